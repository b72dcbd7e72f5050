use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::dispatch::RetryPolicy;
use crate::error::BridgeError;

pub const DEFAULT_CONFIG_PATH: &str = "bridge.json";
pub const CONFIG_ENV: &str = "POTION_BRIDGE_CONFIG";
pub const AUTH_ENV: &str = "POTION_BRIDGE_AUTH";
pub const DEBUG_ENV: &str = "POTION_BRIDGE_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Explicit device path; skips discovery when set.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub settle_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub reconnect_attempts: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            settle_delay_ms: 2000,
            read_timeout_ms: 100,
            reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundSettings {
    pub dir: PathBuf,
    pub sparkle: String,
    pub explosion: String,
    pub step_complete: String,
    /// Gap between repeats of one cue.
    pub gap_ms: u64,
}

impl Default for SoundSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("sounds"),
            sparkle: "sparkle.mp3".into(),
            explosion: "explosion.mp3".into(),
            step_complete: "step_complete.mp3".into(),
            gap_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            max_attempts: 10,
        }
    }
}

impl RetrySettings {
    /// Re-opening the change stream: slower ceiling, more patience.
    pub fn stream() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 12,
        }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub database_url: Option<String>,
    pub auth_token: Option<String>,
    pub status_path: String,
    pub recipe_command: String,
    /// The liquid whose first pour also ends taring.
    pub first_liquid: String,
    pub serial: SerialSettings,
    pub sounds: SoundSettings,
    /// Command retry while the device is not ready.
    pub retry: RetrySettings,
    /// Re-opening the status change stream after it drops.
    pub stream_retry: RetrySettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            auth_token: None,
            status_path: "cocktail/status".into(),
            recipe_command: "1".into(),
            first_liquid: "Orange Juice".into(),
            serial: SerialSettings::default(),
            sounds: SoundSettings::default(),
            retry: RetrySettings::default(),
            stream_retry: RetrySettings::stream(),
        }
    }
}

/// Where and how to reach the Realtime Database.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCredentials {
    pub database_url: String,
    pub auth_token: String,
    pub status_path: String,
}

impl BridgeSettings {
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        if !path.exists() {
            return Err(BridgeError::ConfigMissing(format!(
                "{} not found; copy bridge.example.json and fill in the database credentials",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path).map_err(|err| {
            BridgeError::ConfigMissing(format!("failed to read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            BridgeError::ConfigMissing(format!("{} is not valid settings JSON: {err}", path.display()))
        })
    }

    /// Missing file is fine here; used when no remote store is needed.
    pub fn load_or_default(path: &Path) -> Result<Self, BridgeError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var(AUTH_ENV) {
            if !token.trim().is_empty() {
                self.auth_token = Some(token.trim().to_string());
            }
        }
        self
    }

    pub fn remote(&self) -> Result<RemoteCredentials, BridgeError> {
        let database_url = non_empty(&self.database_url)
            .ok_or_else(|| BridgeError::ConfigMissing("database_url is not set".into()))?;
        let auth_token = non_empty(&self.auth_token).ok_or_else(|| {
            BridgeError::ConfigMissing(format!("auth_token is not set (or export {AUTH_ENV})"))
        })?;

        Ok(RemoteCredentials {
            database_url: database_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            status_path: self.status_path.trim_matches('/').to_string(),
        })
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.serial.settle_delay_ms)
    }

    pub fn cue_gap(&self) -> Duration {
        Duration::from_millis(self.sounds.gap_ms)
    }

    pub fn command_retry(&self) -> RetryPolicy {
        self.retry.policy()
    }

    pub fn stream_retry_policy(&self) -> RetryPolicy {
        self.stream_retry.policy()
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.serial.reconnect_attempts,
        )
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn debug_requested() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
