use std::io;

use thiserror::Error;

use crate::protocol::ParseError;
use crate::store::StoreError;

/// Every failure the bridge can observe.
///
/// Only configuration and discovery failures stop the process; everything
/// else is logged against the event that caused it and the loop carries on.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    #[error("no matching serial device among {} candidate port(s)", .candidates.len())]
    DeviceNotFound { candidates: Vec<String> },

    #[error("serial channel error: {0}")]
    ChannelIo(#[from] io::Error),

    #[error("could not parse device line: {0}")]
    Parse(#[from] ParseError),

    #[error("remote write failed: {0}")]
    RemoteWrite(String),

    #[error("remote read failed: {0}")]
    RemoteRead(String),

    #[error("playback failed: {0}")]
    Playback(String),
}

impl BridgeError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ConfigMissing(_) | BridgeError::DeviceNotFound { .. }
        )
    }

    pub fn remote_read(err: StoreError) -> Self {
        BridgeError::RemoteRead(err.to_string())
    }

    pub fn remote_write(err: StoreError) -> Self {
        BridgeError::RemoteWrite(err.to_string())
    }

    pub fn not_connected() -> Self {
        BridgeError::ChannelIo(io::Error::new(
            io::ErrorKind::NotConnected,
            "serial channel is not open",
        ))
    }
}

impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        BridgeError::ChannelIo(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_startup_failures_are_fatal() {
        assert!(BridgeError::ConfigMissing("bridge.json".into()).is_fatal());
        assert!(BridgeError::DeviceNotFound { candidates: vec![] }.is_fatal());
        assert!(!BridgeError::not_connected().is_fatal());
        assert!(!BridgeError::RemoteWrite("timeout".into()).is_fatal());
        assert!(!BridgeError::Playback("no device".into()).is_fatal());
    }

    #[test]
    fn device_not_found_reports_candidate_count() {
        let err = BridgeError::DeviceNotFound {
            candidates: vec!["/dev/ttyS0".into(), "/dev/ttyS1".into()],
        };
        assert_eq!(
            err.to_string(),
            "no matching serial device among 2 candidate port(s)"
        );
    }
}
