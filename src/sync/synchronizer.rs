use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::scoring::{deviation, score};
use crate::error::BridgeError;
use crate::models::{StatusPatch, StatusRecord};
use crate::protocol::ProtocolEvent;
use crate::store::StatusStore;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// How many times a conditional update re-reads after losing a race.
const CAS_ATTEMPTS: u32 = 3;

/// Projects device events onto the shared status record.
pub struct StateSynchronizer {
    store: Arc<dyn StatusStore>,
    first_liquid: String,
}

impl StateSynchronizer {
    pub fn new(store: Arc<dyn StatusStore>, first_liquid: impl Into<String>) -> Self {
        Self {
            store,
            first_liquid: first_liquid.into(),
        }
    }

    /// Moves the synchronizer onto its own task and returns its inbox.
    ///
    /// Events are applied one at a time in the order they were sent, so the
    /// caller never waits on a store round trip. Failures are logged against
    /// the event. The task ends when every sender is dropped or `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> UnboundedSender<ProtocolEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProtocolEvent>();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                tokio::select! {
                    _ = cancel.cancelled() => {
                        log_warn!("{:?} abandoned at shutdown", event);
                        break;
                    }
                    result = self.apply(&event) => {
                        if let Err(err) = result {
                            log_error!("{:?} not recorded: {}", event, err);
                        }
                    }
                }
            }
            log_debug!("State synchronizer stopped");
        });

        tx
    }

    /// Applies one event. Events that do not touch the record are a no-op.
    pub async fn apply(&self, event: &ProtocolEvent) -> Result<(), BridgeError> {
        match event {
            ProtocolEvent::TareComplete => self.tare_complete().await,
            ProtocolEvent::PourStarted { liquid } => self.pour_started(liquid).await,
            ProtocolEvent::StepComplete => self.step_complete().await,
            ProtocolEvent::RecipeComplete { total_weight } => {
                self.recipe_complete(*total_weight).await
            }
            ProtocolEvent::ReadySignal | ProtocolEvent::SoundCue { .. } => Ok(()),
        }
    }

    async fn tare_complete(&self) -> Result<(), BridgeError> {
        log_info!("Tare complete");
        self.store
            .update(&StatusPatch {
                is_taring: Some(false),
                current_step: Some(1),
                ..Default::default()
            })
            .await
            .map_err(BridgeError::remote_write)
    }

    /// The first pour of the first liquid implies taring finished, for
    /// firmware that skips the explicit marker.
    async fn pour_started(&self, liquid: &str) -> Result<(), BridgeError> {
        if !liquid.contains(self.first_liquid.as_str()) {
            log_debug!("Pouring {}", liquid);
            return Ok(());
        }

        let applied = self
            .compare_and_swap("pour start", |record| {
                if !record.is_taring {
                    return false;
                }
                record.is_taring = false;
                record.current_step = record.current_step.max(1);
                true
            })
            .await?;

        if applied {
            log_info!("Pour started while taring; treating tare as complete");
        }
        Ok(())
    }

    async fn step_complete(&self) -> Result<(), BridgeError> {
        let mut next_step = 0;
        self.compare_and_swap("step complete", |record| {
            record.current_step = record.current_step.saturating_add(1);
            next_step = record.current_step;
            true
        })
        .await?;

        log_info!("Step complete; now on step {}", next_step);
        Ok(())
    }

    async fn recipe_complete(&self, total_weight: f64) -> Result<(), BridgeError> {
        let score = score(total_weight);
        log_info!("Recipe complete! Total: {}ml", total_weight);
        log_info!(
            "Score: {} (error: {:.1}ml)",
            score,
            deviation(total_weight)
        );

        self.store
            .update(&StatusPatch {
                is_blending: Some(false),
                is_taring: Some(false),
                current_step: Some(0),
                total_weight: Some(total_weight),
                score: Some(score),
                completed: Some(true),
                timestamp: Some(Utc::now().timestamp_millis()),
            })
            .await
            .map_err(BridgeError::remote_write)
    }

    /// Read-modify-write guarded by the store's version tag.
    ///
    /// `change` edits a freshly read record and returns whether anything
    /// should be written. Returns whether a write happened.
    async fn compare_and_swap<F>(&self, label: &str, mut change: F) -> Result<bool, BridgeError>
    where
        F: FnMut(&mut StatusRecord) -> bool,
    {
        for attempt in 1..=CAS_ATTEMPTS {
            let versioned = self
                .store
                .read_versioned()
                .await
                .map_err(BridgeError::remote_read)?;

            let mut record = versioned.record.unwrap_or_default();
            if !change(&mut record) {
                return Ok(false);
            }

            let written = self
                .store
                .replace_if_unchanged(&record, &versioned.version)
                .await
                .map_err(BridgeError::remote_write)?;
            if written {
                return Ok(true);
            }

            log_warn!(
                "{} lost a race with another writer (attempt {}/{})",
                label,
                attempt,
                CAS_ATTEMPTS
            );
        }

        Err(BridgeError::RemoteWrite(format!(
            "{label}: record kept changing underneath, gave up after {CAS_ATTEMPTS} attempts"
        )))
    }
}
