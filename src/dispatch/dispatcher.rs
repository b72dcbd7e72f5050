use std::time::Duration;

use super::backoff::RetryPolicy;
use crate::bridge::state::ProcessState;
use crate::error::BridgeError;
use crate::models::StatusRecord;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Where outbound command lines go. The line terminator is the sink's job.
pub trait CommandSink {
    fn write_line(&mut self, line: &str) -> Result<(), BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCommand {
    command: String,
    attempt: u32,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// Not ready yet; the caller schedules `on_retry(generation)` after `delay`.
    Deferred { delay: Duration, generation: u64 },
    /// Retry budget exhausted; the command was dropped.
    Abandoned,
    /// The write itself failed. Not retried.
    WriteFailed,
}

/// Sends the recipe command once per run, when the device can take it.
pub struct CommandDispatcher {
    recipe_command: String,
    retry: RetryPolicy,
    pending: Option<PendingCommand>,
    next_generation: u64,
}

impl CommandDispatcher {
    pub fn new(recipe_command: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            recipe_command: recipe_command.into(),
            retry,
            pending: None,
            next_generation: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Called for every snapshot from the store. Fires on a false→true edge
    /// of `isBlending` only.
    pub fn on_status_change(
        &mut self,
        state: &mut ProcessState,
        record: &StatusRecord,
        sink: &mut dyn CommandSink,
    ) -> Option<DispatchOutcome> {
        let rising = record.is_blending && !state.last_is_blending;
        state.last_is_blending = record.is_blending;

        if !rising {
            return None;
        }

        log_info!("Run started; sending recipe {}", self.recipe_command);
        let command = self.recipe_command.clone();
        Some(self.send_command(state, sink, command))
    }

    pub fn send_command(
        &mut self,
        state: &ProcessState,
        sink: &mut dyn CommandSink,
        command: String,
    ) -> DispatchOutcome {
        if state.is_ready() {
            return write(sink, &command);
        }

        if let Some(previous) = self.pending.take() {
            log_warn!(
                "Replacing command {:?} still waiting for the device",
                previous.command
            );
        }

        self.next_generation += 1;
        let pending = PendingCommand {
            command,
            attempt: 1,
            generation: self.next_generation,
        };
        self.defer(pending)
    }

    /// A retry timer fired. Stale generations are ignored.
    pub fn on_retry(
        &mut self,
        state: &ProcessState,
        sink: &mut dyn CommandSink,
        generation: u64,
    ) -> Option<DispatchOutcome> {
        if self.pending.as_ref()?.generation != generation {
            return None;
        }
        let mut pending = self.pending.take()?;

        if state.is_ready() {
            return Some(write(sink, &pending.command));
        }

        pending.attempt += 1;
        Some(self.defer(pending))
    }

    /// The connection just became ready: flush without waiting for the timer.
    pub fn on_ready(
        &mut self,
        state: &ProcessState,
        sink: &mut dyn CommandSink,
    ) -> Option<DispatchOutcome> {
        if !state.is_ready() {
            return None;
        }
        let pending = self.pending.take()?;
        Some(write(sink, &pending.command))
    }

    fn defer(&mut self, pending: PendingCommand) -> DispatchOutcome {
        match self.retry.delay_for(pending.attempt) {
            Some(delay) => {
                log_info!(
                    "Device not ready; holding command {:?} (attempt {}, retry in {:?})",
                    pending.command,
                    pending.attempt,
                    delay
                );
                let generation = pending.generation;
                self.pending = Some(pending);
                DispatchOutcome::Deferred { delay, generation }
            }
            None => {
                log_error!(
                    "Giving up on command {:?} after {} attempts; device never became ready",
                    pending.command,
                    pending.attempt - 1
                );
                DispatchOutcome::Abandoned
            }
        }
    }
}

fn write(sink: &mut dyn CommandSink, command: &str) -> DispatchOutcome {
    match sink.write_line(command) {
        Ok(()) => {
            log_info!("Command sent: {}", command);
            DispatchOutcome::Sent
        }
        Err(err) => {
            log_error!("Command {:?} not sent: {}", command, err);
            DispatchOutcome::WriteFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionState;

    #[derive(Default)]
    struct Sink {
        lines: Vec<String>,
        fail: bool,
    }

    impl CommandSink for Sink {
        fn write_line(&mut self, line: &str) -> Result<(), BridgeError> {
            if self.fail {
                return Err(BridgeError::not_connected());
            }
            self.lines.push(line.to_string());
            Ok(())
        }
    }

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(
            "1",
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(8), 3),
        )
    }

    fn ready() -> ProcessState {
        ProcessState {
            connection: ConnectionState::Ready,
            ..Default::default()
        }
    }

    fn blending(on: bool) -> StatusRecord {
        StatusRecord {
            is_blending: on,
            ..Default::default()
        }
    }

    #[test]
    fn one_command_per_rising_edge() {
        let mut dispatcher = dispatcher();
        let mut state = ready();
        let mut sink = Sink::default();

        assert_eq!(
            dispatcher.on_status_change(&mut state, &blending(true), &mut sink),
            Some(DispatchOutcome::Sent)
        );
        assert_eq!(dispatcher.on_status_change(&mut state, &blending(true), &mut sink), None);
        assert_eq!(dispatcher.on_status_change(&mut state, &blending(false), &mut sink), None);
        assert_eq!(
            dispatcher.on_status_change(&mut state, &blending(true), &mut sink),
            Some(DispatchOutcome::Sent)
        );

        assert_eq!(sink.lines, vec!["1", "1"]);
    }

    #[test]
    fn falling_edge_updates_memory_without_sending() {
        let mut dispatcher = dispatcher();
        let mut state = ProcessState {
            last_is_blending: true,
            ..ready()
        };
        let mut sink = Sink::default();

        assert_eq!(dispatcher.on_status_change(&mut state, &blending(false), &mut sink), None);
        assert!(!state.last_is_blending);
        assert!(sink.lines.is_empty());
    }

    #[test]
    fn withheld_until_ready_then_flushed_once() {
        let mut dispatcher = dispatcher();
        let mut state = ProcessState {
            connection: ConnectionState::AwaitingReady,
            ..Default::default()
        };
        let mut sink = Sink::default();

        let outcome = dispatcher.on_status_change(&mut state, &blending(true), &mut sink);
        let generation = match outcome {
            Some(DispatchOutcome::Deferred { delay, generation }) => {
                assert_eq!(delay, Duration::from_secs(1));
                generation
            }
            other => panic!("expected Deferred, got {other:?}"),
        };
        assert!(sink.lines.is_empty());

        state.connection = ConnectionState::Ready;
        assert_eq!(dispatcher.on_ready(&state, &mut sink), Some(DispatchOutcome::Sent));
        assert_eq!(sink.lines, vec!["1"]);

        // The retry timer that was already scheduled finds nothing to do.
        assert_eq!(dispatcher.on_retry(&state, &mut sink, generation), None);
        assert_eq!(dispatcher.on_ready(&state, &mut sink), None);
        assert_eq!(sink.lines, vec!["1"]);
    }

    #[test]
    fn retries_back_off_then_give_up() {
        let mut dispatcher = dispatcher();
        let state = ProcessState::default();
        let mut sink = Sink::default();

        let DispatchOutcome::Deferred { generation, .. } =
            dispatcher.send_command(&state, &mut sink, "1".into())
        else {
            panic!("expected Deferred");
        };

        assert_eq!(
            dispatcher.on_retry(&state, &mut sink, generation),
            Some(DispatchOutcome::Deferred {
                delay: Duration::from_secs(2),
                generation
            })
        );
        assert_eq!(
            dispatcher.on_retry(&state, &mut sink, generation),
            Some(DispatchOutcome::Deferred {
                delay: Duration::from_secs(4),
                generation
            })
        );
        assert_eq!(
            dispatcher.on_retry(&state, &mut sink, generation),
            Some(DispatchOutcome::Abandoned)
        );
        assert!(!dispatcher.has_pending());
        assert!(sink.lines.is_empty());
    }

    #[test]
    fn retry_sends_when_ready_by_then() {
        let mut dispatcher = dispatcher();
        let mut state = ProcessState::default();
        let mut sink = Sink::default();

        let DispatchOutcome::Deferred { generation, .. } =
            dispatcher.send_command(&state, &mut sink, "1".into())
        else {
            panic!("expected Deferred");
        };
        state.connection = ConnectionState::Ready;

        assert_eq!(
            dispatcher.on_retry(&state, &mut sink, generation),
            Some(DispatchOutcome::Sent)
        );
        assert_eq!(sink.lines, vec!["1"]);
    }

    #[test]
    fn write_failure_is_not_retried() {
        let mut dispatcher = dispatcher();
        let mut state = ready();
        let mut sink = Sink {
            fail: true,
            ..Default::default()
        };

        assert_eq!(
            dispatcher.on_status_change(&mut state, &blending(true), &mut sink),
            Some(DispatchOutcome::WriteFailed)
        );
        assert!(!dispatcher.has_pending());
    }

    #[test]
    fn stale_retry_generation_is_ignored() {
        let mut dispatcher = dispatcher();
        let state = ProcessState::default();
        let mut sink = Sink::default();

        let DispatchOutcome::Deferred { generation: first, .. } =
            dispatcher.send_command(&state, &mut sink, "1".into())
        else {
            panic!("expected Deferred");
        };
        let DispatchOutcome::Deferred { generation: second, .. } =
            dispatcher.send_command(&state, &mut sink, "1".into())
        else {
            panic!("expected Deferred");
        };

        assert_ne!(first, second);
        assert_eq!(dispatcher.on_retry(&state, &mut sink, first), None);
        assert!(dispatcher.has_pending());
    }
}
