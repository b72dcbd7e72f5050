pub mod state;

pub use state::ProcessState;

use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::{
    audio::CuePlayerHandle,
    device::{ConnectionManager, ConnectionState, DeviceConnector, DeviceEvent},
    dispatch::{CommandDispatcher, DispatchOutcome, RetryPolicy},
    error::BridgeError,
    models::StatusRecord,
    protocol::{classify, ProtocolEvent},
    settings::BridgeSettings,
    store::StatusStore,
    sync::StateSynchronizer,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Deferred work posted back into the loop by a spawned sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMessage {
    /// The post-open settle delay for link `link` elapsed.
    SettleElapsed { link: u64 },
    RetryCommand { generation: u64 },
    Reconnect { attempt: u32 },
}

/// Composition root: owns every component and the single event loop.
///
/// Handlers run one at a time and never await, so the channel and the process
/// state are never touched concurrently. Record writes are queued to the
/// synchronizer task, which applies them in arrival order.
pub struct Bridge {
    state: ProcessState,
    connection: ConnectionManager,
    /// Handed to its own task when the loop starts.
    synchronizer: Option<StateSynchronizer>,
    sync_tx: Option<UnboundedSender<ProtocolEvent>>,
    dispatcher: CommandDispatcher,
    cues: CuePlayerHandle,
    store: Arc<dyn StatusStore>,
    settle_delay: Duration,
    reconnect: RetryPolicy,
    device_rx: UnboundedReceiver<DeviceEvent>,
    timer_tx: UnboundedSender<TimerMessage>,
    timer_rx: UnboundedReceiver<TimerMessage>,
    cancel: CancellationToken,
}

impl Bridge {
    pub fn new(
        settings: &BridgeSettings,
        store: Arc<dyn StatusStore>,
        connector: Box<dyn DeviceConnector>,
        cues: CuePlayerHandle,
    ) -> Self {
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        Self {
            state: ProcessState::new(),
            connection: ConnectionManager::new(connector, device_tx),
            synchronizer: Some(StateSynchronizer::new(
                Arc::clone(&store),
                settings.first_liquid.clone(),
            )),
            sync_tx: None,
            dispatcher: CommandDispatcher::new(
                settings.recipe_command.clone(),
                settings.command_retry(),
            ),
            cues,
            store,
            settle_delay: settings.settle_delay(),
            reconnect: settings.reconnect_policy(),
            device_rx,
            timer_tx,
            timer_rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Opens the channel. Failure here is fatal to the process.
    pub fn start(&mut self) -> Result<String, BridgeError> {
        self.state.connection = ConnectionState::Discovering;
        match self.connection.connect() {
            Ok(path) => {
                self.on_connected(&path);
                Ok(path)
            }
            Err(err) => {
                self.state.connection = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Runs until `shutdown` resolves (`Ok`), or until the serial channel or
    /// the status stream is lost for good (`Err`). The channel is closed
    /// either way.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut snapshots = self
            .store
            .subscribe(self.cancel.child_token())
            .await
            .map_err(BridgeError::remote_read)?;
        if let Some(synchronizer) = self.synchronizer.take() {
            self.sync_tx = Some(synchronizer.spawn(self.cancel.child_token()));
        }

        log_info!("Listening for status changes");

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log_info!("Shutting down");
                    break Ok(());
                }
                Some(event) = self.device_rx.recv() => {
                    if let Err(err) = self.on_device_event(event) {
                        break Err(err);
                    }
                }
                snapshot = snapshots.recv() => match snapshot {
                    Some(record) => self.on_snapshot(record),
                    None => {
                        log_error!("Status stream ended; restart the bridge once the database is reachable");
                        break Err(BridgeError::RemoteRead("status change stream ended".into()));
                    }
                },
                Some(message) = self.timer_rx.recv() => {
                    if let Err(err) = self.on_timer(message) {
                        break Err(err);
                    }
                }
            }
        };

        self.close();
        result
    }

    /// Flushes and drops the channel, stops the cue thread and the stream.
    pub fn close(&mut self) {
        self.sync_tx = None;
        self.cancel.cancel();
        self.connection.close();
        self.state.connection = ConnectionState::Disconnected;
        self.cues.close();
    }

    fn on_device_event(&mut self, event: DeviceEvent) -> Result<(), BridgeError> {
        match event {
            DeviceEvent::Opened { path } => {
                self.state.connection = self.state.connection.on_opened();
                log_info!(
                    "{} open; waiting {:?} for the device to settle",
                    path,
                    self.settle_delay
                );
                self.schedule(
                    self.settle_delay,
                    TimerMessage::SettleElapsed {
                        link: self.state.link_generation,
                    },
                );
            }
            DeviceEvent::Line(line) => self.on_line(&line),
            DeviceEvent::Failed(reason) => {
                log_error!("Serial channel lost: {}", reason);
                self.connection.release();
                self.state.connection = ConnectionState::Disconnected;
                self.schedule_reconnect(1)?;
            }
        }
        Ok(())
    }

    fn on_line(&mut self, line: &str) {
        log_info!("device: {}", line);

        let events = match classify(line) {
            Ok(events) => events,
            Err(err) => {
                log_error!("Dropping line: {}", BridgeError::from(err));
                return;
            }
        };

        for event in events {
            match event {
                ProtocolEvent::ReadySignal => self.mark_ready(),
                ProtocolEvent::SoundCue { kind, repeat } => {
                    if let Err(err) = self.cues.play(kind, repeat) {
                        log_error!("{}", err);
                    }
                }
                other => self.record(other),
            }
        }
    }

    /// Queues a record transition for the synchronizer task.
    fn record(&self, event: ProtocolEvent) {
        let Some(tx) = &self.sync_tx else {
            log_warn!("{:?} arrived before the loop started; not recorded", event);
            return;
        };
        if let Err(err) = tx.send(event) {
            log_error!("{:?} not recorded: synchronizer stopped", err.0);
        }
    }

    fn on_snapshot(&mut self, record: StatusRecord) {
        log_debug!("status: {:?}", record);
        let outcome =
            self.dispatcher
                .on_status_change(&mut self.state, &record, &mut self.connection);
        if let Some(outcome) = outcome {
            self.follow_up(outcome);
        }
    }

    fn on_timer(&mut self, message: TimerMessage) -> Result<(), BridgeError> {
        match message {
            TimerMessage::SettleElapsed { link } => {
                if link == self.state.link_generation {
                    self.mark_ready();
                }
            }
            TimerMessage::RetryCommand { generation } => {
                let outcome = self
                    .dispatcher
                    .on_retry(&self.state, &mut self.connection, generation);
                if let Some(outcome) = outcome {
                    self.follow_up(outcome);
                }
            }
            TimerMessage::Reconnect { attempt } => {
                log_info!("Reconnecting (attempt {})", attempt);
                self.state.reconnect_attempt = attempt;
                self.state.connection = ConnectionState::Discovering;
                match self.connection.connect() {
                    Ok(path) => self.on_connected(&path),
                    Err(err) => {
                        log_warn!("Reconnect attempt {} failed: {}", attempt, err);
                        self.state.connection = ConnectionState::Disconnected;
                        self.schedule_reconnect(attempt + 1)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn on_connected(&mut self, path: &str) {
        self.state.connection = ConnectionState::Opening;
        self.state.link_generation += 1;
        log_info!("Connected to {}", path);
    }

    /// Settle delay elapsed or the device said so, whichever came first.
    fn mark_ready(&mut self) {
        let before = self.state.connection;
        self.state.connection = before.on_ready();
        if before == self.state.connection {
            return;
        }

        log_info!("Device ready");
        self.state.reconnect_attempt = 0;
        if let Some(outcome) = self.dispatcher.on_ready(&self.state, &mut self.connection) {
            self.follow_up(outcome);
        }
    }

    fn follow_up(&self, outcome: DispatchOutcome) {
        if let DispatchOutcome::Deferred { delay, generation } = outcome {
            self.schedule(delay, TimerMessage::RetryCommand { generation });
        }
    }

    fn schedule_reconnect(&self, attempt: u32) -> Result<(), BridgeError> {
        match self.reconnect.delay_for(attempt) {
            Some(delay) => {
                log_info!("Next reconnect attempt in {:?}", delay);
                self.schedule(delay, TimerMessage::Reconnect { attempt });
                Ok(())
            }
            None => {
                log_error!(
                    "Serial channel could not be re-opened after {} attempts; restart the bridge once the device is back",
                    attempt - 1
                );
                Err(BridgeError::not_connected())
            }
        }
    }

    fn schedule(&self, delay: Duration, message: TimerMessage) {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        });
    }
}
