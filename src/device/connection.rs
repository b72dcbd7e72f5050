use std::{
    io::{self, Write},
    time::Duration,
};

use serialport::SerialPort;
use tokio::sync::mpsc::UnboundedSender;

use super::discovery::{discover, MatchReason, PortMatch};
use super::reader::{spawn_reader, DeviceEvent, ReaderHandle};
use crate::dispatch::CommandSink;
use crate::error::BridgeError;
use crate::settings::SerialSettings;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Lifecycle of the one serial channel.
///
/// `Disconnected → Discovering → Opening → AwaitingReady → Ready`. Only
/// `Ready` permits outbound writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Discovering,
    Opening,
    AwaitingReady,
    Ready,
}

impl ConnectionState {
    /// The channel reported open.
    pub fn on_opened(self) -> Self {
        match self {
            ConnectionState::Opening | ConnectionState::Discovering => {
                ConnectionState::AwaitingReady
            }
            other => other,
        }
    }

    /// Settle delay elapsed or the device printed its readiness marker.
    pub fn on_ready(self) -> Self {
        match self {
            ConnectionState::AwaitingReady | ConnectionState::Ready => ConnectionState::Ready,
            other => other,
        }
    }

    pub fn can_write(self) -> bool {
        self == ConnectionState::Ready
    }
}

/// Outbound half of the channel.
pub trait DeviceWriter: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Flushes whatever is buffered. Called once before the channel is dropped.
    fn close(&mut self) -> io::Result<()>;
}

struct SerialWriter {
    port: Box<dyn SerialPort>,
}

impl DeviceWriter for SerialWriter {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');
        self.port.write_all(&framed)?;
        self.port.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

/// An open channel: the writer plus the thread feeding lines into the loop.
pub struct DeviceLink {
    pub path: String,
    pub writer: Box<dyn DeviceWriter>,
    pub reader: Option<ReaderHandle>,
}

/// Finds and opens the device.
///
/// The reader side must emit `DeviceEvent::Opened` before any line.
pub trait DeviceConnector: Send {
    fn connect(&mut self, events: UnboundedSender<DeviceEvent>) -> Result<DeviceLink, BridgeError>;
}

/// Real hardware: discovery (unless a port is configured) then `serialport`.
pub struct SerialConnector {
    settings: SerialSettings,
}

impl SerialConnector {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }

    fn locate(&self) -> Result<PortMatch, BridgeError> {
        match &self.settings.port {
            Some(path) => Ok(PortMatch {
                path: path.clone(),
                reason: MatchReason::Explicit,
            }),
            None => discover(),
        }
    }
}

impl DeviceConnector for SerialConnector {
    fn connect(&mut self, events: UnboundedSender<DeviceEvent>) -> Result<DeviceLink, BridgeError> {
        let found = self.locate()?;

        let port = serialport::new(&found.path, self.settings.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(self.settings.read_timeout_ms))
            .open()?;
        let read_half = port.try_clone()?;

        log_info!(
            "Opened {} at {} baud ({:?})",
            found.path,
            self.settings.baud_rate,
            found.reason
        );

        let reader = spawn_reader(found.path.clone(), read_half, events)?;

        Ok(DeviceLink {
            path: found.path,
            writer: Box::new(SerialWriter { port }),
            reader: Some(reader),
        })
    }
}

/// Owns the single live channel. Nothing else holds the writer.
pub struct ConnectionManager {
    connector: Box<dyn DeviceConnector>,
    events: UnboundedSender<DeviceEvent>,
    link: Option<DeviceLink>,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn DeviceConnector>, events: UnboundedSender<DeviceEvent>) -> Self {
        Self {
            connector,
            events,
            link: None,
        }
    }

    /// Discovers and opens the channel, replacing any previous one.
    pub fn connect(&mut self) -> Result<String, BridgeError> {
        self.release();
        let link = self.connector.connect(self.events.clone())?;
        let path = link.path.clone();
        self.link = Some(link);
        Ok(path)
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn path(&self) -> Option<&str> {
        self.link.as_ref().map(|link| link.path.as_str())
    }

    /// Drops a channel that already failed. The reader has exited on its own.
    pub fn release(&mut self) {
        if let Some(link) = self.link.take() {
            drop(link.reader);
        }
    }

    /// Flushes the writer, stops the reader, then drops the port.
    pub fn close(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };

        if let Err(err) = link.writer.close() {
            log_warn!("flush on close failed for {}: {}", link.path, err);
        }
        if let Some(reader) = link.reader.take() {
            reader.stop();
        }
        log_info!("Closed {}", link.path);
    }
}

impl CommandSink for ConnectionManager {
    fn write_line(&mut self, line: &str) -> Result<(), BridgeError> {
        let link = self.link.as_mut().ok_or_else(BridgeError::not_connected)?;
        link.writer.write_line(line).map_err(|err| {
            log_error!("write to {} failed: {}", link.path, err);
            BridgeError::ChannelIo(err)
        })
    }
}
