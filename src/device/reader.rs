use std::{
    io::{self, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use tokio::sync::mpsc::UnboundedSender;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

/// What the serial reader thread reports back to the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The channel is open; sent once before any line.
    Opened { path: String },
    Line(String),
    /// The channel failed or reached end of stream. No further events follow.
    Failed(String),
}

/// Longest line kept; bytes past it are dropped until the next `\n`.
pub const MAX_LINE_BYTES: usize = 1024;

/// Splits a byte stream into lines on `\n`, dropping a trailing `\r`.
///
/// Partial lines are held until their terminator arrives. Blank lines are
/// skipped and invalid UTF-8 is replaced rather than rejected. A line longer
/// than `MAX_LINE_BYTES` is cut short.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    truncated: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte != b'\n' {
                if self.buffer.len() < MAX_LINE_BYTES {
                    self.buffer.push(byte);
                } else if !self.truncated {
                    self.truncated = true;
                    log_warn!(
                        "Device line exceeds {} bytes; dropping the rest (wrong baud rate?)",
                        MAX_LINE_BYTES
                    );
                }
                continue;
            }
            self.truncated = false;
            if self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
            }
            if !self.buffer.is_empty() {
                lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
            }
            self.buffer.clear();
        }
        lines
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Owns the reader thread; dropping it without `stop` detaches the thread.
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    /// Asks the thread to exit at its next read timeout and waits for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log_error!("serial reader thread panicked");
            }
        }
    }
}

/// Starts the blocking read loop on its own thread.
///
/// Read timeouts are how the loop notices `stop`; the source should be
/// configured with a short timeout.
pub fn spawn_reader<R>(
    path: String,
    mut source: R,
    events: UnboundedSender<DeviceEvent>,
) -> io::Result<ReaderHandle>
where
    R: Read + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = thread::Builder::new()
        .name("serial-reader".into())
        .spawn(move || {
            if events.send(DeviceEvent::Opened { path: path.clone() }).is_err() {
                return;
            }

            let mut lines = LineBuffer::new();
            let mut chunk = [0u8; 256];

            while !stop_flag.load(Ordering::SeqCst) {
                match source.read(&mut chunk) {
                    Ok(0) => {
                        let _ = events.send(DeviceEvent::Failed(format!(
                            "{path}: channel closed by device"
                        )));
                        break;
                    }
                    Ok(n) => {
                        for line in lines.push(&chunk[..n]) {
                            if events.send(DeviceEvent::Line(line)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue;
                    }
                    Err(err) => {
                        let _ = events.send(DeviceEvent::Failed(format!("{path}: {err}")));
                        break;
                    }
                }
            }

            log_debug!("serial reader for {} exiting", path);
        })?;

    Ok(ReaderHandle {
        stop,
        thread: Some(thread),
    })
}
