const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Longest field line kept; bytes past it are dropped until the next `\n`.
pub const MAX_LINE_BYTES: usize = 1024;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes arrive in arbitrary chunks; an event is dispatched on the blank line
/// that ends it. Only the `event` and `data` fields are kept.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    truncated: bool,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();

        for &byte in chunk {
            if byte != b'\n' {
                if self.buffer.len() < MAX_LINE_BYTES {
                    self.buffer.push(byte);
                } else if !self.truncated {
                    self.truncated = true;
                    log_warn!(
                        "Event stream line exceeds {} bytes; dropping the rest",
                        MAX_LINE_BYTES
                    );
                }
                continue;
            }
            self.truncated = false;
            if self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
            }
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();

            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }

        events
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".into()),
            data,
        })
    }
}
