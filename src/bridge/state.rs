use crate::device::ConnectionState;

/// Process-local coordination state, owned by the `Bridge`.
///
/// Not persisted. A restarted bridge treats the first snapshot with
/// `isBlending` set as a fresh rising edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessState {
    pub connection: ConnectionState,
    /// Last observed `isBlending`, for rising-edge detection.
    pub last_is_blending: bool,
    /// Bumped on every (re)connect so stale settle timers are ignored.
    pub link_generation: u64,
    /// Consecutive failed reconnect attempts since the channel dropped.
    pub reconnect_attempt: u32,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.connection.can_write()
    }
}
