// src/types.rs
use crate::drivers::SampleWindow;

/// Messages from a stream monitor's reader thread to its owner, delivered in
/// the order the underlying samples arrived.
#[derive(Clone, Debug)]
pub enum MonitorEvent {
    /// Subscription is live and the reader loop has started.
    Connected { channel: u8 },
    /// Enough new samples arrived; carries the latest scaled window.
    DataReady(SampleWindow),
    /// Reader loop has exited. `reason` is `"Stopped"` after an explicit stop,
    /// otherwise the error that ended the stream.
    Stopped { reason: String },
}

/// Lifecycle of a stream monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
}

pub const STOP_REASON: &str = "Stopped";
