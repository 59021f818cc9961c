// src/drivers/mod.rs
pub mod buffer;
pub mod error;
pub mod fft;
pub mod mask;
pub mod modes;
pub mod monitor;
pub mod protocol;
// Re-exported for the session layer and the binary
pub use buffer::{CircularBuffer, SampleWindow};
pub use error::FaError;
pub use mask::{ChannelMask, MASK_SIZE};
pub use modes::{
    AxisInfo, AxisScale, DisplayMode, Envelope, FftMode, IntegratedMode, LogFftMode, ModeKind,
    ModeOutput, RawMode,
};
pub use monitor::{Cadence, StreamMonitor, SCROLL_THRESHOLD};
pub use protocol::{sample_frequency, Connection, Subscription, NOMINAL_SAMPLE_FREQUENCY};
