use std::io;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum FaError {
    #[error("channel id {0} out of range (expected 0..=255)")]
    InvalidChannel(i64),
    #[error("invalid channel mask: {0}")]
    InvalidMask(String),
    #[error("unable to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("subscription rejected: {0}")]
    Subscribe(String),
    #[error("connection closed by server")]
    EndOfStream,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("monitor is already running")]
    AlreadyRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
