use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::drivers::protocol::NOMINAL_SAMPLE_FREQUENCY;
use crate::drivers::FaError;
use crate::drivers::ModeKind;

pub const DEFAULT_SERVER: &str = "fa-archiver.cs.diamond.ac.uk";
pub const DEFAULT_PORT: u16 = 8888;

/// Where to find the FA server and how to talk to it.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Older servers start streaming straight after `SR` without a status
    /// byte.
    pub expect_ack: bool,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER.to_owned(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5000,
            expect_ack: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// History kept by the circular buffer, in samples (50 s at 10 kHz).
    pub buffer_size: usize,
    /// Samples requested from the socket per loop iteration.
    pub read_size: usize,
    /// Raw units to micrometres.
    pub scale: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 500_000,
            read_size: 1000,
            scale: 1e-3,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), FaError> {
        if self.read_size == 0 {
            return Err(FaError::InvalidConfig("read_size must be positive".into()));
        }
        if self.buffer_size < self.read_size {
            return Err(FaError::InvalidConfig(format!(
                "buffer_size {} smaller than read_size {}",
                self.buffer_size, self.read_size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub server: ServerConfig,
    pub monitor: MonitorConfig,
    pub channel: u8,
    pub timebase: usize,
    pub mode: ModeKind,
    pub fallback_frequency: f64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            monitor: MonitorConfig::default(),
            channel: 1,
            timebase: 10_000,
            mode: ModeKind::Raw,
            fallback_frequency: NOMINAL_SAMPLE_FREQUENCY,
        }
    }
}

impl ViewerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FaError> {
        self.monitor.validate()?;
        if self.timebase < 4 || self.timebase > self.monitor.buffer_size {
            return Err(FaError::InvalidConfig(format!(
                "timebase {} must lie in 4..={}",
                self.timebase, self.monitor.buffer_size
            )));
        }
        Ok(())
    }
}
