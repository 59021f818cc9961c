// src/session.rs
use std::sync::mpsc::Sender;

use log::{debug, info};

use crate::catalogue::channel_label;
use crate::config::ViewerConfig;
use crate::drivers::{DisplayMode, FaError, ModeKind, ModeOutput, StreamMonitor};
use crate::types::MonitorEvent;

/// Headless viewer: one monitored channel shown through one of the four
/// display modes. Each mode keeps its own settings while inactive.
pub struct ViewerSession {
    monitor: StreamMonitor,
    modes: Vec<DisplayMode>,
    active: ModeKind,
    timebase: usize,
    history: usize,
    f_s: f64,
    autoscale: bool,
    y_range: Option<(f64, f64)>,
    status: String,
}

impl ViewerSession {
    pub fn new(
        config: &ViewerConfig,
        f_s: f64,
        events: Sender<MonitorEvent>,
    ) -> Result<Self, FaError> {
        config.validate()?;
        let monitor = StreamMonitor::new(
            config.server.clone(),
            &config.monitor,
            config.channel,
            events,
        )?;
        monitor.set_timebase(config.timebase);
        let modes = ModeKind::ALL
            .iter()
            .map(|&kind| DisplayMode::new(kind, config.timebase, f_s))
            .collect();
        Ok(Self {
            monitor,
            modes,
            active: config.mode,
            timebase: config.timebase,
            history: config.monitor.buffer_size,
            f_s,
            autoscale: true,
            y_range: None,
            status: channel_label(config.channel),
        })
    }

    pub fn start(&mut self) -> Result<(), FaError> {
        self.monitor.start()
    }

    pub fn stop(&mut self) {
        self.monitor.stop();
    }

    pub fn is_running(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn channel(&self) -> u8 {
        self.monitor.channel()
    }

    /// Switches channel; a running stream is resubscribed.
    pub fn set_channel(&mut self, channel: u8) -> Result<(), FaError> {
        self.monitor.set_channel(channel)?;
        self.status = channel_label(channel);
        info!("viewing {}", self.status);
        Ok(())
    }

    /// Same as [`set_channel`](Self::set_channel) for an id typed by hand.
    pub fn set_channel_id(&mut self, id: i64) -> Result<(), FaError> {
        let channel = u8::try_from(id).map_err(|_| FaError::InvalidChannel(id))?;
        self.set_channel(channel)
    }

    pub fn timebase(&self) -> usize {
        self.timebase
    }

    pub fn sample_frequency(&self) -> f64 {
        self.f_s
    }

    /// Changes the window length. The monitor snapshots `timebase` samples
    /// and every mode recomputes its axes.
    pub fn set_timebase(&mut self, timebase: usize) -> Result<(), FaError> {
        if timebase < 4 || timebase > self.history {
            return Err(FaError::InvalidConfig(format!(
                "timebase {timebase} must lie in 4..={}",
                self.history
            )));
        }
        self.timebase = timebase;
        self.monitor.set_timebase(timebase);
        for mode in &mut self.modes {
            mode.set_timebase(timebase, self.f_s);
        }
        self.y_range = None;
        debug!("timebase now {timebase} samples");
        Ok(())
    }

    pub fn mode_kind(&self) -> ModeKind {
        self.active
    }

    pub fn mode(&self) -> &DisplayMode {
        &self.modes[mode_index(self.active)]
    }

    /// Active mode, for adjusting its own settings (decimation, smoothing,
    /// background).
    pub fn mode_mut(&mut self) -> &mut DisplayMode {
        &mut self.modes[mode_index(self.active)]
    }

    /// Activates `kind`, resetting its per-window state.
    pub fn set_mode(&mut self, kind: ModeKind) {
        self.active = kind;
        let (timebase, f_s) = (self.timebase, self.f_s);
        self.mode_mut().set_timebase(timebase, f_s);
        self.y_range = None;
        info!("display mode {}", kind.name());
    }

    pub fn set_autoscale(&mut self, autoscale: bool) {
        self.autoscale = autoscale;
    }

    /// Last y range chosen by autoscaling or [`rescale`](Self::rescale).
    pub fn y_range(&self) -> Option<(f64, f64)> {
        self.y_range
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Recomputes the active mode from the samples currently buffered.
    pub fn redraw(&mut self) -> ModeOutput {
        let window = self.monitor.read();
        self.mode_mut().compute(window.view())
    }

    /// Fits the y range to the samples currently buffered.
    pub fn rescale(&mut self) -> (f64, f64) {
        let window = self.monitor.read();
        let range = self.mode_mut().rescale(window.view());
        self.y_range = Some(range);
        range
    }

    /// Stores the buffered window as the integrated view's background.
    pub fn capture_background(&mut self) {
        let window = self.monitor.read();
        if let DisplayMode::Integrated(mode) = &mut self.modes[mode_index(ModeKind::Integrated)] {
            mode.capture_background(window.view());
        }
    }

    /// Applies one monitor event. Returns the transformed window for
    /// `DataReady`; connection changes only update the status line.
    pub fn handle(&mut self, event: MonitorEvent) -> Option<ModeOutput> {
        match event {
            MonitorEvent::Connected { channel } => {
                self.status = channel_label(channel);
                None
            }
            MonitorEvent::DataReady(window) => {
                if window.nrows() != self.timebase {
                    // Snapshot taken before the last timebase change.
                    debug!(
                        "dropping stale window of {} rows (timebase {})",
                        window.nrows(),
                        self.timebase
                    );
                    return None;
                }
                let autoscale = self.autoscale;
                let mode = self.mode_mut();
                let output = mode.compute(window.view());
                if autoscale {
                    let range = mode.fit(&output);
                    self.y_range = Some(range);
                }
                Some(output)
            }
            MonitorEvent::Stopped { reason } => {
                self.status = format!("FA server disconnected: {reason}");
                None
            }
        }
    }
}

fn mode_index(kind: ModeKind) -> usize {
    match kind {
        ModeKind::Raw => 0,
        ModeKind::Fft => 1,
        ModeKind::FftLogF => 2,
        ModeKind::Integrated => 3,
    }
}
