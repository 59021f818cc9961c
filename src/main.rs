// src/main.rs
use std::fmt;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;

use fa_viewer::args::Args;
use fa_viewer::drivers::modes::finite_range;
use fa_viewer::drivers::{sample_frequency, ModeOutput};
use fa_viewer::session::ViewerSession;
use fa_viewer::types::MonitorEvent;

/// One line per update.
#[derive(Serialize)]
struct Summary {
    update: usize,
    channel: u8,
    mode: &'static str,
    rows: usize,
    min: Option<f64>,
    max: Option<f64>,
    /// Axis value (time or frequency) of the largest X value.
    peak_at: Option<f64>,
}

impl Summary {
    fn new(update: usize, session: &ViewerSession, output: &ModeOutput) -> Self {
        let range = finite_range(output.values.iter());
        let peak_at = output
            .values
            .column(0)
            .iter()
            .zip(output.axis.iter())
            .filter(|(v, _)| v.is_finite())
            .fold(None, |best: Option<(f64, f64)>, (&v, &x)| match best {
                Some((top, _)) if top >= v => best,
                _ => Some((v, x)),
            })
            .map(|(_, x)| x);
        Self {
            update,
            channel: session.channel(),
            mode: session.mode().name(),
            rows: output.values.nrows(),
            min: range.map(|r| r.0),
            max: range.map(|r| r.1),
            peak_at,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} ch {} {}: {} rows",
            self.update, self.channel, self.mode, self.rows
        )?;
        if let (Some(min), Some(max)) = (self.min, self.max) {
            write!(f, ", range {min:.4e}..{max:.4e}")?;
        }
        if let Some(peak) = self.peak_at {
            write!(f, ", peak at {peak:.4}")?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    let config = args.viewer_config()?;
    let f_s = sample_frequency(&config.server, config.fallback_frequency);
    info!(
        "{} at {} Hz, timebase {} samples",
        config.server.address(),
        f_s,
        config.timebase
    );

    let (tx, rx) = mpsc::channel();
    let mut session = ViewerSession::new(&config, f_s, tx)?;
    session
        .start()
        .with_context(|| format!("unable to monitor {}", session.status()))?;

    let mut updates = 0;
    for event in rx.iter() {
        let stopped = matches!(event, MonitorEvent::Stopped { .. });
        if let Some(output) = session.handle(event) {
            updates += 1;
            let summary = Summary::new(updates, &session, &output);
            if args.json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                info!("{summary}");
            }
            if args.count.map_or(false, |n| updates >= n) {
                session.stop();
                break;
            }
        }
        if stopped {
            warn!("{}", session.status());
            break;
        }
    }
    info!("{updates} updates received");
    Ok(())
}
