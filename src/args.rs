//! Argument parsing for running from the command line

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::catalogue::{find_bpm, timebase_by_label};
use crate::config::ViewerConfig;
use crate::drivers::ModeKind;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Live FA beam position viewer", long_about = None)]
pub struct Args {
    /// JSON configuration file; command line options override it
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// FA server host
    #[clap(long)]
    pub host: Option<String>,
    /// FA server port
    #[clap(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,
    /// Channel id to monitor
    #[clap(long, conflicts_with = "bpm")]
    pub channel: Option<u8>,
    /// BPM to monitor, by name (e.g. SR01C-DI-EBPM-03)
    #[clap(short, long)]
    pub bpm: Option<String>,
    /// Window length: a sample count or a label such as 250ms or 2.5s
    #[clap(short, long, value_parser = parse_timebase)]
    pub timebase: Option<usize>,
    /// Display mode: raw, fft, fft_log_f or integrated
    #[clap(short, long, value_parser = parse_mode)]
    pub mode: Option<ModeKind>,
    /// Server starts streaming without a status byte
    #[clap(long)]
    pub no_ack: bool,
    /// Print each update summary as a JSON line on stdout
    #[clap(long)]
    pub json: bool,
    /// Stop after this many updates
    #[clap(short = 'n', long)]
    pub count: Option<usize>,
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Args {
    /// Configuration file (or defaults) with the command line applied on top.
    pub fn viewer_config(&self) -> Result<ViewerConfig> {
        let mut config = match &self.config {
            Some(path) => ViewerConfig::load(path)?,
            None => ViewerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.no_ack {
            config.server.expect_ack = false;
        }
        if let Some(channel) = self.channel {
            config.channel = channel;
        }
        if let Some(name) = &self.bpm {
            match find_bpm(name) {
                Some(bpm) => config.channel = bpm.id,
                None => bail!("unknown BPM {name}"),
            }
        }
        if let Some(timebase) = self.timebase {
            config.timebase = timebase;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_timebase(s: &str) -> Result<usize, String> {
    timebase_by_label(s)
        .or_else(|| s.trim().parse().ok())
        .ok_or_else(|| format!("invalid timebase {s}"))
}

fn parse_mode(s: &str) -> Result<ModeKind, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "raw" => Ok(ModeKind::Raw),
        "fft" => Ok(ModeKind::Fft),
        "fft_log_f" | "logf" => Ok(ModeKind::FftLogF),
        "integrated" => Ok(ModeKind::Integrated),
        _ => Err(format!("unknown mode {s}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpm_name_selects_channel() {
        let args = Args::parse_from(["fa-viewer", "--bpm", "SR02C-DI-EBPM-03", "-t", "250ms"]);
        let config = args.viewer_config().unwrap();
        assert_eq!(config.channel, 10);
        assert_eq!(config.timebase, 2500);
    }

    #[test]
    fn overrides_apply_over_defaults() {
        let args = Args::parse_from([
            "fa-viewer", "--host", "localhost", "-p", "9999", "--no-ack", "-m", "integrated",
            "-t", "4000", "-vv",
        ]);
        let config = args.viewer_config().unwrap();
        assert_eq!(config.server.address(), "localhost:9999");
        assert!(!config.server.expect_ack);
        assert_eq!(config.mode, ModeKind::Integrated);
        assert_eq!(config.timebase, 4000);
        assert_eq!(args.verbose.log_level_filter(), log::LevelFilter::Trace);
    }

    #[test]
    fn verbosity_defaults_to_info() {
        let args = Args::parse_from(["fa-viewer"]);
        assert_eq!(args.verbose.log_level_filter(), log::LevelFilter::Info);
        let args = Args::parse_from(["fa-viewer", "-q"]);
        assert_eq!(args.verbose.log_level_filter(), log::LevelFilter::Warn);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Args::try_parse_from(["fa-viewer", "-m", "waterfall"]).is_err());
        assert!(Args::try_parse_from(["fa-viewer", "--channel", "1", "--bpm", "x"]).is_err());
        let args = Args::parse_from(["fa-viewer", "--bpm", "SR99C-DI-EBPM-01"]);
        assert!(args.viewer_config().is_err());
    }
}
