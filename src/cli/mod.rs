//! CLI module for Keytrim
//!
//! This module handles command-line argument parsing and command execution.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config_initialization::ConfigOverrides;
use crate::utils::logging::LogFormat;

pub mod args;
pub mod commands;

pub use args::{InspectArgs, TrimArgs};

/// Keytrim - lossless MP4 trimming
///
/// Cuts a time range out of an MP4/MOV file without re-encoding: a byte copy
/// for full-range requests, a sample-table rewrite aligned to sync samples,
/// or a sample-by-sample stream copy when the rewrite is not possible.
#[derive(Parser, Debug)]
#[command(name = "keytrim")]
#[command(about = "Keytrim - lossless MP4 trimming")]
#[command(version)]
pub struct Cli {
    /// Logging level or filter directive (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Configuration file (default: ./keytrim.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Cut a time range out of a media file
    Trim(TrimArgs),
    /// Show the tracks of a media file
    Inspect(InspectArgs),
}

impl Cli {
    /// Configuration values given on the command line
    pub fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            config_path: self.config.clone(),
            log_level: self.log_level.clone(),
            log_format: self.log_format,
            ..ConfigOverrides::default()
        };
        if let Commands::Trim(args) = &self.command {
            overrides.worker_threads = args.threads;
            if args.no_audio {
                overrides.retain_audio = Some(false);
            }
            if args.no_video {
                overrides.retain_video = Some(false);
            }
        }
        overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trim() {
        let cli = Cli::try_parse_from([
            "keytrim", "--log-format", "json", "trim", "-i", "in.mp4", "-o", "out.mp4", "-s", "1.5",
            "-e", "00:03", "--no-audio", "--threads", "2",
        ])
        .unwrap();

        let overrides = cli.overrides();
        assert_eq!(overrides.log_format, Some(LogFormat::Json));
        assert_eq!(overrides.retain_audio, Some(false));
        assert_eq!(overrides.retain_video, None);
        assert_eq!(overrides.worker_threads, Some(2));
        match cli.command {
            Commands::Trim(args) => {
                assert_eq!(args.start, "1.5");
                assert_eq!(args.output, PathBuf::from("out.mp4"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from(["keytrim", "inspect", "--input", "a.mov", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Inspect(ref a) if a.json));
        assert!(cli.overrides().worker_threads.is_none());
    }

    #[test]
    fn test_missing_end_is_rejected() {
        assert!(Cli::try_parse_from(["keytrim", "trim", "-i", "a", "-o", "b", "-s", "0"]).is_err());
    }
}
