//! Command-line argument definitions

use std::path::PathBuf;

use clap::Args;

/// Arguments for the trim command
#[derive(Args, Debug)]
pub struct TrimArgs {
    /// Input media file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output file path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Start time (1500ms, seconds, MM:SS.ms or HH:MM:SS.ms)
    #[arg(short, long)]
    pub start: String,

    /// End time (1500ms, seconds, MM:SS.ms or HH:MM:SS.ms)
    #[arg(short, long)]
    pub end: String,

    /// Drop audio tracks in the stream-copy fallback
    #[arg(long)]
    pub no_audio: bool,

    /// Drop video tracks in the stream-copy fallback
    #[arg(long)]
    pub no_video: bool,

    /// Worker threads
    #[arg(long)]
    pub threads: Option<usize>,
}

/// Arguments for the inspect command
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Input media file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
