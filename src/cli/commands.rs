//! Command implementations

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info};

use crate::adapters::FsSourceResolver;
use crate::cli::args::{InspectArgs, TrimArgs};
use crate::config_initialization::TrimConfig;
use crate::domain::model::{MediaSource, MediaType, TrimRange, TrimRequest};
use crate::engine::{TrimCoordinator, TrimHandle, TrimPipeline};
use crate::mp4::atoms::fourcc_str;
use crate::mp4::Movie;
use crate::runtime::{TaskExecutor, UiDispatcher, UiLoop};
use crate::utils::time::TimeParser;

/// Group and dispatch id of the single job the CLI submits
const CLI_JOB_ID: &str = "cli";

/// How long to wait for the callback once the job reports a final status
const CALLBACK_GRACE: Duration = Duration::from_secs(5);

/// Execute the trim command; returns the written file
pub fn trim(args: &TrimArgs, config: &TrimConfig) -> Result<PathBuf> {
    info!("Input: {}", args.input.display());
    info!("Output: {}", args.output.display());

    let parser = TimeParser::new();
    let start_ms = parser
        .parse_ms(&args.start)
        .with_context(|| format!("Invalid start time '{}'", args.start))?;
    let end_ms = parser
        .parse_ms(&args.end)
        .with_context(|| format!("Invalid end time '{}'", args.end))?;

    let source = MediaSource::probe(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let range = TrimRange::new(start_ms, end_ms, source.duration_ms()).context("Invalid trim range")?;
    info!("Range: {} of {}", range, parser.format_ms(source.duration_ms()));

    let executor = Arc::new(TaskExecutor::new(config.worker_threads).context("Failed to start workers")?);
    let (dispatcher, ui) = UiDispatcher::new();
    let pipeline = TrimPipeline::new(Arc::new(FsSourceResolver::new()), config.engine_options());
    let coordinator = TrimCoordinator::new(executor, dispatcher, pipeline);

    let request = TrimRequest::new(source, &args.output, range)
        .with_selection(config.selection())
        .with_group(CLI_JOB_ID);

    let completion: Arc<Mutex<Option<Option<PathBuf>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&completion);
    let handle = coordinator
        .trim(request, move |result| {
            if let Ok(mut slot) = slot.lock() {
                *slot = Some(result);
            }
        })
        .context("Failed to queue trim job")?;
    info!("Queued job {}", handle.job_id());

    // The main thread is the invoking context: pump until the callback lands
    pump_until_done(&ui, &handle, || completion.lock().map(|c| c.is_some()).unwrap_or(true))?;

    let result = completion.lock().ok().and_then(|mut c| c.take()).flatten();
    match result {
        Some(path) => {
            info!("Trim finished ({})", handle.status());
            Ok(path)
        }
        None => {
            error!("Trim failed ({})", handle.status());
            anyhow::bail!("Trim failed: no output was produced")
        }
    }
}

/// Run callbacks until `delivered` holds.
///
/// A job that ends without posting its callback (cancelled before it ran, or
/// panicked) stops the loop through its status instead.
fn pump_until_done<F>(ui: &UiLoop, handle: &TrimHandle, mut delivered: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    while !ui.run_until(Duration::from_secs(1), &mut delivered) {
        if let Some(finished) = handle.finished() {
            finished.context("Trim job did not run")?;
            // the callback is posted right after the final status
            ui.run_until(CALLBACK_GRACE, &mut delivered);
            break;
        }
    }
    Ok(())
}

/// One track as shown by `inspect`
#[derive(Debug, Serialize)]
pub struct TrackReport {
    pub index: usize,
    pub track_id: u32,
    pub media_type: MediaType,
    pub handler: String,
    pub timescale: u32,
    pub sample_count: usize,
    pub duration_ms: u64,
    pub sync_samples: usize,
    pub max_sample_size: u32,
}

/// Container summary shown by `inspect`
#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub rotation_degrees: Option<i32>,
    pub tracks: Vec<TrackReport>,
}

impl InspectReport {
    pub fn from_movie(path: &Path, size_bytes: u64, movie: &Movie) -> Self {
        let tracks = movie
            .tracks
            .iter()
            .enumerate()
            .map(|(index, track)| TrackReport {
                index,
                track_id: track.format.track_id,
                media_type: track.media_type(),
                handler: fourcc_str(&track.format.handler),
                timescale: track.timeline.timescale,
                sample_count: track.sample_count(),
                duration_ms: track.timeline.duration_ms(),
                sync_samples: track.timeline.sync_samples.len(),
                max_sample_size: track.timeline.max_sample_size,
            })
            .collect();
        Self {
            path: path.to_path_buf(),
            size_bytes,
            duration_ms: movie.duration_ms(),
            rotation_degrees: movie.rotation_degrees(),
            tracks,
        }
    }
}

/// Execute the inspect command
pub fn inspect(args: &InspectArgs) -> Result<()> {
    info!("Inspecting {}", args.input.display());

    let size_bytes = std::fs::metadata(&args.input)
        .with_context(|| format!("Input file does not exist: {}", args.input.display()))?
        .len();
    let movie = Movie::open(&args.input).context("Failed to parse input file")?;
    let report = InspectReport::from_movie(&args.input, size_bytes, &movie);

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report to JSON")?;
        println!("{}", json);
    } else {
        display_report(&report);
    }
    Ok(())
}

/// Display the report in human-readable format
fn display_report(report: &InspectReport) {
    let parser = TimeParser::new();
    println!("Media Information");
    println!("=================");
    println!("File: {}", report.path.display());
    println!("Duration: {}", parser.format_ms(report.duration_ms));
    println!("File Size: {} bytes", report.size_bytes);
    if let Some(rotation) = report.rotation_degrees {
        println!("Rotation: {}°", rotation);
    }
    println!();

    println!("Tracks:");
    for track in &report.tracks {
        println!(
            "  Track {} (id {}): {} [{}]",
            track.index, track.track_id, track.media_type, track.handler
        );
        println!(
            "    Timescale: {}, Samples: {}, Duration: {}",
            track.timescale,
            track.sample_count,
            parser.format_ms(track.duration_ms)
        );
        if track.sync_samples > 0 {
            println!("    Sync samples: {}", track.sync_samples);
        } else {
            println!("    Sync samples: all");
        }
        println!("    Max sample size: {} bytes", track.max_sample_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{JobStatus, SourceLocator};
    use std::sync::mpsc;

    #[test]
    fn test_pump_returns_when_job_is_cancelled() {
        let executor = Arc::new(TaskExecutor::new(1).unwrap());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        executor
            .submit(None, move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (dispatcher, ui) = UiDispatcher::new();
        let pipeline = TrimPipeline::new(Arc::new(FsSourceResolver::new()), Default::default());
        let coordinator = TrimCoordinator::new(Arc::clone(&executor), dispatcher, pipeline);
        let dir = tempfile::tempdir().unwrap();
        let source = MediaSource::new(SourceLocator::Path(dir.path().join("in.mp4")), 1000, 1);
        let request = TrimRequest::new(source, dir.path().join("out.mp4"), TrimRange::new(0, 500, 1000).unwrap())
            .with_group(CLI_JOB_ID);
        let handle = coordinator.trim(request, |_| {}).unwrap();
        coordinator.cancel(CLI_JOB_ID);

        let err = pump_until_done(&ui, &handle, || false).unwrap_err();
        assert!(err.to_string().contains("did not run"));
        assert_eq!(handle.status(), JobStatus::Cancelled);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_pump_returns_once_delivered() {
        let (dispatcher, ui) = UiDispatcher::new();
        let done = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&done);
        dispatcher.schedule("", move || *flag.lock().unwrap() = true, Duration::ZERO);

        let executor = Arc::new(TaskExecutor::new(1).unwrap());
        let pipeline = TrimPipeline::new(Arc::new(FsSourceResolver::new()), Default::default());
        let coordinator = TrimCoordinator::new(executor, dispatcher, pipeline);
        let dir = tempfile::tempdir().unwrap();
        let source = MediaSource::new(SourceLocator::Path(dir.path().join("missing.mp4")), 1000, 1);
        let request = TrimRequest::new(source, dir.path().join("out.mp4"), TrimRange::new(0, 500, 1000).unwrap());
        let handle = coordinator.trim(request, |_| {}).unwrap();

        pump_until_done(&ui, &handle, || *done.lock().unwrap()).unwrap();
        assert!(*done.lock().unwrap());
    }
}
