// Domain models - Core types for sources, tracks and trim jobs

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{TrimError, TrimResult};

/// Media type of a track, derived from its handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Other,
}

impl MediaType {
    /// Map an MP4 handler type (`hdlr`) onto a media type
    pub fn from_handler(handler: &[u8; 4]) -> Self {
        match handler {
            b"vide" => MediaType::Video,
            b"soun" => MediaType::Audio,
            _ => MediaType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Other => "other",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a source lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// A local, byte-addressable file
    Path(PathBuf),
    /// An opaque handle understood by a `SourceResolver`
    Handle(String),
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Path(path) => write!(f, "{}", path.display()),
            SourceLocator::Handle(handle) => write!(f, "handle:{}", handle),
        }
    }
}

/// A resolved, read-only media source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    locator: SourceLocator,
    duration_ms: u64,
    size_bytes: u64,
}

impl MediaSource {
    /// Build a source from externally resolved values
    pub fn new(locator: SourceLocator, duration_ms: u64, size_bytes: u64) -> Self {
        Self {
            locator,
            duration_ms,
            size_bytes,
        }
    }

    /// Resolve duration and size of a local MP4/MOV file
    pub fn probe(path: impl AsRef<Path>) -> TrimResult<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| {
            TrimError::unreadable(format!("{}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(TrimError::unreadable(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let movie = crate::mp4::Movie::open(path)?;
        Ok(Self::new(
            SourceLocator::Path(path.to_path_buf()),
            movie.duration_ms(),
            metadata.len(),
        ))
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// The local path, when the locator is one
    pub fn local_path(&self) -> Option<&Path> {
        match &self.locator {
            SourceLocator::Path(path) => Some(path),
            SourceLocator::Handle(_) => None,
        }
    }
}

/// Milliseconds in `ticks` at `timescale`; `None` if the result exceeds `u64`
pub fn checked_ticks_to_ms(ticks: u64, timescale: u32) -> Option<u64> {
    if timescale == 0 {
        return None;
    }
    u64::try_from(ticks as u128 * 1000 / timescale as u128).ok()
}

/// Milliseconds in `ticks` at `timescale`, saturating at `u64::MAX`
pub fn ticks_to_ms(ticks: u64, timescale: u32) -> u64 {
    checked_ticks_to_ms(ticks, timescale).unwrap_or(u64::MAX)
}

/// Timing and keying information for one track
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub media_type: MediaType,
    /// Ticks per second
    pub timescale: u32,
    /// Per-sample decode durations in ticks
    pub sample_durations: Vec<u32>,
    /// 0-based sync sample indices, ascending. Empty means the track
    /// declares no sync table and imposes no re-anchoring constraint.
    pub sync_samples: Vec<u32>,
    /// Largest sample payload in bytes
    pub max_sample_size: u32,
}

impl Track {
    /// Create a track, validating its sync table against the sample count
    pub fn new(
        media_type: MediaType,
        timescale: u32,
        sample_durations: Vec<u32>,
        sync_samples: Vec<u32>,
        max_sample_size: u32,
    ) -> TrimResult<Self> {
        if timescale == 0 {
            return Err(TrimError::parse("track timescale is zero"));
        }
        let count = sample_durations.len();
        if sync_samples.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TrimError::parse("sync samples are not strictly ascending"));
        }
        if let Some(&last) = sync_samples.last() {
            if last as usize >= count {
                return Err(TrimError::parse(format!(
                    "sync sample {} outside {} samples",
                    last, count
                )));
            }
        }
        Ok(Self {
            media_type,
            timescale,
            sample_durations,
            sync_samples,
            max_sample_size,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.sample_durations.len()
    }

    /// Sum of sample durations in ticks
    pub fn duration_ticks(&self) -> u64 {
        self.sample_durations
            .iter()
            .fold(0u64, |total, &d| total.saturating_add(d as u64))
    }

    pub fn duration_secs(&self) -> f64 {
        self.ticks_to_secs(self.duration_ticks())
    }

    pub fn duration_ms(&self) -> u64 {
        ticks_to_ms(self.duration_ticks(), self.timescale)
    }

    pub fn ticks_to_secs(&self, ticks: u64) -> f64 {
        ticks as f64 / self.timescale as f64
    }

    pub fn has_sync_samples(&self) -> bool {
        !self.sync_samples.is_empty()
    }

    /// Whether a sample can be decoded on its own
    pub fn is_sync(&self, index: usize) -> bool {
        self.sync_samples.is_empty() || self.sync_samples.binary_search(&(index as u32)).is_ok()
    }

    /// Start time of every sample, in ticks
    pub fn sample_start_ticks(&self) -> Vec<u64> {
        let mut starts = Vec::with_capacity(self.sample_durations.len());
        let mut t = 0u64;
        for &d in &self.sample_durations {
            starts.push(t);
            t += d as u64;
        }
        starts
    }

    /// Start time of every sync sample, in seconds, ascending
    pub fn sync_sample_times_secs(&self) -> Vec<f64> {
        let starts = self.sample_start_ticks();
        self.sync_samples
            .iter()
            .map(|&i| self.ticks_to_secs(starts[i as usize]))
            .collect()
    }
}

/// Requested cut, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRange {
    pub start_ms: u64,
    pub end_ms: u64,
    pub total_duration_ms: u64,
}

impl TrimRange {
    /// Create a range, enforcing `0 <= start < end <= total`
    pub fn new(start_ms: u64, end_ms: u64, total_duration_ms: u64) -> TrimResult<Self> {
        if start_ms >= end_ms {
            return Err(TrimError::InvalidRange {
                message: format!("start {}ms must be before end {}ms", start_ms, end_ms),
            });
        }
        if end_ms > total_duration_ms {
            return Err(TrimError::InvalidRange {
                message: format!(
                    "end {}ms exceeds source duration {}ms",
                    end_ms, total_duration_ms
                ),
            });
        }
        Ok(Self {
            start_ms,
            end_ms,
            total_duration_ms,
        })
    }

    /// True when the range covers the whole source
    pub fn is_full(&self) -> bool {
        self.start_ms == 0 && self.end_ms == self.total_duration_ms
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }

    pub fn start_secs(&self) -> f64 {
        self.start_ms as f64 / 1000.0
    }

    pub fn end_secs(&self) -> f64 {
        self.end_ms as f64 / 1000.0
    }
}

impl fmt::Display for TrimRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}ms-{}ms of {}ms",
            self.start_ms, self.end_ms, self.total_duration_ms
        )
    }
}

/// Which media types the stream-copy fallback keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelection {
    pub audio: bool,
    pub video: bool,
}

impl Default for StreamSelection {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl StreamSelection {
    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }

    pub fn retains(&self, media_type: MediaType) -> bool {
        match media_type {
            MediaType::Audio => self.audio,
            MediaType::Video => self.video,
            MediaType::Other => false,
        }
    }
}

/// Lifecycle of a trim job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Status only ever moves forward
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A single trim request
#[derive(Debug, Clone)]
pub struct TrimRequest {
    pub source: MediaSource,
    pub destination: PathBuf,
    pub range: TrimRange,
    pub selection: StreamSelection,
    /// Executor group; `None` or empty means not cancellable
    pub group_id: Option<String>,
    /// Dispatcher token id; defaults to the group id
    pub dispatch_id: Option<String>,
}

impl TrimRequest {
    pub fn new(source: MediaSource, destination: impl Into<PathBuf>, range: TrimRange) -> Self {
        Self {
            source,
            destination: destination.into(),
            range,
            selection: StreamSelection::default(),
            group_id: None,
            dispatch_id: None,
        }
    }

    pub fn with_selection(mut self, selection: StreamSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_dispatch_id(mut self, dispatch_id: impl Into<String>) -> Self {
        self.dispatch_id = Some(dispatch_id.into());
        self
    }

    /// Id used to scope the completion callback
    pub fn effective_dispatch_id(&self) -> &str {
        self.dispatch_id
            .as_deref()
            .or(self.group_id.as_deref())
            .unwrap_or("")
    }
}
