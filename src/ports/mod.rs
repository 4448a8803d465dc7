// Ports - Interface definitions for external collaborators

use std::fmt;
use std::io::{Read, Seek};
use std::path::PathBuf;

use crate::domain::model::{MediaSource, MediaType};
use crate::error::TrimResult;

/// A readable, seekable byte stream that can move to a worker thread
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Port mapping an opaque source onto something the engine can read
pub trait SourceResolver: Send + Sync {
    /// Local byte-addressable path, if the source has one
    fn resolve_path(&self, source: &MediaSource) -> Option<PathBuf>;

    /// Open the source as a readable stream
    fn open(&self, source: &MediaSource) -> TrimResult<Box<dyn ReadSeek>>;
}

/// Per-sample flags exchanged between demuxer and muxer
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const NONE: SampleFlags = SampleFlags(0);
    /// Independently decodable sample
    pub const SYNC: SampleFlags = SampleFlags(1);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        SampleFlags(bits)
    }

    pub fn contains(&self, other: SampleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_sync(&self) -> bool {
        self.contains(SampleFlags::SYNC)
    }
}

impl std::ops::BitOr for SampleFlags {
    type Output = SampleFlags;

    fn bitor(self, rhs: SampleFlags) -> SampleFlags {
        SampleFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for SampleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sync() {
            write!(f, "SampleFlags(SYNC)")
        } else {
            write!(f, "SampleFlags({:#x})", self.0)
        }
    }
}

/// Metadata of one compressed sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    /// Source track index
    pub track: usize,
    /// Payload size in bytes
    pub size: usize,
    pub presentation_time_us: i64,
    pub decode_time_us: i64,
    pub duration_us: i64,
    pub flags: SampleFlags,
}

/// Summary of a demuxer track used for selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackInfo {
    pub media_type: MediaType,
    /// Declared largest sample, if the container knows it
    pub max_sample_size: Option<u32>,
}

/// Port for pulling compressed samples out of a container
///
/// Samples are exposed one at a time: `read_sample` copies the current
/// sample, `advance` moves past it.
pub trait Demuxer {
    /// Track description handed to a compatible muxer
    type Format;

    fn track_count(&self) -> usize;

    fn track_info(&self, index: usize) -> TrimResult<TrackInfo>;

    fn track_format(&self, index: usize) -> TrimResult<Self::Format>;

    /// Container-level orientation hint, in degrees
    fn rotation_degrees(&self) -> Option<i32>;

    /// Include a track in `read_sample`/`advance`
    fn select_track(&mut self, index: usize) -> TrimResult<()>;

    /// Position every selected track at or before `time_us`, on sync samples
    fn seek_to_previous_sync(&mut self, time_us: i64) -> TrimResult<()>;

    /// Copy the current sample into `buf`, growing it if needed.
    /// Returns `None` once every selected track is exhausted.
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> TrimResult<Option<SampleInfo>>;

    /// Move past the current sample; false when nothing remains
    fn advance(&mut self) -> bool;
}

/// Port for writing compressed samples into a fresh container
pub trait Muxer {
    type Format;

    /// Register a track; returns its muxer index
    fn add_track(&mut self, format: &Self::Format) -> TrimResult<usize>;

    /// Orientation applied to video tracks, in degrees
    fn set_orientation_hint(&mut self, degrees: i32) -> TrimResult<()>;

    fn start(&mut self) -> TrimResult<()>;

    fn write_sample(&mut self, track: usize, data: &[u8], info: &SampleInfo) -> TrimResult<()>;

    /// Finalize and flush the container
    fn stop(&mut self) -> TrimResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_flags() {
        assert!(SampleFlags::SYNC.is_sync());
        assert!(!SampleFlags::NONE.is_sync());
        let combined = SampleFlags::NONE | SampleFlags::SYNC;
        assert_eq!(combined.bits(), 1);
        assert!(SampleFlags::from_bits(3).contains(SampleFlags::SYNC));
    }
}
