//! Core trimming engine module

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod container;
pub mod coordinator;
pub mod copy;
pub mod stream_copy;

pub use container::{ContainerTrimmer, CropPlan};
pub use coordinator::{AttemptReport, TrimCoordinator, TrimHandle, TrimOutcome, TrimPipeline};
pub use copy::IdentityCopier;
pub use stream_copy::{StreamCopyStats, StreamCopyTrimmer};

/// Default size of the sample buffer used by the stream-copy fallback
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default duration of an interleaved chunk in rewritten files
pub const DEFAULT_CHUNK_DURATION_MS: u64 = 1000;

/// Trimming strategies, attempted in `Strategy::ORDER`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Byte-for-byte copy of a full-range request
    IdentityCopy,
    /// Sample-table crop and container rebuild
    ContainerRewrite,
    /// Demux/mux copy of compressed samples
    StreamCopy,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [
        Strategy::IdentityCopy,
        Strategy::ContainerRewrite,
        Strategy::StreamCopy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::IdentityCopy => "identity-copy",
            Strategy::ContainerRewrite => "container-rewrite",
            Strategy::StreamCopy => "stream-copy",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Demux/mux implementation used by the stream-copy fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCopyBackend {
    /// Built-in MP4 demuxer and muxer
    #[default]
    Native,
    /// libavformat through `ffmpeg-next` (feature `libav`)
    Libav,
}

impl StreamCopyBackend {
    pub fn is_available(&self) -> bool {
        match self {
            StreamCopyBackend::Native => true,
            StreamCopyBackend::Libav => cfg!(feature = "libav"),
        }
    }
}

impl std::str::FromStr for StreamCopyBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(StreamCopyBackend::Native),
            "libav" => Ok(StreamCopyBackend::Libav),
            other => Err(format!("unknown stream-copy backend '{}'", other)),
        }
    }
}

/// Engine tuning shared by every job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Minimum sample buffer for stream copy
    pub default_buffer_size: usize,
    /// Target chunk duration in rewritten files
    pub chunk_duration_ms: u64,
    pub backend: StreamCopyBackend,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            chunk_duration_ms: DEFAULT_CHUNK_DURATION_MS,
            backend: StreamCopyBackend::Native,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_order() {
        assert_eq!(Strategy::ORDER[0], Strategy::IdentityCopy);
        assert_eq!(Strategy::ORDER[2], Strategy::StreamCopy);
        assert_eq!(Strategy::ContainerRewrite.to_string(), "container-rewrite");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("Native".parse::<StreamCopyBackend>().unwrap(), StreamCopyBackend::Native);
        assert_eq!("libav".parse::<StreamCopyBackend>().unwrap(), StreamCopyBackend::Libav);
        assert!("gstreamer".parse::<StreamCopyBackend>().is_err());
        assert!(StreamCopyBackend::Native.is_available());
    }
}
