//! Error handling module for Keytrim

use thiserror::Error;

/// Main error type for Keytrim operations
#[derive(Error, Debug)]
pub enum TrimError {
    /// Source could not be opened or resolved
    #[error("Source unreadable: {message}")]
    SourceUnreadable { message: String },

    /// Malformed or unsupported container structure
    #[error("Container parse error: {message}")]
    ContainerParse { message: String },

    /// More than one track carries its own sync-sample table
    #[error("Sync ambiguity: {tracks} tracks carry independent sync samples")]
    SyncAmbiguity { tracks: usize },

    /// Demuxer/muxer could not be configured
    #[error("Mux setup error: {message}")]
    MuxSetup { message: String },

    /// Work was cancelled before it started
    #[error("Cancelled before start")]
    Cancelled,

    /// Time range validation error
    #[error("Invalid time range: {message}")]
    InvalidRange { message: String },

    /// Invalid time format
    #[error("Invalid time format: {time}. Expected 1500ms, seconds, MM:SS.ms or HH:MM:SS.ms")]
    InvalidTime { time: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Executor no longer accepts work
    #[error("Task executor has been shut down")]
    ExecutorShutdown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// FFmpeg error
    #[cfg(feature = "libav")]
    #[error("FFmpeg error: {0}")]
    Libav(#[from] ffmpeg_next::Error),
}

/// Coarse error taxonomy used for logging and fallback decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SourceUnreadable,
    ContainerParse,
    SyncAmbiguity,
    MuxSetup,
    Io,
    Cancelled,
    Usage,
}

impl TrimError {
    pub fn parse(message: impl Into<String>) -> Self {
        TrimError::ContainerParse {
            message: message.into(),
        }
    }

    pub fn mux(message: impl Into<String>) -> Self {
        TrimError::MuxSetup {
            message: message.into(),
        }
    }

    pub fn unreadable(message: impl Into<String>) -> Self {
        TrimError::SourceUnreadable {
            message: message.into(),
        }
    }

    /// Map onto the coarse taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrimError::SourceUnreadable { .. } => ErrorKind::SourceUnreadable,
            TrimError::ContainerParse { .. } => ErrorKind::ContainerParse,
            TrimError::SyncAmbiguity { .. } => ErrorKind::SyncAmbiguity,
            TrimError::MuxSetup { .. } => ErrorKind::MuxSetup,
            TrimError::Io(_) => ErrorKind::Io,
            #[cfg(feature = "libav")]
            TrimError::Libav(_) => ErrorKind::Io,
            TrimError::Cancelled => ErrorKind::Cancelled,
            TrimError::InvalidRange { .. }
            | TrimError::InvalidTime { .. }
            | TrimError::Config { .. }
            | TrimError::ExecutorShutdown => ErrorKind::Usage,
        }
    }
}

/// Result type alias for Keytrim operations
pub type TrimResult<T> = std::result::Result<T, TrimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_io_kind() {
        let err: TrimError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_sync_ambiguity_message() {
        let err = TrimError::SyncAmbiguity { tracks: 2 };
        assert_eq!(err.kind(), ErrorKind::SyncAmbiguity);
        assert!(err.to_string().contains("2 tracks"));
    }
}
