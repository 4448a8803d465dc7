//! Keytrim Library
//!
//! Lossless trimming of MP4/MOV files. A request is served by the first of
//! three strategies that succeeds:
//!
//! 1. identity copy, when the range covers the whole source;
//! 2. container rewrite, cropping every sample table to sync-sample
//!    boundaries and rebuilding the file around the original payload;
//! 3. stream copy, demuxing and remuxing the samples of the range.
//!
//! Jobs run on a [`runtime::TaskExecutor`] and report back through a
//! [`runtime::UiDispatcher`] exactly once.

pub mod adapters;
pub mod cli;
pub mod config_initialization;
pub mod domain;
pub mod engine;
pub mod error;
pub mod mp4;
pub mod ports;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use config_initialization::TrimConfig;
pub use domain::model::{MediaSource, SourceLocator, StreamSelection, TrimRange, TrimRequest};
pub use engine::{TrimCoordinator, TrimPipeline};
pub use error::{TrimError, TrimResult};
