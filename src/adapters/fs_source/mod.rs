// Filesystem source adapter - resolves local media files

use std::fs::File;
use std::path::PathBuf;

use tracing::debug;

use crate::domain::model::{MediaSource, SourceLocator};
use crate::error::{TrimError, TrimResult};
use crate::ports::{ReadSeek, SourceResolver};

/// Resolves `SourceLocator::Path` sources on the local filesystem.
///
/// Opaque handles are not understood and stay unreadable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSourceResolver;

impl FsSourceResolver {
    pub fn new() -> Self {
        Self
    }
}

impl SourceResolver for FsSourceResolver {
    fn resolve_path(&self, source: &MediaSource) -> Option<PathBuf> {
        let path = source.local_path()?;
        if path.is_file() {
            Some(path.to_path_buf())
        } else {
            debug!("{} is not a readable file", path.display());
            None
        }
    }

    fn open(&self, source: &MediaSource) -> TrimResult<Box<dyn ReadSeek>> {
        match source.locator() {
            SourceLocator::Path(path) => {
                let file = File::open(path)
                    .map_err(|e| TrimError::unreadable(format!("{}: {}", path.display(), e)))?;
                Ok(Box::new(file))
            }
            SourceLocator::Handle(handle) => Err(TrimError::unreadable(format!(
                "no filesystem mapping for handle '{}'",
                handle
            ))),
        }
    }
}
