//! Identity copy for full-range requests

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::domain::model::{MediaSource, TrimRange};
use crate::error::{TrimError, TrimResult};
use crate::ports::SourceResolver;

/// Copies the source verbatim when the request spans the whole duration
pub struct IdentityCopier;

impl IdentityCopier {
    /// Create a new identity copier
    pub fn new() -> Self {
        Self
    }

    /// Whether the range covers `[0, duration]`
    pub fn is_possible(&self, range: &TrimRange) -> bool {
        range.is_full()
    }

    /// Copy every source byte to `destination`; returns the byte count
    pub fn copy(
        &self,
        resolver: &dyn SourceResolver,
        source: &MediaSource,
        destination: &Path,
    ) -> TrimResult<u64> {
        let mut reader = resolver.open(source)?;
        let expected = match source.size_bytes() {
            0 => {
                let len = reader.seek(SeekFrom::End(0))?;
                reader.seek(SeekFrom::Start(0))?;
                len
            }
            n => n,
        };

        let mut writer = BufWriter::new(File::create(destination)?);
        let copied = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        drop(writer);

        let written = std::fs::metadata(destination)?.len();
        if copied != expected || written != expected {
            return Err(TrimError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "copied {} of {} bytes ({} on disk)",
                    copied, expected, written
                ),
            )));
        }

        debug!("Identity copy wrote {} bytes to {}", written, destination.display());
        Ok(written)
    }
}

impl Default for IdentityCopier {
    fn default() -> Self {
        Self::new()
    }
}
