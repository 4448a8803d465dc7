//! Demux/mux stream-copy fallback

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tracing::{debug, info};

use crate::domain::model::{MediaSource, StreamSelection, TrimRange};
use crate::error::{TrimError, TrimResult};
use crate::mp4::{Mp4Demuxer, Mp4Muxer};
use crate::ports::{Demuxer, Muxer, SourceResolver};

/// What a stream-copy run produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamCopyStats {
    pub tracks: usize,
    pub samples_written: u64,
    pub bytes_written: u64,
    /// Largest sample seen, which may exceed the declared maximum
    pub max_sample_size: usize,
}

/// Copies compressed samples between a demuxer and a fresh muxer
pub struct StreamCopyTrimmer {
    selection: StreamSelection,
    min_buffer_size: usize,
}

impl StreamCopyTrimmer {
    pub fn new(selection: StreamSelection, min_buffer_size: usize) -> Self {
        Self {
            selection,
            min_buffer_size,
        }
    }

    /// Copy `range` from `demuxer` into `muxer`, then finalize the muxer
    pub fn trim<D, M>(&self, demuxer: &mut D, muxer: &mut M, range: &TrimRange) -> TrimResult<StreamCopyStats>
    where
        D: Demuxer,
        M: Muxer<Format = D::Format>,
    {
        // source track index -> muxer track index
        let mut track_map: Vec<Option<usize>> = vec![None; demuxer.track_count()];
        let mut declared_max: Option<u32> = None;
        let mut tracks = 0usize;

        for index in 0..demuxer.track_count() {
            let info = demuxer.track_info(index)?;
            if !self.selection.retains(info.media_type) {
                debug!("Skipping {} track {}", info.media_type, index);
                continue;
            }
            demuxer.select_track(index)?;
            let format = demuxer.track_format(index)?;
            track_map[index] = Some(muxer.add_track(&format)?);
            if let Some(size) = info.max_sample_size {
                declared_max = Some(declared_max.map_or(size, |m| m.max(size)));
            }
            tracks += 1;
        }
        if tracks == 0 {
            return Err(TrimError::mux(format!(
                "No track matches the selection (audio: {}, video: {})",
                self.selection.audio, self.selection.video
            )));
        }

        let capacity = match declared_max {
            Some(size) if size > 0 => size as usize,
            _ => self.min_buffer_size,
        };
        let mut buffer = Vec::with_capacity(capacity);

        if let Some(degrees) = demuxer.rotation_degrees() {
            if degrees != 0 {
                muxer.set_orientation_hint(degrees)?;
            }
        }

        muxer.start()?;

        let start_us = ms_to_us(range.start_ms);
        let end_us = ms_to_us(range.end_ms);
        if range.start_ms > 0 {
            demuxer.seek_to_previous_sync(start_us)?;
        }

        let mut stats = StreamCopyStats {
            tracks,
            ..StreamCopyStats::default()
        };
        while let Some(sample) = demuxer.read_sample(&mut buffer)? {
            if sample.presentation_time_us > end_us {
                break;
            }
            let target = track_map
                .get(sample.track)
                .copied()
                .flatten()
                .ok_or_else(|| TrimError::mux(format!("Sample from unselected track {}", sample.track)))?;
            if sample.size > capacity && sample.size > stats.max_sample_size {
                debug!("Sample of {} bytes exceeds the {} byte buffer", sample.size, capacity);
            }
            muxer.write_sample(target, &buffer[..sample.size], &sample)?;

            stats.samples_written += 1;
            stats.bytes_written += sample.size as u64;
            stats.max_sample_size = stats.max_sample_size.max(sample.size);
            if !demuxer.advance() {
                break;
            }
        }

        muxer.stop()?;
        Ok(stats)
    }

    /// Run the built-in MP4 demuxer and muxer from `source` into `destination`
    pub fn trim_file(
        &self,
        resolver: &dyn SourceResolver,
        source: &MediaSource,
        destination: &Path,
        range: &TrimRange,
    ) -> TrimResult<StreamCopyStats> {
        let reader = resolver.open(source)?;
        let mut demuxer = Mp4Demuxer::new(BufReader::new(reader))?;
        let mut muxer = Mp4Muxer::new(BufWriter::new(File::create(destination)?));
        let stats = self.trim(&mut demuxer, &mut muxer, range)?;
        info!(
            "Stream copy wrote {} samples ({} bytes) across {} tracks",
            stats.samples_written, stats.bytes_written, stats.tracks
        );
        Ok(stats)
    }
}

/// Milliseconds to microseconds, saturating at `i64::MAX`
fn ms_to_us(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX).saturating_mul(1000)
}

impl Default for StreamCopyTrimmer {
    fn default() -> Self {
        Self::new(StreamSelection::default(), crate::engine::DEFAULT_BUFFER_SIZE)
    }
}
