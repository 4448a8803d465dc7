//! Pull-model MP4 demuxer.
//!
//! Exposes samples of the selected tracks in decode-time order, reading
//! payloads straight from the underlying stream.

use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use super::{Movie, Mp4Track, TrackFormat};
use crate::domain::model::MediaType;
use crate::error::{TrimError, TrimResult};
use crate::ports::{Demuxer, SampleFlags, SampleInfo, TrackInfo};
use crate::utils::time::ticks_to_us;

/// Read position within one track.
#[derive(Debug, Clone)]
struct TrackCursor {
    selected: bool,
    /// Decode time of every sample, in ticks.
    decode_ticks: Vec<i64>,
    next: usize,
}

impl TrackCursor {
    fn exhausted(&self) -> bool {
        self.next >= self.decode_ticks.len()
    }
}

/// Demuxer over any seekable MP4 stream.
pub struct Mp4Demuxer<R> {
    reader: R,
    movie: Movie,
    cursors: Vec<TrackCursor>,
}

impl<R: Read + Seek> Mp4Demuxer<R> {
    /// Parse the movie; no track is selected yet.
    pub fn new(mut reader: R) -> TrimResult<Self> {
        let movie = Movie::read(&mut reader)?;
        let cursors = movie
            .tracks
            .iter()
            .map(|track| {
                let mut decode_ticks = Vec::with_capacity(track.sample_count());
                let mut t = 0i64;
                for &d in &track.timeline.sample_durations {
                    decode_ticks.push(t);
                    t += d as i64;
                }
                TrackCursor {
                    selected: false,
                    decode_ticks,
                    next: 0,
                }
            })
            .collect();
        Ok(Self {
            reader,
            movie,
            cursors,
        })
    }

    pub fn movie(&self) -> &Movie {
        &self.movie
    }

    fn track(&self, index: usize) -> TrimResult<&Mp4Track> {
        self.movie
            .tracks
            .get(index)
            .ok_or_else(|| TrimError::mux(format!("No track {}", index)))
    }

    fn presentation_us(&self, track: usize, sample: usize) -> i64 {
        let t = &self.movie.tracks[track];
        let ticks = self.cursors[track].decode_ticks[sample] + t.composition_offset(sample) as i64;
        ticks_to_us(ticks, t.timeline.timescale)
    }

    fn decode_us(&self, track: usize, sample: usize) -> i64 {
        ticks_to_us(
            self.cursors[track].decode_ticks[sample],
            self.movie.tracks[track].timeline.timescale,
        )
    }

    /// Selected track whose next sample decodes first; ties go to the lower index.
    fn current_track(&self) -> Option<usize> {
        self.cursors
            .iter()
            .enumerate()
            .filter(|(_, c)| c.selected && !c.exhausted())
            .min_by_key(|&(i, c)| (self.decode_us(i, c.next), i))
            .map(|(i, _)| i)
    }

    /// Last candidate sample whose presentation time is at or before `target_us`.
    /// Candidates are the sync samples, or every sample when the track has none.
    fn last_sync_at_or_before(&self, track: usize, target_us: i64) -> usize {
        let t = &self.movie.tracks[track];
        let candidates: Box<dyn Iterator<Item = usize>> = if t.timeline.has_sync_samples() {
            Box::new(t.timeline.sync_samples.iter().map(|&s| s as usize))
        } else {
            Box::new(0..t.sample_count())
        };
        let mut first = None;
        let mut best = None;
        for index in candidates {
            first.get_or_insert(index);
            if self.presentation_us(track, index) <= target_us {
                best = Some(index);
            }
        }
        best.or(first).unwrap_or(0)
    }
}

impl<R: Read + Seek> Demuxer for Mp4Demuxer<R> {
    type Format = TrackFormat;

    fn track_count(&self) -> usize {
        self.movie.tracks.len()
    }

    fn track_info(&self, index: usize) -> TrimResult<TrackInfo> {
        let track = self.track(index)?;
        Ok(TrackInfo {
            media_type: track.media_type(),
            max_sample_size: track.format.max_sample_size,
        })
    }

    fn track_format(&self, index: usize) -> TrimResult<TrackFormat> {
        Ok(self.track(index)?.format.clone())
    }

    fn rotation_degrees(&self) -> Option<i32> {
        self.movie.rotation_degrees()
    }

    fn select_track(&mut self, index: usize) -> TrimResult<()> {
        let cursor = self
            .cursors
            .get_mut(index)
            .ok_or_else(|| TrimError::mux(format!("No track {}", index)))?;
        cursor.selected = true;
        Ok(())
    }

    fn seek_to_previous_sync(&mut self, time_us: i64) -> TrimResult<()> {
        let selected: Vec<usize> = (0..self.cursors.len())
            .filter(|&i| self.cursors[i].selected)
            .collect();
        if selected.is_empty() {
            return Err(TrimError::mux("Seek without a selected track"));
        }

        let reference = selected
            .iter()
            .copied()
            .find(|&i| {
                let t = &self.movie.tracks[i];
                t.media_type() == MediaType::Video && t.timeline.has_sync_samples()
            })
            .unwrap_or(selected[0]);

        let anchor_sample = self.last_sync_at_or_before(reference, time_us);
        let anchor_us = self.presentation_us(reference, anchor_sample);
        self.cursors[reference].next = anchor_sample;

        for &index in selected.iter().filter(|&&i| i != reference) {
            let sample = self.last_sync_at_or_before(index, anchor_us);
            self.cursors[index].next = sample;
        }

        debug!(
            "Seek to {}us anchored on track {} sample {} at {}us",
            time_us, reference, anchor_sample, anchor_us
        );
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> TrimResult<Option<SampleInfo>> {
        let Some(track_index) = self.current_track() else {
            return Ok(None);
        };
        let sample = self.cursors[track_index].next;
        let track = &self.movie.tracks[track_index];
        let size = track.sizes[sample] as usize;
        let offset = track.offsets[sample];
        let duration_ticks = track.timeline.sample_durations[sample] as i64;
        let timescale = track.timeline.timescale;
        let flags = if track.timeline.is_sync(sample) {
            SampleFlags::SYNC
        } else {
            SampleFlags::NONE
        };

        if buf.len() < size {
            buf.resize(size, 0);
        }
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut buf[..size])?;

        Ok(Some(SampleInfo {
            track: track_index,
            size,
            presentation_time_us: self.presentation_us(track_index, sample),
            decode_time_us: self.decode_us(track_index, sample),
            duration_us: ticks_to_us(duration_ticks, timescale),
            flags,
        }))
    }

    fn advance(&mut self) -> bool {
        if let Some(track_index) = self.current_track() {
            self.cursors[track_index].next += 1;
        }
        self.current_track().is_some()
    }
}
