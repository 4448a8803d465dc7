//! Lossless sample-table crop.
//!
//! Aligns the requested cut to the sync samples of the single keyed track,
//! crops every track's sample table and rebuilds the file around the original
//! encoded payloads. Nothing is decoded.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::domain::model::{Track, TrimRange};
use crate::error::{TrimError, TrimResult};
use crate::mp4::atoms::mdat_header_large;
use crate::mp4::writer::{build_moov, default_ftyp, ChunkEntry, TrakBuild};
use crate::mp4::Movie;
use crate::utils::time::ticks_to_us;

/// Cut points after sync correction, plus the crop applied to each track.
#[derive(Debug, Clone, PartialEq)]
pub struct CropPlan {
    pub corrected_start_secs: f64,
    pub corrected_end_secs: f64,
    /// Track whose sync samples anchored the cut, if any
    pub keyed_track: Option<usize>,
    /// Per track `[first, end)` sample range
    pub crops: Vec<(usize, usize)>,
}

impl CropPlan {
    pub fn duration_secs(&self) -> f64 {
        self.corrected_end_secs - self.corrected_start_secs
    }
}

/// Snap a cut to a sync sample of `track`.
///
/// With `next == false` this is the greatest sync time at or before `cut_secs`
/// (the first sync time if none is). With `next == true` it is the smallest
/// sync time after `cut_secs` (the last sync time if none is).
pub fn correct_time_to_sync_sample(track: &Track, cut_secs: f64, next: bool) -> f64 {
    let times = track.sync_sample_times_secs();
    let picked = if next {
        times.iter().find(|&&t| t > cut_secs).or(times.last())
    } else {
        times.iter().rev().find(|&&t| t <= cut_secs).or(times.first())
    };
    picked.copied().unwrap_or(cut_secs)
}

/// Sample range of `track` covering `[start_secs, end_secs)`.
///
/// The first index is the last sample starting at or before `start_secs`; the
/// end index is the last sample starting at or before `end_secs`, excluded.
/// Zero-duration samples never move a bound.
pub fn crop_bounds(track: &Track, start_secs: f64, end_secs: f64) -> (usize, usize) {
    let mut first = 0usize;
    let mut end = 0usize;
    let mut current = 0u64;
    let mut last_time = -1.0f64;
    for (index, &duration) in track.sample_durations.iter().enumerate() {
        let time = track.ticks_to_secs(current);
        if time > last_time {
            if time <= start_secs {
                first = index;
            }
            if time <= end_secs {
                end = index;
            }
        }
        last_time = time;
        current += duration as u64;
    }
    (first, end)
}

/// A run of samples from one track, placed contiguously in the output.
#[derive(Debug, Clone)]
struct PlannedChunk {
    track: usize,
    start_us: i64,
    first_sample: usize,
    count: usize,
}

/// Sample-table rewrite strategy
pub struct ContainerTrimmer {
    chunk_duration_ms: u64,
}

impl ContainerTrimmer {
    pub fn new(chunk_duration_ms: u64) -> Self {
        Self {
            chunk_duration_ms: chunk_duration_ms.max(1),
        }
    }

    /// Compute the sync-corrected crop for every track
    pub fn plan(&self, movie: &Movie, range: &TrimRange) -> TrimResult<CropPlan> {
        let keyed: Vec<usize> = movie
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.timeline.has_sync_samples())
            .map(|(i, _)| i)
            .collect();
        if keyed.len() > 1 {
            return Err(TrimError::SyncAmbiguity {
                tracks: keyed.len(),
            });
        }

        let mut start = range.start_secs();
        let mut end = range.end_secs();
        let keyed_track = keyed.first().copied();
        if let Some(index) = keyed_track {
            let timeline = &movie.tracks[index].timeline;
            start = correct_time_to_sync_sample(timeline, start, false);
            end = correct_time_to_sync_sample(timeline, end, true);
        }

        let mut crops = Vec::with_capacity(movie.tracks.len());
        for (index, track) in movie.tracks.iter().enumerate() {
            let (first, last) = crop_bounds(&track.timeline, start, end);
            if last <= first {
                return Err(TrimError::parse(format!(
                    "empty crop on track {} ({:.3}s-{:.3}s)",
                    track.format.track_id, start, end
                )));
            }
            crops.push((first, last));
        }

        Ok(CropPlan {
            corrected_start_secs: start,
            corrected_end_secs: end,
            keyed_track,
            crops,
        })
    }

    /// Crop `source` into `destination`
    pub fn trim(&self, source: &Path, destination: &Path, range: &TrimRange) -> TrimResult<CropPlan> {
        let file = File::open(source)
            .map_err(|e| TrimError::unreadable(format!("{}: {}", source.display(), e)))?;
        let mut reader = BufReader::new(file);
        let movie = Movie::read(&mut reader)?;
        let plan = self.plan(&movie, range)?;

        info!(
            "Container rewrite: requested {:.3}s-{:.3}s, corrected {:.3}s-{:.3}s",
            range.start_secs(),
            range.end_secs(),
            plan.corrected_start_secs,
            plan.corrected_end_secs
        );

        let written = self.write_cropped(&movie, &plan, &mut reader, destination)?;
        debug!("Container rewrite wrote {} bytes", written);
        Ok(plan)
    }

    /// Split each cropped track into chunks and interleave them by start time
    fn plan_chunks(&self, movie: &Movie, plan: &CropPlan) -> Vec<PlannedChunk> {
        let mut chunks: Vec<PlannedChunk> = Vec::new();
        for (index, track) in movie.tracks.iter().enumerate() {
            let (first, end) = plan.crops[index];
            let timescale = track.timeline.timescale;
            let chunk_ticks = (self.chunk_duration_ms.saturating_mul(timescale as u64) / 1000).max(1);

            let mut elapsed_in_chunk = 0u64;
            let mut crop_time = 0u64;
            for sample in first..end {
                let starts_chunk = match chunks.last() {
                    Some(PlannedChunk { track, .. }) if *track == index => elapsed_in_chunk >= chunk_ticks,
                    _ => true,
                };
                if starts_chunk {
                    chunks.push(PlannedChunk {
                        track: index,
                        start_us: ticks_to_us(crop_time as i64, timescale),
                        first_sample: sample,
                        count: 0,
                    });
                    elapsed_in_chunk = 0;
                }
                if let Some(chunk) = chunks.last_mut() {
                    chunk.count += 1;
                }
                let duration = track.timeline.sample_durations[sample] as u64;
                elapsed_in_chunk += duration;
                crop_time += duration;
            }
        }
        chunks.sort_by_key(|c| (c.start_us, c.track));
        chunks
    }

    fn write_cropped<R: Read + Seek>(
        &self,
        movie: &Movie,
        plan: &CropPlan,
        reader: &mut R,
        destination: &Path,
    ) -> TrimResult<u64> {
        let chunks = self.plan_chunks(movie, plan);

        // Offsets relative to the first payload byte.
        let mut entries: Vec<Vec<ChunkEntry>> = vec![Vec::new(); movie.tracks.len()];
        let mut payload_len = 0u64;
        for chunk in &chunks {
            let track = &movie.tracks[chunk.track];
            entries[chunk.track].push(ChunkEntry {
                offset: payload_len,
                samples: chunk.count as u32,
            });
            let range = chunk.first_sample..chunk.first_sample + chunk.count;
            payload_len += track.sizes[range].iter().map(|&s| s as u64).sum::<u64>();
        }

        let traks: Vec<TrakBuild<'_>> = movie
            .tracks
            .iter()
            .enumerate()
            .map(|(index, track)| {
                let (first, end) = plan.crops[index];
                let sync_samples = if track.timeline.has_sync_samples() {
                    Some(
                        track
                            .timeline
                            .sync_samples
                            .iter()
                            .filter(|&&s| (s as usize) >= first && (s as usize) < end)
                            .map(|&s| s - first as u32)
                            .collect(),
                    )
                } else {
                    None
                };
                let composition_offsets = if track.composition_offsets.is_empty() {
                    Vec::new()
                } else {
                    track.composition_offsets[first..end].to_vec()
                };
                TrakBuild {
                    format: &track.format,
                    track_id: track.format.track_id,
                    header: track.format.header.clone(),
                    durations: track.timeline.sample_durations[first..end].to_vec(),
                    sizes: track.sizes[first..end].to_vec(),
                    composition_offsets,
                    sync_samples,
                    chunks: std::mem::take(&mut entries[index]),
                    edit_delay: 0,
                }
            })
            .collect();

        let movie_timescale = if movie.timescale > 0 { movie.timescale } else { 1000 };
        let ftyp = movie.ftyp.clone().unwrap_or_else(default_ftyp);
        let mdat_header = 16u64;

        // moov size depends on stco vs co64, which depends on where mdat lands.
        let mut base = ftyp.len() as u64 + build_moov(movie_timescale, 0, &traks).len() as u64 + mdat_header;
        let mut moov = build_moov(movie_timescale, base, &traks);
        for _ in 0..4 {
            let next_base = ftyp.len() as u64 + moov.len() as u64 + mdat_header;
            if next_base == base {
                break;
            }
            base = next_base;
            moov = build_moov(movie_timescale, base, &traks);
        }

        let mut writer = BufWriter::new(File::create(destination)?);
        writer.write_all(&ftyp)?;
        writer.write_all(&moov)?;
        writer.write_all(&mdat_header_large(mdat_header + payload_len))?;

        let mut pending: Option<(u64, u64)> = None;
        for chunk in &chunks {
            let track = &movie.tracks[chunk.track];
            for sample in chunk.first_sample..chunk.first_sample + chunk.count {
                let offset = track.offsets[sample];
                let size = track.sizes[sample] as u64;
                pending = match pending {
                    Some((start, len)) if start + len == offset => Some((start, len + size)),
                    Some((start, len)) => {
                        copy_range(reader, &mut writer, start, len)?;
                        Some((offset, size))
                    }
                    None => Some((offset, size)),
                };
            }
        }
        if let Some((start, len)) = pending {
            copy_range(reader, &mut writer, start, len)?;
        }
        writer.flush()?;

        Ok(base + payload_len)
    }
}

impl Default for ContainerTrimmer {
    fn default() -> Self {
        Self::new(crate::engine::DEFAULT_CHUNK_DURATION_MS)
    }
}

/// Stream `len` source bytes starting at `offset` into `writer`.
fn copy_range<R: Read + Seek, W: Write>(reader: &mut R, writer: &mut W, offset: u64, len: u64) -> io::Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    let copied = io::copy(&mut reader.by_ref().take(len), writer)?;
    if copied != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("payload at {} truncated: {} of {} bytes", offset, copied, len),
        ));
    }
    Ok(())
}
