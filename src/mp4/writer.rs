//! `moov` serialization for non-fragmented output.
//!
//! Both the sample-table rewrite and the muxer describe each output track as a
//! [`TrakBuild`] and hand the set to [`build_moov`].

use super::atoms::{fullbox_header, write_box, write_container_box, write_full_box};
use super::{TrackFormat, TrackHeader};
use crate::utils::time::rescale;

/// A run of consecutive samples stored contiguously in `mdat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Offset of the first sample, relative to the `chunk_base` given to `build_moov`.
    pub offset: u64,
    pub samples: u32,
}

/// Everything needed to serialize one output `trak`.
#[derive(Debug, Clone)]
pub struct TrakBuild<'a> {
    pub format: &'a TrackFormat,
    pub track_id: u32,
    pub header: TrackHeader,
    /// Per-sample decode deltas in media ticks.
    pub durations: Vec<u32>,
    pub sizes: Vec<u32>,
    /// Per-sample composition offsets; empty writes no `ctts`.
    pub composition_offsets: Vec<i32>,
    /// 0-based sync indices; `None` writes no `stss`.
    pub sync_samples: Option<Vec<u32>>,
    pub chunks: Vec<ChunkEntry>,
    /// Empty edit before the media starts, in movie ticks; 0 writes no `edts`.
    pub edit_delay: u64,
}

impl TrakBuild<'_> {
    pub fn media_duration(&self) -> u64 {
        self.durations.iter().map(|&d| d as u64).sum()
    }

    fn presentation_duration(&self, movie_timescale: u32) -> u64 {
        rescale(self.media_duration(), self.format.timescale, movie_timescale)
    }
}

/// Default `ftyp` used when the source carries none.
pub fn default_ftyp() -> Vec<u8> {
    let mut content = Vec::with_capacity(20);
    content.extend_from_slice(b"isom");
    content.extend_from_slice(&0x200u32.to_be_bytes());
    content.extend_from_slice(b"isom");
    content.extend_from_slice(b"iso2");
    content.extend_from_slice(b"mp41");
    write_box(b"ftyp", &content)
}

/// Serialize a complete `moov` box.
pub fn build_moov(movie_timescale: u32, chunk_base: u64, traks: &[TrakBuild<'_>]) -> Vec<u8> {
    let movie_duration = traks
        .iter()
        .map(|t| t.edit_delay + t.presentation_duration(movie_timescale))
        .max()
        .unwrap_or(0);
    let next_track_id = traks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;

    let mut children = vec![write_mvhd(movie_timescale, movie_duration, next_track_id)];
    for trak in traks {
        children.push(write_trak(movie_timescale, chunk_base, trak));
    }
    let refs: Vec<&[u8]> = children.iter().map(|c| c.as_slice()).collect();
    write_container_box(b"moov", &refs)
}

fn needs_64(values: &[u64]) -> bool {
    values.iter().any(|&v| v > u32::MAX as u64)
}

fn write_matrix(content: &mut Vec<u8>, matrix: &[i32; 9]) {
    for value in matrix {
        content.extend_from_slice(&value.to_be_bytes());
    }
}

fn write_mvhd(timescale: u32, duration: u64, next_track_id: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(108);
    if needs_64(&[duration]) {
        content.extend_from_slice(&fullbox_header(1, 0));
        content.extend_from_slice(&0u64.to_be_bytes()); // creation_time
        content.extend_from_slice(&0u64.to_be_bytes()); // modification_time
        content.extend_from_slice(&timescale.to_be_bytes());
        content.extend_from_slice(&duration.to_be_bytes());
    } else {
        content.extend_from_slice(&fullbox_header(0, 0));
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&timescale.to_be_bytes());
        content.extend_from_slice(&(duration as u32).to_be_bytes());
    }
    // rate 1.0, volume 1.0
    content.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    content.extend_from_slice(&0x0100u16.to_be_bytes());
    content.extend_from_slice(&[0u8; 10]);
    write_matrix(&mut content, &super::IDENTITY_MATRIX);
    content.extend_from_slice(&[0u8; 24]);
    content.extend_from_slice(&next_track_id.to_be_bytes());
    write_box(b"mvhd", &content)
}

fn write_tkhd(track_id: u32, duration: u64, header: &TrackHeader) -> Vec<u8> {
    let mut content = Vec::with_capacity(96);
    if needs_64(&[duration]) {
        content.extend_from_slice(&fullbox_header(1, header.flags));
        content.extend_from_slice(&0u64.to_be_bytes());
        content.extend_from_slice(&0u64.to_be_bytes());
        content.extend_from_slice(&track_id.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&duration.to_be_bytes());
    } else {
        content.extend_from_slice(&fullbox_header(0, header.flags));
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&track_id.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&(duration as u32).to_be_bytes());
    }
    content.extend_from_slice(&[0u8; 8]);
    content.extend_from_slice(&header.layer.to_be_bytes());
    content.extend_from_slice(&header.alternate_group.to_be_bytes());
    content.extend_from_slice(&header.volume.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    write_matrix(&mut content, &header.matrix);
    content.extend_from_slice(&header.width.to_be_bytes());
    content.extend_from_slice(&header.height.to_be_bytes());
    write_box(b"tkhd", &content)
}

/// Empty edit of `delay` movie ticks followed by the whole media.
fn write_edts(delay: u64, media_duration: u64) -> Vec<u8> {
    let mut content = Vec::new();
    if needs_64(&[delay, media_duration]) {
        content.extend_from_slice(&fullbox_header(1, 0));
        content.extend_from_slice(&2u32.to_be_bytes());
        content.extend_from_slice(&delay.to_be_bytes());
        content.extend_from_slice(&(-1i64).to_be_bytes());
        content.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        content.extend_from_slice(&media_duration.to_be_bytes());
        content.extend_from_slice(&0i64.to_be_bytes());
        content.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    } else {
        content.extend_from_slice(&fullbox_header(0, 0));
        content.extend_from_slice(&2u32.to_be_bytes());
        content.extend_from_slice(&(delay as u32).to_be_bytes());
        content.extend_from_slice(&(-1i32).to_be_bytes());
        content.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        content.extend_from_slice(&(media_duration as u32).to_be_bytes());
        content.extend_from_slice(&0i32.to_be_bytes());
        content.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    }
    let elst = write_box(b"elst", &content);
    write_box(b"edts", &elst)
}

fn write_mdhd(timescale: u32, duration: u64, language: u16) -> Vec<u8> {
    let mut content = Vec::with_capacity(36);
    if needs_64(&[duration]) {
        content.extend_from_slice(&fullbox_header(1, 0));
        content.extend_from_slice(&0u64.to_be_bytes());
        content.extend_from_slice(&0u64.to_be_bytes());
        content.extend_from_slice(&timescale.to_be_bytes());
        content.extend_from_slice(&duration.to_be_bytes());
    } else {
        content.extend_from_slice(&fullbox_header(0, 0));
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&timescale.to_be_bytes());
        content.extend_from_slice(&(duration as u32).to_be_bytes());
    }
    content.extend_from_slice(&language.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    write_box(b"mdhd", &content)
}

/// Collapse a sequence into (count, value) runs.
fn runs<T: Copy + PartialEq>(values: &[T]) -> Vec<(u32, T)> {
    let mut out: Vec<(u32, T)> = Vec::new();
    for &v in values {
        match out.last_mut() {
            Some((count, last)) if *last == v => *count += 1,
            _ => out.push((1, v)),
        }
    }
    out
}

fn write_stts(durations: &[u32]) -> Vec<u8> {
    let entries = runs(durations);
    let mut content = Vec::with_capacity(4 + entries.len() * 8);
    content.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (count, delta) in entries {
        content.extend_from_slice(&count.to_be_bytes());
        content.extend_from_slice(&delta.to_be_bytes());
    }
    write_full_box(b"stts", 0, 0, &content)
}

fn write_ctts(offsets: &[i32]) -> Vec<u8> {
    let version = if offsets.iter().any(|&o| o < 0) { 1 } else { 0 };
    let entries = runs(offsets);
    let mut content = Vec::with_capacity(4 + entries.len() * 8);
    content.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (count, offset) in entries {
        content.extend_from_slice(&count.to_be_bytes());
        content.extend_from_slice(&offset.to_be_bytes());
    }
    write_full_box(b"ctts", version, 0, &content)
}

fn write_stss(sync_samples: &[u32]) -> Vec<u8> {
    let mut content = Vec::with_capacity(4 + sync_samples.len() * 4);
    content.extend_from_slice(&(sync_samples.len() as u32).to_be_bytes());
    for &index in sync_samples {
        content.extend_from_slice(&(index + 1).to_be_bytes());
    }
    write_full_box(b"stss", 0, 0, &content)
}

fn write_stsz(sizes: &[u32]) -> Vec<u8> {
    let mut content = Vec::new();
    let uniform = sizes.first().filter(|&&first| sizes.iter().all(|&s| s == first));
    match uniform {
        Some(&size) => {
            content.extend_from_slice(&size.to_be_bytes());
            content.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
        }
        None => {
            content.extend_from_slice(&0u32.to_be_bytes());
            content.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
            for &size in sizes {
                content.extend_from_slice(&size.to_be_bytes());
            }
        }
    }
    write_full_box(b"stsz", 0, 0, &content)
}

fn write_stsc(chunks: &[ChunkEntry]) -> Vec<u8> {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if entries.last().map(|&(_, n)| n) != Some(chunk.samples) {
            entries.push((i as u32 + 1, chunk.samples));
        }
    }
    let mut content = Vec::with_capacity(4 + entries.len() * 12);
    content.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (first_chunk, samples_per_chunk) in entries {
        content.extend_from_slice(&first_chunk.to_be_bytes());
        content.extend_from_slice(&samples_per_chunk.to_be_bytes());
        content.extend_from_slice(&1u32.to_be_bytes()); // sample description index
    }
    write_full_box(b"stsc", 0, 0, &content)
}

fn write_chunk_offsets(chunk_base: u64, chunks: &[ChunkEntry]) -> Vec<u8> {
    let offsets: Vec<u64> = chunks.iter().map(|c| chunk_base + c.offset).collect();
    let mut content = Vec::new();
    content.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    if needs_64(&offsets) {
        for offset in &offsets {
            content.extend_from_slice(&offset.to_be_bytes());
        }
        write_full_box(b"co64", 0, 0, &content)
    } else {
        for &offset in &offsets {
            content.extend_from_slice(&(offset as u32).to_be_bytes());
        }
        write_full_box(b"stco", 0, 0, &content)
    }
}

fn write_stbl(chunk_base: u64, trak: &TrakBuild<'_>) -> Vec<u8> {
    let mut children = vec![trak.format.stsd_box.clone(), write_stts(&trak.durations)];
    if !trak.composition_offsets.is_empty() {
        children.push(write_ctts(&trak.composition_offsets));
    }
    if let Some(sync) = &trak.sync_samples {
        children.push(write_stss(sync));
    }
    children.push(write_stsz(&trak.sizes));
    children.push(write_stsc(&trak.chunks));
    children.push(write_chunk_offsets(chunk_base, &trak.chunks));
    let refs: Vec<&[u8]> = children.iter().map(|c| c.as_slice()).collect();
    write_container_box(b"stbl", &refs)
}

fn write_trak(movie_timescale: u32, chunk_base: u64, trak: &TrakBuild<'_>) -> Vec<u8> {
    let media_duration = trak.media_duration();
    let presentation = trak.presentation_duration(movie_timescale);

    let stbl = write_stbl(chunk_base, trak);
    let mut minf_children: Vec<&[u8]> = trak
        .format
        .media_info_boxes
        .iter()
        .map(|b| b.as_slice())
        .collect();
    minf_children.push(&stbl);
    let minf = write_container_box(b"minf", &minf_children);

    let mdhd = write_mdhd(trak.format.timescale, media_duration, trak.format.language);
    let mdia = write_container_box(b"mdia", &[&mdhd, &trak.format.hdlr_box, &minf]);

    let tkhd = write_tkhd(trak.track_id, trak.edit_delay + presentation, &trak.header);
    if trak.edit_delay > 0 {
        let edts = write_edts(trak.edit_delay, presentation);
        write_container_box(b"trak", &[&tkhd, &edts, &mdia])
    } else {
        write_container_box(b"trak", &[&tkhd, &mdia])
    }
}
