//! Push-model MP4 muxer.
//!
//! Layout: `ftyp`, an `mdat` with a 64-bit size patched on `stop`, then `moov`.
//! Consecutive samples of the same track share a chunk.

use std::io::{Seek, SeekFrom, Write};

use tracing::debug;

use super::atoms::mdat_header_large;
use super::writer::{build_moov, default_ftyp, ChunkEntry, TrakBuild};
use super::{TrackFormat, TrackHeader};
use crate::domain::model::MediaType;
use crate::error::{TrimError, TrimResult};
use crate::ports::{Muxer, SampleInfo};
use crate::utils::time::{rescale, us_to_ticks};

/// Movie timescale of muxed output.
const MOVIE_TIMESCALE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Configuring,
    Started,
    Stopped,
}

/// Samples written to one output track.
#[derive(Debug, Default)]
struct TrackRecord {
    decode_ticks: Vec<i64>,
    composition_offsets: Vec<i32>,
    sizes: Vec<u32>,
    sync: Vec<bool>,
    last_duration: u32,
    chunks: Vec<ChunkEntry>,
}

/// Muxer writing a non-fragmented MP4 to any seekable sink.
pub struct Mp4Muxer<W> {
    writer: W,
    state: State,
    formats: Vec<TrackFormat>,
    records: Vec<TrackRecord>,
    rotation: Option<i32>,
    mdat_start: u64,
    position: u64,
    last_track: Option<usize>,
}

impl<W: Write + Seek> Mp4Muxer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            state: State::Configuring,
            formats: Vec::new(),
            records: Vec::new(),
            rotation: None,
            mdat_start: 0,
            position: 0,
            last_track: None,
        }
    }

    /// Give back the sink, finalized or not.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn build_traks(&self) -> TrimResult<Vec<TrakBuild<'_>>> {
        let movie_start_us = self
            .formats
            .iter()
            .zip(&self.records)
            .filter_map(|(f, r)| r.decode_ticks.first().map(|&t| to_us(t, f.timescale)))
            .min()
            .unwrap_or(0);

        let mut traks = Vec::with_capacity(self.formats.len());
        for (index, (format, record)) in self.formats.iter().zip(&self.records).enumerate() {
            let count = record.decode_ticks.len();
            let mut durations = Vec::with_capacity(count);
            for pair in record.decode_ticks.windows(2) {
                let delta = pair[1] - pair[0];
                let delta = u32::try_from(delta).map_err(|_| {
                    TrimError::mux(format!("Decode delta {} out of range on track {}", delta, index))
                })?;
                durations.push(delta);
            }
            if count > 0 {
                durations.push(record.last_duration);
            }

            let composition_offsets = if record.composition_offsets.iter().any(|&o| o != 0) {
                record.composition_offsets.clone()
            } else {
                Vec::new()
            };
            let sync_samples = if record.sync.iter().all(|&s| s) {
                None
            } else {
                Some(
                    record
                        .sync
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| **s)
                        .map(|(i, _)| i as u32)
                        .collect(),
                )
            };

            let edit_delay = match record.decode_ticks.first() {
                Some(&first) => {
                    let delay_us = (to_us(first, format.timescale) - movie_start_us).max(0);
                    rescale(delay_us as u64, 1_000_000, MOVIE_TIMESCALE)
                }
                None => 0,
            };

            let mut header = format.header.clone();
            if format.media_type == MediaType::Video {
                if let Some(matrix) = self.rotation.and_then(TrackHeader::rotation_matrix) {
                    header.matrix = matrix;
                }
            }

            traks.push(TrakBuild {
                format,
                track_id: index as u32 + 1,
                header,
                durations,
                sizes: record.sizes.clone(),
                composition_offsets,
                sync_samples,
                chunks: record.chunks.clone(),
                edit_delay,
            });
        }
        Ok(traks)
    }
}

fn to_us(ticks: i64, timescale: u32) -> i64 {
    crate::utils::time::ticks_to_us(ticks, timescale)
}

impl<W: Write + Seek> Muxer for Mp4Muxer<W> {
    type Format = TrackFormat;

    fn add_track(&mut self, format: &TrackFormat) -> TrimResult<usize> {
        if self.state != State::Configuring {
            return Err(TrimError::mux("Tracks must be added before start"));
        }
        if format.timescale == 0 {
            return Err(TrimError::mux("Track format has a zero timescale"));
        }
        self.formats.push(format.clone());
        self.records.push(TrackRecord::default());
        Ok(self.formats.len() - 1)
    }

    fn set_orientation_hint(&mut self, degrees: i32) -> TrimResult<()> {
        if self.state != State::Configuring {
            return Err(TrimError::mux("Orientation must be set before start"));
        }
        if degrees % 90 != 0 {
            return Err(TrimError::mux(format!(
                "Unsupported orientation {} degrees",
                degrees
            )));
        }
        self.rotation = Some(degrees.rem_euclid(360));
        Ok(())
    }

    fn start(&mut self) -> TrimResult<()> {
        if self.state != State::Configuring {
            return Err(TrimError::mux("Muxer already started"));
        }
        if self.formats.is_empty() {
            return Err(TrimError::mux("No tracks added"));
        }
        let ftyp = default_ftyp();
        self.writer.write_all(&ftyp)?;
        self.mdat_start = ftyp.len() as u64;
        self.writer.write_all(&mdat_header_large(0))?;
        self.position = self.mdat_start + 16;
        self.state = State::Started;
        debug!("Muxer started with {} tracks", self.formats.len());
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &SampleInfo) -> TrimResult<()> {
        if self.state != State::Started {
            return Err(TrimError::mux("Sample written outside start/stop"));
        }
        let timescale = self
            .formats
            .get(track)
            .map(|f| f.timescale)
            .ok_or_else(|| TrimError::mux(format!("Unknown track {}", track)))?;

        let decode = us_to_ticks(info.decode_time_us, timescale);
        let presentation = us_to_ticks(info.presentation_time_us, timescale);
        let duration = us_to_ticks(info.duration_us, timescale).max(0);
        let size = u32::try_from(data.len())
            .map_err(|_| TrimError::mux(format!("Sample of {} bytes is too large", data.len())))?;

        let record = &mut self.records[track];
        if let Some(&last) = record.decode_ticks.last() {
            if decode < last {
                return Err(TrimError::mux(format!(
                    "Decode time went backwards on track {} ({} < {})",
                    track, decode, last
                )));
            }
        }
        let offset = i32::try_from(presentation - decode)
            .map_err(|_| TrimError::mux("Composition offset out of range"))?;

        if self.last_track != Some(track) || record.chunks.is_empty() {
            record.chunks.push(ChunkEntry {
                offset: self.position,
                samples: 0,
            });
        }
        if let Some(chunk) = record.chunks.last_mut() {
            chunk.samples += 1;
        }
        record.decode_ticks.push(decode);
        record.composition_offsets.push(offset);
        record.sizes.push(size);
        record.sync.push(info.flags.is_sync());
        record.last_duration = duration as u32;

        self.writer.write_all(data)?;
        self.position += data.len() as u64;
        self.last_track = Some(track);
        Ok(())
    }

    fn stop(&mut self) -> TrimResult<()> {
        if self.state != State::Started {
            return Err(TrimError::mux("Muxer stopped without being started"));
        }

        let mdat_size = self.position - self.mdat_start;
        self.writer.seek(SeekFrom::Start(self.mdat_start))?;
        self.writer.write_all(&mdat_header_large(mdat_size))?;
        self.writer.seek(SeekFrom::Start(self.position))?;

        let moov = {
            let traks = self.build_traks()?;
            build_moov(MOVIE_TIMESCALE, 0, &traks)
        };
        self.writer.write_all(&moov)?;
        self.writer.flush()?;
        self.state = State::Stopped;

        debug!(
            "Muxer finalized: mdat {} bytes, moov {} bytes",
            mdat_size,
            moov.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::atoms::{fullbox_header, write_box, write_full_box};
    use crate::mp4::{Mp4Demuxer, LANGUAGE_UNDETERMINED};
    use crate::ports::{Demuxer, SampleFlags};
    use std::io::Cursor;

    fn format(media_type: MediaType, timescale: u32) -> TrackFormat {
        let handler: &[u8; 4] = if media_type == MediaType::Video { b"vide" } else { b"soun" };
        let mut hdlr = Vec::new();
        hdlr.extend_from_slice(&fullbox_header(0, 0));
        hdlr.extend_from_slice(&0u32.to_be_bytes());
        hdlr.extend_from_slice(handler);
        hdlr.extend_from_slice(&[0u8; 13]);
        let mut stsd = Vec::new();
        stsd.extend_from_slice(&fullbox_header(0, 0));
        stsd.extend_from_slice(&1u32.to_be_bytes());
        stsd.extend_from_slice(&write_box(b"mp4v", &[0u8; 8]));
        TrackFormat {
            track_id: 1,
            media_type,
            handler: *handler,
            timescale,
            language: LANGUAGE_UNDETERMINED,
            header: TrackHeader::for_media(media_type),
            hdlr_box: write_box(b"hdlr", &hdlr),
            media_info_boxes: vec![write_full_box(b"nmhd", 0, 0, &[])],
            stsd_box: write_box(b"stsd", &stsd),
            max_sample_size: None,
        }
    }

    fn sample(track: usize, pts: i64, dts: i64, sync: bool) -> SampleInfo {
        SampleInfo {
            track,
            size: 4,
            presentation_time_us: pts,
            decode_time_us: dts,
            duration_us: 40_000,
            flags: if sync { SampleFlags::SYNC } else { SampleFlags::NONE },
        }
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()));
        assert!(muxer.start().is_err());
        let track = muxer.add_track(&format(MediaType::Video, 90_000)).unwrap();
        assert!(muxer.write_sample(track, &[0; 4], &sample(0, 0, 0, true)).is_err());
        assert!(muxer.set_orientation_hint(45).is_err());
        muxer.start().unwrap();
        assert!(muxer.add_track(&format(MediaType::Audio, 48_000)).is_err());
        assert!(muxer.write_sample(7, &[0; 4], &sample(0, 0, 0, true)).is_err());
        muxer.stop().unwrap();
        assert!(muxer.write_sample(track, &[0; 4], &sample(0, 0, 0, true)).is_err());
    }

    #[test]
    fn test_backwards_decode_time_is_rejected() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()));
        let track = muxer.add_track(&format(MediaType::Video, 90_000)).unwrap();
        muxer.start().unwrap();
        muxer.write_sample(track, &[1; 4], &sample(0, 80_000, 80_000, true)).unwrap();
        let err = muxer
            .write_sample(track, &[1; 4], &sample(0, 40_000, 40_000, false))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MuxSetup);
    }

    #[test]
    fn test_muxed_output_reads_back() {
        let mut muxer = Mp4Muxer::new(Cursor::new(Vec::new()));
        let video = muxer.add_track(&format(MediaType::Video, 90_000)).unwrap();
        muxer.set_orientation_hint(90).unwrap();
        muxer.start().unwrap();
        // I P B with reordering
        muxer.write_sample(video, &[1, 1, 1, 1], &sample(0, 80_000, 0, true)).unwrap();
        muxer.write_sample(video, &[2, 2, 2, 2], &sample(0, 160_000, 40_000, false)).unwrap();
        muxer.write_sample(video, &[3, 3, 3, 3], &sample(0, 120_000, 80_000, false)).unwrap();
        muxer.stop().unwrap();

        let bytes = muxer.into_inner().into_inner();
        let mut demuxer = Mp4Demuxer::new(Cursor::new(bytes)).unwrap();
        assert_eq!(demuxer.track_count(), 1);
        assert_eq!(demuxer.rotation_degrees(), Some(90));
        demuxer.select_track(0).unwrap();

        let mut buf = Vec::new();
        let first = demuxer.read_sample(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..first.size], &[1, 1, 1, 1]);
        assert_eq!(first.decode_time_us, 0);
        assert_eq!(first.presentation_time_us, 80_000);
        assert!(first.flags.is_sync());

        assert!(demuxer.advance());
        let second = demuxer.read_sample(&mut buf).unwrap().unwrap();
        assert_eq!(second.decode_time_us, 40_000);
        assert_eq!(second.presentation_time_us, 160_000);
        assert!(!second.flags.is_sync());

        assert!(demuxer.advance());
        let third = demuxer.read_sample(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..third.size], &[3, 3, 3, 3]);
        assert!(!demuxer.advance());
        assert!(demuxer.read_sample(&mut buf).unwrap().is_none());
    }
}
