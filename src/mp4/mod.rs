//! ISO-BMFF (MP4/MOV) container layer.
//!
//! Parses a non-fragmented movie into per-track sample tables, rebuilds
//! `moov` boxes from cropped tables, and provides a pull demuxer and push
//! muxer over plain `Read + Seek` / `Write + Seek` streams.

pub mod atoms;
pub mod demux;
pub mod mux;
pub mod sample_table;
pub mod writer;

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use crate::domain::model::{checked_ticks_to_ms, ticks_to_ms, MediaType, Track};
use crate::error::{TrimError, TrimResult};
use atoms::{
    find, read_bytes, read_children, read_fullbox_header, read_i16, read_i32, read_raw_box,
    read_u16, read_u32, read_u64, BoxHeader,
};
use sample_table::resolve_sample_table;

pub use demux::Mp4Demuxer;
pub use mux::Mp4Muxer;

/// Identity transformation matrix in 16.16 / 2.30 fixed point.
pub const IDENTITY_MATRIX: [i32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Packed ISO-639-2 code for "und".
pub const LANGUAGE_UNDETERMINED: u16 = 0x55C4;

/// Presentation attributes carried by `tkhd`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackHeader {
    pub flags: u32,
    pub layer: i16,
    pub alternate_group: i16,
    /// 8.8 fixed point; 0x0100 for audio, 0 otherwise.
    pub volume: i16,
    pub matrix: [i32; 9],
    /// 16.16 fixed point.
    pub width: u32,
    /// 16.16 fixed point.
    pub height: u32,
}

impl TrackHeader {
    /// Defaults for a freshly created track of the given type.
    pub fn for_media(media_type: MediaType) -> Self {
        Self {
            flags: 0x3,
            layer: 0,
            alternate_group: 0,
            volume: if media_type == MediaType::Audio { 0x0100 } else { 0 },
            matrix: IDENTITY_MATRIX,
            width: 0,
            height: 0,
        }
    }

    /// Clockwise rotation encoded in the matrix, in whole degrees within [0, 360).
    pub fn rotation_degrees(&self) -> i32 {
        let a = self.matrix[0] as f64;
        let b = self.matrix[1] as f64;
        if a == 0.0 && b == 0.0 {
            return 0;
        }
        let degrees = b.atan2(a).to_degrees().round() as i32;
        degrees.rem_euclid(360)
    }

    /// Matrix for a rotation by a multiple of 90 degrees.
    pub fn rotation_matrix(degrees: i32) -> Option<[i32; 9]> {
        const ONE: i32 = 0x0001_0000;
        const W: i32 = 0x4000_0000;
        match degrees.rem_euclid(360) {
            0 => Some(IDENTITY_MATRIX),
            90 => Some([0, ONE, 0, -ONE, 0, 0, 0, 0, W]),
            180 => Some([-ONE, 0, 0, 0, -ONE, 0, 0, 0, W]),
            270 => Some([0, -ONE, 0, ONE, 0, 0, 0, 0, W]),
            _ => None,
        }
    }
}

/// Muxer-facing description of a source track.
#[derive(Debug, Clone)]
pub struct TrackFormat {
    pub track_id: u32,
    pub media_type: MediaType,
    pub handler: [u8; 4],
    pub timescale: u32,
    /// Packed ISO-639-2 language from `mdhd`.
    pub language: u16,
    pub header: TrackHeader,
    /// Raw `hdlr` box.
    pub hdlr_box: Vec<u8>,
    /// Raw `minf` children other than `stbl` (`vmhd`, `smhd`, `dinf`, ...).
    pub media_info_boxes: Vec<Vec<u8>>,
    /// Raw `stsd` box.
    pub stsd_box: Vec<u8>,
    /// Largest sample payload, when known.
    pub max_sample_size: Option<u32>,
}

/// One parsed track: format, timing and payload location of every sample.
#[derive(Debug, Clone)]
pub struct Mp4Track {
    pub format: TrackFormat,
    pub timeline: Track,
    pub sizes: Vec<u32>,
    pub offsets: Vec<u64>,
    /// Empty when the track has no `ctts`.
    pub composition_offsets: Vec<i32>,
}

impl Mp4Track {
    pub fn sample_count(&self) -> usize {
        self.sizes.len()
    }

    pub fn media_type(&self) -> MediaType {
        self.timeline.media_type
    }

    pub fn composition_offset(&self, index: usize) -> i32 {
        self.composition_offsets.get(index).copied().unwrap_or(0)
    }
}

/// A parsed, non-fragmented movie.
#[derive(Debug, Clone)]
pub struct Movie {
    /// Raw `ftyp` box, if the file had one.
    pub ftyp: Option<Vec<u8>>,
    pub timescale: u32,
    /// Movie duration in `timescale` units.
    pub duration: u64,
    pub tracks: Vec<Mp4Track>,
}

impl Movie {
    /// Open and parse a local file.
    pub fn open(path: &Path) -> TrimResult<Self> {
        let file = File::open(path)
            .map_err(|e| TrimError::unreadable(format!("{}: {}", path.display(), e)))?;
        let mut reader = BufReader::new(file);
        Self::read(&mut reader)
    }

    /// Parse the movie structure from any seekable stream.
    pub fn read<R: Read + Seek>(reader: &mut R) -> TrimResult<Self> {
        parse_movie(reader).map_err(map_parse_error)
    }

    /// Duration in milliseconds, from `mvhd` or else the longest track.
    pub fn duration_ms(&self) -> u64 {
        if self.timescale > 0 && self.duration > 0 {
            return ticks_to_ms(self.duration, self.timescale);
        }
        self.tracks
            .iter()
            .map(|t| t.timeline.duration_ms())
            .max()
            .unwrap_or(0)
    }

    /// Rotation of the first video track, if there is one.
    pub fn rotation_degrees(&self) -> Option<i32> {
        self.tracks
            .iter()
            .find(|t| t.media_type() == MediaType::Video)
            .map(|t| t.format.header.rotation_degrees())
    }
}

/// Truncated or inconsistent structure is a parse failure; anything else is I/O.
fn map_parse_error(e: io::Error) -> TrimError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => TrimError::parse(e.to_string()),
        _ => TrimError::Io(e),
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn parse_movie<R: Read + Seek>(reader: &mut R) -> io::Result<Movie> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    let top = read_children(reader, 0, file_size)?;

    let ftyp = match find(&top, b"ftyp") {
        Some(h) => Some(read_raw_box(reader, h)?),
        None => None,
    };
    let moov = find(&top, b"moov").ok_or_else(|| invalid("No moov box found"))?;
    if find(&top, b"moof").is_some() {
        return Err(invalid("Fragmented MP4 is not supported"));
    }

    let moov_children = read_children(reader, moov.content_start(), moov.end())?;
    if find(&moov_children, b"mvex").is_some() {
        return Err(invalid("Fragmented MP4 is not supported"));
    }
    let mvhd = find(&moov_children, b"mvhd").ok_or_else(|| invalid("No mvhd in moov"))?;
    reader.seek(SeekFrom::Start(mvhd.content_start()))?;
    let (timescale, duration) = parse_mvhd(reader)?;
    if timescale > 0 && checked_ticks_to_ms(duration, timescale).is_none() {
        return Err(invalid(format!(
            "mvhd duration {} at timescale {} is out of range",
            duration, timescale
        )));
    }

    let mut tracks = Vec::new();
    for trak in moov_children.iter().filter(|h| &h.box_type == b"trak") {
        let track = parse_trak(reader, trak)?;
        if track.sample_count() == 0 {
            debug!("Skipping track {} without samples", track.format.track_id);
            continue;
        }
        tracks.push(track);
    }
    if tracks.is_empty() {
        return Err(invalid("Movie has no tracks with samples"));
    }

    debug!(
        "Parsed movie: timescale {}, duration {}, {} tracks",
        timescale,
        duration,
        tracks.len()
    );

    Ok(Movie {
        ftyp,
        timescale,
        duration,
        tracks,
    })
}

/// Parse mvhd, return (timescale, duration).
fn parse_mvhd<R: Read>(reader: &mut R) -> io::Result<(u32, u64)> {
    let (version, _flags) = read_fullbox_header(reader)?;
    if version == 1 {
        let _creation_time = read_u64(reader)?;
        let _modification_time = read_u64(reader)?;
        let timescale = read_u32(reader)?;
        let duration = read_u64(reader)?;
        Ok((timescale, duration))
    } else {
        let _creation_time = read_u32(reader)?;
        let _modification_time = read_u32(reader)?;
        let timescale = read_u32(reader)?;
        let duration = read_u32(reader)? as u64;
        Ok((timescale, duration))
    }
}

/// Parse tkhd, return (track_id, header).
fn parse_tkhd<R: Read>(reader: &mut R) -> io::Result<(u32, TrackHeader)> {
    let (version, flags) = read_fullbox_header(reader)?;
    let track_id = if version == 1 {
        let _creation_time = read_u64(reader)?;
        let _modification_time = read_u64(reader)?;
        let track_id = read_u32(reader)?;
        let _reserved = read_u32(reader)?;
        let _duration = read_u64(reader)?;
        track_id
    } else {
        let _creation_time = read_u32(reader)?;
        let _modification_time = read_u32(reader)?;
        let track_id = read_u32(reader)?;
        let _reserved = read_u32(reader)?;
        let _duration = read_u32(reader)?;
        track_id
    };
    let _reserved = read_u64(reader)?;
    let layer = read_i16(reader)?;
    let alternate_group = read_i16(reader)?;
    let volume = read_i16(reader)?;
    let _reserved = read_u16(reader)?;
    let mut matrix = [0i32; 9];
    for value in matrix.iter_mut() {
        *value = read_i32(reader)?;
    }
    let width = read_u32(reader)?;
    let height = read_u32(reader)?;

    Ok((
        track_id,
        TrackHeader {
            flags,
            layer,
            alternate_group,
            volume,
            matrix,
            width,
            height,
        },
    ))
}

/// Parse mdhd, return (timescale, language).
fn parse_mdhd<R: Read>(reader: &mut R) -> io::Result<(u32, u16)> {
    let (version, _flags) = read_fullbox_header(reader)?;
    let timescale = if version == 1 {
        let _creation_time = read_u64(reader)?;
        let _modification_time = read_u64(reader)?;
        let timescale = read_u32(reader)?;
        let _duration = read_u64(reader)?;
        timescale
    } else {
        let _creation_time = read_u32(reader)?;
        let _modification_time = read_u32(reader)?;
        let timescale = read_u32(reader)?;
        let _duration = read_u32(reader)?;
        timescale
    };
    let language = read_u16(reader)?;
    Ok((timescale, language))
}

/// Parse hdlr, return handler_type.
fn parse_hdlr<R: Read>(reader: &mut R) -> io::Result<[u8; 4]> {
    let (_version, _flags) = read_fullbox_header(reader)?;
    let _pre_defined = read_u32(reader)?;
    let bytes = read_bytes(reader, 4)?;
    Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn require<'a>(children: &'a [BoxHeader], box_type: &[u8; 4], parent: &str) -> io::Result<&'a BoxHeader> {
    find(children, box_type).ok_or_else(|| {
        invalid(format!(
            "No {} in {}",
            atoms::fourcc_str(box_type),
            parent
        ))
    })
}

fn parse_trak<R: Read + Seek>(reader: &mut R, trak: &BoxHeader) -> io::Result<Mp4Track> {
    let trak_children = read_children(reader, trak.content_start(), trak.end())?;

    let tkhd = require(&trak_children, b"tkhd", "trak")?;
    reader.seek(SeekFrom::Start(tkhd.content_start()))?;
    let (track_id, header) = parse_tkhd(reader)?;

    let mdia = require(&trak_children, b"mdia", "trak")?;
    let mdia_children = read_children(reader, mdia.content_start(), mdia.end())?;

    let mdhd = require(&mdia_children, b"mdhd", "mdia")?;
    reader.seek(SeekFrom::Start(mdhd.content_start()))?;
    let (timescale, language) = parse_mdhd(reader)?;
    if timescale == 0 {
        return Err(invalid(format!("Track {} has a zero timescale", track_id)));
    }

    let hdlr = require(&mdia_children, b"hdlr", "mdia")?;
    reader.seek(SeekFrom::Start(hdlr.content_start()))?;
    let handler = parse_hdlr(reader)?;
    let hdlr_box = read_raw_box(reader, hdlr)?;
    let media_type = MediaType::from_handler(&handler);

    let minf = require(&mdia_children, b"minf", "mdia")?;
    let minf_children = read_children(reader, minf.content_start(), minf.end())?;
    let stbl = require(&minf_children, b"stbl", "minf")?;

    let mut media_info_boxes = Vec::new();
    for child in minf_children.iter().filter(|h| &h.box_type != b"stbl") {
        media_info_boxes.push(read_raw_box(reader, child)?);
    }

    let stbl_children = read_children(reader, stbl.content_start(), stbl.end())?;
    let stsd = require(&stbl_children, b"stsd", "stbl")?;
    reader.seek(SeekFrom::Start(stsd.content_start()))?;
    let (_version, _flags) = read_fullbox_header(reader)?;
    let entry_count = read_u32(reader)?;
    if entry_count != 1 {
        return Err(invalid(format!(
            "Track {} has {} sample descriptions; exactly one is supported",
            track_id, entry_count
        )));
    }
    let stsd_box = read_raw_box(reader, stsd)?;

    let table = resolve_sample_table(reader, &stbl_children)?;
    let max_sample_size = table.sizes.iter().copied().max().unwrap_or(0);

    let timeline = Track::new(
        media_type,
        timescale,
        table.durations,
        table.sync_samples,
        max_sample_size,
    )
    .map_err(|e| invalid(e.to_string()))?;

    debug!(
        "Track {}: {} {} samples, timescale {}, {} sync",
        track_id,
        media_type,
        timeline.sample_count(),
        timescale,
        timeline.sync_samples.len()
    );

    Ok(Mp4Track {
        format: TrackFormat {
            track_id,
            media_type,
            handler,
            timescale,
            language,
            header,
            hdlr_box,
            media_info_boxes,
            stsd_box,
            max_sample_size: Some(max_sample_size),
        },
        timeline,
        sizes: table.sizes,
        offsets: table.offsets,
        composition_offsets: table.composition_offsets,
    })
}
