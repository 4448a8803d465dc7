//! Stream-copy backend over libavformat
//!
//! [`LibavDemuxer`] and [`LibavMuxer`] implement the demux/mux ports with
//! `ffmpeg-next`, so the stream-copy fallback can read any container libav
//! understands. Packets are copied as-is; nothing is decoded.

use std::path::Path;

use ffmpeg_next::codec::{self, packet};
use ffmpeg_next::format::context::{Input, Output};
use ffmpeg_next::format::stream::StreamMut;
use ffmpeg_next::media;
use ffmpeg_next::{ffi, Dictionary, Packet, Rational, Rescale};
use tracing::{debug, info};

use crate::domain::model::{MediaType, TrimRange};
use crate::engine::{StreamCopyStats, StreamCopyTrimmer};
use crate::error::{TrimError, TrimResult};
use crate::ports::{Demuxer, Muxer, SampleFlags, SampleInfo, TrackInfo};

const MICROS: Rational = Rational(1, 1_000_000);

/// Codec parameters and time base of one stream
#[derive(Clone)]
pub struct LibavTrackFormat {
    pub parameters: codec::Parameters,
    pub time_base: Rational,
    pub media_type: MediaType,
}

/// Size of a 3x3 display matrix of 32-bit fixed-point values
const DISPLAY_MATRIX_BYTES: usize = 9 * 4;

/// Clockwise whole degrees in [0, 360) from libav's counter-clockwise angle
fn clockwise_degrees(counter_clockwise: f64) -> Option<i32> {
    if !counter_clockwise.is_finite() {
        return None;
    }
    Some(((-counter_clockwise).round() as i32).rem_euclid(360))
}

/// Rotation stored as display-matrix side data on the codec parameters.
///
/// Newer libavformat no longer mirrors it into the `rotate` tag.
fn display_matrix_rotation(parameters: &codec::Parameters) -> Option<i32> {
    unsafe {
        let par = parameters.as_ptr();
        let entries = (*par).coded_side_data;
        if entries.is_null() {
            return None;
        }
        for i in 0..(*par).nb_coded_side_data.max(0) as usize {
            let entry = &*entries.add(i);
            if entry.type_ == ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX
                && entry.size >= DISPLAY_MATRIX_BYTES
                && !entry.data.is_null()
            {
                return clockwise_degrees(ffi::av_display_rotation_get(entry.data as *const i32));
            }
        }
    }
    None
}

/// Attach a display matrix for a clockwise rotation to an output stream
fn set_display_matrix(stream: &mut StreamMut<'_>, degrees: i32) -> TrimResult<()> {
    unsafe {
        let par = (*stream.as_mut_ptr()).codecpar;
        if par.is_null() {
            return Err(TrimError::mux("output stream has no codec parameters"));
        }
        let entry = ffi::av_packet_side_data_new(
            &mut (*par).coded_side_data,
            &mut (*par).nb_coded_side_data,
            ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
            DISPLAY_MATRIX_BYTES,
            0,
        );
        if entry.is_null() {
            return Err(TrimError::mux("cannot allocate display matrix"));
        }
        ffi::av_display_rotation_set((*entry).data as *mut i32, -(degrees as f64));
    }
    Ok(())
}

fn media_type_of(medium: media::Type) -> MediaType {
    match medium {
        media::Type::Video => MediaType::Video,
        media::Type::Audio => MediaType::Audio,
        _ => MediaType::Other,
    }
}

/// Packet reader over an input context
pub struct LibavDemuxer {
    input: Input,
    selected: Vec<bool>,
    current: Option<Packet>,
    exhausted: bool,
}

impl LibavDemuxer {
    pub fn open(path: &Path) -> TrimResult<Self> {
        ffmpeg_next::init()?;
        let input = ffmpeg_next::format::input(&path)
            .map_err(|e| TrimError::unreadable(format!("{}: {}", path.display(), e)))?;
        let streams = input.streams().count();
        debug!("libav opened {} with {} streams", path.display(), streams);
        Ok(Self {
            input,
            selected: vec![false; streams],
            current: None,
            exhausted: false,
        })
    }

    fn stream_time_base(&self, index: usize) -> Rational {
        self.input
            .stream(index)
            .map(|s| s.time_base())
            .unwrap_or(MICROS)
    }

    /// Read packets until one belongs to a selected stream
    fn fill(&mut self) -> TrimResult<()> {
        while self.current.is_none() && !self.exhausted {
            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if self.selected.get(packet.stream()).copied().unwrap_or(false) {
                        self.current = Some(packet);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => self.exhausted = true,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Demuxer for LibavDemuxer {
    type Format = LibavTrackFormat;

    fn track_count(&self) -> usize {
        self.selected.len()
    }

    fn track_info(&self, index: usize) -> TrimResult<TrackInfo> {
        let stream = self
            .input
            .stream(index)
            .ok_or_else(|| TrimError::mux(format!("no stream {}", index)))?;
        Ok(TrackInfo {
            media_type: media_type_of(stream.parameters().medium()),
            max_sample_size: None,
        })
    }

    fn track_format(&self, index: usize) -> TrimResult<LibavTrackFormat> {
        let stream = self
            .input
            .stream(index)
            .ok_or_else(|| TrimError::mux(format!("no stream {}", index)))?;
        let parameters = stream.parameters();
        Ok(LibavTrackFormat {
            media_type: media_type_of(parameters.medium()),
            parameters,
            time_base: stream.time_base(),
        })
    }

    fn rotation_degrees(&self) -> Option<i32> {
        self.input
            .streams()
            .filter(|s| s.parameters().medium() == media::Type::Video)
            .find_map(|s| {
                s.metadata()
                    .get("rotate")
                    .and_then(|r| r.trim().parse().ok())
                    .or_else(|| display_matrix_rotation(&s.parameters()))
            })
    }

    fn select_track(&mut self, index: usize) -> TrimResult<()> {
        let slot = self
            .selected
            .get_mut(index)
            .ok_or_else(|| TrimError::mux(format!("no stream {}", index)))?;
        *slot = true;
        Ok(())
    }

    fn seek_to_previous_sync(&mut self, time_us: i64) -> TrimResult<()> {
        // Timestamps here are in AV_TIME_BASE, which is microseconds
        self.input.seek(time_us, ..time_us)?;
        self.current = None;
        self.exhausted = false;
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> TrimResult<Option<SampleInfo>> {
        self.fill()?;
        let Some(packet) = self.current.as_ref() else {
            return Ok(None);
        };
        let data = packet.data().unwrap_or(&[]);
        if buf.len() < data.len() {
            buf.resize(data.len(), 0);
        }
        buf[..data.len()].copy_from_slice(data);

        let time_base = self.stream_time_base(packet.stream());
        let dts = packet.dts().or(packet.pts()).unwrap_or(0);
        let pts = packet.pts().unwrap_or(dts);
        let flags = if packet.is_key() {
            SampleFlags::SYNC
        } else {
            SampleFlags::NONE
        };
        Ok(Some(SampleInfo {
            track: packet.stream(),
            size: data.len(),
            presentation_time_us: pts.rescale(time_base, MICROS),
            decode_time_us: dts.rescale(time_base, MICROS),
            duration_us: packet.duration().rescale(time_base, MICROS),
            flags,
        }))
    }

    fn advance(&mut self) -> bool {
        self.current = None;
        match self.fill() {
            Ok(()) => self.current.is_some(),
            Err(e) => {
                debug!("libav read stopped: {}", e);
                false
            }
        }
    }
}

/// Packet writer over an output context
pub struct LibavMuxer {
    output: Output,
    media_types: Vec<MediaType>,
    rotation: Option<i32>,
    started: bool,
    stopped: bool,
}

impl LibavMuxer {
    pub fn create(path: &Path) -> TrimResult<Self> {
        ffmpeg_next::init()?;
        let output = ffmpeg_next::format::output(&path)
            .map_err(|e| TrimError::mux(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            output,
            media_types: Vec::new(),
            rotation: None,
            started: false,
            stopped: false,
        })
    }
}

impl Muxer for LibavMuxer {
    type Format = LibavTrackFormat;

    fn add_track(&mut self, format: &LibavTrackFormat) -> TrimResult<usize> {
        if self.started {
            return Err(TrimError::mux("tracks must be added before start"));
        }
        let mut stream = self.output.add_stream(ffmpeg_next::encoder::find(codec::Id::None))?;
        stream.set_parameters(format.parameters.clone());
        stream.set_time_base(format.time_base);
        self.media_types.push(format.media_type);
        Ok(self.media_types.len() - 1)
    }

    fn set_orientation_hint(&mut self, degrees: i32) -> TrimResult<()> {
        if self.started {
            return Err(TrimError::mux("orientation must be set before start"));
        }
        if degrees.rem_euclid(90) != 0 {
            return Err(TrimError::mux(format!("unsupported rotation {}", degrees)));
        }
        self.rotation = Some(degrees.rem_euclid(360));
        Ok(())
    }

    fn start(&mut self) -> TrimResult<()> {
        if self.media_types.is_empty() {
            return Err(TrimError::mux("no tracks to write"));
        }
        if let Some(degrees) = self.rotation {
            for (index, media_type) in self.media_types.iter().enumerate() {
                if *media_type != MediaType::Video {
                    continue;
                }
                if let Some(mut stream) = self.output.stream_mut(index) {
                    let mut metadata = Dictionary::new();
                    metadata.set("rotate", &degrees.to_string());
                    stream.set_metadata(metadata);
                    set_display_matrix(&mut stream, degrees)?;
                }
            }
        }
        self.output.write_header()?;
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &SampleInfo) -> TrimResult<()> {
        if !self.started || self.stopped {
            return Err(TrimError::mux("muxer is not accepting samples"));
        }
        let time_base = self
            .output
            .stream(track)
            .map(|s| s.time_base())
            .ok_or_else(|| TrimError::mux(format!("unknown track {}", track)))?;

        let mut packet = Packet::copy(data);
        packet.set_stream(track);
        packet.set_pts(Some(info.presentation_time_us.rescale(MICROS, time_base)));
        packet.set_dts(Some(info.decode_time_us.rescale(MICROS, time_base)));
        packet.set_duration(info.duration_us.rescale(MICROS, time_base));
        if info.flags.is_sync() {
            packet.set_flags(packet::Flags::KEY);
        }
        packet.write_interleaved(&mut self.output)?;
        Ok(())
    }

    fn stop(&mut self) -> TrimResult<()> {
        if !self.started {
            return Err(TrimError::mux("muxer was never started"));
        }
        if !self.stopped {
            self.output.write_trailer()?;
            self.stopped = true;
        }
        Ok(())
    }
}

/// Stream-copy `range` of `source` into `destination` through libav
pub fn stream_copy(
    trimmer: &StreamCopyTrimmer,
    source: &Path,
    destination: &Path,
    range: &TrimRange,
) -> TrimResult<StreamCopyStats> {
    let mut demuxer = LibavDemuxer::open(source)?;
    let mut muxer = LibavMuxer::create(destination)?;
    let stats = trimmer.trim(&mut demuxer, &mut muxer, range)?;
    info!(
        "libav stream copy wrote {} packets ({} bytes)",
        stats.samples_written, stats.bytes_written
    );
    Ok(stats)
}
