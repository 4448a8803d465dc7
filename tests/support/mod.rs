//! Synthetic MP4 fixtures assembled box by box.
//!
//! Layout is `ftyp`, `mdat`, `moov`, with one chunk per track. Every byte of
//! sample `i` on track `t` equals `payload_byte(t, i)`, so tests can check
//! that payloads survive a trim untouched.

#![allow(dead_code)]

use std::path::Path;

pub const HANDLER_VIDEO: [u8; 4] = *b"vide";
pub const HANDLER_AUDIO: [u8; 4] = *b"soun";

/// One track of a fixture
#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub handler: [u8; 4],
    pub timescale: u32,
    pub durations: Vec<u32>,
    pub sizes: Vec<u32>,
    /// 0-based sync samples; `None` writes no `stss`
    pub sync: Option<Vec<u32>>,
}

impl TrackSpec {
    /// `count` samples of `sample_ms` each, in a 1 kHz timescale
    pub fn video(count: usize, sample_ms: u32, sync: &[u32]) -> Self {
        Self {
            handler: HANDLER_VIDEO,
            timescale: 1000,
            durations: vec![sample_ms; count],
            sizes: (0..count).map(|i| 200 + (i as u32 % 7) * 10).collect(),
            sync: Some(sync.to_vec()),
        }
    }

    /// `count` samples of `sample_ms` each without a sync table
    pub fn audio(count: usize, sample_ms: u32) -> Self {
        Self {
            handler: HANDLER_AUDIO,
            timescale: 1000,
            durations: vec![sample_ms; count],
            sizes: vec![32; count],
            sync: None,
        }
    }

    pub fn with_sync(mut self, sync: &[u32]) -> Self {
        self.sync = Some(sync.to_vec());
        self
    }

    fn duration(&self) -> u64 {
        self.durations.iter().map(|&d| d as u64).sum()
    }
}

pub fn payload_byte(track: usize, sample: usize) -> u8 {
    (track * 64 + sample % 61 + 1) as u8
}

fn bx(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn full(kind: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut content = vec![version];
    content.extend_from_slice(&flags.to_be_bytes()[1..]);
    content.extend_from_slice(body);
    bx(kind, &content)
}

fn u16s(v: u16) -> [u8; 2] {
    v.to_be_bytes()
}

fn u32s(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

const MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

fn matrix_bytes() -> Vec<u8> {
    MATRIX.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn ftyp() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"isom");
    body.extend_from_slice(&u32s(0x200));
    body.extend_from_slice(b"isomiso2mp41");
    bx(b"ftyp", &body)
}

fn mvhd(timescale: u32, duration: u32, next_track_id: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&u32s(0)); // creation
    body.extend_from_slice(&u32s(0)); // modification
    body.extend_from_slice(&u32s(timescale));
    body.extend_from_slice(&u32s(duration));
    body.extend_from_slice(&u32s(0x0001_0000)); // rate
    body.extend_from_slice(&u16s(0x0100)); // volume
    body.extend_from_slice(&[0u8; 10]);
    body.extend_from_slice(&matrix_bytes());
    body.extend_from_slice(&[0u8; 24]);
    body.extend_from_slice(&u32s(next_track_id));
    full(b"mvhd", 0, 0, &body)
}

fn tkhd(track_id: u32, duration: u32, audio: bool) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&u32s(0));
    body.extend_from_slice(&u32s(0));
    body.extend_from_slice(&u32s(track_id));
    body.extend_from_slice(&u32s(0));
    body.extend_from_slice(&u32s(duration));
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&u16s(0)); // layer
    body.extend_from_slice(&u16s(0)); // alternate group
    body.extend_from_slice(&u16s(if audio { 0x0100 } else { 0 }));
    body.extend_from_slice(&u16s(0));
    body.extend_from_slice(&matrix_bytes());
    let (w, h) = if audio { (0, 0) } else { (320 << 16, 240 << 16) };
    body.extend_from_slice(&u32s(w));
    body.extend_from_slice(&u32s(h));
    full(b"tkhd", 0, 3, &body)
}

fn mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&u32s(0));
    body.extend_from_slice(&u32s(0));
    body.extend_from_slice(&u32s(timescale));
    body.extend_from_slice(&u32s(duration));
    body.extend_from_slice(&u16s(0x55C4)); // und
    body.extend_from_slice(&u16s(0));
    full(b"mdhd", 0, 0, &body)
}

fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&u32s(0));
    body.extend_from_slice(handler);
    body.extend_from_slice(&[0u8; 12]);
    body.extend_from_slice(b"fixture\0");
    full(b"hdlr", 0, 0, &body)
}

fn sample_entry(handler: &[u8; 4]) -> Vec<u8> {
    let mut body = vec![0u8; 6];
    body.extend_from_slice(&u16s(1)); // data reference index
    if handler == &HANDLER_VIDEO {
        body.extend_from_slice(&[0u8; 16]);
        body.extend_from_slice(&u16s(320));
        body.extend_from_slice(&u16s(240));
        body.extend_from_slice(&u32s(0x0048_0000));
        body.extend_from_slice(&u32s(0x0048_0000));
        body.extend_from_slice(&u32s(0));
        body.extend_from_slice(&u16s(1));
        body.extend_from_slice(&[0u8; 32]);
        body.extend_from_slice(&u16s(0x0018));
        body.extend_from_slice(&u16s(0xFFFF));
        bx(b"avc1", &body)
    } else {
        body.extend_from_slice(&[0u8; 8]);
        body.extend_from_slice(&u16s(2));
        body.extend_from_slice(&u16s(16));
        body.extend_from_slice(&[0u8; 4]);
        body.extend_from_slice(&u32s(48_000 << 16));
        bx(b"mp4a", &body)
    }
}

fn stbl(spec: &TrackSpec, chunk_offset: u32) -> Vec<u8> {
    let mut stsd = u32s(1).to_vec();
    stsd.extend_from_slice(&sample_entry(&spec.handler));

    // run-length stts
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &d in &spec.durations {
        match runs.last_mut() {
            Some((count, delta)) if *delta == d => *count += 1,
            _ => runs.push((1, d)),
        }
    }
    let mut stts = u32s(runs.len() as u32).to_vec();
    for (count, delta) in runs {
        stts.extend_from_slice(&u32s(count));
        stts.extend_from_slice(&u32s(delta));
    }

    let mut stsz = u32s(0).to_vec();
    stsz.extend_from_slice(&u32s(spec.sizes.len() as u32));
    for &s in &spec.sizes {
        stsz.extend_from_slice(&u32s(s));
    }

    let mut stsc = u32s(1).to_vec();
    stsc.extend_from_slice(&u32s(1));
    stsc.extend_from_slice(&u32s(spec.sizes.len() as u32));
    stsc.extend_from_slice(&u32s(1));

    let mut stco = u32s(1).to_vec();
    stco.extend_from_slice(&u32s(chunk_offset));

    let mut children = Vec::new();
    children.extend(full(b"stsd", 0, 0, &stsd));
    children.extend(full(b"stts", 0, 0, &stts));
    if let Some(sync) = &spec.sync {
        let mut stss = u32s(sync.len() as u32).to_vec();
        for &s in sync {
            stss.extend_from_slice(&u32s(s + 1));
        }
        children.extend(full(b"stss", 0, 0, &stss));
    }
    children.extend(full(b"stsz", 0, 0, &stsz));
    children.extend(full(b"stsc", 0, 0, &stsc));
    children.extend(full(b"stco", 0, 0, &stco));
    bx(b"stbl", &children)
}

fn trak(index: usize, spec: &TrackSpec, movie_timescale: u32, chunk_offset: u32) -> Vec<u8> {
    let audio = spec.handler == HANDLER_AUDIO;
    let media_duration = spec.duration();
    let movie_duration = media_duration * movie_timescale as u64 / spec.timescale as u64;

    let media_header = if audio {
        full(b"smhd", 0, 0, &[0u8; 4])
    } else {
        full(b"vmhd", 0, 1, &[0u8; 8])
    };
    let dref = full(b"dref", 0, 0, &[&u32s(1)[..], &full(b"url ", 0, 1, &[])[..]].concat());
    let minf = bx(
        b"minf",
        &[media_header, bx(b"dinf", &dref), stbl(spec, chunk_offset)].concat(),
    );
    let mdia = bx(
        b"mdia",
        &[mdhd(spec.timescale, media_duration as u32), hdlr(&spec.handler), minf].concat(),
    );
    bx(
        b"trak",
        &[tkhd(index as u32 + 1, movie_duration as u32, audio), mdia].concat(),
    )
}

/// Assemble a complete file for `tracks`
pub fn build_mp4(tracks: &[TrackSpec]) -> Vec<u8> {
    let movie_timescale = 1000u32;
    let ftyp = ftyp();

    let mut payload = Vec::new();
    let mut chunk_offsets = Vec::new();
    let mdat_start = ftyp.len() as u32 + 8;
    for (t, spec) in tracks.iter().enumerate() {
        chunk_offsets.push(mdat_start + payload.len() as u32);
        for (i, &size) in spec.sizes.iter().enumerate() {
            payload.extend(std::iter::repeat(payload_byte(t, i)).take(size as usize));
        }
    }

    let duration = tracks
        .iter()
        .map(|t| t.duration() * movie_timescale as u64 / t.timescale as u64)
        .max()
        .unwrap_or(0);
    let mut moov_children = mvhd(movie_timescale, duration as u32, tracks.len() as u32 + 1);
    for (t, spec) in tracks.iter().enumerate() {
        moov_children.extend(trak(t, spec, movie_timescale, chunk_offsets[t]));
    }

    let mut file = ftyp;
    file.extend(bx(b"mdat", &payload));
    file.extend(bx(b"moov", &moov_children));
    file
}

/// Write a fixture to `path`
pub fn write_mp4(path: &Path, tracks: &[TrackSpec]) -> Vec<u8> {
    let bytes = build_mp4(tracks);
    std::fs::write(path, &bytes).expect("write fixture");
    bytes
}

/// 12 s of 1 s video samples keyed at 0, 2 and 4 s, plus 100 ms audio samples
pub fn scenario_tracks() -> Vec<TrackSpec> {
    vec![TrackSpec::video(12, 1000, &[0, 2, 4]), TrackSpec::audio(120, 100)]
}

/// Same as [`scenario_tracks`] but the audio track also carries a sync table
pub fn doubly_keyed_tracks() -> Vec<TrackSpec> {
    vec![
        TrackSpec::video(12, 1000, &[0, 2, 4]),
        TrackSpec::audio(120, 100).with_sync(&(0..12).map(|i| i * 10).collect::<Vec<u32>>()),
    ]
}
