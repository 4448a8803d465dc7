//! Parse MP4 sample table atoms (stts, ctts, stss, stsz/stz2, stsc, stco/co64)
//! and resolve them into flat per-sample vectors with absolute file offsets.

use std::io::{self, Read, Seek, SeekFrom};

use super::atoms::{find, read_fullbox_header, read_u16, read_u32, read_u64, BoxHeader};

/// A resolved sample table for one track.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    /// Per-sample payload size in bytes.
    pub sizes: Vec<u32>,
    /// Per-sample absolute file offset.
    pub offsets: Vec<u64>,
    /// Per-sample decode duration in media ticks.
    pub durations: Vec<u32>,
    /// Per-sample composition offset; empty when the track has no ctts.
    pub composition_offsets: Vec<i32>,
    /// 0-based sync sample indices, ascending; empty when the track has no stss.
    pub sync_samples: Vec<u32>,
}

impl SampleTable {
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// (first_chunk, samples_per_chunk) from stsc.
struct StscEntry {
    first_chunk: u32,
    samples_per_chunk: u32,
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Guard against entry counts that cannot fit in the box.
fn check_entries(header: &BoxHeader, count: u32, entry_size: u64, fixed: u64) -> io::Result<()> {
    if fixed + count as u64 * entry_size > header.content_size() {
        return Err(invalid(format!(
            "'{}' declares {} entries but holds {} bytes",
            header.type_str(),
            count,
            header.content_size()
        )));
    }
    Ok(())
}

/// Parse stts into a flat list of durations, expanding at most `limit` samples.
fn parse_stts<R: Read>(reader: &mut R, header: &BoxHeader, limit: usize) -> io::Result<Vec<u32>> {
    let (_version, _flags) = read_fullbox_header(reader)?;
    let entry_count = read_u32(reader)?;
    check_entries(header, entry_count, 8, 8)?;
    let mut durations = Vec::with_capacity(limit);
    for _ in 0..entry_count {
        let count = read_u32(reader)?;
        let delta = read_u32(reader)?;
        let take = (count as usize).min(limit - durations.len());
        durations.extend(std::iter::repeat(delta).take(take));
    }
    Ok(durations)
}

/// Parse ctts into a flat list of composition offsets, expanding at most
/// `limit` samples.
fn parse_ctts<R: Read>(reader: &mut R, header: &BoxHeader, limit: usize) -> io::Result<Vec<i32>> {
    let (_version, _flags) = read_fullbox_header(reader)?;
    let entry_count = read_u32(reader)?;
    check_entries(header, entry_count, 8, 8)?;
    let mut offsets = Vec::with_capacity(limit);
    for _ in 0..entry_count {
        let count = read_u32(reader)?;
        // Version 0 is nominally unsigned but writers routinely store negatives.
        let offset = read_u32(reader)? as i32;
        let take = (count as usize).min(limit - offsets.len());
        offsets.extend(std::iter::repeat(offset).take(take));
    }
    Ok(offsets)
}

/// Parse stss. Returns 0-based sync sample indices.
fn parse_stss<R: Read>(reader: &mut R, header: &BoxHeader) -> io::Result<Vec<u32>> {
    let (_version, _flags) = read_fullbox_header(reader)?;
    let entry_count = read_u32(reader)?;
    check_entries(header, entry_count, 4, 8)?;
    let mut syncs = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let sample_number = read_u32(reader)?;
        if sample_number == 0 {
            return Err(invalid("stss references sample 0"));
        }
        // stss uses 1-based sample numbers.
        syncs.push(sample_number - 1);
    }
    syncs.sort_unstable();
    syncs.dedup();
    Ok(syncs)
}

/// Parse stsz. Returns per-sample sizes.
///
/// A constant-size table only stores a count, so it is checked against
/// `max_samples` before being expanded.
fn parse_stsz<R: Read>(reader: &mut R, header: &BoxHeader, max_samples: u64) -> io::Result<Vec<u32>> {
    let (_version, _flags) = read_fullbox_header(reader)?;
    let sample_size = read_u32(reader)?;
    let sample_count = read_u32(reader)?;
    if sample_size != 0 {
        if sample_count as u64 > max_samples {
            return Err(invalid(format!(
                "stsz declares {} samples of {} bytes but at most {} fit",
                sample_count, sample_size, max_samples
            )));
        }
        Ok(vec![sample_size; sample_count as usize])
    } else {
        check_entries(header, sample_count, 4, 12)?;
        let mut sizes = Vec::with_capacity(sample_count as usize);
        for _ in 0..sample_count {
            sizes.push(read_u32(reader)?);
        }
        Ok(sizes)
    }
}

/// Parse the compact stz2 variant.
fn parse_stz2<R: Read>(reader: &mut R, header: &BoxHeader) -> io::Result<Vec<u32>> {
    let (_version, _flags) = read_fullbox_header(reader)?;
    let field_size = (read_u32(reader)? & 0xFF) as u8;
    let sample_count = read_u32(reader)?;
    match field_size {
        4 => check_entries(header, sample_count / 2 + sample_count % 2, 1, 12)?,
        8 => check_entries(header, sample_count, 1, 12)?,
        16 => check_entries(header, sample_count, 2, 12)?,
        other => return Err(invalid(format!("stz2 field size {} not supported", other))),
    }
    let mut sizes = Vec::with_capacity(sample_count as usize);
    let mut byte = [0u8; 1];
    for i in 0..sample_count {
        let size = match field_size {
            4 if i % 2 == 0 => {
                reader.read_exact(&mut byte)?;
                (byte[0] >> 4) as u32
            }
            4 => (byte[0] & 0x0F) as u32,
            8 => {
                reader.read_exact(&mut byte)?;
                byte[0] as u32
            }
            _ => read_u16(reader)? as u32,
        };
        sizes.push(size);
    }
    Ok(sizes)
}

/// Parse stsc.
fn parse_stsc<R: Read>(reader: &mut R, header: &BoxHeader) -> io::Result<Vec<StscEntry>> {
    let (_version, _flags) = read_fullbox_header(reader)?;
    let entry_count = read_u32(reader)?;
    check_entries(header, entry_count, 12, 8)?;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let first_chunk = read_u32(reader)?;
        let samples_per_chunk = read_u32(reader)?;
        let _sdi = read_u32(reader)?; // sample description index
        if first_chunk == 0 {
            return Err(invalid("stsc references chunk 0"));
        }
        if let Some(prev) = entries.last() {
            let prev: &StscEntry = prev;
            if first_chunk <= prev.first_chunk {
                return Err(invalid("stsc entries are not ascending"));
            }
        }
        entries.push(StscEntry {
            first_chunk,
            samples_per_chunk,
        });
    }
    Ok(entries)
}

/// Parse chunk offsets from stco (32-bit) or co64 (64-bit).
fn parse_chunk_offsets<R: Read>(reader: &mut R, header: &BoxHeader, is_co64: bool) -> io::Result<Vec<u64>> {
    let (_version, _flags) = read_fullbox_header(reader)?;
    let entry_count = read_u32(reader)?;
    check_entries(header, entry_count, if is_co64 { 8 } else { 4 }, 8)?;
    let mut offsets = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        if is_co64 {
            offsets.push(read_u64(reader)?);
        } else {
            offsets.push(read_u32(reader)? as u64);
        }
    }
    Ok(offsets)
}

fn seek_to<R: Seek>(reader: &mut R, header: &BoxHeader) -> io::Result<()> {
    reader.seek(SeekFrom::Start(header.content_start()))?;
    Ok(())
}

/// Samples the chunk tables can place: each chunk holds the
/// `samples_per_chunk` of the stsc run it falls in.
fn addressable_samples(stsc: &[StscEntry], chunk_count: usize) -> u64 {
    let chunk_count = chunk_count as u64;
    stsc.iter()
        .enumerate()
        .map(|(i, entry)| {
            let first = entry.first_chunk as u64;
            let next = stsc
                .get(i + 1)
                .map_or(chunk_count + 1, |e| e.first_chunk as u64)
                .min(chunk_count + 1);
            next.saturating_sub(first) * entry.samples_per_chunk as u64
        })
        .fold(0u64, u64::saturating_add)
}

fn stream_len<R: Seek>(reader: &mut R) -> io::Result<u64> {
    reader.seek(SeekFrom::End(0))
}

/// Resolve the sample table from the children of an stbl box.
///
/// Counts taken from the file are bounded before anything is expanded: the
/// chunk tables cap how many samples can exist, and constant-size samples
/// must fit in the stream.
pub fn resolve_sample_table<R: Read + Seek>(reader: &mut R, stbl_children: &[BoxHeader]) -> io::Result<SampleTable> {
    // --- chunks ---
    let stsc = find(stbl_children, b"stsc").ok_or_else(|| invalid("Missing stsc box"))?;
    seek_to(reader, stsc)?;
    let stsc_entries = parse_stsc(reader, stsc)?;

    let chunk_offsets = if let Some(h) = find(stbl_children, b"stco") {
        seek_to(reader, h)?;
        parse_chunk_offsets(reader, h, false)?
    } else if let Some(h) = find(stbl_children, b"co64") {
        seek_to(reader, h)?;
        parse_chunk_offsets(reader, h, true)?
    } else {
        return Err(invalid("Missing stco/co64 box"));
    };
    let addressable = addressable_samples(&stsc_entries, chunk_offsets.len());

    // --- sizes ---
    let sizes = if let Some(h) = find(stbl_children, b"stsz") {
        let total_len = stream_len(reader)?;
        seek_to(reader, h)?;
        parse_stsz(reader, h, addressable.min(total_len))?
    } else if let Some(h) = find(stbl_children, b"stz2") {
        seek_to(reader, h)?;
        parse_stz2(reader, h)?
    } else {
        return Err(invalid("Missing stsz box"));
    };
    let sample_count = sizes.len();
    if sample_count as u64 > addressable {
        return Err(invalid(format!(
            "chunk table covers {} of {} samples",
            addressable, sample_count
        )));
    }

    // --- durations ---
    let stts = find(stbl_children, b"stts").ok_or_else(|| invalid("Missing stts box"))?;
    seek_to(reader, stts)?;
    let durations = parse_stts(reader, stts, sample_count)?;
    if durations.len() < sample_count {
        return Err(invalid(format!(
            "stts covers {} of {} samples",
            durations.len(),
            sample_count
        )));
    }

    // --- composition offsets (optional) ---
    let composition_offsets = match find(stbl_children, b"ctts") {
        Some(h) => {
            seek_to(reader, h)?;
            let mut offsets = parse_ctts(reader, h, sample_count)?;
            offsets.resize(sample_count, offsets.last().copied().unwrap_or(0));
            offsets
        }
        None => Vec::new(),
    };

    // --- sync samples (optional: absent means every sample is sync) ---
    let sync_samples = match find(stbl_children, b"stss") {
        Some(h) => {
            seek_to(reader, h)?;
            let syncs = parse_stss(reader, h)?;
            if let Some(&last) = syncs.last() {
                if last as usize >= sample_count {
                    return Err(invalid(format!(
                        "stss references sample {} of {}",
                        last + 1,
                        sample_count
                    )));
                }
            }
            syncs
        }
        None => Vec::new(),
    };

    // --- resolve: walk chunks, assigning file offsets to samples ---
    let mut offsets = Vec::with_capacity(sample_count);
    if sample_count > 0 {
        let mut entry_idx = 0usize;
        for (chunk_idx, &chunk_offset) in chunk_offsets.iter().enumerate() {
            let chunk_number = chunk_idx as u32 + 1; // 1-based
            while entry_idx + 1 < stsc_entries.len() && stsc_entries[entry_idx + 1].first_chunk <= chunk_number {
                entry_idx += 1;
            }
            if stsc_entries[entry_idx].first_chunk > chunk_number {
                return Err(invalid("stsc does not cover the first chunk"));
            }
            let mut offset = chunk_offset;
            for _ in 0..stsc_entries[entry_idx].samples_per_chunk {
                if offsets.len() >= sample_count {
                    break;
                }
                offsets.push(offset);
                offset = offset
                    .checked_add(sizes[offsets.len() - 1] as u64)
                    .ok_or_else(|| invalid(format!("chunk {} runs past the 64-bit offset range", chunk_number)))?;
            }
            if offsets.len() >= sample_count {
                break;
            }
        }
        if offsets.len() < sample_count {
            return Err(invalid(format!(
                "chunk table covers {} of {} samples",
                offsets.len(),
                sample_count
            )));
        }
    }

    Ok(SampleTable {
        sizes,
        offsets,
        durations,
        composition_offsets,
        sync_samples,
    })
}
