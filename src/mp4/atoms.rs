//! ISO BMFF box header parsing, navigation and serialization primitives.

use std::io::{self, Read, Seek, SeekFrom};

/// A parsed box header.
#[derive(Debug, Clone)]
pub struct BoxHeader {
    /// 4-byte box type (e.g. b"moov").
    pub box_type: [u8; 4],
    /// Total size of the box including the header.
    pub size: u64,
    /// Size of the header itself (8 or 16 for extended-size boxes).
    pub header_size: u64,
    /// Absolute position of the first header byte.
    pub offset: u64,
}

impl BoxHeader {
    /// Size of the box content (size - header_size).
    pub fn content_size(&self) -> u64 {
        self.size.saturating_sub(self.header_size)
    }

    /// Absolute position of the first content byte.
    pub fn content_start(&self) -> u64 {
        self.offset + self.header_size
    }

    /// Absolute position one past the last byte of the box.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn type_str(&self) -> String {
        fourcc_str(&self.box_type)
    }
}

/// Printable form of a four-character code.
pub fn fourcc_str(code: &[u8; 4]) -> String {
    code.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Read a box header from the current position.
///
/// Returns `Ok(None)` at EOF. A size of zero ("extends to end of file") is
/// resolved against `limit`, the end of the enclosing box or file.
pub fn read_box_header<R: Read + Seek>(reader: &mut R, limit: u64) -> io::Result<Option<BoxHeader>> {
    let offset = reader.stream_position()?;
    let mut buf = [0u8; 8];
    match reader.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let box_type = [buf[4], buf[5], buf[6], buf[7]];

    let (size, header_size) = match size32 {
        1 => {
            // Extended 64-bit size.
            let size64 = read_u64(reader)?;
            (size64, 16u64)
        }
        0 => (limit.saturating_sub(offset), 8u64),
        n => (n as u64, 8u64),
    };

    if size < header_size {
        return Err(invalid(format!(
            "box '{}' at {} declares size {} smaller than its header",
            fourcc_str(&box_type),
            offset,
            size
        )));
    }
    if offset + size > limit {
        return Err(invalid(format!(
            "box '{}' at {} overruns its parent ({} > {})",
            fourcc_str(&box_type),
            offset,
            offset + size,
            limit
        )));
    }

    Ok(Some(BoxHeader {
        box_type,
        size,
        header_size,
        offset,
    }))
}

/// Read every direct child header in `[start, end)`, leaving the reader at `end`.
pub fn read_children<R: Read + Seek>(reader: &mut R, start: u64, end: u64) -> io::Result<Vec<BoxHeader>> {
    let mut children = Vec::new();
    let mut pos = start;
    while pos + 8 <= end {
        reader.seek(SeekFrom::Start(pos))?;
        let Some(header) = read_box_header(reader, end)? else {
            break;
        };
        pos = header.end();
        children.push(header);
    }
    reader.seek(SeekFrom::Start(end))?;
    Ok(children)
}

/// Find the first child of the given type among pre-read headers.
pub fn find<'a>(children: &'a [BoxHeader], target: &[u8; 4]) -> Option<&'a BoxHeader> {
    children.iter().find(|h| &h.box_type == target)
}

/// Read a whole box (header included) into memory.
pub fn read_raw_box<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> io::Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(header.offset))?;
    read_bytes(reader, header.size as usize)
}

/// Read a big-endian u16.
pub fn read_u16<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Read a big-endian i16.
pub fn read_i16<R: Read>(reader: &mut R) -> io::Result<i16> {
    Ok(read_u16(reader)? as i16)
}

/// Read a big-endian u32.
pub fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Read a big-endian i32.
pub fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    Ok(read_u32(reader)? as i32)
}

/// Read a big-endian u64.
pub fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Read `n` bytes into a new Vec.
pub fn read_bytes<R: Read>(reader: &mut R, n: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(n as u64).read_to_end(&mut buf)?;
    if buf.len() != n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("wanted {} bytes, got {}", n, buf.len()),
        ));
    }
    Ok(buf)
}

/// Read a fullbox header (1 byte version + 3 bytes flags) and return (version, flags).
pub fn read_fullbox_header<R: Read>(reader: &mut R) -> io::Result<(u8, u32)> {
    let val = read_u32(reader)?;
    let version = (val >> 24) as u8;
    let flags = val & 0x00FF_FFFF;
    Ok((version, flags))
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Write a complete box: size (u32 BE) + type + content.
pub fn write_box(box_type: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let size = (8 + content.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(content);
    out
}

/// Write a full box: box header + version/flags + content.
pub fn write_full_box(box_type: &[u8; 4], version: u8, flags: u32, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + content.len());
    body.extend_from_slice(&fullbox_header(version, flags));
    body.extend_from_slice(content);
    write_box(box_type, &body)
}

/// Write a container box (size + type + children concatenated).
pub fn write_container_box(box_type: &[u8; 4], children: &[&[u8]]) -> Vec<u8> {
    let children_len: usize = children.iter().map(|c| c.len()).sum();
    let size = (8 + children_len) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    for child in children {
        out.extend_from_slice(child);
    }
    out
}

/// Version + flags word of a full box.
pub fn fullbox_header(version: u8, flags: u32) -> [u8; 4] {
    let val = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
    val.to_be_bytes()
}

/// `mdat` header with a 64-bit size field.
pub fn mdat_header_large(total_size: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&1u32.to_be_bytes());
    out[4..8].copy_from_slice(b"mdat");
    out[8..16].copy_from_slice(&total_size.to_be_bytes());
    out
}
