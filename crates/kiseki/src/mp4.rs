//! Just enough ISO-BMFF walking to read track timescales from an init segment and base media
//! decode times from a media segment.
//!
//! Layout reference: ISO/IEC 14496-12, boxes `tkhd` (8.3.2), `mdhd` (8.4.2), `tfhd` (8.8.7) and
//! `tfdt` (8.8.12).
use std::{collections::HashMap, fmt};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Mp4Error {
    #[error("box {0} is truncated")]
    Truncated(BoxType),

    #[error("box {box_type} declares invalid size {size}")]
    InvalidSize { box_type: BoxType, size: u64 },

    #[error("missing {0} box")]
    MissingBox(BoxType),

    #[error("unsupported {box_type} version {version}")]
    UnsupportedVersion { box_type: BoxType, version: u8 },

    #[error("no timescale known for track {0}")]
    MissingTimescale(u32),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const MOOV: Self = Self(*b"moov");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const MOOF: Self = Self(*b"moof");
    pub const TRAF: Self = Self(*b"traf");
    pub const TFHD: Self = Self(*b"tfhd");
    pub const TFDT: Self = Self(*b"tfdt");

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxType({})", self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Mp4Box<'a> {
    pub box_type: BoxType,
    pub payload: &'a [u8],
}

impl<'a> Mp4Box<'a> {
    pub fn children(&self) -> BoxIter<'a> {
        BoxIter::new(self.payload)
    }

    pub fn child(&self, box_type: BoxType) -> Result<Mp4Box<'a>, Mp4Error> {
        find_box(self.payload, box_type)?.ok_or(Mp4Error::MissingBox(box_type))
    }

    /// Version byte of a full box.
    fn version(&self) -> Result<u8, Mp4Error> {
        self.payload
            .first()
            .copied()
            .ok_or(Mp4Error::Truncated(self.box_type))
    }

    fn read_u32(&self, offset: usize) -> Result<u32, Mp4Error> {
        let bytes = self
            .payload
            .get(offset..offset + 4)
            .ok_or(Mp4Error::Truncated(self.box_type))?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&self, offset: usize) -> Result<u64, Mp4Error> {
        let bytes = self
            .payload
            .get(offset..offset + 8)
            .ok_or(Mp4Error::Truncated(self.box_type))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads a 32-bit field which follows the creation and modification times, which are 32
    /// bits each in version 0 and 64 bits each in version 1.
    fn read_after_times(&self) -> Result<u32, Mp4Error> {
        match self.version()? {
            0 => self.read_u32(12),
            1 => self.read_u32(20),
            version => Err(Mp4Error::UnsupportedVersion {
                box_type: self.box_type,
                version,
            }),
        }
    }
}

/// Iterates sibling boxes in a buffer.
pub struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> BoxIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<Mp4Box<'a>, Mp4Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos + 8 > self.data.len() {
            return None;
        }

        let rest = &self.data[self.pos..];
        let size = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as u64;
        let box_type = BoxType([rest[4], rest[5], rest[6], rest[7]]);

        let (size, header_size) = match size {
            1 => {
                let Some(ext) = rest.get(8..16) else {
                    self.failed = true;
                    return Some(Err(Mp4Error::Truncated(box_type)));
                };
                let mut buf = [0u8; 8];
                buf.copy_from_slice(ext);
                (u64::from_be_bytes(buf), 16)
            }
            // Box extends to the end of the buffer
            0 => (rest.len() as u64, 8),
            size => (size, 8),
        };

        if size < header_size as u64 {
            self.failed = true;
            return Some(Err(Mp4Error::InvalidSize { box_type, size }));
        }
        if size > rest.len() as u64 {
            self.failed = true;
            return Some(Err(Mp4Error::Truncated(box_type)));
        }

        let size = size as usize;
        self.pos += size;
        Some(Ok(Mp4Box {
            box_type,
            payload: &rest[header_size..size],
        }))
    }
}

pub fn find_box(data: &[u8], box_type: BoxType) -> Result<Option<Mp4Box<'_>>, Mp4Error> {
    for mp4_box in BoxIter::new(data) {
        let mp4_box = mp4_box?;
        if mp4_box.box_type == box_type {
            return Ok(Some(mp4_box));
        }
    }
    Ok(None)
}

/// Track id to media timescale (ticks per second), read from `moov/trak/{tkhd,mdia/mdhd}`.
pub fn parse_timescales(init_segment: &[u8]) -> Result<HashMap<u32, u32>, Mp4Error> {
    let moov = find_box(init_segment, BoxType::MOOV)?.ok_or(Mp4Error::MissingBox(BoxType::MOOV))?;

    let mut timescales = HashMap::new();
    for trak in moov.children() {
        let trak = trak?;
        if trak.box_type != BoxType::TRAK {
            continue;
        }

        let tkhd = trak.child(BoxType::TKHD)?;
        let track_id = tkhd.read_after_times()?;
        let mdhd = trak.child(BoxType::MDIA)?.child(BoxType::MDHD)?;
        let timescale = mdhd.read_after_times()?;

        if timescale == 0 {
            tracing::debug!(track_id, "Ignoring track with zero timescale");
            continue;
        }
        timescales.insert(track_id, timescale);
    }

    if timescales.is_empty() {
        return Err(Mp4Error::MissingBox(BoxType::TRAK));
    }
    Ok(timescales)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackFragmentTime {
    pub track_id: u32,
    pub base_media_decode_time: u64,
}

/// Base media decode time of every track fragment in the first `moof` of a media segment.
pub fn parse_base_decode_times(media_segment: &[u8]) -> Result<Vec<TrackFragmentTime>, Mp4Error> {
    let moof =
        find_box(media_segment, BoxType::MOOF)?.ok_or(Mp4Error::MissingBox(BoxType::MOOF))?;

    let mut times = Vec::new();
    for traf in moof.children() {
        let traf = traf?;
        if traf.box_type != BoxType::TRAF {
            continue;
        }

        let track_id = traf.child(BoxType::TFHD)?.read_u32(4)?;
        let tfdt = traf.child(BoxType::TFDT)?;
        let base_media_decode_time = match tfdt.version()? {
            0 => tfdt.read_u32(4)? as u64,
            1 => tfdt.read_u64(4)?,
            version => {
                return Err(Mp4Error::UnsupportedVersion {
                    box_type: BoxType::TFDT,
                    version,
                })
            }
        };
        times.push(TrackFragmentTime {
            track_id,
            base_media_decode_time,
        });
    }

    if times.is_empty() {
        return Err(Mp4Error::MissingBox(BoxType::TRAF));
    }
    Ok(times)
}
