//! Video codec utilities
//!
//! Only H.264 is carried end to end; these helpers look at Annex-B NAL
//! headers without decoding anything.

use thiserror::Error;

/// Video codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            VideoCodec::H264 => 90_000,
        }
    }
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("access unit of {size} bytes exceeds limit of {limit} bytes")]
    AccessUnitTooLarge { size: usize, limit: usize },
}

/// H.264 NAL unit type (the low five bits of the NAL header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalType {
    Slice,
    SliceA,
    SliceB,
    SliceC,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl NalType {
    pub fn from_header(header: u8) -> Self {
        match header & 0x1f {
            1 => NalType::Slice,
            2 => NalType::SliceA,
            3 => NalType::SliceB,
            4 => NalType::SliceC,
            5 => NalType::Idr,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::Aud,
            other => NalType::Other(other),
        }
    }

    /// Video coding layer units carry picture data; everything else is parameter sets and metadata
    pub fn is_vcl(&self) -> bool {
        matches!(
            self,
            NalType::Slice | NalType::SliceA | NalType::SliceB | NalType::SliceC | NalType::Idr
        )
    }
}

/// Position of the next Annex-B start code at or after `from`.
///
/// Returns `(offset, length)` where `length` is 3 or 4 depending on whether the
/// short or long start sequence was used.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if data.len() < 3 {
        return None;
    }

    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > from && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }

    None
}

/// Iterator over the NAL units of an Annex-B buffer, start codes stripped
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: Option<usize>,
}

pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    let pos = find_start_code(data, 0).map(|(offset, len)| offset + len);
    NalUnits { data, pos }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let start = self.pos?;
            let (end, next) = match find_start_code(self.data, start) {
                Some((offset, len)) => (offset, Some(offset + len)),
                None => (self.data.len(), None),
            };
            self.pos = next;

            if end > start {
                return Some(&self.data[start..end]);
            }
            // empty unit between two back-to-back start codes
            if self.pos.is_none() {
                return None;
            }
        }
    }
}

/// True if the buffer contains an IDR slice
pub fn is_key_frame(data: &[u8]) -> bool {
    nal_units(data).any(|nal| NalType::from_header(nal[0]) == NalType::Idr)
}
