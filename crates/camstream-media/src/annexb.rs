//! Access unit splitting for raw H.264 Annex-B streams
//!
//! Encoders piped into the server (`libcamera-vid -o -`, `ffmpeg -f h264 -`)
//! produce one continuous byte stream. The reader groups NAL units into
//! access units: parameter sets, SEI and delimiters travel with the picture
//! that follows them, and every slice of a picture lands in the same unit.
//!
//! A unit is only known to be complete once the first NAL unit of the next
//! one arrives, so output trails the input by one picture.

use bytes::{Bytes, BytesMut};
use std::io::Read;

use crate::codec::{find_start_code, is_key_frame, nal_units, MediaError, NalType};

/// Default cap on a single access unit
pub const DEFAULT_MAX_ACCESS_UNIT: usize = 8 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// One encoded picture with its leading parameter sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Annex-B bytes, start codes included
    pub data: Bytes,
    /// True if the unit carries an IDR slice
    pub key_frame: bool,
}

/// Splits a byte source into access units
pub struct AccessUnitReader<R> {
    source: R,
    /// Unparsed input, always beginning at a start code once one has been seen
    buf: BytesMut,
    /// Access unit under construction
    unit: BytesMut,
    /// `unit` already holds a slice
    has_slice: bool,
    max_size: usize,
    eof: bool,
}

impl<R: Read> AccessUnitReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_max_size(source, DEFAULT_MAX_ACCESS_UNIT)
    }

    pub fn with_max_size(source: R, max_size: usize) -> Self {
        Self {
            source,
            buf: BytesMut::with_capacity(READ_CHUNK),
            unit: BytesMut::new(),
            has_slice: false,
            max_size,
            eof: false,
        }
    }

    /// Read more input; returns false once the source is exhausted
    fn fill(&mut self) -> Result<bool, MediaError> {
        if self.eof {
            return Ok(false);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            match self.source.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if n == 0 {
            self.eof = true;
            return Ok(false);
        }

        self.buf.extend_from_slice(&chunk[..n]);
        if self.buf.len() > self.max_size {
            return Err(MediaError::AccessUnitTooLarge {
                size: self.buf.len(),
                limit: self.max_size,
            });
        }
        Ok(true)
    }

    /// Take the next complete NAL unit (with its start code) from the buffer
    fn next_nal(&mut self) -> Result<Option<Bytes>, MediaError> {
        loop {
            match find_start_code(&self.buf, 0) {
                Some((0, len)) => {
                    if let Some((end, _)) = find_start_code(&self.buf, len) {
                        return Ok(Some(self.buf.split_to(end).freeze()));
                    }
                }
                Some((offset, _)) => {
                    tracing::debug!("Skipping {} bytes before start code", offset);
                    let _ = self.buf.split_to(offset);
                    continue;
                }
                None => {}
            }

            if !self.fill()? {
                // the last unit runs to the end of input
                if find_start_code(&self.buf, 0).is_some_and(|(offset, _)| offset == 0) {
                    return Ok(Some(self.buf.split().freeze()));
                }
                self.buf.clear();
                return Ok(None);
            }
        }
    }

    fn take_unit(&mut self) -> AccessUnit {
        let data = self.unit.split().freeze();
        self.has_slice = false;
        AccessUnit {
            key_frame: is_key_frame(&data),
            data,
        }
    }

    fn push_nal(&mut self, nal: &[u8], nal_type: NalType) -> Result<(), MediaError> {
        let size = self.unit.len() + nal.len();
        if size > self.max_size {
            self.unit.clear();
            self.has_slice = false;
            return Err(MediaError::AccessUnitTooLarge {
                size,
                limit: self.max_size,
            });
        }

        self.unit.extend_from_slice(nal);
        self.has_slice |= nal_type.is_vcl();
        Ok(())
    }

    fn read_unit(&mut self) -> Result<Option<AccessUnit>, MediaError> {
        while let Some(nal) = self.next_nal()? {
            let Some(payload) = nal_units(&nal).next() else {
                continue;
            };

            let nal_type = NalType::from_header(payload[0]);

            if self.has_slice && starts_access_unit(payload) {
                let unit = self.take_unit();
                self.push_nal(&nal, nal_type)?;
                return Ok(Some(unit));
            }

            self.push_nal(&nal, nal_type)?;
        }

        if !self.unit.is_empty() {
            return Ok(Some(self.take_unit()));
        }
        Ok(None)
    }
}

/// True if `nal` (start code stripped) cannot belong to an access unit that
/// already holds a slice.
///
/// A slice opens a new picture when its `first_mb_in_slice` is 0, which
/// Exp-Golomb codes as a single set bit at the top of the slice header.
/// Data partitions B and C never carry that field.
fn starts_access_unit(nal: &[u8]) -> bool {
    match NalType::from_header(nal[0]) {
        NalType::Aud | NalType::Sps | NalType::Pps | NalType::Sei => true,
        NalType::Slice | NalType::SliceA | NalType::Idr => {
            nal.get(1).is_some_and(|byte| byte & 0x80 != 0)
        }
        _ => false,
    }
}

impl<R: Read> Iterator for AccessUnitReader<R> {
    type Item = Result<AccessUnit, MediaError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_unit().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xe0, 0x1f];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80];
    const IDR: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21];
    const SLICE: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x03];

    #[test]
    fn test_groups_parameter_sets_with_idr() {
        let stream = [SPS, PPS, IDR, SLICE, SLICE].concat();
        let units: Vec<_> = AccessUnitReader::new(Cursor::new(stream))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(units.len(), 3);
        assert!(units[0].key_frame);
        assert_eq!(units[0].data.as_ref(), [SPS, PPS, IDR].concat().as_slice());
        assert!(!units[1].key_frame);
        assert_eq!(units[1].data.as_ref(), SLICE);
        assert_eq!(units[2].data.as_ref(), SLICE);
    }

    #[test]
    fn test_slices_of_one_picture_stay_together() {
        // first_mb_in_slice = 0 (top bit set), then a second slice at mb 1 (ue "010")
        const IDR_FIRST: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21];
        const IDR_SECOND: &[u8] = &[0, 0, 0, 1, 0x65, 0x48, 0x84, 0x21];
        const P_FIRST: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x03];
        const P_SECOND: &[u8] = &[0, 0, 0, 1, 0x41, 0x5a, 0x02, 0x03];

        let stream = [IDR_FIRST, IDR_SECOND, P_FIRST, P_SECOND].concat();
        let units: Vec<_> = AccessUnitReader::new(Cursor::new(stream))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(units.len(), 2);
        assert!(units[0].key_frame);
        assert_eq!(units[0].data.as_ref(), [IDR_FIRST, IDR_SECOND].concat().as_slice());
        assert!(!units[1].key_frame);
        assert_eq!(units[1].data.as_ref(), [P_FIRST, P_SECOND].concat().as_slice());
    }

    #[test]
    fn test_delimiter_closes_unit() {
        const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xf0];
        let stream = [AUD, SPS, PPS, IDR, AUD, SLICE].concat();
        let units: Vec<_> = AccessUnitReader::new(Cursor::new(stream))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].data.as_ref(), [AUD, SPS, PPS, IDR].concat().as_slice());
        assert_eq!(units[1].data.as_ref(), [AUD, SLICE].concat().as_slice());
    }

    #[test]
    fn test_skips_leading_garbage() {
        let stream = [&[0xff, 0xfe][..], IDR].concat();
        let units: Vec<_> = AccessUnitReader::new(Cursor::new(stream))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data.as_ref(), IDR);
    }

    #[test]
    fn test_small_reads_are_reassembled() {
        struct Trickle(Vec<u8>, usize);
        impl Read for Trickle {
            fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
                if self.1 >= self.0.len() {
                    return Ok(0);
                }
                out[0] = self.0[self.1];
                self.1 += 1;
                Ok(1)
            }
        }

        let stream = [SPS, IDR, SLICE].concat();
        let units: Vec<_> = AccessUnitReader::new(Trickle(stream, 0))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(units.len(), 2);
        assert!(units[0].key_frame);
        assert!(!units[1].key_frame);
    }

    #[test]
    fn test_oversized_unit_is_rejected() {
        let mut big = IDR.to_vec();
        big.extend(std::iter::repeat_n(0x11, 64));
        let mut reader = AccessUnitReader::with_max_size(Cursor::new(big), 32);

        assert!(matches!(
            reader.next(),
            Some(Err(MediaError::AccessUnitTooLarge { .. }))
        ));
    }
}
