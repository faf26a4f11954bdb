// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use thiserror::Error;

/// Errors raised by [`BitReader`]. Any of them means the syntax structure
/// being decoded is corrupt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("exp-golomb codeword has more than 32 leading zero bits")]
    ExpGolombOverflow,
    #[error("value {value} is out of range [{min}, {max}]")]
    OutOfRange { value: i64, min: i64, max: i64 },
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("{decoded} bits decoded from a buffer holding {available} bits")]
    Overrun { decoded: u64, available: u64 },
}

/// A bit reader for codec bitstreams. It reads MSB-first and optionally
/// removes emulation-prevention bytes on the fly.
#[derive(Clone)]
pub struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u8,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in emulation prevention byte detection.
    prev_two_bytes: u16,
    /// Number of emulation prevention bytes (i.e. 0x000003) we found.
    num_epb: usize,
    /// Whether or not we need emulation prevention logic.
    needs_epb: bool,
    /// How many bits have been read so far.
    position: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], needs_epb: bool) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
            needs_epb,
            position: 0,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        let bit = self.read_bits::<u32>(1)?;
        Ok(bit == 1)
    }

    /// Read up to 32 bits from the stream. Reading zero bits is allowed and
    /// yields 0, which is what `u(v)` elements with a zero length expect.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        if num_bits == 0 {
            return U::try_from(0).map_err(|_| ReadBitsError::ConversionFailed);
        }

        let mut bits_left = num_bits;
        let mut out = 0u64;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= u64::from(self.curr_byte) << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.move_to_next_byte()?;
        }

        out |= u64::from(self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left));
        out &= (1u64 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;
        self.position += num_bits as u64;

        let out = u32::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)?;
        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Reads `num_bits` and fails if the value is larger than `max`.
    pub fn read_bits_max<U: TryFrom<u32>>(
        &mut self,
        num_bits: usize,
        max: u32,
    ) -> Result<U, ReadBitsError> {
        let value = self.read_bits::<u32>(num_bits)?;
        if value > max {
            return Err(ReadBitsError::OutOfRange {
                value: value.into(),
                min: 0,
                max: max.into(),
            });
        }

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        let len = self.data.get_ref().len() as u64;
        let cur_pos = std::cmp::min(self.data.position(), len);
        ((len - cur_pos) as usize) * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.move_to_next_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        let mut buf = [0u8; 1];
        let orig_pos = self.data.position();
        while self.data.read_exact(&mut buf).is_ok() {
            if buf[0] != 0 {
                self.data.set_position(orig_pos);
                return true;
            }
        }
        self.data.set_position(orig_pos);
        false
    }

    /// Reads an unsigned Exp-Golomb codeword. This may advance the state of
    /// position within the bitstream even if the read operation is
    /// unsuccessful. See H.266 clause 9.2.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U, ReadBitsError> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 32 {
                return Err(ReadBitsError::ExpGolombOverflow);
            }
        }

        let value = ((1u64 << num_bits) - 1) + u64::from(self.read_bits::<u32>(num_bits)?);
        let value = u32::try_from(value).map_err(|_| ReadBitsError::ExpGolombOverflow)?;

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(
        &mut self,
        min: u32,
        max: u32,
    ) -> Result<U, ReadBitsError> {
        let ue = self.read_ue::<u32>()?;
        if ue > max || ue < min {
            Err(ReadBitsError::OutOfRange {
                value: ue.into(),
                min: min.into(),
                max: max.into(),
            })
        } else {
            U::try_from(ue).map_err(|_| ReadBitsError::ConversionFailed)
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> Result<U, ReadBitsError> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb codeword. Odd code numbers map to positive
    /// values and even ones to negative values, i.e. (-1)^(k+1) * Ceil(k/2).
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> Result<U, ReadBitsError> {
        let k = i64::from(self.read_ue::<u32>()?);
        let se = if k % 2 == 0 { -(k / 2) } else { (k + 1) / 2 };
        let se = i32::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)?;

        U::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(
        &mut self,
        min: i32,
        max: i32,
    ) -> Result<U, ReadBitsError> {
        let se = self.read_se::<i32>()?;
        if se < min || se > max {
            Err(ReadBitsError::OutOfRange {
                value: se.into(),
                min: min.into(),
                max: max.into(),
            })
        } else {
            U::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)
        }
    }

    /// Whether the cursor sits on a byte boundary.
    pub fn is_byte_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte % 8 == 0
    }

    /// Consumes bits up to the next byte boundary. Returns whether all of the
    /// skipped bits were zero, as alignment_zero_bit requires.
    pub fn skip_to_byte_boundary(&mut self) -> Result<bool, ReadBitsError> {
        let mut all_zero = true;
        while !self.is_byte_aligned() {
            all_zero &= !self.read_bit()?;
        }

        Ok(all_zero)
    }

    /// Reads a stop bit equal to 1 followed by zero bits up to the next byte
    /// boundary. Implements both rbsp_trailing_bits() and byte_alignment().
    pub fn read_trailing_bits(&mut self) -> Result<(), ReadBitsError> {
        if !self.read_bit()? {
            return Err(ReadBitsError::OutOfRange {
                value: 0,
                min: 1,
                max: 1,
            });
        }

        if !self.skip_to_byte_boundary()? {
            log::warn!("Non-zero alignment bits after the stop bit");
        }

        Ok(())
    }

    /// Return the position of this bitstream in bits.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of payload bits decoded so far.
    pub fn bits_decoded(&self) -> u64 {
        self.position
    }

    /// Number of whole payload bytes that have not been touched yet.
    pub fn bytes_left(&self) -> usize {
        self.num_bits_left() / 8
    }

    /// Fails if more bits were decoded than the payload holds.
    pub fn check_overrun(&self) -> Result<(), ReadBitsError> {
        let available = (self.data.get_ref().len().saturating_sub(self.num_epb) * 8) as u64;
        if self.position > available {
            return Err(ReadBitsError::Overrun {
                decoded: self.position,
                available,
            });
        }

        Ok(())
    }

    fn get_byte(&mut self) -> Result<u8, ReadBitsError> {
        let mut buf = [0u8; 1];
        self.data
            .read_exact(&mut buf)
            .map_err(|_| ReadBitsError::OutOfBits)?;
        Ok(buf[0])
    }

    fn move_to_next_byte(&mut self) -> Result<(), ReadBitsError> {
        let mut byte = self.get_byte()?;

        if self.needs_epb {
            if self.prev_two_bytes == 0 && byte == 0x03 {
                // We found an epb
                self.num_epb += 1;
                // Read another byte
                byte = self.get_byte()?;
                // We need another 3 bytes before another epb can happen.
                self.prev_two_bytes = 0xffff;
            }
            self.prev_two_bytes = (self.prev_two_bytes << 8) | u16::from(byte);
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.curr_byte = byte;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mut written = 0;
        for bit in (0..bits).rev() {
            let bit = 1u32 << bit;

            self.write_bit((value & bit) == bit)?;
            written += 1;
        }

        Ok(written)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    pub(crate) fn inner(&self) -> &W {
        &self.out
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h266::nalu_writer::NaluWriter;

    #[test]
    fn test_bitwriter_f1() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(1, true).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
        }
        assert_eq!(buf, vec![0b10001111u8]);
    }

    #[test]
    fn test_bitwriter_f3() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b100u8).unwrap();
            writer.write_f(3, 0b101u8).unwrap();
            writer.write_f(3, 0b011u8).unwrap();
        }
        assert_eq!(buf, vec![0b10010101u8, 0b10000000u8]);
    }

    // These tests are adapted from the chromium tests at media/video/h264_bit_reader_unitttest.cc

    #[test]
    fn read_stream_without_escape_and_trailing_zero_bytes() {
        const RBSP: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = BitReader::new(&RBSP, true);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 47);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.num_bits_left(), 39);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 1);
        assert_eq!(reader.num_bits_left(), 7);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 6);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn single_byte_stream() {
        const RBSP: [u8; 1] = [0x18];

        let mut reader = BitReader::new(&RBSP, true);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rsbp_data());
        assert_eq!(reader.read_bits::<u32>(4).unwrap(), 1);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn stop_bit_occupy_full_byte() {
        const RBSP: [u8; 2] = [0xab, 0x80];

        let mut reader = BitReader::new(&RBSP, true);
        assert_eq!(reader.num_bits_left(), 16);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xab);
        assert_eq!(reader.num_bits_left(), 8);

        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn read_full_32_bits() {
        let mut reader = BitReader::new(&[0xde, 0xad, 0xbe, 0xef, 0x80], false);
        assert_eq!(reader.read_bits::<u32>(32).unwrap(), 0xdeadbeef);
        assert_eq!(reader.read_bits::<u32>(0).unwrap(), 0);
        assert_eq!(
            reader.read_bits::<u32>(33).unwrap_err(),
            ReadBitsError::TooManyBitsRequested(33)
        );
    }

    // Check that read_ue behaves properly with input at the limits.
    #[test]
    fn read_ue() {
        // Regular value.
        let mut reader = BitReader::new(&[0b0001_1010], true);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 12);
        assert_eq!(reader.data.position(), 1);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 1);

        // 0 value.
        let mut reader = BitReader::new(&[0b1000_0000], true);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.data.position(), 1);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 7);

        // No prefix stop bit.
        let mut reader = BitReader::new(&[0b0000_0000], true);
        reader.read_ue::<u32>().unwrap_err();

        // 31 0-bits, 1 bit marker, 31 bits 1-bits.
        let mut reader = BitReader::new(
            &[
                0b0000_0000,
                0b0000_0000,
                0b0000_0000,
                0b0000_0001,
                0b1111_1111,
                0b1111_1111,
                0b1111_1111,
                0b1111_1110,
            ],
            true,
        );
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0xffff_fffe);
        assert_eq!(reader.data.position(), 8);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 1);

        // 32 0-bits followed by a zero suffix is exactly u32::MAX.
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&[0x80, 0, 0, 0, 0]);
        let mut reader = BitReader::new(&data, false);
        assert_eq!(reader.read_ue::<u32>().unwrap(), u32::MAX);

        // 33 leading zeros is corruption.
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&[0x40, 0, 0, 0, 0]);
        let mut reader = BitReader::new(&data, false);
        assert_eq!(
            reader.read_ue::<u32>().unwrap_err(),
            ReadBitsError::ExpGolombOverflow
        );
    }

    #[test]
    fn exp_golomb_round_trip() {
        let values: Vec<u32> = (0..4096).chain((4096..1 << 20).step_by(997)).collect();
        let signed: Vec<i32> = (-3000..3000).chain([-(1 << 19), (1 << 19) - 1]).collect();

        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            for v in &values {
                writer.write_ue(*v).unwrap();
            }
            for v in &signed {
                writer.write_se(*v).unwrap();
            }
        }

        let mut reader = BitReader::new(&buf, false);
        for v in &values {
            assert_eq!(reader.read_ue::<u32>().unwrap(), *v);
        }
        for v in &signed {
            assert_eq!(reader.read_se::<i32>().unwrap(), *v);
        }
    }

    #[test]
    fn bounded_reads_report_range() {
        // ue(v) 7 followed by se(v) -2.
        let mut reader = BitReader::new(&[0b0001_0000, 0b0101_0000], false);
        assert_eq!(
            reader.read_ue_max::<u32>(6).unwrap_err(),
            ReadBitsError::OutOfRange {
                value: 7,
                min: 0,
                max: 6
            }
        );
        assert!(matches!(
            reader.read_se_bounded::<i32>(-1, 1).unwrap_err(),
            ReadBitsError::OutOfRange { value: -2, .. }
        ));
    }

    #[test]
    fn cursor_accounting() {
        let data = [0xa5u8, 0x5a, 0xff, 0x00, 0x80];
        let mut reader = BitReader::new(&data, false);

        for k in [3usize, 1, 7, 0, 5] {
            let before = reader.bits_decoded();
            reader.read_bits::<u32>(k).unwrap();
            assert_eq!(reader.bits_decoded(), before + k as u64);
        }

        let before = reader.bits_decoded();
        reader.skip_to_byte_boundary().unwrap();
        assert!(reader.bits_decoded() >= before);
        assert_eq!(reader.bits_decoded() % 8, 0);

        // Already aligned: nothing is consumed.
        let before = reader.bits_decoded();
        reader.skip_to_byte_boundary().unwrap();
        assert_eq!(reader.bits_decoded(), before);

        reader.check_overrun().unwrap();
    }

    #[test]
    fn trailing_bits() {
        let mut reader = BitReader::new(&[0b1010_0000], false);
        assert_eq!(reader.read_bits::<u32>(2).unwrap(), 0b10);
        reader.read_trailing_bits().unwrap();
        assert_eq!(reader.bits_decoded(), 8);
        assert_eq!(reader.bytes_left(), 0);

        // Missing stop bit.
        let mut reader = BitReader::new(&[0b0000_0000], false);
        reader.read_trailing_bits().unwrap_err();

        // Reading past the end is caught.
        let mut reader = BitReader::new(&[0xff], false);
        reader.read_bits::<u32>(8).unwrap();
        assert_eq!(reader.read_bit().unwrap_err(), ReadBitsError::OutOfBits);
    }

    // Check that emulation prevention is being handled correctly.
    #[test]
    fn skip_epb_when_enabled() {
        let mut reader = BitReader::new(&[0x00, 0x00, 0x03, 0x01], false);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x03);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x01);

        let mut reader = BitReader::new(&[0x00, 0x00, 0x03, 0x01], true);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x01);
        assert_eq!(reader.num_epb(), 1);
        reader.check_overrun().unwrap();
    }
}
