// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Debug;
use std::io::Cursor;

use anyhow::anyhow;
use anyhow::Result;
use bytes::Buf;

pub trait Header: Sized {
    /// Parse the NALU header, returning it.
    fn parse<T: AsRef<[u8]>>(cursor: &Cursor<T>) -> Result<Self>;
    /// Whether this header type indicates EOS.
    fn is_end(&self) -> bool;
    /// The length of the header.
    fn len(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct Nalu<'a, U> {
    pub header: U,
    /// The mapping that backs this NALU. Possibly shared with the other NALUs
    /// in the Access Unit.
    pub data: &'a [u8],
    /// Size of the NALU, header included.
    pub size: usize,
    /// Offset of the NALU header within `data`.
    pub offset: usize,
    /// Offset of the start code within `data`.
    pub sc_offset: usize,
}

impl<'a, U> Nalu<'a, U>
where
    U: Debug + Header,
{
    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        // discard all zeroes until the start code pattern is found
        data.get(offset..)?
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
    }

    /// Find the next Annex B encoded NAL unit and advance `cursor` past it.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> Result<Nalu<'a, U>> {
        let bitstream: &'a [u8] = *cursor.get_ref();
        let pos = usize::try_from(cursor.position())?;

        // Find the start code for this NALU
        let current_nalu_offset = match Self::find_start_code(bitstream, pos) {
            Some(offset) => offset,
            None => return Err(anyhow!("No NAL found")),
        };

        let mut start_code_offset = pos + current_nalu_offset;

        // If the preceding byte is 00, then we actually have a four byte SC,
        // i.e. 00 00 00 01 Where the first 00 is the "zero_byte()"
        if start_code_offset > 0 && bitstream[start_code_offset - 1] == 00 {
            start_code_offset -= 1;
        }

        // The NALU offset is its offset + 3 bytes to skip the start code.
        let nalu_offset = pos + current_nalu_offset + 3;

        // Set the bitstream position to the start of the current NALU
        cursor.set_position(u64::try_from(nalu_offset)?);

        let hdr = U::parse(cursor)?;

        // Find the start of the subsequent NALU.
        let mut next_nalu_offset = match Self::find_start_code(bitstream, nalu_offset) {
            Some(offset) => offset,
            None => cursor.chunk().len(), // Whatever data is left must be part of the current NALU
        };

        while next_nalu_offset > 0 && bitstream[nalu_offset + next_nalu_offset - 1] == 00 {
            // Discard trailing_zero_8bits
            next_nalu_offset -= 1;
        }

        let nal_size = if hdr.is_end() {
            hdr.len()
        } else {
            next_nalu_offset
        };

        if nal_size < hdr.len() {
            return Err(anyhow!("NALU of {} bytes is shorter than its header", nal_size));
        }

        cursor.set_position(u64::try_from(nalu_offset + nal_size)?);

        Ok(Nalu {
            header: hdr,
            data: bitstream,
            size: nal_size,
            offset: nalu_offset,
            sc_offset: start_code_offset,
        })
    }

    /// Wraps a single NAL unit that is not preceded by a start code.
    pub fn from_bytes(data: &'a [u8]) -> Result<Nalu<'a, U>> {
        let hdr = U::parse(&Cursor::new(data))?;
        if data.len() < hdr.len() {
            return Err(anyhow!("NALU of {} bytes is shorter than its header", data.len()));
        }

        Ok(Nalu {
            header: hdr,
            data,
            size: data.len(),
            offset: 0,
            sc_offset: 0,
        })
    }

    /// The NALU bytes following the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.offset + self.header.len()..self.offset + self.size]
    }
}

impl<'a, U> AsRef<[u8]> for Nalu<'a, U> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}
