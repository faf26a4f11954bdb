// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bitflags::bitflags;

use crate::codec::h266::parser::NaluType;
use crate::codec::h266::parser::ParseResult;
use crate::codec::h266::parser::Slice;
use crate::codec::h266::resolver::PocState;

bitflags! {
    /// Defects found while setting a picture up for decoding. A picture
    /// carrying any of them can still be completed and output, but its
    /// content is likely corrupted.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FrameErrors: u32 {
        /// A reference picture could not be found in the DPB.
        const REFERENCE_FRAME = 1 << 0;
        /// The picture will not be decoded correctly.
        const MAJOR = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// What reference picture list construction and reference marking need to
/// know about, and do to, a picture. Frame storage is left to the
/// implementor.
pub trait ReferenceFrame {
    /// PicOrderCntVal.
    fn pic_order_cnt(&self) -> i32;
    /// nuh_layer_id of the picture.
    fn layer_id(&self) -> u8;
    fn reference(&self) -> Reference;
    /// Sets the marking without touching the reference count. Use
    /// [`ReferenceFrame::mark`] instead.
    fn set_reference(&mut self, reference: Reference);
    fn is_referenced(&self) -> bool;
    fn set_referenced(&mut self, referenced: bool);
    fn inc_ref_count(&mut self);
    fn dec_ref_count(&mut self);
    /// Records that the picture preceded an IDR picture in decoding order.
    fn set_frame_before_idr(&mut self, before_idr: bool);
    fn add_errors(&mut self, errors: FrameErrors);
    /// Whether the picture can leave the DPB.
    fn is_disposable(&self) -> bool;

    fn is_short_term_ref(&self) -> bool {
        self.reference() == Reference::ShortTerm
    }

    fn is_long_term_ref(&self) -> bool {
        self.reference() == Reference::LongTerm
    }

    /// Whether the picture is marked as used for short or long term
    /// reference.
    fn is_ref(&self) -> bool {
        self.reference() != Reference::None
    }

    /// Changes the marking of the picture. The reference count is taken when
    /// the picture becomes a short or long term reference, and released when
    /// it stops being one.
    fn mark(&mut self, reference: Reference) {
        let was_ref = self.is_ref();
        self.set_reference(reference);

        match (was_ref, self.is_ref()) {
            (false, true) => self.inc_ref_count(),
            (true, false) => self.dec_ref_count(),
            _ => (),
        }
    }
}

/// Data associated with an h.266 picture. Most fields are extracted from the
/// first slice of the picture and kept for reference management.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PictureData {
    pub nalu_type: NaluType,
    pub nuh_layer_id: u8,
    pub pic_order_cnt_lsb: u32,
    pub pic_order_cnt_val: i32,
    /// ph_non_ref_pic_flag.
    pub non_ref_pic: bool,
    pub pic_output_flag: bool,
    pub no_output_of_prior_pics_flag: bool,

    // Internal state.
    reference: Reference,
    referenced: bool,
    ref_count: u32,
    frame_before_idr: bool,
    errors: FrameErrors,
    /// Set by the owner once the picture has been handed out for display.
    pub displayed: bool,
    /// Set by the owner once the picture has been output.
    pub outputted: bool,
}

impl PictureData {
    /// Instantiates a new `PictureData` from the first slice of a picture.
    ///
    /// This runs the picture order count process (clause 8.3.1) and thus
    /// updates `poc_state`: it must be called exactly once per picture. Fails
    /// if the picture order count cannot be represented.
    pub fn new_from_slice(slice: &Slice, poc_state: &mut PocState) -> ParseResult<Self> {
        let hdr = &slice.header;
        let ph = &hdr.picture_header;
        let nalu_header = &slice.nalu.header;

        let pic_order_cnt_val = poc_state.compute_pic_order_cnt(ph, &hdr.pps.sps, nalu_header)?;

        Ok(Self {
            nalu_type: nalu_header.type_,
            nuh_layer_id: nalu_header.nuh_layer_id,
            pic_order_cnt_lsb: ph.ph_pic_order_cnt_lsb,
            pic_order_cnt_val,
            non_ref_pic: ph.ph_non_ref_pic_flag,
            pic_output_flag: ph.ph_pic_output_flag,
            no_output_of_prior_pics_flag: hdr.sh_no_output_of_prior_pics_flag,
            ..Default::default()
        })
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn frame_before_idr(&self) -> bool {
        self.frame_before_idr
    }

    pub fn errors(&self) -> FrameErrors {
        self.errors
    }
}

impl ReferenceFrame for PictureData {
    fn pic_order_cnt(&self) -> i32 {
        self.pic_order_cnt_val
    }

    fn layer_id(&self) -> u8 {
        self.nuh_layer_id
    }

    fn reference(&self) -> Reference {
        self.reference
    }

    fn set_reference(&mut self, reference: Reference) {
        log::debug!(
            "Set reference of POC {} (layer {}) to {:?}",
            self.pic_order_cnt_val,
            self.nuh_layer_id,
            reference
        );

        self.reference = reference;
    }

    fn is_referenced(&self) -> bool {
        self.referenced
    }

    fn set_referenced(&mut self, referenced: bool) {
        self.referenced = referenced;
    }

    fn inc_ref_count(&mut self) {
        self.ref_count += 1;
    }

    fn dec_ref_count(&mut self) {
        match self.ref_count.checked_sub(1) {
            Some(count) => self.ref_count = count,
            None => log::warn!(
                "Reference count of POC {} released more often than taken",
                self.pic_order_cnt_val
            ),
        }
    }

    fn set_frame_before_idr(&mut self, before_idr: bool) {
        self.frame_before_idr = before_idr;
    }

    fn add_errors(&mut self, errors: FrameErrors) {
        self.errors |= errors;
    }

    fn is_disposable(&self) -> bool {
        self.ref_count == 0 && self.displayed && self.outputted && !self.is_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picture(poc: i32) -> PictureData {
        PictureData {
            pic_order_cnt_val: poc,
            ..Default::default()
        }
    }

    #[test]
    fn marking_takes_one_reference() {
        let mut pic = picture(4);

        pic.mark(Reference::ShortTerm);
        assert!(pic.is_short_term_ref());
        assert_eq!(pic.ref_count(), 1);

        // Promotion keeps the picture referenced: no new reference is taken.
        pic.mark(Reference::LongTerm);
        assert!(pic.is_long_term_ref());
        assert!(!pic.is_short_term_ref());
        assert_eq!(pic.ref_count(), 1);

        pic.mark(Reference::None);
        assert!(!pic.is_ref());
        assert_eq!(pic.ref_count(), 0);

        // Unmarking twice does not release twice.
        pic.mark(Reference::None);
        assert_eq!(pic.ref_count(), 0);
    }

    #[test]
    fn disposable_once_released_and_output() {
        let mut pic = picture(0);
        pic.mark(Reference::ShortTerm);
        pic.displayed = true;
        pic.outputted = true;
        assert!(!pic.is_disposable());

        pic.mark(Reference::None);
        assert!(pic.is_disposable());

        pic.inc_ref_count();
        assert!(!pic.is_disposable());
        pic.dec_ref_count();

        pic.outputted = false;
        assert!(!pic.is_disposable());
    }

    #[test]
    fn errors_accumulate() {
        let mut pic = picture(0);
        pic.add_errors(FrameErrors::REFERENCE_FRAME);
        pic.add_errors(FrameErrors::MAJOR);
        assert_eq!(pic.errors(), FrameErrors::REFERENCE_FRAME | FrameErrors::MAJOR);
    }
}
