// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Values of a slice that depend on its picture header or on previously
//! decoded pictures: picture header inheritance and the picture order count.

use crate::codec::h266::parser::invalid_stream;
use crate::codec::h266::parser::NaluHeader;
use crate::codec::h266::parser::ParseError;
use crate::codec::h266::parser::ParseResult;
use crate::codec::h266::parser::PictureHeader;
use crate::codec::h266::parser::Sps;

/// Picks the value that applies to a slice for a syntax element that can be
/// carried by either the picture header or the slice header.
///
/// `info_in_ph` is the PPS flag moving the element to the picture header
/// (e.g. `pps_sao_info_in_ph_flag`), and `sh_signalled` tells whether the
/// slice header actually carried its own value. The picture header value
/// wins unless the element lives in the slice header and was signalled
/// there.
pub fn resolve_field<T: Clone>(
    info_in_ph: bool,
    ph_value: &T,
    sh_signalled: bool,
    sh_value: &T,
) -> T {
    if !info_in_ph && sh_signalled {
        sh_value.clone()
    } else {
        ph_value.clone()
    }
}

/// Equations 196 to 198: PicOrderCntVal of a picture.
///
/// `msb_cycle` is `ph_poc_msb_cycle_val` when present. `prev_tid0_poc` is the
/// PicOrderCntVal of prevTid0Pic, or `None` if the picture starts a new coded
/// layer video sequence, in which case the MSB is reset.
///
/// Fails if the resulting POC does not fit in 32 bits.
pub fn compute_pic_order_cnt(
    pic_order_cnt_lsb: u32,
    max_pic_order_cnt_lsb: u32,
    msb_cycle: Option<u32>,
    prev_tid0_poc: Option<i32>,
) -> ParseResult<i32> {
    let max_lsb = i64::from(max_pic_order_cnt_lsb);
    let lsb = i64::from(pic_order_cnt_lsb);

    let msb = match (msb_cycle, prev_tid0_poc) {
        (Some(cycle), _) => i64::from(cycle) * max_lsb,
        (None, None) => 0,
        (None, Some(prev_poc)) => {
            let prev_poc = i64::from(prev_poc);
            let prev_lsb = prev_poc & (max_lsb - 1);
            let prev_msb = prev_poc - prev_lsb;

            if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
                prev_msb + max_lsb
            } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
                prev_msb - max_lsb
            } else {
                prev_msb
            }
        }
    };

    let poc = msb + lsb;
    i32::try_from(poc).map_err(|_| invalid_stream!("PicOrderCntVal {} is out of range", poc))
}

/// Cross picture state of the picture order count derivation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PocState {
    /// PicOrderCntVal of prevTid0Pic.
    prev_tid0_poc: Option<i32>,
}

impl PocState {
    pub fn prev_tid0_poc(&self) -> Option<i32> {
        self.prev_tid0_poc
    }

    /// Forgets the previous picture, e.g. after an end of sequence NALU. The
    /// next picture is then handled as the first one of a coded layer video
    /// sequence.
    pub fn reset(&mut self) {
        self.prev_tid0_poc = None;
    }

    /// Computes the POC of the picture whose first slice NALU has
    /// `nalu_header` and whose picture header is `ph`, then remembers it if
    /// the picture qualifies as prevTid0Pic for the following ones. The
    /// state is left untouched on error.
    pub fn compute_pic_order_cnt(
        &mut self,
        ph: &PictureHeader,
        sps: &Sps,
        nalu_header: &NaluHeader,
    ) -> ParseResult<i32> {
        let nalu_type = nalu_header.type_;
        let prev = if nalu_type.is_idr() { None } else { self.prev_tid0_poc };

        let msb_cycle = ph.ph_poc_msb_cycle_present_flag.then_some(ph.ph_poc_msb_cycle_val);
        let poc = compute_pic_order_cnt(
            ph.ph_pic_order_cnt_lsb,
            sps.max_pic_order_cnt_lsb(),
            msb_cycle,
            prev,
        )?;

        let valid_for_prev_tid0_pic = nalu_header.temporal_id() == 0
            && !nalu_type.is_rasl()
            && !nalu_type.is_radl()
            && !ph.ph_non_ref_pic_flag;

        if valid_for_prev_tid0_pic {
            self.prev_tid0_poc = Some(poc);
        }

        log::debug!(
            "POC {} (LSB {}, previous {:?}, {:?})",
            poc,
            ph.ph_pic_order_cnt_lsb,
            prev,
            nalu_type
        );

        Ok(poc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h266::parser::DeblockingParams;
    use crate::codec::h266::parser::NaluType;

    fn header(type_: NaluType, tid: u8) -> NaluHeader {
        NaluHeader {
            type_,
            nuh_layer_id: 0,
            nuh_temporal_id_plus1: tid + 1,
        }
    }

    fn ph(lsb: u32) -> PictureHeader {
        PictureHeader {
            ph_pic_order_cnt_lsb: lsb,
            ..Default::default()
        }
    }

    fn poc(state: &mut PocState, sps: &Sps, lsb: u32, type_: NaluType, tid: u8) -> i32 {
        state.compute_pic_order_cnt(&ph(lsb), sps, &header(type_, tid)).unwrap()
    }

    fn sps_with_lsb_bits(log2_max_poc_lsb_minus4: u8) -> Sps {
        Sps {
            sps_log2_max_pic_order_cnt_lsb_minus4: log2_max_poc_lsb_minus4,
            ..Default::default()
        }
    }

    #[test]
    fn field_comes_from_picture_header_when_info_in_ph() {
        assert_eq!(resolve_field(true, &3, true, &7), 3);
        assert_eq!(resolve_field(true, &3, false, &7), 3);
    }

    #[test]
    fn field_comes_from_slice_header_when_signalled() {
        assert_eq!(resolve_field(false, &3, true, &7), 7);
        assert_eq!(resolve_field(false, &3, false, &7), 3);
    }

    #[test]
    fn deblocking_offsets_are_inherited_as_a_whole() {
        let ph = DeblockingParams {
            luma_beta_offset_div2: 2,
            ..Default::default()
        };
        let sh = DeblockingParams {
            deblocking_filter_disabled_flag: true,
            ..Default::default()
        };

        assert_eq!(resolve_field(false, &ph, false, &sh), ph);
        assert_eq!(resolve_field(false, &ph, true, &sh), sh);
    }

    #[test]
    fn poc_wraps_forward() {
        assert_eq!(compute_pic_order_cnt(10, 256, None, Some(250)), Ok(266));
    }

    #[test]
    fn poc_wraps_backward() {
        assert_eq!(compute_pic_order_cnt(250, 256, None, Some(266)), Ok(250));
        assert_eq!(compute_pic_order_cnt(250, 256, None, Some(10)), Ok(-6));
    }

    #[test]
    fn poc_tie_breaks() {
        // Exactly half a period behind: the MSB moves forward.
        assert_eq!(compute_pic_order_cnt(0, 256, None, Some(128)), Ok(256));
        // Exactly half a period ahead: the MSB stays.
        assert_eq!(compute_pic_order_cnt(128, 256, None, Some(0)), Ok(128));
        // One more and it moves back.
        assert_eq!(compute_pic_order_cnt(129, 256, None, Some(0)), Ok(-127));
    }

    #[test]
    fn poc_msb_cycle_overrides_prediction() {
        assert_eq!(compute_pic_order_cnt(10, 256, Some(3), Some(250)), Ok(778));
        assert_eq!(compute_pic_order_cnt(10, 256, Some(2), None), Ok(522));
    }

    #[test]
    fn poc_state_tracks_prev_tid0_pic() {
        let sps = sps_with_lsb_bits(4);
        let mut state = PocState::default();

        assert_eq!(poc(&mut state, &sps, 0, NaluType::IdrNLp, 0), 0);
        assert_eq!(poc(&mut state, &sps, 250, NaluType::TrailNut, 0), -6);
        assert_eq!(state.prev_tid0_poc(), Some(-6));

        // A higher sublayer does not become prevTid0Pic.
        assert_eq!(poc(&mut state, &sps, 10, NaluType::TrailNut, 1), 10);
        assert_eq!(state.prev_tid0_poc(), Some(-6));

        // Neither do RASL pictures.
        assert_eq!(poc(&mut state, &sps, 5, NaluType::RaslNut, 0), 5);
        assert_eq!(state.prev_tid0_poc(), Some(-6));
    }

    #[test]
    fn idr_resets_msb() {
        let sps = sps_with_lsb_bits(4);
        let mut state = PocState::default();

        poc(&mut state, &sps, 200, NaluType::TrailNut, 0);
        poc(&mut state, &sps, 100, NaluType::TrailNut, 0);
        assert_eq!(state.prev_tid0_poc(), Some(100));

        assert_eq!(poc(&mut state, &sps, 250, NaluType::IdrWRadl, 0), 250);
    }

    #[test]
    fn reset_handles_next_picture_as_first() {
        let sps = sps_with_lsb_bits(4);
        let mut state = PocState::default();

        poc(&mut state, &sps, 250, NaluType::TrailNut, 0);
        state.reset();
        assert_eq!(state.prev_tid0_poc(), None);
        assert_eq!(poc(&mut state, &sps, 10, NaluType::CraNut, 0), 10);
    }

    #[test]
    fn poc_out_of_range_is_rejected() {
        let max_lsb = 1 << 16;
        assert_eq!(compute_pic_order_cnt(0, max_lsb, Some(32767), None), Ok(32767 << 16));
        assert!(compute_pic_order_cnt(0, max_lsb, Some(32768), None).is_err());
        assert!(compute_pic_order_cnt(10, max_lsb, Some(u32::MAX >> 16), None).is_err());

        let sps = sps_with_lsb_bits(12);
        let mut state = PocState::default();
        poc(&mut state, &sps, 7, NaluType::TrailNut, 0);

        let far_ph = PictureHeader {
            ph_poc_msb_cycle_present_flag: true,
            ph_poc_msb_cycle_val: 1 << 16,
            ..ph(0)
        };
        let err = state.compute_pic_order_cnt(&far_ph, &sps, &header(NaluType::TrailNut, 0));
        assert!(matches!(err, Err(ParseError::InvalidStream(_))));
        assert_eq!(state.prev_tid0_poc(), Some(7));
    }
}
