// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use thiserror::Error;

use crate::codec::h266::parser::NaluType;
use crate::codec::h266::parser::SliceHeader;
use crate::codec::h266::parser::Vps;
use crate::codec::h266::picture::FrameErrors;
use crate::codec::h266::picture::Reference;
use crate::codec::h266::picture::ReferenceFrame;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpbError {
    #[error("DPB is full")]
    DpbIsFull,
}

/// A reference picture list resolved against the DPB. `None` stands for an
/// entry that matched no picture.
pub type RefPicList<F> = Vec<Option<Rc<RefCell<F>>>>;

/// The decoded picture buffer. `F` is the caller's frame type, which keeps
/// whatever storage it needs next to the reference state.
pub struct Dpb<F> {
    /// Pictures held by the DPB.
    entries: Vec<Rc<RefCell<F>>>,
    /// The maximum number of pictures that can be stored.
    max_num_pics: usize,
}

impl<F: ReferenceFrame> Dpb<F> {
    /// Returns an iterator over the pictures stored in the DPB.
    pub fn pictures(&self) -> impl Iterator<Item = Ref<'_, F>> {
        self.entries.iter().map(|p| p.borrow())
    }

    /// Returns a mutable iterator over the pictures stored in the DPB.
    pub fn pictures_mut(&mut self) -> impl Iterator<Item = RefMut<'_, F>> {
        self.entries.iter().map(|p| p.borrow_mut())
    }

    /// Returns the length of the DPB.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the whole DPB entries.
    pub fn entries(&self) -> &Vec<Rc<RefCell<F>>> {
        &self.entries
    }

    /// Set the dpb's max num pics.
    pub fn set_max_num_pics(&mut self, max_num_pics: usize) {
        self.max_num_pics = max_num_pics;
    }

    /// Get a reference to the dpb's max num pics.
    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// Mark all pictures in the DPB as unused for reference.
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for mut picture in self.pictures_mut() {
            picture.mark(Reference::None);
            picture.set_referenced(false);
        }
    }

    fn find(&self, pred: impl Fn(&F) -> bool) -> Option<Rc<RefCell<F>>> {
        self.entries.iter().find(|p| pred(&p.borrow())).cloned()
    }

    /// Finds a picture of layer `layer_id` marked as used for reference with
    /// the given POC.
    pub fn find_ref_by_poc(&self, poc: i32, layer_id: u8) -> Option<Rc<RefCell<F>>> {
        self.find(|p| p.is_ref() && p.layer_id() == layer_id && p.pic_order_cnt() == poc)
    }

    /// Finds a picture of layer `layer_id` marked as used for short term
    /// reference with the given POC.
    pub fn find_short_term_ref_by_poc(&self, poc: i32, layer_id: u8) -> Option<Rc<RefCell<F>>> {
        self.find(|p| {
            p.is_short_term_ref() && p.layer_id() == layer_id && p.pic_order_cnt() == poc
        })
    }

    /// Finds a picture of layer `layer_id` marked as used for reference whose
    /// POC LSBs are `poc_lsb`.
    pub fn find_ref_by_poc_lsb(
        &self,
        poc_lsb: i32,
        max_pic_order_cnt_lsb: u32,
        layer_id: u8,
    ) -> Option<Rc<RefCell<F>>> {
        let mask = max_pic_order_cnt_lsb as i32 - 1;
        self.find(|p| {
            p.is_ref() && p.layer_id() == layer_id && (p.pic_order_cnt() & mask) == poc_lsb
        })
    }

    /// Drops all the pictures. The capacity is kept.
    pub fn clear(&mut self) {
        log::debug!("Clearing the DPB");
        self.entries.clear();
    }

    /// Removes the pictures that are neither referenced nor waiting to be
    /// output.
    pub fn remove_disposable(&mut self) {
        self.entries.retain(|p| !p.borrow().is_disposable());
    }

    /// Stores a decoded picture. As per 8.3.2 the current picture is marked
    /// as used for short-term reference once decoded.
    pub fn store_picture(&mut self, picture: Rc<RefCell<F>>) -> Result<(), DpbError> {
        if self.entries.len() >= self.max_num_pics {
            return Err(DpbError::DpbIsFull);
        }

        {
            let mut pic = picture.borrow_mut();
            pic.mark(Reference::ShortTerm);
            pic.set_referenced(true);

            log::debug!("Stored picture with POC {} in the DPB", pic.pic_order_cnt());
        }

        self.entries.push(picture);
        Ok(())
    }

    /// Resolves the reference picture lists of the slice with header `hdr`
    /// against the pictures in the DPB (8.3.2). `current` is the picture
    /// being decoded and must not be in the DPB yet.
    ///
    /// Pictures referred to by a long-term entry are marked as used for
    /// long-term reference, which may promote short-term ones. Entries that
    /// match no picture are left as `None`. If such an entry is active,
    /// `current` is flagged as erroneous.
    pub fn build_ref_pic_lists(
        &self,
        current: &mut F,
        hdr: &SliceHeader,
        vps: Option<&Vps>,
    ) -> [RefPicList<F>; 2] {
        let rpls = &hdr.ref_pic_lists;
        let max_lsb = hdr.pps.sps.max_pic_order_cnt_lsb();
        let cur_poc = current.pic_order_cnt();
        let layer_id = current.layer_id();

        let mut lists: [RefPicList<F>; 2] = Default::default();

        // Long-term entries first, so that a promoted picture can no longer
        // be picked by a short-term entry.
        for (i, list) in lists.iter_mut().enumerate() {
            let rpl = &rpls.rpl[i];
            list.resize(rpls.num_ref_entries(i), None);

            let mut lt_idx = 0;
            for (j, slot) in list.iter_mut().enumerate() {
                if rpl.inter_layer_ref_pic_flag[j] || rpl.st_ref_pic_flag[j] {
                    continue;
                }

                let poc_lsb = (rpls.poc_lsb_lt_val[i][lt_idx] & (max_lsb - 1)) as i32;
                *slot = if rpls.delta_poc_msb_cycle_present_flag[i][lt_idx] {
                    let msb_cycle = i64::from(rpls.delta_poc_msb_cycle_lt_val[i][lt_idx]);
                    let cur_poc = i64::from(cur_poc);
                    let max_lsb = i64::from(max_lsb);
                    let poc_msb = cur_poc - msb_cycle * max_lsb - (cur_poc & (max_lsb - 1));
                    let poc = poc_msb + i64::from(poc_lsb);

                    i32::try_from(poc).ok().and_then(|poc| self.find_ref_by_poc(poc, layer_id))
                } else {
                    self.find_ref_by_poc_lsb(poc_lsb, max_lsb, layer_id)
                };

                if let Some(pic) = slot {
                    let mut pic = pic.borrow_mut();
                    if !pic.is_long_term_ref() {
                        pic.mark(Reference::LongTerm);
                    }
                }

                log::trace!("RefPicList{}[{}]: long-term, POC LSB {}", i, j, poc_lsb);
                lt_idx += 1;
            }
        }

        for (i, list) in lists.iter_mut().enumerate() {
            let rpl = &rpls.rpl[i];
            let mut poc_base = cur_poc;

            for (j, slot) in list.iter_mut().enumerate() {
                if rpl.inter_layer_ref_pic_flag[j] {
                    let ref_layer_id = vps.and_then(|vps| {
                        vps.inter_layer_ref_layer_id(layer_id, usize::from(rpl.ilrp_idx[j]))
                    });

                    *slot = ref_layer_id.and_then(|ref_layer_id| {
                        self.find_ref_by_poc(cur_poc, ref_layer_id)
                    });

                    log::trace!("RefPicList{}[{}]: inter-layer, layer {:?}", i, j, ref_layer_id);
                } else if rpl.st_ref_pic_flag[j] {
                    poc_base = poc_base.wrapping_add(rpl.delta_poc_val_st[j]);
                    *slot = self.find_short_term_ref_by_poc(poc_base, layer_id);

                    log::trace!("RefPicList{}[{}]: short-term, POC {}", i, j, poc_base);
                }
            }

            let num_active = usize::from(hdr.num_ref_idx_active[i]);
            for (j, _) in list.iter().enumerate().filter(|(_, slot)| slot.is_none()) {
                if j < num_active {
                    log::warn!(
                        "Missing reference picture for RefPicList{}[{}] of POC {}",
                        i,
                        j,
                        cur_poc
                    );
                    current.add_errors(FrameErrors::REFERENCE_FRAME | FrameErrors::MAJOR);
                } else {
                    log::trace!("Inactive entry RefPicList{}[{}] has no picture", i, j);
                }
            }
        }

        lists
    }

    /// Resolves the reference picture lists of a picture and updates the
    /// marking of the pictures in the DPB accordingly (8.3.2). Must be called
    /// once per picture, with the header of its first slice.
    ///
    /// An IDR picture that does not mix NALU types marks every picture as
    /// unused for reference. Otherwise, the pictures of the current layer
    /// that no list entry refers to are marked as unused for reference,
    /// except those sharing the current POC.
    pub fn update_ref_pic_marking(
        &mut self,
        current: &mut F,
        hdr: &SliceHeader,
        nalu_type: NaluType,
        vps: Option<&Vps>,
    ) -> [RefPicList<F>; 2] {
        if nalu_type.is_idr() && !hdr.pps.pps_mixed_nalu_types_in_pic_flag {
            log::debug!("IDR picture, marking all pictures as unused for reference");

            for mut pic in self.pictures_mut() {
                pic.mark(Reference::None);
                pic.set_referenced(false);
                pic.set_frame_before_idr(true);
            }
        }

        let lists = self.build_ref_pic_lists(current, hdr, vps);

        let cur_poc = current.pic_order_cnt();
        let layer_id = current.layer_id();

        for pic in &self.entries {
            let in_lists = lists.iter().flatten().flatten().any(|r| Rc::ptr_eq(r, pic));
            if in_lists {
                continue;
            }

            let mut pic = pic.borrow_mut();
            if pic.layer_id() != layer_id || pic.pic_order_cnt() == cur_poc {
                continue;
            }

            if pic.is_ref() {
                log::debug!("POC {} is no longer used for reference", pic.pic_order_cnt());
                pic.mark(Reference::None);
            }
            pic.set_referenced(false);
        }

        lists
    }
}

impl<F> Default for Dpb<F> {
    fn default() -> Self {
        // See https://github.com/rust-lang/rust/issues/26925 on why this can't
        // be derived.
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
        }
    }
}

impl<F: ReferenceFrame> std::fmt::Debug for Dpb<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|p| {
                let p = p.borrow();
                (p.pic_order_cnt(), p.layer_id(), p.reference())
            })
            .collect::<Vec<_>>();

        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h266::parser::RefPicLists;
    use crate::codec::h266::picture::PictureData;

    fn picture(poc: i32) -> PictureData {
        let mut pic = PictureData::default();
        pic.pic_order_cnt_val = poc;
        pic
    }

    /// A DPB holding short-term references with the given POCs.
    fn dpb_with(pocs: &[i32]) -> Dpb<PictureData> {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(8);
        for poc in pocs {
            dpb.store_picture(Rc::new(RefCell::new(picture(*poc)))).unwrap();
        }
        dpb
    }

    /// A header whose list 0 has the given short-term deltas, all active.
    fn header_with_deltas(deltas: &[i32]) -> SliceHeader {
        let mut rpls = RefPicLists::default();
        rpls.rpl[0].num_ref_entries = deltas.len() as u8;
        for (i, delta) in deltas.iter().enumerate() {
            rpls.rpl[0].st_ref_pic_flag[i] = true;
            rpls.rpl[0].delta_poc_val_st[i] = *delta;
        }

        SliceHeader {
            ref_pic_lists: rpls,
            num_ref_idx_active: [deltas.len() as u8, 0],
            ..Default::default()
        }
    }

    /// A header whose list 0 has a single long-term entry.
    fn header_with_long_term(poc_lsb: u32, msb_cycle: Option<u32>) -> SliceHeader {
        let mut rpls = RefPicLists::default();
        rpls.rpl[0].num_ref_entries = 1;
        rpls.rpl[0].num_ltrp_entries = 1;
        rpls.poc_lsb_lt_val[0][0] = poc_lsb;
        if let Some(cycle) = msb_cycle {
            rpls.delta_poc_msb_cycle_present_flag[0][0] = true;
            rpls.delta_poc_msb_cycle_lt_val[0][0] = cycle;
        }

        SliceHeader {
            ref_pic_lists: rpls,
            num_ref_idx_active: [1, 0],
            ..Default::default()
        }
    }

    fn pocs(list: &RefPicList<PictureData>) -> Vec<Option<i32>> {
        list.iter().map(|p| p.as_ref().map(|p| p.borrow().pic_order_cnt_val)).collect()
    }

    #[test]
    fn store_picture_respects_capacity() {
        let mut dpb = dpb_with(&[]);
        dpb.set_max_num_pics(1);

        dpb.store_picture(Rc::new(RefCell::new(picture(0)))).unwrap();
        assert!(dpb.pictures().all(|p| p.is_short_term_ref() && p.is_referenced()));
        assert_eq!(
            dpb.store_picture(Rc::new(RefCell::new(picture(1)))),
            Err(DpbError::DpbIsFull)
        );
        assert_eq!(dpb.len(), 1);
    }

    #[test]
    fn idr_flushes_all_references() {
        let mut dpb = dpb_with(&[0, 1, 2]);
        let mut current = picture(0);

        let hdr = SliceHeader::default();
        let lists = dpb.update_ref_pic_marking(&mut current, &hdr, NaluType::IdrNLp, None);

        assert!(lists.iter().all(Vec::is_empty));
        assert_eq!(dpb.len(), 3);
        for pic in dpb.pictures() {
            assert!(!pic.is_short_term_ref());
            assert!(!pic.is_long_term_ref());
            assert!(!pic.is_referenced());
            assert!(pic.frame_before_idr());
            assert_eq!(pic.ref_count(), 0);
        }
        assert!(current.errors().is_empty());
    }

    #[test]
    fn idr_with_mixed_nalu_types_does_not_flush() {
        let mut dpb = dpb_with(&[3]);
        let mut current = picture(4);
        let mut hdr = header_with_deltas(&[-1]);
        let mut pps = (*hdr.pps).clone();
        pps.pps_mixed_nalu_types_in_pic_flag = true;
        hdr.pps = Rc::new(pps);

        let lists = dpb.update_ref_pic_marking(&mut current, &hdr, NaluType::IdrWRadl, None);

        assert_eq!(pocs(&lists[0]), vec![Some(3)]);
        assert!(dpb.pictures().all(|p| p.is_short_term_ref() && !p.frame_before_idr()));
    }

    #[test]
    fn short_term_deltas_are_cumulative() {
        let mut dpb = dpb_with(&[0, 4, 6]);
        let mut current = picture(8);

        let lists = dpb.update_ref_pic_marking(
            &mut current,
            &header_with_deltas(&[-2, -2]),
            NaluType::TrailNut,
            None,
        );

        assert_eq!(pocs(&lists[0]), vec![Some(6), Some(4)]);
        assert!(current.errors().is_empty());

        // POC 0 is not referred to anymore.
        let unused: Vec<_> =
            dpb.pictures().filter(|p| !p.is_ref()).map(|p| p.pic_order_cnt()).collect();
        assert_eq!(unused, vec![0]);
    }

    #[test]
    fn missing_reference_degrades_picture() {
        let mut dpb = dpb_with(&[0]);
        let mut current = picture(2);

        let lists = dpb.update_ref_pic_marking(
            &mut current,
            &header_with_deltas(&[-1]),
            NaluType::TrailNut,
            None,
        );

        assert_eq!(pocs(&lists[0]), vec![None]);
        assert_eq!(current.errors(), FrameErrors::REFERENCE_FRAME | FrameErrors::MAJOR);
    }

    #[test]
    fn missing_inactive_reference_is_tolerated() {
        let dpb = dpb_with(&[1]);
        let mut current = picture(2);
        let mut hdr = header_with_deltas(&[-1, -5]);
        hdr.num_ref_idx_active[0] = 1;

        let lists = dpb.build_ref_pic_lists(&mut current, &hdr, None);

        assert_eq!(pocs(&lists[0]), vec![Some(1), None]);
        assert!(current.errors().is_empty());
    }

    #[test]
    fn long_term_entry_promotes_short_term_picture() {
        // MaxPicOrderCntLsb is 16 with a default SPS.
        let mut dpb = dpb_with(&[0, 19]);
        let mut current = picture(20);

        let lists = dpb.update_ref_pic_marking(
            &mut current,
            &header_with_long_term(3, None),
            NaluType::TrailNut,
            None,
        );

        assert_eq!(pocs(&lists[0]), vec![Some(19)]);
        let promoted = lists[0][0].as_ref().unwrap().borrow();
        assert!(promoted.is_long_term_ref());
        assert_eq!(promoted.ref_count(), 1);
        drop(promoted);

        let first = dpb.entries()[0].borrow();
        assert!(!first.is_ref());
        assert_eq!(first.ref_count(), 0);
    }

    #[test]
    fn long_term_entry_with_msb_cycle_matches_full_poc() {
        let dpb = dpb_with(&[3, 19]);
        let mut current = picture(36);

        let lists = dpb.build_ref_pic_lists(&mut current, &header_with_long_term(3, Some(1)), None);
        assert_eq!(pocs(&lists[0]), vec![Some(19)]);

        let lists = dpb.build_ref_pic_lists(&mut current, &header_with_long_term(3, Some(2)), None);
        assert_eq!(pocs(&lists[0]), vec![Some(3)]);
        assert!(current.errors().is_empty());
    }

    #[test]
    fn long_term_candidate_must_be_referenced() {
        let mut dpb = dpb_with(&[3]);
        dpb.mark_all_as_unused_for_ref();
        let mut current = picture(4);

        let lists = dpb.build_ref_pic_lists(&mut current, &header_with_long_term(3, None), None);

        assert_eq!(pocs(&lists[0]), vec![None]);
        assert!(current.errors().contains(FrameErrors::REFERENCE_FRAME));
    }

    #[test]
    fn marking_spares_other_layers_and_current_poc() {
        let mut dpb = dpb_with(&[0]);
        let mut other_layer = picture(0);
        other_layer.nuh_layer_id = 1;
        dpb.store_picture(Rc::new(RefCell::new(other_layer))).unwrap();
        let same_poc = picture(5);
        dpb.store_picture(Rc::new(RefCell::new(same_poc))).unwrap();

        let mut current = picture(5);
        let hdr = header_with_deltas(&[]);
        dpb.update_ref_pic_marking(&mut current, &hdr, NaluType::TrailNut, None);

        let marks: Vec<_> = dpb.pictures().map(|p| p.is_ref()).collect();
        assert_eq!(marks, vec![false, true, true]);
    }

    #[test]
    fn reference_counts_stay_balanced() {
        let mut dpb = dpb_with(&[0, 1]);

        // Promote POC 0 to long-term, drop POC 1.
        let mut current = picture(2);
        dpb.update_ref_pic_marking(
            &mut current,
            &header_with_long_term(0, None),
            NaluType::TrailNut,
            None,
        );
        let counts: Vec<_> = dpb.pictures().map(|p| p.ref_count()).collect();
        assert_eq!(counts, vec![1, 0]);

        // Marking twice does not take another reference.
        dpb.update_ref_pic_marking(
            &mut current,
            &header_with_long_term(0, None),
            NaluType::TrailNut,
            None,
        );
        let counts: Vec<_> = dpb.pictures().map(|p| p.ref_count()).collect();
        assert_eq!(counts, vec![1, 0]);

        let hdr = SliceHeader::default();
        dpb.update_ref_pic_marking(&mut current, &hdr, NaluType::IdrNLp, None);
        assert!(dpb.pictures().all(|p| p.ref_count() == 0));
    }

    #[test]
    fn disposable_pictures_are_removed() {
        let mut dpb = dpb_with(&[0, 1]);
        dpb.mark_all_as_unused_for_ref();

        {
            let mut first = dpb.entries()[0].borrow_mut();
            first.displayed = true;
            first.outputted = true;
        }

        dpb.remove_disposable();
        let remaining: Vec<_> = dpb.pictures().map(|p| p.pic_order_cnt()).collect();
        assert_eq!(remaining, vec![1]);

        dpb.clear();
        assert!(dpb.is_empty());
        assert_eq!(dpb.max_num_pics(), 8);
    }
}
