// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives a synthesized Annex B stream through NALU splitting, header parsing,
//! POC derivation and reference picture marking.

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

use cros_vvc::codec::h266::dpb::Dpb;
use cros_vvc::codec::h266::nalu_writer::NaluWriter;
use cros_vvc::codec::h266::parser::Nalu;
use cros_vvc::codec::h266::parser::NaluType;
use cros_vvc::codec::h266::parser::Parser;
use cros_vvc::codec::h266::parser::SliceType;
use cros_vvc::codec::h266::picture::FrameErrors;
use cros_vvc::codec::h266::picture::PictureData;
use cros_vvc::codec::h266::resolver::PocState;

/// Writes NALUs with start codes and emulation prevention.
struct StreamWriter<'a>(NaluWriter<&'a mut Vec<u8>>);

impl StreamWriter<'_> {
    fn u(&mut self, bits: usize, value: u32) {
        self.0.write_u(bits, value).unwrap();
    }

    fn flag(&mut self, value: bool) {
        self.0.write_u(1, value).unwrap();
    }

    fn flags(&mut self, count: usize) {
        for _ in 0..count {
            self.flag(false);
        }
    }

    fn ue(&mut self, value: u32) {
        self.0.write_ue(value).unwrap();
    }

    fn se(&mut self, value: i32) {
        self.0.write_se(value).unwrap();
    }

    fn nalu(&mut self, type_: NaluType, body: impl FnOnce(&mut Self)) {
        self.0.write_header(0, type_, 1).unwrap();
        body(self);
        self.0.write_trailing_bits().unwrap();
    }

    /// A 64x64 4:2:0 10 bit SPS, with 8 bit POC LSBs and no coding tool.
    fn sps(&mut self) {
        self.nalu(NaluType::SpsNut, |w| {
            w.u(4, 0);
            w.u(4, 0);
            w.u(3, 0);
            w.u(2, 1);
            w.u(2, 0);
            w.flag(true);

            // Main 10, level 3.1.
            w.u(7, 1);
            w.flag(false);
            w.u(8, 51);
            w.flag(true);
            w.flags(2);
            while !w.0.aligned() {
                w.flag(false);
            }
            w.u(8, 0);

            w.flags(2);
            w.ue(64);
            w.ue(64);
            w.flags(2);
            w.ue(2);
            w.flags(2);
            w.u(4, 4);
            w.flag(false);
            w.u(2, 0);
            w.u(2, 0);

            w.ue(4);
            w.ue(0);
            w.ue(0);

            w.ue(0);
            w.flag(false);
            w.ue(0);
            w.ue(0);
            w.flag(false);
            w.ue(0);
            w.ue(0);

            w.flags(3);

            w.flag(false);
            w.flag(true);
            w.se(0);
            w.ue(0);
            w.ue(0);
            w.ue(0);

            // No loop filter tool nor long-term references. The SPS carries no
            // list structure.
            w.flags(7);
            w.flag(true);
            w.ue(0);

            w.flags(7);
            w.ue(0);
            w.flags(5);
            w.ue(0);
            w.flags(13);
            w.flags(4);
        });
    }

    /// A PPS without picture partitioning.
    fn pps(&mut self) {
        self.nalu(NaluType::PpsNut, |w| {
            w.u(6, 0);
            w.u(4, 0);
            w.flag(false);
            w.ue(64);
            w.ue(64);
            w.flags(3);
            w.flag(true);
            w.flag(false);

            w.flag(false);
            w.ue(0);
            w.ue(0);
            w.flags(4);
            w.se(0);
            w.flags(3);
            w.flags(3);
        });
    }

    fn picture_header_fields(&mut self, irap: bool, poc_lsb: u32) {
        self.flag(irap);
        self.flag(false);
        if irap {
            self.flag(false);
        }

        let inter = !irap;
        self.flag(inter);
        if inter {
            self.flag(true);
        }

        self.ue(0);
        self.u(8, poc_lsb);

        if inter {
            // ph_mvd_l1_zero_flag
            self.flag(false);
        }
    }

    /// An IDR picture made of one slice carrying its picture header.
    fn idr(&mut self, poc_lsb: u32) {
        self.nalu(NaluType::IdrNLp, |w| {
            w.flag(true);
            w.picture_header_fields(true, poc_lsb);
            // sh_no_output_of_prior_pics_flag
            w.flag(false);
            w.se(0);
        });
    }

    /// A picture header NALU followed by a P slice whose list 0 holds the
    /// given short-term deltas. Only the first entry is active.
    fn p_picture(&mut self, poc_lsb: u32, deltas: &[i32]) {
        self.nalu(NaluType::PhNut, |w| w.picture_header_fields(false, poc_lsb));

        self.nalu(NaluType::TrailNut, |w| {
            w.flag(false);
            w.ue(SliceType::P as u32);

            w.ue(deltas.len() as u32);
            for delta in deltas {
                w.ue(delta.unsigned_abs() - 1);
                w.flag(*delta < 0);
            }
            // Empty list 1.
            w.ue(0);

            if deltas.len() > 1 {
                // sh_num_ref_idx_active_override_flag
                w.flag(false);
            }

            w.se(0);
        });
    }
}

fn stream() -> Vec<u8> {
    let mut data = vec![];
    {
        let mut w = StreamWriter(NaluWriter::new(&mut data, true));
        w.sps();
        w.pps();
        w.idr(0);
        w.p_picture(1, &[-1]);
        w.p_picture(2, &[-1, -1]);
        w.p_picture(3, &[-2]);
        w.p_picture(4, &[-4]);
    }
    data
}

/// What happened to one picture.
#[derive(Debug, PartialEq)]
struct Decoded {
    poc: i32,
    ref_pic_list0: Vec<Option<i32>>,
    errors: FrameErrors,
    dpb: Vec<i32>,
}

#[test]
fn decode_annexb_stream() {
    let _ = env_logger::builder().is_test(true).try_init();

    let data = stream();
    let mut cursor = Cursor::new(data.as_ref());
    let mut parser = Parser::with_emulation_prevention(true);
    let mut poc_state = PocState::default();
    let mut dpb = Dpb::default();
    dpb.set_max_num_pics(4);

    let mut decoded = vec![];
    let mut num_nalus = 0;

    while let Ok(nalu) = Nalu::next(&mut cursor) {
        num_nalus += 1;

        let nalu_type = nalu.header.type_;
        match nalu_type {
            NaluType::SpsNut => {
                parser.parse_sps(&nalu).unwrap();
            }
            NaluType::PpsNut => {
                parser.parse_pps(&nalu).unwrap();
            }
            NaluType::PhNut => {
                parser.parse_picture_header(&nalu).unwrap();
            }
            type_ if type_.is_vcl() => {
                let slice = parser.parse_slice_header(nalu).unwrap();
                let mut pic = PictureData::new_from_slice(&slice, &mut poc_state).unwrap();

                let lists = dpb.update_ref_pic_marking(&mut pic, &slice.header, type_, None);
                let ref_pic_list0 = lists[0]
                    .iter()
                    .map(|p| p.as_ref().map(|p| p.borrow().pic_order_cnt_val))
                    .collect();

                dpb.remove_disposable();

                let poc = pic.pic_order_cnt_val;
                let errors = pic.errors();
                pic.displayed = true;
                pic.outputted = true;
                dpb.store_picture(Rc::new(RefCell::new(pic))).unwrap();

                decoded.push(Decoded {
                    poc,
                    ref_pic_list0,
                    errors,
                    dpb: dpb.pictures().map(|p| p.pic_order_cnt_val).collect(),
                });
            }
            type_ => panic!("unexpected NALU {:?}", type_),
        }
    }

    assert_eq!(num_nalus, 11);

    let missing = FrameErrors::REFERENCE_FRAME | FrameErrors::MAJOR;
    assert_eq!(
        decoded,
        vec![
            Decoded {
                poc: 0,
                ref_pic_list0: vec![],
                errors: FrameErrors::empty(),
                dpb: vec![0],
            },
            Decoded {
                poc: 1,
                ref_pic_list0: vec![Some(0)],
                errors: FrameErrors::empty(),
                dpb: vec![0, 1],
            },
            Decoded {
                poc: 2,
                ref_pic_list0: vec![Some(1), Some(0)],
                errors: FrameErrors::empty(),
                dpb: vec![0, 1, 2],
            },
            // POC 0 and 2 are dropped.
            Decoded {
                poc: 3,
                ref_pic_list0: vec![Some(1)],
                errors: FrameErrors::empty(),
                dpb: vec![1, 3],
            },
            // POC 0 is gone: the picture is decoded with errors.
            Decoded {
                poc: 4,
                ref_pic_list0: vec![None],
                errors: missing,
                dpb: vec![4],
            },
        ]
    );
}

#[test]
fn slice_before_its_parameter_sets_is_rejected() {
    let mut data = vec![];
    {
        let mut w = StreamWriter(NaluWriter::new(&mut data, true));
        w.idr(0);
        w.sps();
    }

    let mut cursor = Cursor::new(data.as_ref());
    let mut parser = Parser::with_emulation_prevention(true);

    let nalu = Nalu::next(&mut cursor).unwrap();
    assert_eq!(nalu.header.type_, NaluType::IdrNLp);
    let err = parser.parse_slice_header(nalu).unwrap_err();
    assert!(err.is_invalid_stream());

    let nalu = Nalu::next(&mut cursor).unwrap();
    parser.parse_sps(&nalu).unwrap();
    assert!(parser.get_sps(0).is_some());
    assert!(parser.active_sps().is_none());
}
