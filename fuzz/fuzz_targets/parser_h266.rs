#![no_main]

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

use cros_vvc::codec::h266::dpb::Dpb;
use cros_vvc::codec::h266::parser::Nalu;
use cros_vvc::codec::h266::parser::NaluType;
use cros_vvc::codec::h266::parser::Parser;
use cros_vvc::codec::h266::picture::PictureData;
use cros_vvc::codec::h266::resolver::PocState;
use libfuzzer_sys::fuzz_target;

const MAX_DPB_SIZE: usize = 16;

struct State {
    parser: Parser,
    poc_state: PocState,
    dpb: Dpb<PictureData>,
}

fn process_nalu(state: &mut State, nalu: Nalu) -> anyhow::Result<()> {
    let parser = &mut state.parser;

    let nalu_type = nalu.header.type_;
    match nalu_type {
        NaluType::OpiNut => {
            parser.parse_opi(&nalu)?;
        }
        NaluType::VpsNut => {
            parser.parse_vps(&nalu)?;
        }
        NaluType::SpsNut => {
            parser.parse_sps(&nalu)?;
        }
        NaluType::PpsNut => {
            parser.parse_pps(&nalu)?;
        }
        NaluType::PrefixApsNut | NaluType::SuffixApsNut => {
            parser.parse_aps(&nalu)?;
        }
        NaluType::PhNut => {
            parser.parse_picture_header(&nalu)?;
        }
        NaluType::AudNut => {
            parser.parse_aud(&nalu)?;
        }
        NaluType::EosNut => state.poc_state.reset(),
        type_ if type_.is_vcl() => {
            let slice = parser.parse_slice_header(nalu)?;
            if slice.header.sh_slice_address != 0 {
                return Ok(());
            }

            let sps = &slice.header.pps.sps;
            let vps = parser.get_vps(sps.sps_video_parameter_set_id).cloned();
            let mut pic = PictureData::new_from_slice(&slice, &mut state.poc_state)?;

            let _ = state.dpb.update_ref_pic_marking(
                &mut pic,
                &slice.header,
                type_,
                vps.as_deref(),
            );

            pic.displayed = true;
            pic.outputted = true;
            state.dpb.remove_disposable();
            if state.dpb.store_picture(Rc::new(RefCell::new(pic))).is_err() {
                state.dpb.mark_all_as_unused_for_ref();
                state.dpb.clear();
            }
        }
        _ => (),
    }

    Ok(())
}

fuzz_target!(|data: &[u8]| {
    let mut state = State {
        parser: Parser::with_emulation_prevention(true),
        poc_state: Default::default(),
        dpb: Default::default(),
    };
    state.dpb.set_max_num_pics(MAX_DPB_SIZE);

    let mut cursor = Cursor::new(data);
    while let Ok(nalu) = Nalu::next(&mut cursor) {
        let _ = process_nalu(&mut state, nalu);
    }
});
