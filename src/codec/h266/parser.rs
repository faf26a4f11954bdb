// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An H.266 (VVC) header parser. Decodes parameter sets, picture headers and
//! slice headers into plain structures, enforcing the range and consistency
//! constraints of the syntax.

use std::io::Cursor;
use std::rc::Rc;

use anyhow::anyhow;
use bytes::Buf;
use enumn::N;
use thiserror::Error;

use crate::bitstream_utils::BitReader;
use crate::bitstream_utils::ReadBitsError;
use crate::codec::h266::resolver::resolve_field;
use crate::codec::h266::scaling_list::ScanTables;
use crate::codec::h266::store::ParameterSetStore;
use crate::codec::h266::store::StoreError;
use crate::codec::h266::tiles;
use crate::codec::h266::tiles::PartitionError;
use crate::codec::h266::tiles::RectSliceSyntax;
use crate::codec::h266::tiles::SliceMap;
use crate::codec::h266::tiles::SubpicRect;
use crate::codec::h266::tiles::TileLayout;
use crate::utils::nalu;
use crate::utils::nalu::Header;

pub use crate::codec::h266::scaling_list::ScalingListData;

pub const MAX_VPS_COUNT: usize = 16;
pub const MAX_SPS_COUNT: usize = 16;
pub const MAX_PPS_COUNT: usize = 64;
pub const MAX_APS_COUNT: usize = 32;
pub const MAX_OPI_COUNT: usize = 1;

/// Maximum number of temporal sublayers.
pub const MAX_SUB_LAYERS: usize = 7;
/// Maximum number of layers a VPS can describe.
pub const MAX_LAYERS: usize = 64;
/// MaxDpbSize for the highest level.
pub const MAX_DPB_SIZE: usize = 16;
/// Upper bound for num_ref_entries.
pub const MAX_NUM_REF_ENTRIES: usize = MAX_DPB_SIZE + 13;
pub const MAX_NUM_REF_PIC_LISTS: usize = 64;
/// Upper bound for the number of subpictures (MaxSlicesPerAu of the highest
/// level).
pub const MAX_SUBPICS: usize = 600;
pub const MAX_SLICES_PER_PIC: usize = 600;
pub const NUM_ALF_FILTERS: usize = 25;
const MAX_VUI_PAYLOAD_SIZE: u32 = 1024;
const MAX_CPB_CNT: u32 = 32;

macro_rules! invalid_stream {
    ($($arg:tt)*) => {
        ParseError::InvalidStream(format!($($arg)*))
    };
}

pub(crate) use invalid_stream;

/// Errors raised while decoding a syntax structure. The NAL unit being parsed
/// must be dropped when any of them is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid stream: {0}")]
    InvalidStream(String),
    #[error(transparent)]
    BitReader(#[from] ReadBitsError),
    #[error("{kind} {id} has not been received")]
    MissingParameterSet { kind: &'static str, id: u32 },
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ParseError {
    /// Whether the error means the bitstream itself is corrupt or
    /// inconsistent, as opposed to using a feature this parser does not
    /// handle.
    pub fn is_invalid_stream(&self) -> bool {
        !matches!(self, ParseError::Unsupported(_))
    }
}

impl From<PartitionError> for ParseError {
    fn from(err: PartitionError) -> Self {
        ParseError::InvalidStream(err.to_string())
    }
}

impl From<StoreError> for ParseError {
    fn from(err: StoreError) -> Self {
        ParseError::InvalidStream(err.to_string())
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Ceil(Log2(x)) as used for the length of u(v) elements.
pub(crate) fn ceil_log2(x: u32) -> usize {
    if x <= 1 {
        0
    } else {
        (32 - (x - 1).leading_zeros()) as usize
    }
}

/// See table 5 of the H.266 specification.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailNut = 0,
    StsaNut = 1,
    RadlNut = 2,
    RaslNut = 3,
    RsvVcl4 = 4,
    RsvVcl5 = 5,
    RsvVcl6 = 6,
    IdrWRadl = 7,
    IdrNLp = 8,
    CraNut = 9,
    GdrNut = 10,
    RsvIrap11 = 11,
    OpiNut = 12,
    DciNut = 13,
    VpsNut = 14,
    SpsNut = 15,
    PpsNut = 16,
    PrefixApsNut = 17,
    SuffixApsNut = 18,
    PhNut = 19,
    AudNut = 20,
    EosNut = 21,
    EobNut = 22,
    PrefixSeiNut = 23,
    SuffixSeiNut = 24,
    FdNut = 25,
    RsvNvcl26 = 26,
    RsvNvcl27 = 27,
    Unspec28 = 28,
    Unspec29 = 29,
    Unspec30 = 30,
    Unspec31 = 31,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is an IRAP NALU.
    pub fn is_irap(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::IdrWRadl as u32 && type_ <= Self::RsvIrap11 as u32
    }

    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    pub fn is_gdr(&self) -> bool {
        matches!(self, Self::GdrNut)
    }

    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlNut)
    }

    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslNut)
    }

    /// Whether this NALU carries coded slice data.
    pub fn is_vcl(&self) -> bool {
        (*self as u32) <= Self::RsvIrap11 as u32
    }

    /// Whether a picture made of this NALU type may start a coded layer video
    /// sequence.
    pub fn is_irap_or_gdr(&self) -> bool {
        self.is_irap() || self.is_gdr()
    }
}

/// The two-byte NAL unit header of clause 7.3.1.2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    /// The NALU type.
    pub type_: NaluType,
    /// Specifies the identifier of the layer to which a VCL NAL unit belongs
    /// or the identifier of a layer to which a non-VCL NAL unit applies.
    pub nuh_layer_id: u8,
    /// Minus 1 specifies a temporal identifier for the NAL unit. The value of
    /// nuh_temporal_id_plus1 shall not be equal to 0.
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    /// TemporalId of the NALU.
    pub fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1.saturating_sub(1)
    }
}

impl Header for NaluHeader {
    fn parse<T: AsRef<[u8]>>(cursor: &Cursor<T>) -> anyhow::Result<Self> {
        let data = cursor.chunk();
        if data.len() < 2 {
            return Err(anyhow!("Broken Data"));
        }

        let mut r = bitreader::BitReader::new(&data[0..2]);

        if r.read_bool()? {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        if r.read_bool()? {
            log::warn!("nuh_reserved_zero_bit is set, ignoring");
        }

        let nuh_layer_id = r.read_u8(6)?;
        if nuh_layer_id > 55 {
            return Err(anyhow!("Invalid nuh_layer_id {}", nuh_layer_id));
        }

        let type_ = NaluType::n(r.read_u8(5)?).ok_or(anyhow!("Invalid NALU type"))?;
        let nuh_temporal_id_plus1 = r.read_u8(3)?;
        if nuh_temporal_id_plus1 == 0 {
            return Err(anyhow!("nuh_temporal_id_plus1 is 0"));
        }

        if type_.is_irap() && nuh_temporal_id_plus1 != 1 {
            return Err(anyhow!(
                "IRAP NALU {:?} with TemporalId {}",
                type_,
                nuh_temporal_id_plus1 - 1
            ));
        }

        Ok(Self {
            type_,
            nuh_layer_id,
            nuh_temporal_id_plus1,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::EosNut | NaluType::EobNut)
    }

    fn len(&self) -> usize {
        // 7.3.1.2
        2
    }
}

pub type Nalu<'a> = nalu::Nalu<'a, NaluHeader>;

/// H.266 profiles, see Annex A.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Profile {
    Main10 = 1,
    Main12 = 2,
    Main12Intra = 10,
    MultilayerMain10 = 17,
    Main10_444 = 33,
    Main12_444 = 34,
    Main16_444 = 36,
    Main12_444Intra = 42,
    Main16_444Intra = 44,
    MultilayerMain10_444 = 49,
    Main10StillPicture = 65,
    Main12StillPicture = 66,
    Main10_444StillPicture = 97,
    Main12_444StillPicture = 98,
    Main16_444StillPicture = 100,
}

/// H.266 levels as defined by table A.8. general_level_idc is 16 times the
/// major level number plus 3 times the minor one.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 16,
    L2 = 32,
    L2_1 = 35,
    L3 = 48,
    L3_1 = 51,
    L4 = 64,
    L4_1 = 67,
    L5 = 80,
    L5_1 = 83,
    L5_2 = 86,
    L6 = 96,
    L6_1 = 99,
    L6_2 = 102,
    L6_3 = 105,
    L15_5 = 255,
}

/// General constraints information. See 7.3.3.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneralConstraintsInfo {
    pub gci_present_flag: bool,
    pub gci_intra_only_constraint_flag: bool,
    pub gci_all_layers_independent_constraint_flag: bool,
    pub gci_one_au_only_constraint_flag: bool,
    pub gci_sixteen_minus_max_bitdepth_constraint_idc: u8,
    pub gci_three_minus_max_chroma_format_constraint_idc: u8,
    pub gci_no_mixed_nalu_types_in_pic_constraint_flag: bool,
    pub gci_no_trail_constraint_flag: bool,
    pub gci_no_stsa_constraint_flag: bool,
    pub gci_no_rasl_constraint_flag: bool,
    pub gci_no_radl_constraint_flag: bool,
    pub gci_no_idr_constraint_flag: bool,
    pub gci_no_cra_constraint_flag: bool,
    pub gci_no_gdr_constraint_flag: bool,
    pub gci_no_aps_constraint_flag: bool,
    pub gci_no_idr_rpl_constraint_flag: bool,
    pub gci_one_tile_per_pic_constraint_flag: bool,
    pub gci_pic_header_in_slice_header_constraint_flag: bool,
    pub gci_one_slice_per_pic_constraint_flag: bool,
    pub gci_no_rectangular_slice_constraint_flag: bool,
    pub gci_one_slice_per_subpic_constraint_flag: bool,
    pub gci_no_subpic_info_constraint_flag: bool,
    pub gci_three_minus_max_log2_ctu_size_constraint_idc: u8,
    pub gci_no_partition_constraints_override_constraint_flag: bool,
    pub gci_no_mtt_constraint_flag: bool,
    pub gci_no_qtbtt_dual_tree_intra_constraint_flag: bool,
    pub gci_no_palette_constraint_flag: bool,
    pub gci_no_ibc_constraint_flag: bool,
    pub gci_no_isp_constraint_flag: bool,
    pub gci_no_mrl_constraint_flag: bool,
    pub gci_no_mip_constraint_flag: bool,
    pub gci_no_cclm_constraint_flag: bool,
    pub gci_no_ref_pic_resampling_constraint_flag: bool,
    pub gci_no_res_change_in_clvs_constraint_flag: bool,
    pub gci_no_weighted_prediction_constraint_flag: bool,
    pub gci_no_ref_wraparound_constraint_flag: bool,
    pub gci_no_temporal_mvp_constraint_flag: bool,
    pub gci_no_sbtmvp_constraint_flag: bool,
    pub gci_no_amvr_constraint_flag: bool,
    pub gci_no_bdof_constraint_flag: bool,
    pub gci_no_smvd_constraint_flag: bool,
    pub gci_no_dmvr_constraint_flag: bool,
    pub gci_no_mmvd_constraint_flag: bool,
    pub gci_no_affine_motion_constraint_flag: bool,
    pub gci_no_prof_constraint_flag: bool,
    pub gci_no_bcw_constraint_flag: bool,
    pub gci_no_ciip_constraint_flag: bool,
    pub gci_no_gpm_constraint_flag: bool,
    pub gci_no_luma_transform_size_64_constraint_flag: bool,
    pub gci_no_transform_skip_constraint_flag: bool,
    pub gci_no_bdpcm_constraint_flag: bool,
    pub gci_no_mts_constraint_flag: bool,
    pub gci_no_lfnst_constraint_flag: bool,
    pub gci_no_joint_cbcr_constraint_flag: bool,
    pub gci_no_sbt_constraint_flag: bool,
    pub gci_no_act_constraint_flag: bool,
    pub gci_no_explicit_scaling_list_constraint_flag: bool,
    pub gci_no_dep_quant_constraint_flag: bool,
    pub gci_no_sign_data_hiding_constraint_flag: bool,
    pub gci_no_cu_qp_delta_constraint_flag: bool,
    pub gci_no_chroma_qp_offset_constraint_flag: bool,
    pub gci_no_sao_constraint_flag: bool,
    pub gci_no_alf_constraint_flag: bool,
    pub gci_no_ccalf_constraint_flag: bool,
    pub gci_no_lmcs_constraint_flag: bool,
    pub gci_no_ladf_constraint_flag: bool,
    pub gci_no_virtual_boundaries_constraint_flag: bool,
    pub gci_num_additional_bits: u8,
    pub gci_all_rap_pictures_constraint_flag: bool,
    pub gci_no_extended_precision_processing_constraint_flag: bool,
    pub gci_no_ts_residual_coding_rice_constraint_flag: bool,
    pub gci_no_rrc_rice_extension_constraint_flag: bool,
    pub gci_no_persistent_rice_adaptation_constraint_flag: bool,
    pub gci_no_reverse_last_sig_coeff_constraint_flag: bool,
}

/// Profile, tier and level. See 7.3.3.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general_profile_idc: u8,
    pub general_tier_flag: bool,
    pub general_level_idc: Level,
    pub ptl_frame_only_constraint_flag: bool,
    pub ptl_multilayer_enabled_flag: bool,
    pub general_constraints_info: GeneralConstraintsInfo,
    pub ptl_sublayer_level_present_flag: [bool; MAX_SUB_LAYERS],
    /// Sublayer levels, with the inference of 7.4.4.1 applied to the ones
    /// that are not signalled.
    pub sublayer_level_idc: [u8; MAX_SUB_LAYERS],
    pub ptl_num_sub_profiles: u8,
    pub general_sub_profile_idc: Vec<u32>,
}

impl ProfileTierLevel {
    pub fn profile(&self) -> Option<Profile> {
        Profile::n(self.general_profile_idc)
    }
}

/// DPB parameters for each sublayer. See 7.3.4. Entries for sublayers that
/// are not signalled are inferred from the highest one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DpbParameters {
    pub dpb_max_dec_pic_buffering_minus1: [u32; MAX_SUB_LAYERS],
    pub dpb_max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    pub dpb_max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
}

/// See 7.3.5.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneralTimingHrdParameters {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub general_nal_hrd_params_present_flag: bool,
    pub general_vcl_hrd_params_present_flag: bool,
    pub general_same_pic_timing_in_all_ols_flag: bool,
    pub general_du_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub hrd_cpb_cnt_minus1: u32,
}

/// See 7.3.5.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SublayerHrdParameters {
    pub bit_rate_value_minus1: Vec<u32>,
    pub cpb_size_value_minus1: Vec<u32>,
    pub cpb_size_du_value_minus1: Vec<u32>,
    pub bit_rate_du_value_minus1: Vec<u32>,
    pub cbr_flag: Vec<bool>,
}

/// See 7.3.5.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OlsTimingHrdParameters {
    pub fixed_pic_rate_general_flag: [bool; MAX_SUB_LAYERS],
    pub fixed_pic_rate_within_cvs_flag: [bool; MAX_SUB_LAYERS],
    pub elemental_duration_in_tc_minus1: [u32; MAX_SUB_LAYERS],
    pub low_delay_hrd_flag: [bool; MAX_SUB_LAYERS],
    pub nal_sublayer_hrd_parameters: [SublayerHrdParameters; MAX_SUB_LAYERS],
    pub vcl_sublayer_hrd_parameters: [SublayerHrdParameters; MAX_SUB_LAYERS],
}

/// Video usability information, as carried by the SPS VUI payload. See
/// Rec. ITU-T H.274.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParameters {
    pub vui_progressive_source_flag: bool,
    pub vui_interlaced_source_flag: bool,
    pub vui_non_packed_constraint_flag: bool,
    pub vui_non_projected_constraint_flag: bool,
    pub vui_aspect_ratio_info_present_flag: bool,
    pub vui_aspect_ratio_constant_flag: bool,
    pub vui_aspect_ratio_idc: u8,
    pub vui_sar_width: u16,
    pub vui_sar_height: u16,
    pub vui_overscan_info_present_flag: bool,
    pub vui_overscan_appropriate_flag: bool,
    pub vui_colour_description_present_flag: bool,
    pub vui_colour_primaries: u8,
    pub vui_transfer_characteristics: u8,
    pub vui_matrix_coeffs: u8,
    pub vui_full_range_flag: bool,
    pub vui_chroma_loc_info_present_flag: bool,
    pub vui_chroma_sample_loc_type_frame: u8,
    pub vui_chroma_sample_loc_type_top_field: u8,
    pub vui_chroma_sample_loc_type_bottom_field: u8,
}

impl Default for VuiParameters {
    fn default() -> Self {
        Self {
            vui_progressive_source_flag: false,
            vui_interlaced_source_flag: false,
            vui_non_packed_constraint_flag: false,
            vui_non_projected_constraint_flag: false,
            vui_aspect_ratio_info_present_flag: false,
            vui_aspect_ratio_constant_flag: false,
            vui_aspect_ratio_idc: 0,
            vui_sar_width: 0,
            vui_sar_height: 0,
            vui_overscan_info_present_flag: false,
            vui_overscan_appropriate_flag: false,
            vui_colour_description_present_flag: false,
            // Unspecified.
            vui_colour_primaries: 2,
            vui_transfer_characteristics: 2,
            vui_matrix_coeffs: 2,
            vui_full_range_flag: false,
            vui_chroma_loc_info_present_flag: false,
            vui_chroma_sample_loc_type_frame: 0,
            vui_chroma_sample_loc_type_top_field: 0,
            vui_chroma_sample_loc_type_bottom_field: 0,
        }
    }
}

/// Operating point information. See 7.3.2.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Opi {
    pub opi_ols_info_present_flag: bool,
    pub opi_htid_info_present_flag: bool,
    pub opi_ols_idx: u32,
    pub opi_htid_plus1: u8,
}

/// Video parameter set. See 7.3.2.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    /// Identifies the VPS for reference by other syntax elements. Never 0.
    pub vps_video_parameter_set_id: u8,
    pub vps_max_layers_minus1: u8,
    pub vps_max_sublayers_minus1: u8,
    pub vps_default_ptl_dpb_hrd_max_tid_flag: bool,
    pub vps_all_independent_layers_flag: bool,
    pub vps_layer_id: Vec<u8>,
    pub vps_independent_layer_flag: Vec<bool>,
    pub vps_max_tid_ref_present_flag: Vec<bool>,
    /// `vps_direct_ref_layer_flag[i][j]`, square matrix over the layers.
    pub vps_direct_ref_layer_flag: Vec<Vec<bool>>,
    pub vps_max_tid_il_ref_pics_plus1: Vec<Vec<u8>>,
    pub vps_each_layer_is_an_ols_flag: bool,
    pub vps_ols_mode_idc: u8,
    pub vps_num_output_layer_sets_minus2: u8,
    /// `vps_ols_output_layer_flag[i][j]`, indexed by OLS then layer.
    pub vps_ols_output_layer_flag: Vec<Vec<bool>>,
    pub vps_num_ptls_minus1: u8,
    pub vps_pt_present_flag: Vec<bool>,
    pub vps_ptl_max_tid: Vec<u8>,
    pub profile_tier_level: Vec<ProfileTierLevel>,
    pub vps_ols_ptl_idx: Vec<u8>,
    pub vps_num_dpb_params_minus1: u32,
    pub vps_sublayer_dpb_params_present_flag: bool,
    pub vps_dpb_max_tid: Vec<u8>,
    pub dpb_parameters: Vec<DpbParameters>,
    pub vps_ols_dpb_pic_width: Vec<u32>,
    pub vps_ols_dpb_pic_height: Vec<u32>,
    pub vps_ols_dpb_chroma_format: Vec<u8>,
    pub vps_ols_dpb_bitdepth_minus8: Vec<u8>,
    pub vps_ols_dpb_params_idx: Vec<u32>,
    pub vps_timing_hrd_params_present_flag: bool,
    pub general_timing_hrd_parameters: GeneralTimingHrdParameters,
    pub vps_sublayer_cpb_params_present_flag: bool,
    pub vps_num_ols_timing_hrd_params_minus1: u32,
    pub vps_hrd_max_tid: Vec<u8>,
    pub ols_timing_hrd_parameters: Vec<OlsTimingHrdParameters>,
    pub vps_ols_timing_hrd_idx: Vec<u32>,
    pub vps_extension_flag: bool,

    // Derived values, see 7.4.3.3.
    /// GeneralLayerIdx, indexed by nuh_layer_id.
    pub general_layer_idx: Vec<u8>,
    /// DirectRefLayerIdx[i], the layer indices layer i directly depends on.
    pub direct_ref_layer_idx: Vec<Vec<u8>>,
    /// ReferenceLayerIdx[i], every layer index layer i depends on.
    pub reference_layer_idx: Vec<Vec<u8>>,
    pub layer_used_as_ref_layer_flag: Vec<bool>,
    pub layer_used_as_output_layer_flag: Vec<bool>,
    pub total_num_olss: u32,
    pub num_output_layers_in_ols: Vec<u32>,
    pub output_layer_id_in_ols: Vec<Vec<u8>>,
    pub num_layers_in_ols: Vec<u32>,
    pub layer_id_in_ols: Vec<Vec<u8>>,
    pub num_multi_layer_olss: u32,
    pub multi_layer_ols_idx: Vec<u32>,
}

impl Vps {
    /// VpsNumDpbParams.
    pub fn num_dpb_params(&self) -> u32 {
        if self.vps_each_layer_is_an_ols_flag {
            0
        } else {
            self.vps_num_dpb_params_minus1 + 1
        }
    }

    /// NumDirectRefLayers of the layer with `nuh_layer_id`.
    pub fn num_direct_ref_layers(&self, nuh_layer_id: u8) -> usize {
        self.general_layer_idx
            .get(usize::from(nuh_layer_id))
            .and_then(|idx| self.direct_ref_layer_idx.get(usize::from(*idx)))
            .map_or(0, Vec::len)
    }

    /// nuh_layer_id of the `ilrp_idx`-th direct reference layer of the layer
    /// with `nuh_layer_id`.
    pub fn inter_layer_ref_layer_id(&self, nuh_layer_id: u8, ilrp_idx: usize) -> Option<u8> {
        let idx = usize::from(*self.general_layer_idx.get(usize::from(nuh_layer_id))?);
        let layer_idx = *self.direct_ref_layer_idx.get(idx)?.get(ilrp_idx)?;
        self.vps_layer_id.get(usize::from(layer_idx)).copied()
    }
}

/// ref_pic_list_struct(listIdx, rplsIdx). See 7.3.10.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListStruct {
    pub num_ref_entries: u8,
    pub ltrp_in_header_flag: bool,
    pub inter_layer_ref_pic_flag: [bool; MAX_NUM_REF_ENTRIES],
    pub st_ref_pic_flag: [bool; MAX_NUM_REF_ENTRIES],
    pub abs_delta_poc_st: [u16; MAX_NUM_REF_ENTRIES],
    pub strp_entry_sign_flag: [bool; MAX_NUM_REF_ENTRIES],
    /// rpls_poc_lsb_lt, indexed by long-term entry ordinal.
    pub rpls_poc_lsb_lt: [u32; MAX_NUM_REF_ENTRIES],
    pub ilrp_idx: [u8; MAX_NUM_REF_ENTRIES],

    // Derived values.
    /// DeltaPocValSt, indexed by entry.
    pub delta_poc_val_st: [i32; MAX_NUM_REF_ENTRIES],
    /// NumLtrpEntries.
    pub num_ltrp_entries: u8,
}

/// ref_pic_lists(), as found in a picture or slice header. See 7.3.9.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicLists {
    pub rpl_sps_flag: [bool; 2],
    pub rpl_idx: [u8; 2],
    /// The list structures in use, either copied from the SPS or signalled
    /// in the header.
    pub rpl: [RefPicListStruct; 2],
    /// RplsIdx.
    pub rpls_idx: [u8; 2],
    pub poc_lsb_lt: [[u32; MAX_NUM_REF_ENTRIES]; 2],
    pub delta_poc_msb_cycle_present_flag: [[bool; MAX_NUM_REF_ENTRIES]; 2],
    pub delta_poc_msb_cycle_lt: [[u32; MAX_NUM_REF_ENTRIES]; 2],

    // Derived values.
    /// PocLsbLt, indexed by long-term entry ordinal.
    pub poc_lsb_lt_val: [[u32; MAX_NUM_REF_ENTRIES]; 2],
    /// DeltaPocMsbCycleLt, indexed by long-term entry ordinal.
    pub delta_poc_msb_cycle_lt_val: [[u32; MAX_NUM_REF_ENTRIES]; 2],
}

impl RefPicLists {
    /// num_ref_entries[i][RplsIdx[i]].
    pub fn num_ref_entries(&self, list: usize) -> usize {
        usize::from(self.rpl[list].num_ref_entries)
    }
}

/// Sequence parameter set. See 7.3.2.4.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub sps_seq_parameter_set_id: u8,
    /// 0 means the SPS does not refer to a VPS.
    pub sps_video_parameter_set_id: u8,
    pub sps_max_sublayers_minus1: u8,
    /// 0: monochrome, 1: 4:2:0, 2: 4:2:2, 3: 4:4:4.
    pub sps_chroma_format_idc: u8,
    pub sps_log2_ctu_size_minus5: u8,
    pub sps_ptl_dpb_hrd_params_present_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub sps_gdr_enabled_flag: bool,
    pub sps_ref_pic_resampling_enabled_flag: bool,
    pub sps_res_change_in_clvs_allowed_flag: bool,
    pub sps_pic_width_max_in_luma_samples: u32,
    pub sps_pic_height_max_in_luma_samples: u32,
    pub sps_conformance_window_flag: bool,
    pub sps_conf_win_left_offset: u32,
    pub sps_conf_win_right_offset: u32,
    pub sps_conf_win_top_offset: u32,
    pub sps_conf_win_bottom_offset: u32,
    pub sps_subpic_info_present_flag: bool,
    pub sps_num_subpics_minus1: u16,
    pub sps_independent_subpics_flag: bool,
    pub sps_subpic_same_size_flag: bool,
    pub sps_subpic_ctu_top_left_x: Vec<u32>,
    pub sps_subpic_ctu_top_left_y: Vec<u32>,
    pub sps_subpic_width_minus1: Vec<u32>,
    pub sps_subpic_height_minus1: Vec<u32>,
    pub sps_subpic_treated_as_pic_flag: Vec<bool>,
    pub sps_loop_filter_across_subpic_enabled_flag: Vec<bool>,
    pub sps_subpic_id_len_minus1: u8,
    pub sps_subpic_id_mapping_explicitly_signalled_flag: bool,
    pub sps_subpic_id_mapping_present_flag: bool,
    pub sps_subpic_id: Vec<u16>,
    pub sps_bitdepth_minus8: u8,
    pub sps_entropy_coding_sync_enabled_flag: bool,
    pub sps_entry_point_offsets_present_flag: bool,
    pub sps_log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sps_poc_msb_cycle_flag: bool,
    pub sps_poc_msb_cycle_len_minus1: u8,
    pub sps_num_extra_ph_bytes: u8,
    pub sps_extra_ph_bit_present_flag: Vec<bool>,
    pub sps_num_extra_sh_bytes: u8,
    pub sps_extra_sh_bit_present_flag: Vec<bool>,
    pub sps_sublayer_dpb_params_flag: bool,
    pub dpb_parameters: DpbParameters,
    pub sps_log2_min_luma_coding_block_size_minus2: u8,
    pub sps_partition_constraints_override_enabled_flag: bool,
    pub sps_log2_diff_min_qt_min_cb_intra_slice_luma: u8,
    pub sps_max_mtt_hierarchy_depth_intra_slice_luma: u8,
    pub sps_log2_diff_max_bt_min_qt_intra_slice_luma: u8,
    pub sps_log2_diff_max_tt_min_qt_intra_slice_luma: u8,
    pub sps_qtbtt_dual_tree_intra_flag: bool,
    pub sps_log2_diff_min_qt_min_cb_intra_slice_chroma: u8,
    pub sps_max_mtt_hierarchy_depth_intra_slice_chroma: u8,
    pub sps_log2_diff_max_bt_min_qt_intra_slice_chroma: u8,
    pub sps_log2_diff_max_tt_min_qt_intra_slice_chroma: u8,
    pub sps_log2_diff_min_qt_min_cb_inter_slice: u8,
    pub sps_max_mtt_hierarchy_depth_inter_slice: u8,
    pub sps_log2_diff_max_bt_min_qt_inter_slice: u8,
    pub sps_log2_diff_max_tt_min_qt_inter_slice: u8,
    pub sps_max_luma_transform_size_64_flag: bool,
    pub sps_transform_skip_enabled_flag: bool,
    pub sps_log2_transform_skip_max_size_minus2: u8,
    pub sps_bdpcm_enabled_flag: bool,
    pub sps_mts_enabled_flag: bool,
    pub sps_explicit_mts_intra_enabled_flag: bool,
    pub sps_explicit_mts_inter_enabled_flag: bool,
    pub sps_lfnst_enabled_flag: bool,
    pub sps_joint_cbcr_enabled_flag: bool,
    pub sps_same_qp_table_for_chroma_flag: bool,
    pub sps_qp_table_start_minus26: [i8; 3],
    pub sps_num_points_in_qp_table_minus1: [u8; 3],
    pub sps_delta_qp_in_val_minus1: [Vec<u8>; 3],
    pub sps_delta_qp_diff_val: [Vec<u8>; 3],
    pub sps_sao_enabled_flag: bool,
    pub sps_alf_enabled_flag: bool,
    pub sps_ccalf_enabled_flag: bool,
    pub sps_lmcs_enabled_flag: bool,
    pub sps_weighted_pred_flag: bool,
    pub sps_weighted_bipred_flag: bool,
    pub sps_long_term_ref_pics_flag: bool,
    pub sps_inter_layer_prediction_enabled_flag: bool,
    pub sps_idr_rpl_present_flag: bool,
    pub sps_rpl1_same_as_rpl0_flag: bool,
    pub sps_num_ref_pic_lists: [u8; 2],
    /// The candidate list structures, `sps_num_ref_pic_lists[i]` per list.
    pub ref_pic_list_struct: [Vec<RefPicListStruct>; 2],
    pub sps_ref_wraparound_enabled_flag: bool,
    pub sps_temporal_mvp_enabled_flag: bool,
    pub sps_sbtmvp_enabled_flag: bool,
    pub sps_amvr_enabled_flag: bool,
    pub sps_bdof_enabled_flag: bool,
    pub sps_bdof_control_present_in_ph_flag: bool,
    pub sps_smvd_enabled_flag: bool,
    pub sps_dmvr_enabled_flag: bool,
    pub sps_dmvr_control_present_in_ph_flag: bool,
    pub sps_mmvd_enabled_flag: bool,
    pub sps_mmvd_fullpel_only_enabled_flag: bool,
    pub sps_six_minus_max_num_merge_cand: u8,
    pub sps_sbt_enabled_flag: bool,
    pub sps_affine_enabled_flag: bool,
    pub sps_five_minus_max_num_subblock_merge_cand: u8,
    pub sps_6param_affine_enabled_flag: bool,
    pub sps_affine_amvr_enabled_flag: bool,
    pub sps_affine_prof_enabled_flag: bool,
    pub sps_prof_control_present_in_ph_flag: bool,
    pub sps_bcw_enabled_flag: bool,
    pub sps_ciip_enabled_flag: bool,
    pub sps_gpm_enabled_flag: bool,
    pub sps_max_num_merge_cand_minus_max_num_gpm_cand: u8,
    pub sps_log2_parallel_merge_level_minus2: u8,
    pub sps_isp_enabled_flag: bool,
    pub sps_mrl_enabled_flag: bool,
    pub sps_mip_enabled_flag: bool,
    pub sps_cclm_enabled_flag: bool,
    pub sps_chroma_horizontal_collocated_flag: bool,
    pub sps_chroma_vertical_collocated_flag: bool,
    pub sps_palette_enabled_flag: bool,
    pub sps_act_enabled_flag: bool,
    pub sps_min_qp_prime_ts: u8,
    pub sps_ibc_enabled_flag: bool,
    pub sps_six_minus_max_num_ibc_merge_cand: u8,
    pub sps_ladf_enabled_flag: bool,
    pub sps_num_ladf_intervals_minus2: u8,
    pub sps_ladf_lowest_interval_qp_offset: i8,
    pub sps_ladf_qp_offset: [i8; 4],
    pub sps_ladf_delta_threshold_minus1: [u32; 4],
    pub sps_explicit_scaling_list_enabled_flag: bool,
    pub sps_scaling_matrix_for_lfnst_disabled_flag: bool,
    pub sps_scaling_matrix_for_alternative_colour_space_disabled_flag: bool,
    pub sps_scaling_matrix_designated_colour_space_flag: bool,
    pub sps_dep_quant_enabled_flag: bool,
    pub sps_sign_data_hiding_enabled_flag: bool,
    pub sps_virtual_boundaries_enabled_flag: bool,
    pub sps_virtual_boundaries_present_flag: bool,
    pub sps_num_ver_virtual_boundaries: u8,
    pub sps_virtual_boundary_pos_x_minus1: [u32; 3],
    pub sps_num_hor_virtual_boundaries: u8,
    pub sps_virtual_boundary_pos_y_minus1: [u32; 3],
    pub sps_timing_hrd_params_present_flag: bool,
    pub general_timing_hrd_parameters: GeneralTimingHrdParameters,
    pub sps_sublayer_cpb_params_present_flag: bool,
    pub ols_timing_hrd_parameters: OlsTimingHrdParameters,
    pub sps_field_seq_flag: bool,
    pub sps_vui_parameters_present_flag: bool,
    pub sps_vui_payload_size_minus1: u16,
    pub vui_parameters: VuiParameters,
    pub sps_extension_flag: bool,
    pub sps_range_extension_flag: bool,
    pub sps_extension_7bits: u8,
    pub sps_extended_precision_flag: bool,
    pub sps_ts_residual_coding_rice_present_in_sh_flag: bool,
    pub sps_rrc_rice_extension_flag: bool,
    pub sps_persistent_rice_adaptation_enabled_flag: bool,
    pub sps_reverse_last_sig_coeff_enabled_flag: bool,

    // Derived values.
    /// The subpictures of the picture, in CTB units. Always holds at least
    /// one entry.
    pub subpics: Vec<SubpicRect>,
    /// CtbToSubpicIdx for pictures of the maximum size.
    pub ctb_to_subpic_idx: Vec<u16>,
    /// ChromaQpTable[i], indexed by `qp + QpBdOffset`.
    pub chroma_qp_table: [Vec<i32>; 3],
}

impl Sps {
    /// CtbLog2SizeY.
    pub fn ctb_log2_size_y(&self) -> u32 {
        u32::from(self.sps_log2_ctu_size_minus5) + 5
    }

    /// CtbSizeY.
    pub fn ctb_size_y(&self) -> u32 {
        1 << self.ctb_log2_size_y()
    }

    /// MinCbLog2SizeY.
    pub fn min_cb_log2_size_y(&self) -> u32 {
        u32::from(self.sps_log2_min_luma_coding_block_size_minus2) + 2
    }

    pub fn min_cb_size_y(&self) -> u32 {
        1 << self.min_cb_log2_size_y()
    }

    /// BitDepth.
    pub fn bit_depth(&self) -> u32 {
        u32::from(self.sps_bitdepth_minus8) + 8
    }

    /// QpBdOffset.
    pub fn qp_bd_offset(&self) -> i32 {
        6 * i32::from(self.sps_bitdepth_minus8)
    }

    /// WpOffsetHalfRangeY, equal to WpOffsetHalfRangeC as both components
    /// share one bit depth.
    pub fn wp_offset_half_range(&self) -> i32 {
        if self.sps_extended_precision_flag {
            1 << (self.bit_depth() - 1)
        } else {
            1 << 7
        }
    }

    /// MaxPicOrderCntLsb.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (u32::from(self.sps_log2_max_pic_order_cnt_lsb_minus4) + 4)
    }

    /// MaxNumMergeCand.
    pub fn max_num_merge_cand(&self) -> u32 {
        6 - u32::from(self.sps_six_minus_max_num_merge_cand)
    }

    /// NumExtraPhBits.
    pub fn num_extra_ph_bits(&self) -> usize {
        self.sps_extra_ph_bit_present_flag.iter().filter(|f| **f).count()
    }

    /// NumExtraShBits.
    pub fn num_extra_sh_bits(&self) -> usize {
        self.sps_extra_sh_bit_present_flag.iter().filter(|f| **f).count()
    }

    /// SubWidthC and SubHeightC.
    pub fn sub_width_height_c(&self) -> (u32, u32) {
        match self.sps_chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        }
    }

    /// Width of the largest picture in CTBs.
    pub fn pic_width_max_in_ctbs(&self) -> u32 {
        self.sps_pic_width_max_in_luma_samples.div_ceil(self.ctb_size_y())
    }

    /// Height of the largest picture in CTBs.
    pub fn pic_height_max_in_ctbs(&self) -> u32 {
        self.sps_pic_height_max_in_luma_samples.div_ceil(self.ctb_size_y())
    }

    /// ChromaQpTable[table][qp].
    pub fn chroma_qp(&self, table: usize, qp: i32) -> Option<i32> {
        let idx = usize::try_from(qp + self.qp_bd_offset()).ok()?;
        self.chroma_qp_table.get(table)?.get(idx).copied()
    }

    /// Number of syntax elements needed to address a subpicture CTB
    /// position, i.e. the length of the sps_subpic_ctu_* u(v) fields.
    fn subpic_pos_bits(size_in_luma_samples: u32, ctb_size: u32) -> usize {
        ceil_log2(size_in_luma_samples.div_ceil(ctb_size))
    }
}

/// Picture parameter set. See 7.3.2.5.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pps_pic_parameter_set_id: u8,
    pub pps_seq_parameter_set_id: u8,
    pub pps_mixed_nalu_types_in_pic_flag: bool,
    pub pps_pic_width_in_luma_samples: u32,
    pub pps_pic_height_in_luma_samples: u32,
    pub pps_conformance_window_flag: bool,
    pub pps_conf_win_left_offset: u32,
    pub pps_conf_win_right_offset: u32,
    pub pps_conf_win_top_offset: u32,
    pub pps_conf_win_bottom_offset: u32,
    pub pps_scaling_window_explicit_signalling_flag: bool,
    pub pps_scaling_win_left_offset: i32,
    pub pps_scaling_win_right_offset: i32,
    pub pps_scaling_win_top_offset: i32,
    pub pps_scaling_win_bottom_offset: i32,
    pub pps_output_flag_present_flag: bool,
    pub pps_no_pic_partition_flag: bool,
    pub pps_subpic_id_mapping_present_flag: bool,
    pub pps_num_subpics_minus1: u16,
    pub pps_subpic_id_len_minus1: u8,
    pub pps_subpic_id: Vec<u16>,
    pub pps_log2_ctu_size_minus5: u8,
    pub pps_num_exp_tile_columns_minus1: u32,
    pub pps_num_exp_tile_rows_minus1: u32,
    pub pps_tile_column_width_minus1: Vec<u32>,
    pub pps_tile_row_height_minus1: Vec<u32>,
    pub pps_loop_filter_across_tiles_enabled_flag: bool,
    pub pps_rect_slice_flag: bool,
    pub pps_single_slice_per_subpic_flag: bool,
    pub pps_num_slices_in_pic_minus1: u32,
    pub pps_tile_idx_delta_present_flag: bool,
    /// Per slice syntax of the rectangular slice loop, indexed by slice.
    pub pps_slice_width_in_tiles_minus1: Vec<u32>,
    pub pps_slice_height_in_tiles_minus1: Vec<u32>,
    pub pps_num_exp_slices_in_tile: Vec<u32>,
    pub pps_exp_slice_height_in_ctus_minus1: Vec<Vec<u32>>,
    pub pps_tile_idx_delta_val: Vec<i32>,
    pub pps_loop_filter_across_slices_enabled_flag: bool,
    pub pps_cabac_init_present_flag: bool,
    pub pps_num_ref_idx_default_active_minus1: [u8; 2],
    pub pps_rpl1_idx_present_flag: bool,
    pub pps_weighted_pred_flag: bool,
    pub pps_weighted_bipred_flag: bool,
    pub pps_ref_wraparound_enabled_flag: bool,
    pub pps_pic_width_minus_wraparound_offset: u32,
    pub pps_init_qp_minus26: i8,
    pub pps_cu_qp_delta_enabled_flag: bool,
    pub pps_chroma_tool_offsets_present_flag: bool,
    pub pps_cb_qp_offset: i8,
    pub pps_cr_qp_offset: i8,
    pub pps_joint_cbcr_qp_offset_present_flag: bool,
    pub pps_joint_cbcr_qp_offset_value: i8,
    pub pps_slice_chroma_qp_offsets_present_flag: bool,
    pub pps_cu_chroma_qp_offset_list_enabled_flag: bool,
    pub pps_chroma_qp_offset_list_len_minus1: u8,
    pub pps_cb_qp_offset_list: [i8; 6],
    pub pps_cr_qp_offset_list: [i8; 6],
    pub pps_joint_cbcr_qp_offset_list: [i8; 6],
    pub pps_deblocking_filter_control_present_flag: bool,
    pub pps_deblocking_filter_override_enabled_flag: bool,
    pub pps_deblocking_filter_disabled_flag: bool,
    pub pps_dbf_info_in_ph_flag: bool,
    pub pps_luma_beta_offset_div2: i8,
    pub pps_luma_tc_offset_div2: i8,
    pub pps_cb_beta_offset_div2: i8,
    pub pps_cb_tc_offset_div2: i8,
    pub pps_cr_beta_offset_div2: i8,
    pub pps_cr_tc_offset_div2: i8,
    pub pps_rpl_info_in_ph_flag: bool,
    pub pps_sao_info_in_ph_flag: bool,
    pub pps_alf_info_in_ph_flag: bool,
    pub pps_wp_info_in_ph_flag: bool,
    pub pps_qp_delta_info_in_ph_flag: bool,
    pub pps_picture_header_extension_present_flag: bool,
    pub pps_slice_header_extension_present_flag: bool,
    pub pps_extension_flag: bool,

    // Derived values. They are computed before the PPS becomes visible to the
    // slice parser, so a slice can always rely on them.
    /// The tile grid.
    pub tile_layout: TileLayout,
    /// The CTBs of each rectangular slice. Empty when slices are in raster
    /// scan mode.
    pub slice_map: SliceMap,
    /// Mapping between rectangular slices and subpictures.
    pub subpic_slices: tiles::SubpicSliceMap,
    /// SubpicIdVal.
    pub subpic_id_val: Vec<u16>,
    /// The SPS this PPS was parsed against.
    pub sps: Rc<Sps>,
}

impl Pps {
    /// PicWidthInCtbsY.
    pub fn pic_width_in_ctbs(&self) -> u32 {
        self.tile_layout.pic_width_in_ctbs
    }

    /// PicHeightInCtbsY.
    pub fn pic_height_in_ctbs(&self) -> u32 {
        self.tile_layout.pic_height_in_ctbs
    }

    /// NumTilesInPic.
    pub fn num_tiles_in_pic(&self) -> u32 {
        self.tile_layout.num_tiles()
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApsParamsType {
    #[default]
    Alf = 0,
    Lmcs = 1,
    ScalingList = 2,
}

impl ApsParamsType {
    /// Number of APS IDs available to this type.
    pub fn max_ids(&self) -> usize {
        match self {
            ApsParamsType::Alf | ApsParamsType::ScalingList => 8,
            ApsParamsType::Lmcs => 4,
        }
    }
}

/// alf_data(). See 7.3.2.18.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlfData {
    pub alf_luma_filter_signal_flag: bool,
    pub alf_chroma_filter_signal_flag: bool,
    pub alf_cc_cb_filter_signal_flag: bool,
    pub alf_cc_cr_filter_signal_flag: bool,
    pub alf_luma_clip_flag: bool,
    pub alf_luma_num_filters_signalled_minus1: u8,
    pub alf_luma_coeff_delta_idx: [u8; NUM_ALF_FILTERS],
    /// AlfCoeffL, per signalled filter.
    pub alf_luma_coeff: Vec<[i16; 12]>,
    pub alf_luma_clip_idx: Vec<[u8; 12]>,
    pub alf_chroma_clip_flag: bool,
    pub alf_chroma_num_alt_filters_minus1: u8,
    /// AlfCoeffC, per alternative filter.
    pub alf_chroma_coeff: Vec<[i16; 6]>,
    pub alf_chroma_clip_idx: Vec<[u8; 6]>,
    pub alf_cc_cb_filters_signalled_minus1: u8,
    /// CcAlfApsCoeffCb, per filter.
    pub alf_cc_cb_coeff: Vec<[i16; 7]>,
    pub alf_cc_cr_filters_signalled_minus1: u8,
    /// CcAlfApsCoeffCr, per filter.
    pub alf_cc_cr_coeff: Vec<[i16; 7]>,
}

/// lmcs_data(). See 7.3.2.19.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LmcsData {
    pub lmcs_min_bin_idx: u8,
    pub lmcs_delta_max_bin_idx: u8,
    pub lmcs_delta_cw_prec_minus1: u8,
    /// lmcsDeltaCW, for all 16 bins. Bins outside of
    /// `lmcs_min_bin_idx..=LmcsMaxBinIdx` are 0.
    pub lmcs_delta_cw: [i32; 16],
    /// lmcsDeltaCrs.
    pub lmcs_delta_crs: i8,
}

impl LmcsData {
    /// LmcsMaxBinIdx.
    pub fn max_bin_idx(&self) -> u8 {
        15 - self.lmcs_delta_max_bin_idx
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApsData {
    Alf(AlfData),
    Lmcs(LmcsData),
    ScalingList(Box<ScalingListData>),
}

impl Default for ApsData {
    fn default() -> Self {
        ApsData::Alf(Default::default())
    }
}

/// Adaptation parameter set. See 7.3.2.6.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Aps {
    pub aps_params_type: ApsParamsType,
    pub aps_adaptation_parameter_set_id: u8,
    pub aps_chroma_present_flag: bool,
    pub data: ApsData,
    pub aps_extension_flag: bool,
    /// nuh_layer_id of the NALU carrying this APS.
    pub nuh_layer_id: u8,
}

impl Aps {
    pub fn alf(&self) -> Option<&AlfData> {
        match &self.data {
            ApsData::Alf(alf) => Some(alf),
            _ => None,
        }
    }

    pub fn lmcs(&self) -> Option<&LmcsData> {
        match &self.data {
            ApsData::Lmcs(lmcs) => Some(lmcs),
            _ => None,
        }
    }

    pub fn scaling_list(&self) -> Option<&ScalingListData> {
        match &self.data {
            ApsData::ScalingList(sl) => Some(sl),
            _ => None,
        }
    }
}

/// pred_weight_table(). See 7.3.8.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub delta_chroma_log2_weight_denom: i8,
    pub num_l0_weights: u8,
    pub num_l1_weights: u8,
    pub luma_weight_flag: [[bool; 15]; 2],
    pub chroma_weight_flag: [[bool; 15]; 2],
    pub delta_luma_weight: [[i8; 15]; 2],
    pub luma_offset: [[i16; 15]; 2],
    pub delta_chroma_weight: [[[i8; 2]; 15]; 2],
    pub delta_chroma_offset: [[[i32; 2]; 15]; 2],

    // Derived values.
    /// LumaWeightL0 and LumaWeightL1.
    pub luma_weight: [[i16; 15]; 2],
    /// ChromaWeightL0 and ChromaWeightL1.
    pub chroma_weight: [[[i16; 2]; 15]; 2],
    /// ChromaOffsetL0 and ChromaOffsetL1.
    pub chroma_offset: [[[i16; 2]; 15]; 2],
}

impl PredWeightTable {
    /// ChromaLog2WeightDenom.
    pub fn chroma_log2_weight_denom(&self) -> i32 {
        i32::from(self.luma_log2_weight_denom) + i32::from(self.delta_chroma_log2_weight_denom)
    }
}

/// Partitioning constraints that a picture header may override.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartitionConstraints {
    pub log2_diff_min_qt_min_cb_intra_slice_luma: u8,
    pub max_mtt_hierarchy_depth_intra_slice_luma: u8,
    pub log2_diff_max_bt_min_qt_intra_slice_luma: u8,
    pub log2_diff_max_tt_min_qt_intra_slice_luma: u8,
    pub log2_diff_min_qt_min_cb_intra_slice_chroma: u8,
    pub max_mtt_hierarchy_depth_intra_slice_chroma: u8,
    pub log2_diff_max_bt_min_qt_intra_slice_chroma: u8,
    pub log2_diff_max_tt_min_qt_intra_slice_chroma: u8,
    pub log2_diff_min_qt_min_cb_inter_slice: u8,
    pub max_mtt_hierarchy_depth_inter_slice: u8,
    pub log2_diff_max_bt_min_qt_inter_slice: u8,
    pub log2_diff_max_tt_min_qt_inter_slice: u8,
}

impl PartitionConstraints {
    fn from_sps(sps: &Sps) -> Self {
        Self {
            log2_diff_min_qt_min_cb_intra_slice_luma: sps
                .sps_log2_diff_min_qt_min_cb_intra_slice_luma,
            max_mtt_hierarchy_depth_intra_slice_luma: sps
                .sps_max_mtt_hierarchy_depth_intra_slice_luma,
            log2_diff_max_bt_min_qt_intra_slice_luma: sps
                .sps_log2_diff_max_bt_min_qt_intra_slice_luma,
            log2_diff_max_tt_min_qt_intra_slice_luma: sps
                .sps_log2_diff_max_tt_min_qt_intra_slice_luma,
            log2_diff_min_qt_min_cb_intra_slice_chroma: sps
                .sps_log2_diff_min_qt_min_cb_intra_slice_chroma,
            max_mtt_hierarchy_depth_intra_slice_chroma: sps
                .sps_max_mtt_hierarchy_depth_intra_slice_chroma,
            log2_diff_max_bt_min_qt_intra_slice_chroma: sps
                .sps_log2_diff_max_bt_min_qt_intra_slice_chroma,
            log2_diff_max_tt_min_qt_intra_slice_chroma: sps
                .sps_log2_diff_max_tt_min_qt_intra_slice_chroma,
            log2_diff_min_qt_min_cb_inter_slice: sps.sps_log2_diff_min_qt_min_cb_inter_slice,
            max_mtt_hierarchy_depth_inter_slice: sps.sps_max_mtt_hierarchy_depth_inter_slice,
            log2_diff_max_bt_min_qt_inter_slice: sps.sps_log2_diff_max_bt_min_qt_inter_slice,
            log2_diff_max_tt_min_qt_inter_slice: sps.sps_log2_diff_max_tt_min_qt_inter_slice,
        }
    }
}

/// ALF settings, as signalled in either the picture or the slice header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlfInfo {
    pub alf_enabled_flag: bool,
    pub num_alf_aps_ids_luma: u8,
    pub alf_aps_id_luma: [u8; 8],
    pub alf_cb_enabled_flag: bool,
    pub alf_cr_enabled_flag: bool,
    pub alf_aps_id_chroma: u8,
    pub alf_cc_cb_enabled_flag: bool,
    pub alf_cc_cb_aps_id: u8,
    pub alf_cc_cr_enabled_flag: bool,
    pub alf_cc_cr_aps_id: u8,
}

/// Deblocking settings, as signalled in a PPS, picture or slice header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeblockingParams {
    pub deblocking_filter_disabled_flag: bool,
    pub luma_beta_offset_div2: i8,
    pub luma_tc_offset_div2: i8,
    pub cb_beta_offset_div2: i8,
    pub cb_tc_offset_div2: i8,
    pub cr_beta_offset_div2: i8,
    pub cr_tc_offset_div2: i8,
}

impl DeblockingParams {
    fn from_pps(pps: &Pps) -> Self {
        Self {
            deblocking_filter_disabled_flag: pps.pps_deblocking_filter_disabled_flag,
            luma_beta_offset_div2: pps.pps_luma_beta_offset_div2,
            luma_tc_offset_div2: pps.pps_luma_tc_offset_div2,
            cb_beta_offset_div2: pps.pps_cb_beta_offset_div2,
            cb_tc_offset_div2: pps.pps_cb_tc_offset_div2,
            cr_beta_offset_div2: pps.pps_cr_beta_offset_div2,
            cr_tc_offset_div2: pps.pps_cr_tc_offset_div2,
        }
    }
}

/// picture_header_structure(). See 7.3.2.8.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureHeader {
    pub ph_gdr_or_irap_pic_flag: bool,
    pub ph_non_ref_pic_flag: bool,
    pub ph_gdr_pic_flag: bool,
    pub ph_inter_slice_allowed_flag: bool,
    pub ph_intra_slice_allowed_flag: bool,
    pub ph_pic_parameter_set_id: u8,
    pub ph_pic_order_cnt_lsb: u32,
    pub ph_recovery_poc_cnt: u32,
    pub ph_poc_msb_cycle_present_flag: bool,
    pub ph_poc_msb_cycle_val: u32,
    pub alf: AlfInfo,
    pub ph_lmcs_enabled_flag: bool,
    pub ph_lmcs_aps_id: u8,
    pub ph_chroma_residual_scale_flag: bool,
    pub ph_explicit_scaling_list_enabled_flag: bool,
    pub ph_scaling_list_aps_id: u8,
    pub ph_virtual_boundaries_present_flag: bool,
    pub ph_num_ver_virtual_boundaries: u8,
    pub ph_virtual_boundary_pos_x_minus1: [u32; 3],
    pub ph_num_hor_virtual_boundaries: u8,
    pub ph_virtual_boundary_pos_y_minus1: [u32; 3],
    pub ph_pic_output_flag: bool,
    pub ref_pic_lists: RefPicLists,
    pub ph_partition_constraints_override_flag: bool,
    pub partition_constraints: PartitionConstraints,
    pub ph_cu_qp_delta_subdiv_intra_slice: u8,
    pub ph_cu_chroma_qp_offset_subdiv_intra_slice: u8,
    pub ph_cu_qp_delta_subdiv_inter_slice: u8,
    pub ph_cu_chroma_qp_offset_subdiv_inter_slice: u8,
    pub ph_temporal_mvp_enabled_flag: bool,
    pub ph_collocated_from_l0_flag: bool,
    pub ph_collocated_ref_idx: u8,
    pub ph_mmvd_fullpel_only_flag: bool,
    pub ph_mvd_l1_zero_flag: bool,
    pub ph_bdof_disabled_flag: bool,
    pub ph_dmvr_disabled_flag: bool,
    pub ph_prof_disabled_flag: bool,
    pub pred_weight_table: PredWeightTable,
    pub ph_qp_delta: i8,
    pub ph_joint_cbcr_sign_flag: bool,
    pub ph_sao_luma_enabled_flag: bool,
    pub ph_sao_chroma_enabled_flag: bool,
    pub ph_deblocking_params_present_flag: bool,
    pub deblocking: DeblockingParams,
    pub ph_extension_length: u16,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    P = 1,
    #[default]
    I = 2,
}

impl SliceType {
    /// Whether this is a P slice.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

/// slice_header(). See 7.3.7.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub sh_picture_header_in_slice_header_flag: bool,
    pub sh_subpic_id: u16,
    pub sh_slice_address: u32,
    pub sh_num_tiles_in_slice_minus1: u32,
    pub sh_slice_type: SliceType,
    pub sh_no_output_of_prior_pics_flag: bool,
    /// ALF settings signalled in the slice header, if any.
    pub sh_alf: AlfInfo,
    pub sh_lmcs_used_flag: bool,
    pub sh_explicit_scaling_list_used_flag: bool,
    /// Reference picture lists signalled in the slice header.
    pub sh_ref_pic_lists: RefPicLists,
    pub sh_num_ref_idx_active_override_flag: bool,
    pub sh_num_ref_idx_active_minus1: [u8; 2],
    pub sh_cabac_init_flag: bool,
    pub sh_collocated_from_l0_flag: bool,
    pub sh_collocated_ref_idx: u8,
    pub sh_pred_weight_table: PredWeightTable,
    pub sh_qp_delta: i8,
    pub sh_cb_qp_offset: i8,
    pub sh_cr_qp_offset: i8,
    pub sh_joint_cbcr_qp_offset: i8,
    pub sh_cu_chroma_qp_offset_enabled_flag: bool,
    pub sh_sao_luma_used_flag: bool,
    pub sh_sao_chroma_used_flag: bool,
    pub sh_deblocking_params_present_flag: bool,
    /// Deblocking settings signalled in the slice header.
    pub sh_deblocking: DeblockingParams,
    pub sh_dep_quant_used_flag: bool,
    pub sh_sign_data_hiding_used_flag: bool,
    pub sh_ts_residual_coding_disabled_flag: bool,
    pub sh_ts_residual_coding_rice_idx_minus1: u8,
    pub sh_reverse_last_sig_coeff_flag: bool,
    pub sh_slice_header_extension_length: u16,
    pub sh_entry_offset_len_minus1: u8,
    pub sh_entry_point_offset_minus1: Vec<u32>,

    // Values after picture header inheritance.
    /// The ALF settings that apply to this slice.
    pub alf: AlfInfo,
    /// The reference picture lists that apply to this slice.
    pub ref_pic_lists: RefPicLists,
    /// The prediction weights that apply to this slice.
    pub pred_weight_table: PredWeightTable,
    /// The deblocking settings that apply to this slice.
    pub deblocking: DeblockingParams,
    pub sao_luma_used_flag: bool,
    pub sao_chroma_used_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u8,

    // Derived values.
    /// NumRefIdxActive.
    pub num_ref_idx_active: [u8; 2],
    /// SliceQpY.
    pub slice_qp_y: i32,
    /// CurrSubpicIdx.
    pub curr_subpic_idx: u16,
    /// CtbAddrInCurrSlice. NumCtusInCurrSlice is its length.
    pub ctb_addr_in_curr_slice: Vec<u32>,
    /// NumEntryPoints.
    pub num_entry_points: u32,
    /// Size of the slice header in bits, byte alignment included.
    pub header_bit_size: u64,
    /// Number of emulation prevention bytes found in the slice header.
    pub n_emulation_prevention_bytes: usize,

    /// The picture header of the picture this slice belongs to.
    pub picture_header: Rc<PictureHeader>,
    /// The PPS this slice refers to.
    pub pps: Rc<Pps>,
}

impl SliceHeader {
    /// NumCtusInCurrSlice.
    pub fn num_ctus_in_curr_slice(&self) -> usize {
        self.ctb_addr_in_curr_slice.len()
    }
}

/// A H.266 slice. An integer number of CTUs.
#[derive(Debug)]
pub struct Slice<'a> {
    /// The slice header.
    pub header: SliceHeader,
    /// The NAL unit backing this slice.
    pub nalu: Nalu<'a>,
}

/// Access unit delimiter. See 7.3.2.9.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessUnitDelimiter {
    pub aud_irap_or_gdr_flag: bool,
    /// 0: I slices only, 1: P and I, 2: B, P and I.
    pub aud_pic_type: u8,
}

/// A H.266 header parser. Keeps the parameter sets it has seen so that the
/// headers referring to them can be decoded.
#[derive(Debug)]
pub struct Parser {
    active_opis: ParameterSetStore<Opi>,
    active_vpses: ParameterSetStore<Vps>,
    active_spses: ParameterSetStore<Sps>,
    active_ppses: ParameterSetStore<Pps>,
    active_alf_apses: ParameterSetStore<Aps>,
    active_lmcs_apses: ParameterSetStore<Aps>,
    active_scaling_list_apses: ParameterSetStore<Aps>,
    /// The last picture header received, either on its own or within a
    /// slice header.
    current_ph: Option<Rc<PictureHeader>>,
    /// Scan orders used to reconstruct scaling matrices.
    scan_tables: Rc<ScanTables>,
    /// Whether payloads still contain emulation prevention bytes.
    emulation_prevention: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            active_opis: ParameterSetStore::new(MAX_OPI_COUNT),
            active_vpses: ParameterSetStore::new(MAX_VPS_COUNT),
            active_spses: ParameterSetStore::new(MAX_SPS_COUNT),
            active_ppses: ParameterSetStore::new(MAX_PPS_COUNT),
            active_alf_apses: ParameterSetStore::new(ApsParamsType::Alf.max_ids()),
            active_lmcs_apses: ParameterSetStore::new(ApsParamsType::Lmcs.max_ids()),
            active_scaling_list_apses: ParameterSetStore::new(
                ApsParamsType::ScalingList.max_ids(),
            ),
            current_ph: None,
            scan_tables: Rc::new(ScanTables::new()),
            emulation_prevention: false,
        }
    }
}

fn check_nalu_type(nalu: &Nalu, expected: &[NaluType]) -> ParseResult<()> {
    if expected.contains(&nalu.header.type_) {
        Ok(())
    } else {
        Err(invalid_stream!(
            "invalid NALU type, expected one of {:?}, got {:?}",
            expected,
            nalu.header.type_
        ))
    }
}

/// Reads the extension payload flags up to the RBSP trailing bits.
fn skip_extension_data(r: &mut BitReader) -> ParseResult<()> {
    let mut n = 0usize;
    while r.has_more_rsbp_data() {
        r.read_bit()?;
        n += 1;
    }

    if n > 0 {
        log::warn!("Skipped {} bits of extension data", n);
    }

    Ok(())
}

/// Reads rbsp_trailing_bits() and makes sure the structure did not read
/// past the end of its payload.
fn finish_rbsp(r: &mut BitReader) -> ParseResult<()> {
    r.read_trailing_bits()?;
    r.check_overrun()?;
    Ok(())
}

impl Parser {
    /// Creates a parser. If `emulation_prevention` is set, NALU payloads are
    /// expected to still contain emulation prevention bytes, which are then
    /// removed while reading.
    pub fn with_emulation_prevention(emulation_prevention: bool) -> Self {
        Self {
            emulation_prevention,
            ..Default::default()
        }
    }

    fn reader<'b>(&self, nalu: &Nalu<'b>) -> BitReader<'b> {
        BitReader::new(nalu.payload(), self.emulation_prevention)
    }

    fn parse_general_constraints_info(
        r: &mut BitReader,
    ) -> ParseResult<GeneralConstraintsInfo> {
        let mut gci = GeneralConstraintsInfo {
            gci_present_flag: r.read_bit()?,
            ..Default::default()
        };

        if gci.gci_present_flag {
            gci.gci_intra_only_constraint_flag = r.read_bit()?;
            gci.gci_all_layers_independent_constraint_flag = r.read_bit()?;
            gci.gci_one_au_only_constraint_flag = r.read_bit()?;
            gci.gci_sixteen_minus_max_bitdepth_constraint_idc = r.read_bits_max(4, 8)?;
            gci.gci_three_minus_max_chroma_format_constraint_idc = r.read_bits(2)?;
            gci.gci_no_mixed_nalu_types_in_pic_constraint_flag = r.read_bit()?;
            gci.gci_no_trail_constraint_flag = r.read_bit()?;
            gci.gci_no_stsa_constraint_flag = r.read_bit()?;
            gci.gci_no_rasl_constraint_flag = r.read_bit()?;
            gci.gci_no_radl_constraint_flag = r.read_bit()?;
            gci.gci_no_idr_constraint_flag = r.read_bit()?;
            gci.gci_no_cra_constraint_flag = r.read_bit()?;
            gci.gci_no_gdr_constraint_flag = r.read_bit()?;
            gci.gci_no_aps_constraint_flag = r.read_bit()?;
            gci.gci_no_idr_rpl_constraint_flag = r.read_bit()?;
            gci.gci_one_tile_per_pic_constraint_flag = r.read_bit()?;
            gci.gci_pic_header_in_slice_header_constraint_flag = r.read_bit()?;
            gci.gci_one_slice_per_pic_constraint_flag = r.read_bit()?;
            gci.gci_no_rectangular_slice_constraint_flag = r.read_bit()?;
            gci.gci_one_slice_per_subpic_constraint_flag = r.read_bit()?;
            gci.gci_no_subpic_info_constraint_flag = r.read_bit()?;
            gci.gci_three_minus_max_log2_ctu_size_constraint_idc = r.read_bits(2)?;
            gci.gci_no_partition_constraints_override_constraint_flag = r.read_bit()?;
            gci.gci_no_mtt_constraint_flag = r.read_bit()?;
            gci.gci_no_qtbtt_dual_tree_intra_constraint_flag = r.read_bit()?;
            gci.gci_no_palette_constraint_flag = r.read_bit()?;
            gci.gci_no_ibc_constraint_flag = r.read_bit()?;
            gci.gci_no_isp_constraint_flag = r.read_bit()?;
            gci.gci_no_mrl_constraint_flag = r.read_bit()?;
            gci.gci_no_mip_constraint_flag = r.read_bit()?;
            gci.gci_no_cclm_constraint_flag = r.read_bit()?;
            gci.gci_no_ref_pic_resampling_constraint_flag = r.read_bit()?;
            gci.gci_no_res_change_in_clvs_constraint_flag = r.read_bit()?;
            gci.gci_no_weighted_prediction_constraint_flag = r.read_bit()?;
            gci.gci_no_ref_wraparound_constraint_flag = r.read_bit()?;
            gci.gci_no_temporal_mvp_constraint_flag = r.read_bit()?;
            gci.gci_no_sbtmvp_constraint_flag = r.read_bit()?;
            gci.gci_no_amvr_constraint_flag = r.read_bit()?;
            gci.gci_no_bdof_constraint_flag = r.read_bit()?;
            gci.gci_no_smvd_constraint_flag = r.read_bit()?;
            gci.gci_no_dmvr_constraint_flag = r.read_bit()?;
            gci.gci_no_mmvd_constraint_flag = r.read_bit()?;
            gci.gci_no_affine_motion_constraint_flag = r.read_bit()?;
            gci.gci_no_prof_constraint_flag = r.read_bit()?;
            gci.gci_no_bcw_constraint_flag = r.read_bit()?;
            gci.gci_no_ciip_constraint_flag = r.read_bit()?;
            gci.gci_no_gpm_constraint_flag = r.read_bit()?;
            gci.gci_no_luma_transform_size_64_constraint_flag = r.read_bit()?;
            gci.gci_no_transform_skip_constraint_flag = r.read_bit()?;
            gci.gci_no_bdpcm_constraint_flag = r.read_bit()?;
            gci.gci_no_mts_constraint_flag = r.read_bit()?;
            gci.gci_no_lfnst_constraint_flag = r.read_bit()?;
            gci.gci_no_joint_cbcr_constraint_flag = r.read_bit()?;
            gci.gci_no_sbt_constraint_flag = r.read_bit()?;
            gci.gci_no_act_constraint_flag = r.read_bit()?;
            gci.gci_no_explicit_scaling_list_constraint_flag = r.read_bit()?;
            gci.gci_no_dep_quant_constraint_flag = r.read_bit()?;
            gci.gci_no_sign_data_hiding_constraint_flag = r.read_bit()?;
            gci.gci_no_cu_qp_delta_constraint_flag = r.read_bit()?;
            gci.gci_no_chroma_qp_offset_constraint_flag = r.read_bit()?;
            gci.gci_no_sao_constraint_flag = r.read_bit()?;
            gci.gci_no_alf_constraint_flag = r.read_bit()?;
            gci.gci_no_ccalf_constraint_flag = r.read_bit()?;
            gci.gci_no_lmcs_constraint_flag = r.read_bit()?;
            gci.gci_no_ladf_constraint_flag = r.read_bit()?;
            gci.gci_no_virtual_boundaries_constraint_flag = r.read_bit()?;

            gci.gci_num_additional_bits = r.read_bits(8)?;
            let mut num_additional_bits_used = 0;
            if gci.gci_num_additional_bits > 5 {
                gci.gci_all_rap_pictures_constraint_flag = r.read_bit()?;
                gci.gci_no_extended_precision_processing_constraint_flag = r.read_bit()?;
                gci.gci_no_ts_residual_coding_rice_constraint_flag = r.read_bit()?;
                gci.gci_no_rrc_rice_extension_constraint_flag = r.read_bit()?;
                gci.gci_no_persistent_rice_adaptation_constraint_flag = r.read_bit()?;
                gci.gci_no_reverse_last_sig_coeff_constraint_flag = r.read_bit()?;
                num_additional_bits_used = 6;
            }

            // gci_reserved_bit
            r.skip_bits(usize::from(gci.gci_num_additional_bits) - num_additional_bits_used)?;
        }

        // gci_alignment_zero_bit
        if !r.skip_to_byte_boundary()? {
            log::warn!("Non-zero gci_alignment_zero_bit");
        }

        Ok(gci)
    }

    /// Parses profile_tier_level(). When the profile and tier are not
    /// present they are copied from `prev`.
    fn parse_profile_tier_level(
        r: &mut BitReader,
        profile_tier_present_flag: bool,
        max_num_sub_layers_minus1: u8,
        prev: Option<&ProfileTierLevel>,
    ) -> ParseResult<ProfileTierLevel> {
        let mut ptl = ProfileTierLevel::default();

        if profile_tier_present_flag {
            ptl.general_profile_idc = r.read_bits(7)?;
            ptl.general_tier_flag = r.read_bit()?;
        } else if let Some(prev) = prev {
            ptl.general_profile_idc = prev.general_profile_idc;
            ptl.general_tier_flag = prev.general_tier_flag;
            ptl.general_constraints_info = prev.general_constraints_info.clone();
            ptl.ptl_num_sub_profiles = prev.ptl_num_sub_profiles;
            ptl.general_sub_profile_idc = prev.general_sub_profile_idc.clone();
        } else {
            return Err(invalid_stream!("the first profile_tier_level() must carry a profile"));
        }

        let level: u8 = r.read_bits(8)?;
        ptl.general_level_idc =
            Level::n(level).ok_or_else(|| invalid_stream!("invalid general_level_idc {}", level))?;
        ptl.ptl_frame_only_constraint_flag = r.read_bit()?;
        ptl.ptl_multilayer_enabled_flag = r.read_bit()?;

        if profile_tier_present_flag {
            ptl.general_constraints_info = Self::parse_general_constraints_info(r)?;
        }

        let max = usize::from(max_num_sub_layers_minus1);
        for i in (0..max).rev() {
            ptl.ptl_sublayer_level_present_flag[i] = r.read_bit()?;
        }

        // ptl_reserved_zero_bit
        r.skip_to_byte_boundary()?;

        for i in (0..max).rev() {
            if ptl.ptl_sublayer_level_present_flag[i] {
                ptl.sublayer_level_idc[i] = r.read_bits(8)?;
            }
        }

        // Sublayers that do not signal a level share the one of the next
        // higher sublayer.
        ptl.sublayer_level_idc[max] = level;
        for i in (0..max).rev() {
            if !ptl.ptl_sublayer_level_present_flag[i] {
                ptl.sublayer_level_idc[i] = ptl.sublayer_level_idc[i + 1];
            }
        }

        if profile_tier_present_flag {
            ptl.ptl_num_sub_profiles = r.read_bits(8)?;
            ptl.general_sub_profile_idc = (0..ptl.ptl_num_sub_profiles)
                .map(|_| r.read_bits::<u32>(32))
                .collect::<Result<_, _>>()?;
        }

        Ok(ptl)
    }

    fn parse_dpb_parameters(
        r: &mut BitReader,
        max_sub_layers_minus1: u8,
        sub_layer_info_flag: bool,
    ) -> ParseResult<DpbParameters> {
        let mut dpb = DpbParameters::default();
        let max = usize::from(max_sub_layers_minus1);
        let first = if sub_layer_info_flag { 0 } else { max };

        for i in first..=max {
            dpb.dpb_max_dec_pic_buffering_minus1[i] = r.read_ue_max(MAX_DPB_SIZE as u32 - 1)?;
            dpb.dpb_max_num_reorder_pics[i] =
                r.read_ue_max(dpb.dpb_max_dec_pic_buffering_minus1[i])?;
            dpb.dpb_max_latency_increase_plus1[i] = r.read_ue_max(u32::MAX - 1)?;
        }

        for i in 0..first {
            dpb.dpb_max_dec_pic_buffering_minus1[i] = dpb.dpb_max_dec_pic_buffering_minus1[max];
            dpb.dpb_max_num_reorder_pics[i] = dpb.dpb_max_num_reorder_pics[max];
            dpb.dpb_max_latency_increase_plus1[i] = dpb.dpb_max_latency_increase_plus1[max];
        }

        Ok(dpb)
    }

    fn parse_general_timing_hrd_parameters(
        r: &mut BitReader,
    ) -> ParseResult<GeneralTimingHrdParameters> {
        let mut hrd = GeneralTimingHrdParameters {
            num_units_in_tick: r.read_bits(32)?,
            time_scale: r.read_bits(32)?,
            general_nal_hrd_params_present_flag: r.read_bit()?,
            general_vcl_hrd_params_present_flag: r.read_bit()?,
            ..Default::default()
        };

        if hrd.num_units_in_tick == 0 || hrd.time_scale == 0 {
            return Err(invalid_stream!(
                "invalid timing info {}/{}",
                hrd.num_units_in_tick,
                hrd.time_scale
            ));
        }

        if hrd.general_nal_hrd_params_present_flag || hrd.general_vcl_hrd_params_present_flag {
            hrd.general_same_pic_timing_in_all_ols_flag = r.read_bit()?;
            hrd.general_du_hrd_params_present_flag = r.read_bit()?;
            if hrd.general_du_hrd_params_present_flag {
                hrd.tick_divisor_minus2 = r.read_bits(8)?;
            }

            hrd.bit_rate_scale = r.read_bits(4)?;
            hrd.cpb_size_scale = r.read_bits(4)?;
            if hrd.general_du_hrd_params_present_flag {
                hrd.cpb_size_du_scale = r.read_bits(4)?;
            }

            hrd.hrd_cpb_cnt_minus1 = r.read_ue_max(MAX_CPB_CNT - 1)?;
        }

        Ok(hrd)
    }

    fn parse_sublayer_hrd_parameters(
        r: &mut BitReader,
        general: &GeneralTimingHrdParameters,
    ) -> ParseResult<SublayerHrdParameters> {
        let mut hrd = SublayerHrdParameters::default();

        for _ in 0..=general.hrd_cpb_cnt_minus1 {
            hrd.bit_rate_value_minus1.push(r.read_ue_max(u32::MAX - 1)?);
            hrd.cpb_size_value_minus1.push(r.read_ue_max(u32::MAX - 1)?);
            if general.general_du_hrd_params_present_flag {
                hrd.cpb_size_du_value_minus1.push(r.read_ue_max(u32::MAX - 1)?);
                hrd.bit_rate_du_value_minus1.push(r.read_ue_max(u32::MAX - 1)?);
            }
            hrd.cbr_flag.push(r.read_bit()?);
        }

        Ok(hrd)
    }

    fn parse_ols_timing_hrd_parameters(
        r: &mut BitReader,
        general: &GeneralTimingHrdParameters,
        first_sub_layer: u8,
        max_sub_layers_val: u8,
    ) -> ParseResult<OlsTimingHrdParameters> {
        let mut hrd = OlsTimingHrdParameters::default();

        for i in usize::from(first_sub_layer)..=usize::from(max_sub_layers_val) {
            hrd.fixed_pic_rate_general_flag[i] = r.read_bit()?;
            hrd.fixed_pic_rate_within_cvs_flag[i] = if hrd.fixed_pic_rate_general_flag[i] {
                true
            } else {
                r.read_bit()?
            };

            if hrd.fixed_pic_rate_within_cvs_flag[i] {
                hrd.elemental_duration_in_tc_minus1[i] = r.read_ue_max(2047)?;
            } else if (general.general_nal_hrd_params_present_flag
                || general.general_vcl_hrd_params_present_flag)
                && general.hrd_cpb_cnt_minus1 == 0
            {
                hrd.low_delay_hrd_flag[i] = r.read_bit()?;
            }

            if general.general_nal_hrd_params_present_flag {
                hrd.nal_sublayer_hrd_parameters[i] =
                    Self::parse_sublayer_hrd_parameters(r, general)?;
            }

            if general.general_vcl_hrd_params_present_flag {
                hrd.vcl_sublayer_hrd_parameters[i] =
                    Self::parse_sublayer_hrd_parameters(r, general)?;
            }
        }

        Ok(hrd)
    }

    fn parse_vui_parameters(r: &mut BitReader) -> ParseResult<VuiParameters> {
        let mut vui = VuiParameters {
            vui_progressive_source_flag: r.read_bit()?,
            vui_interlaced_source_flag: r.read_bit()?,
            vui_non_packed_constraint_flag: r.read_bit()?,
            vui_non_projected_constraint_flag: r.read_bit()?,
            vui_aspect_ratio_info_present_flag: r.read_bit()?,
            ..Default::default()
        };

        if vui.vui_aspect_ratio_info_present_flag {
            vui.vui_aspect_ratio_constant_flag = r.read_bit()?;
            vui.vui_aspect_ratio_idc = r.read_bits(8)?;
            if vui.vui_aspect_ratio_idc == 255 {
                vui.vui_sar_width = r.read_bits(16)?;
                vui.vui_sar_height = r.read_bits(16)?;
            }
        }

        vui.vui_overscan_info_present_flag = r.read_bit()?;
        if vui.vui_overscan_info_present_flag {
            vui.vui_overscan_appropriate_flag = r.read_bit()?;
        }

        vui.vui_colour_description_present_flag = r.read_bit()?;
        if vui.vui_colour_description_present_flag {
            vui.vui_colour_primaries = r.read_bits(8)?;
            vui.vui_transfer_characteristics = r.read_bits(8)?;
            vui.vui_matrix_coeffs = r.read_bits(8)?;
            vui.vui_full_range_flag = r.read_bit()?;
        }

        vui.vui_chroma_loc_info_present_flag = r.read_bit()?;
        if vui.vui_chroma_loc_info_present_flag {
            if vui.vui_progressive_source_flag && !vui.vui_interlaced_source_flag {
                vui.vui_chroma_sample_loc_type_frame = r.read_ue_max(6)?;
            } else {
                vui.vui_chroma_sample_loc_type_top_field = r.read_ue_max(6)?;
                vui.vui_chroma_sample_loc_type_bottom_field = r.read_ue_max(6)?;
            }
        }

        Ok(vui)
    }

    /// Derives the layer dependency and output layer set variables of
    /// 7.4.3.3.
    fn derive_vps_ols(vps: &mut Vps) -> ParseResult<()> {
        let num_layers = usize::from(vps.vps_max_layers_minus1) + 1;

        vps.general_layer_idx = vec![0; MAX_LAYERS];
        for (i, &layer_id) in vps.vps_layer_id.iter().enumerate() {
            vps.general_layer_idx[usize::from(layer_id)] = i as u8;
        }

        // dependencyFlag is the transitive closure of the direct references.
        let mut dependency = vps.vps_direct_ref_layer_flag.clone();
        for i in 0..num_layers {
            for j in 0..num_layers {
                let indirect = (0..i).any(|k| dependency[i][k] && dependency[k][j]);
                dependency[i][j] |= indirect;
            }
        }

        vps.direct_ref_layer_idx = vec![vec![]; num_layers];
        vps.reference_layer_idx = vec![vec![]; num_layers];
        vps.layer_used_as_ref_layer_flag = vec![false; num_layers];
        for i in 0..num_layers {
            for j in 0..num_layers {
                if vps.vps_direct_ref_layer_flag[i][j] {
                    vps.direct_ref_layer_idx[i].push(j as u8);
                    vps.layer_used_as_ref_layer_flag[j] = true;
                }
                if dependency[i][j] {
                    vps.reference_layer_idx[i].push(j as u8);
                }
            }
        }

        vps.total_num_olss = if vps.vps_each_layer_is_an_ols_flag || vps.vps_ols_mode_idc < 2 {
            num_layers as u32
        } else {
            u32::from(vps.vps_num_output_layer_sets_minus2) + 2
        };

        let total = vps.total_num_olss as usize;
        vps.num_output_layers_in_ols = vec![0; total];
        vps.output_layer_id_in_ols = vec![vec![]; total];
        vps.num_layers_in_ols = vec![0; total];
        vps.layer_id_in_ols = vec![vec![]; total];
        vps.layer_used_as_output_layer_flag = vec![false; num_layers];

        vps.num_output_layers_in_ols[0] = 1;
        vps.output_layer_id_in_ols[0] = vec![vps.vps_layer_id[0]];
        vps.num_layers_in_ols[0] = 1;
        vps.layer_id_in_ols[0] = vec![vps.vps_layer_id[0]];
        vps.layer_used_as_output_layer_flag[0] = true;
        for i in 1..num_layers {
            vps.layer_used_as_output_layer_flag[i] =
                vps.vps_each_layer_is_an_ols_flag || vps.vps_ols_mode_idc < 2;
        }

        for i in 1..total {
            if vps.vps_each_layer_is_an_ols_flag {
                vps.output_layer_id_in_ols[i] = vec![vps.vps_layer_id[i]];
                vps.layer_id_in_ols[i] = vec![vps.vps_layer_id[i]];
            } else if vps.vps_ols_mode_idc == 0 {
                vps.output_layer_id_in_ols[i] = vec![vps.vps_layer_id[i]];
                vps.layer_id_in_ols[i] = vps.vps_layer_id[..=i].to_vec();
            } else if vps.vps_ols_mode_idc == 1 {
                vps.output_layer_id_in_ols[i] = vps.vps_layer_id[..=i].to_vec();
                vps.layer_id_in_ols[i] = vps.vps_layer_id[..=i].to_vec();
            } else {
                let mut included = vec![false; num_layers];
                for k in 0..num_layers {
                    if vps.vps_ols_output_layer_flag[i][k] {
                        included[k] = true;
                        vps.layer_used_as_output_layer_flag[k] = true;
                        vps.output_layer_id_in_ols[i].push(vps.vps_layer_id[k]);
                        for &r in &vps.reference_layer_idx[k] {
                            included[usize::from(r)] = true;
                        }
                    }
                }

                if vps.output_layer_id_in_ols[i].is_empty() {
                    return Err(invalid_stream!("OLS {} has no output layer", i));
                }

                vps.layer_id_in_ols[i] = (0..num_layers)
                    .filter(|&k| included[k])
                    .map(|k| vps.vps_layer_id[k])
                    .collect();
            }

            vps.num_output_layers_in_ols[i] = vps.output_layer_id_in_ols[i].len() as u32;
            vps.num_layers_in_ols[i] = vps.layer_id_in_ols[i].len() as u32;
        }

        for i in 0..num_layers {
            if !vps.layer_used_as_output_layer_flag[i] && !vps.layer_used_as_ref_layer_flag[i] {
                return Err(invalid_stream!(
                    "layer {} is neither an output nor a reference layer",
                    i
                ));
            }
        }

        vps.multi_layer_ols_idx = vec![0; total];
        vps.num_multi_layer_olss = 0;
        for i in 0..total {
            if vps.num_layers_in_ols[i] > 1 {
                vps.multi_layer_ols_idx[i] = vps.num_multi_layer_olss;
                vps.num_multi_layer_olss += 1;
            }
        }

        Ok(())
    }

    /// Parses a VPS and stores it.
    pub fn parse_vps(&mut self, nalu: &Nalu) -> ParseResult<Rc<Vps>> {
        check_nalu_type(nalu, &[NaluType::VpsNut])?;

        let mut r = self.reader(nalu);
        let mut vps = Vps {
            vps_video_parameter_set_id: r.read_bits(4)?,
            vps_max_layers_minus1: r.read_bits(6)?,
            vps_max_sublayers_minus1: r.read_bits_max(3, MAX_SUB_LAYERS as u32 - 1)?,
            vps_default_ptl_dpb_hrd_max_tid_flag: true,
            vps_all_independent_layers_flag: true,
            ..Default::default()
        };

        if vps.vps_video_parameter_set_id == 0 {
            return Err(invalid_stream!("vps_video_parameter_set_id must not be 0"));
        }

        let num_layers = usize::from(vps.vps_max_layers_minus1) + 1;
        if vps.vps_max_layers_minus1 > 0 && vps.vps_max_sublayers_minus1 > 0 {
            vps.vps_default_ptl_dpb_hrd_max_tid_flag = r.read_bit()?;
        }
        if vps.vps_max_layers_minus1 > 0 {
            vps.vps_all_independent_layers_flag = r.read_bit()?;
        }

        vps.vps_independent_layer_flag = vec![true; num_layers];
        vps.vps_max_tid_ref_present_flag = vec![false; num_layers];
        vps.vps_direct_ref_layer_flag = vec![vec![false; num_layers]; num_layers];
        vps.vps_max_tid_il_ref_pics_plus1 =
            vec![vec![vps.vps_max_sublayers_minus1 + 1; num_layers]; num_layers];

        for i in 0..num_layers {
            let layer_id: u8 = r.read_bits(6)?;
            if let Some(&prev) = vps.vps_layer_id.last() {
                if layer_id <= prev {
                    return Err(invalid_stream!("vps_layer_id {} is not increasing", layer_id));
                }
            }
            vps.vps_layer_id.push(layer_id);

            if i > 0 && !vps.vps_all_independent_layers_flag {
                vps.vps_independent_layer_flag[i] = r.read_bit()?;
                if !vps.vps_independent_layer_flag[i] {
                    vps.vps_max_tid_ref_present_flag[i] = r.read_bit()?;
                    for j in 0..i {
                        vps.vps_direct_ref_layer_flag[i][j] = r.read_bit()?;
                        if vps.vps_max_tid_ref_present_flag[i]
                            && vps.vps_direct_ref_layer_flag[i][j]
                        {
                            vps.vps_max_tid_il_ref_pics_plus1[i][j] = r.read_bits(3)?;
                        }
                    }

                    if !vps.vps_direct_ref_layer_flag[i].iter().any(|f| *f) {
                        return Err(invalid_stream!("dependent layer {} has no reference layer", i));
                    }
                }
            }
        }

        vps.vps_each_layer_is_an_ols_flag = num_layers == 1;
        vps.vps_ols_mode_idc = 2;
        if vps.vps_max_layers_minus1 > 0 {
            if vps.vps_all_independent_layers_flag {
                vps.vps_each_layer_is_an_ols_flag = r.read_bit()?;
            }

            if !vps.vps_each_layer_is_an_ols_flag {
                if !vps.vps_all_independent_layers_flag {
                    vps.vps_ols_mode_idc = r.read_bits_max(2, 2)?;
                }

                if vps.vps_ols_mode_idc == 2 {
                    vps.vps_num_output_layer_sets_minus2 = r.read_bits(8)?;
                    let num_olss = usize::from(vps.vps_num_output_layer_sets_minus2) + 2;
                    vps.vps_ols_output_layer_flag = vec![vec![false; num_layers]; num_olss];
                    for i in 1..num_olss {
                        for j in 0..num_layers {
                            vps.vps_ols_output_layer_flag[i][j] = r.read_bit()?;
                        }
                    }
                }
            }
        }

        Self::derive_vps_ols(&mut vps)?;

        if vps.vps_max_layers_minus1 > 0 {
            vps.vps_num_ptls_minus1 = r.read_bits(8)?;
            if u32::from(vps.vps_num_ptls_minus1) >= vps.total_num_olss {
                return Err(invalid_stream!(
                    "vps_num_ptls_minus1 {} exceeds TotalNumOlss",
                    vps.vps_num_ptls_minus1
                ));
            }
        }

        let num_ptls = usize::from(vps.vps_num_ptls_minus1) + 1;
        vps.vps_pt_present_flag = vec![true; num_ptls];
        vps.vps_ptl_max_tid = vec![vps.vps_max_sublayers_minus1; num_ptls];
        for i in 0..num_ptls {
            if i > 0 {
                vps.vps_pt_present_flag[i] = r.read_bit()?;
            }
            if !vps.vps_default_ptl_dpb_hrd_max_tid_flag {
                vps.vps_ptl_max_tid[i] = r.read_bits_max(3, vps.vps_max_sublayers_minus1.into())?;
            }
        }

        // vps_ptl_alignment_zero_bit
        r.skip_to_byte_boundary()?;

        for i in 0..num_ptls {
            let ptl = Self::parse_profile_tier_level(
                &mut r,
                vps.vps_pt_present_flag[i],
                vps.vps_ptl_max_tid[i],
                vps.profile_tier_level.last(),
            )?;
            vps.profile_tier_level.push(ptl);
        }

        let total = vps.total_num_olss as usize;
        vps.vps_ols_ptl_idx = (0..total)
            .map(|i| if num_ptls == total { i as u8 } else { 0 })
            .collect();
        if vps.vps_num_ptls_minus1 > 0 && num_ptls != total {
            for i in 0..total {
                vps.vps_ols_ptl_idx[i] = r.read_bits_max(8, u32::from(vps.vps_num_ptls_minus1))?;
            }
        }

        if !vps.vps_each_layer_is_an_ols_flag {
            let num_multi = vps.num_multi_layer_olss;
            if num_multi == 0 {
                return Err(invalid_stream!("no multi-layer OLS in a multi-layer VPS"));
            }

            vps.vps_num_dpb_params_minus1 = r.read_ue_max(num_multi - 1)?;
            if vps.vps_max_sublayers_minus1 > 0 {
                vps.vps_sublayer_dpb_params_present_flag = r.read_bit()?;
            }

            let num_dpb_params = vps.num_dpb_params() as usize;
            vps.vps_dpb_max_tid = vec![vps.vps_max_sublayers_minus1; num_dpb_params];
            for i in 0..num_dpb_params {
                if !vps.vps_default_ptl_dpb_hrd_max_tid_flag {
                    vps.vps_dpb_max_tid[i] =
                        r.read_bits_max(3, vps.vps_max_sublayers_minus1.into())?;
                }
                let dpb = Self::parse_dpb_parameters(
                    &mut r,
                    vps.vps_dpb_max_tid[i],
                    vps.vps_sublayer_dpb_params_present_flag,
                )?;
                vps.dpb_parameters.push(dpb);
            }

            for i in 0..num_multi as usize {
                vps.vps_ols_dpb_pic_width.push(r.read_ue()?);
                vps.vps_ols_dpb_pic_height.push(r.read_ue()?);
                vps.vps_ols_dpb_chroma_format.push(r.read_bits(2)?);
                vps.vps_ols_dpb_bitdepth_minus8.push(r.read_ue_max(8)?);
                let idx = if num_dpb_params > 1 && num_dpb_params != num_multi as usize {
                    r.read_ue_max(num_dpb_params as u32 - 1)?
                } else if num_dpb_params == 1 {
                    0
                } else {
                    i as u32
                };
                vps.vps_ols_dpb_params_idx.push(idx);
            }

            vps.vps_timing_hrd_params_present_flag = r.read_bit()?;
            if vps.vps_timing_hrd_params_present_flag {
                vps.general_timing_hrd_parameters =
                    Self::parse_general_timing_hrd_parameters(&mut r)?;
                if vps.vps_max_sublayers_minus1 > 0 {
                    vps.vps_sublayer_cpb_params_present_flag = r.read_bit()?;
                }

                vps.vps_num_ols_timing_hrd_params_minus1 = r.read_ue_max(num_multi - 1)?;
                let num_hrd = vps.vps_num_ols_timing_hrd_params_minus1 as usize + 1;
                vps.vps_hrd_max_tid = vec![vps.vps_max_sublayers_minus1; num_hrd];
                for i in 0..num_hrd {
                    if !vps.vps_default_ptl_dpb_hrd_max_tid_flag {
                        vps.vps_hrd_max_tid[i] =
                            r.read_bits_max(3, vps.vps_max_sublayers_minus1.into())?;
                    }
                    let first_sub_layer = if vps.vps_sublayer_cpb_params_present_flag {
                        0
                    } else {
                        vps.vps_hrd_max_tid[i]
                    };
                    let hrd = Self::parse_ols_timing_hrd_parameters(
                        &mut r,
                        &vps.general_timing_hrd_parameters,
                        first_sub_layer,
                        vps.vps_hrd_max_tid[i],
                    )?;
                    vps.ols_timing_hrd_parameters.push(hrd);
                }

                vps.vps_ols_timing_hrd_idx = (0..num_multi)
                    .map(|i| if num_hrd == num_multi as usize { i } else { 0 })
                    .collect();
                if num_hrd > 1 && num_hrd != num_multi as usize {
                    for i in 0..num_multi as usize {
                        vps.vps_ols_timing_hrd_idx[i] = r.read_ue_max(num_hrd as u32 - 1)?;
                    }
                }
            }
        }

        vps.vps_extension_flag = r.read_bit()?;
        if vps.vps_extension_flag {
            skip_extension_data(&mut r)?;
        }

        finish_rbsp(&mut r)?;

        log::debug!(
            "VPS {}: {} layer(s), {} OLS(s)",
            vps.vps_video_parameter_set_id,
            num_layers,
            vps.total_num_olss
        );

        let key = usize::from(vps.vps_video_parameter_set_id);
        Ok(self.active_vpses.add_header(key, vps)?)
    }

    /// Parses ref_pic_list_struct(list_idx, rpls_idx). `num_direct_ref_layers`
    /// bounds the inter-layer reference indices.
    fn parse_ref_pic_list_struct(
        r: &mut BitReader,
        sps: &Sps,
        list_idx: usize,
        rpls_idx: usize,
        num_direct_ref_layers: usize,
    ) -> ParseResult<RefPicListStruct> {
        let mut rpl = RefPicListStruct {
            num_ref_entries: r.read_ue_max(MAX_NUM_REF_ENTRIES as u32 - 1)?,
            ltrp_in_header_flag: true,
            ..Default::default()
        };

        if sps.sps_long_term_ref_pics_flag
            && rpls_idx < usize::from(sps.sps_num_ref_pic_lists[list_idx])
            && rpl.num_ref_entries > 0
        {
            rpl.ltrp_in_header_flag = r.read_bit()?;
        }

        let poc_lsb_bits = usize::from(sps.sps_log2_max_pic_order_cnt_lsb_minus4) + 4;
        let weighted = sps.sps_weighted_pred_flag || sps.sps_weighted_bipred_flag;
        let mut num_ltrp = 0;

        for i in 0..usize::from(rpl.num_ref_entries) {
            if sps.sps_inter_layer_prediction_enabled_flag {
                rpl.inter_layer_ref_pic_flag[i] = r.read_bit()?;
            }

            if rpl.inter_layer_ref_pic_flag[i] {
                if num_direct_ref_layers == 0 {
                    return Err(invalid_stream!("inter-layer entry without reference layers"));
                }
                rpl.ilrp_idx[i] = r.read_ue_max(num_direct_ref_layers as u32 - 1)?;
                continue;
            }

            rpl.st_ref_pic_flag[i] = true;
            if sps.sps_long_term_ref_pics_flag {
                rpl.st_ref_pic_flag[i] = r.read_bit()?;
            }

            if rpl.st_ref_pic_flag[i] {
                rpl.abs_delta_poc_st[i] = r.read_ue_max((1 << 15) - 1)?;

                let abs_delta = if weighted && i != 0 {
                    i32::from(rpl.abs_delta_poc_st[i])
                } else {
                    i32::from(rpl.abs_delta_poc_st[i]) + 1
                };

                if abs_delta > 0 {
                    rpl.strp_entry_sign_flag[i] = r.read_bit()?;
                }

                rpl.delta_poc_val_st[i] = if rpl.strp_entry_sign_flag[i] {
                    -abs_delta
                } else {
                    abs_delta
                };
            } else {
                if !rpl.ltrp_in_header_flag {
                    rpl.rpls_poc_lsb_lt[num_ltrp] = r.read_bits(poc_lsb_bits)?;
                }
                num_ltrp += 1;
            }
        }

        rpl.num_ltrp_entries = num_ltrp as u8;
        Ok(rpl)
    }

    /// Derives ChromaQpTable (equation 57).
    fn derive_chroma_qp_tables(sps: &mut Sps) -> ParseResult<()> {
        let qp_bd_offset = sps.qp_bd_offset();
        let table_len = (64 + qp_bd_offset) as usize;
        let clip = |v: i32| v.clamp(-qp_bd_offset, 63);

        if sps.sps_chroma_format_idc == 0 {
            let identity: Vec<i32> = (-qp_bd_offset..=63).collect();
            sps.chroma_qp_table = [identity.clone(), identity.clone(), identity];
            return Ok(());
        }

        let num_qp_tables = if sps.sps_same_qp_table_for_chroma_flag {
            1
        } else if sps.sps_joint_cbcr_enabled_flag {
            3
        } else {
            2
        };

        for i in 0..num_qp_tables {
            let mut table = vec![0i32; table_len];
            let num_points = usize::from(sps.sps_num_points_in_qp_table_minus1[i]) + 1;
            let mut qp_in = vec![i32::from(sps.sps_qp_table_start_minus26[i]) + 26];
            let mut qp_out = vec![qp_in[0]];

            for j in 0..num_points {
                let delta_in = i32::from(sps.sps_delta_qp_in_val_minus1[i][j]);
                let delta_diff = i32::from(sps.sps_delta_qp_diff_val[i][j]);
                qp_in.push(qp_in[j] + delta_in + 1);
                qp_out.push(qp_out[j] + (delta_in ^ delta_diff));
            }

            if qp_in[num_points] > 63 || qp_out.iter().any(|&v| v < -qp_bd_offset || v > 63) {
                return Err(invalid_stream!("chroma QP mapping table {} is out of range", i));
            }

            let idx = |qp: i32| (qp + qp_bd_offset) as usize;
            table[idx(qp_in[0])] = qp_out[0];
            for k in (-qp_bd_offset..qp_in[0]).rev() {
                table[idx(k)] = clip(table[idx(k + 1)] - 1);
            }

            for j in 0..num_points {
                let delta_in = i32::from(sps.sps_delta_qp_in_val_minus1[i][j]) + 1;
                let sh = delta_in >> 1;
                for (m, k) in ((qp_in[j] + 1)..=qp_in[j + 1]).enumerate() {
                    let m = m as i32 + 1;
                    table[idx(k)] =
                        table[idx(qp_in[j])] + ((qp_out[j + 1] - qp_out[j]) * m + sh) / delta_in;
                }
            }

            for k in (qp_in[num_points] + 1)..=63 {
                table[idx(k)] = clip(table[idx(k - 1)] + 1);
            }

            sps.chroma_qp_table[i] = table;
        }

        for i in num_qp_tables..3 {
            sps.chroma_qp_table[i] = sps.chroma_qp_table[num_qp_tables - 1].clone();
        }

        Ok(())
    }

    fn parse_sps_subpic_info(r: &mut BitReader, sps: &mut Sps) -> ParseResult<()> {
        let ctb_size = sps.ctb_size_y();
        let width = sps.sps_pic_width_max_in_luma_samples;
        let height = sps.sps_pic_height_max_in_luma_samples;
        let width_in_ctbs = sps.pic_width_max_in_ctbs();
        let height_in_ctbs = sps.pic_height_max_in_ctbs();

        sps.sps_num_subpics_minus1 =
            r.read_ue_max((MAX_SUBPICS as u32 - 1).min(width_in_ctbs * height_in_ctbs - 1))?;
        let num_subpics = usize::from(sps.sps_num_subpics_minus1) + 1;

        sps.sps_independent_subpics_flag = true;
        if num_subpics > 1 {
            sps.sps_independent_subpics_flag = r.read_bit()?;
            sps.sps_subpic_same_size_flag = r.read_bit()?;
        }

        sps.sps_subpic_ctu_top_left_x = vec![0; num_subpics];
        sps.sps_subpic_ctu_top_left_y = vec![0; num_subpics];
        sps.sps_subpic_width_minus1 = vec![0; num_subpics];
        sps.sps_subpic_height_minus1 = vec![0; num_subpics];
        sps.sps_subpic_treated_as_pic_flag = vec![true; num_subpics];
        sps.sps_loop_filter_across_subpic_enabled_flag = vec![false; num_subpics];

        let x_bits = Sps::subpic_pos_bits(width, ctb_size);
        let y_bits = Sps::subpic_pos_bits(height, ctb_size);

        for i in 0..num_subpics {
            if num_subpics == 1 {
                sps.sps_subpic_width_minus1[0] = width_in_ctbs - 1;
                sps.sps_subpic_height_minus1[0] = height_in_ctbs - 1;
                break;
            }

            if !sps.sps_subpic_same_size_flag || i == 0 {
                if i > 0 && width > ctb_size {
                    sps.sps_subpic_ctu_top_left_x[i] = r.read_bits(x_bits)?;
                }
                if i > 0 && height > ctb_size {
                    sps.sps_subpic_ctu_top_left_y[i] = r.read_bits(y_bits)?;
                }

                let x = sps.sps_subpic_ctu_top_left_x[i];
                let y = sps.sps_subpic_ctu_top_left_y[i];
                if x >= width_in_ctbs || y >= height_in_ctbs {
                    return Err(invalid_stream!("subpicture {} starts outside the picture", i));
                }

                sps.sps_subpic_width_minus1[i] = if i < num_subpics - 1 && width > ctb_size {
                    r.read_bits(x_bits)?
                } else {
                    width_in_ctbs - x - 1
                };
                sps.sps_subpic_height_minus1[i] = if i < num_subpics - 1 && height > ctb_size {
                    r.read_bits(y_bits)?
                } else {
                    height_in_ctbs - y - 1
                };
            } else {
                let sub_width = sps.sps_subpic_width_minus1[0] + 1;
                let sub_height = sps.sps_subpic_height_minus1[0] + 1;
                let num_cols = width_in_ctbs / sub_width;
                if num_cols == 0 {
                    return Err(invalid_stream!("subpicture wider than the picture"));
                }
                let i = i as u32;
                sps.sps_subpic_ctu_top_left_x[i as usize] = (i % num_cols) * sub_width;
                sps.sps_subpic_ctu_top_left_y[i as usize] = (i / num_cols) * sub_height;
                sps.sps_subpic_width_minus1[i as usize] = sub_width - 1;
                sps.sps_subpic_height_minus1[i as usize] = sub_height - 1;
            }

            if !sps.sps_independent_subpics_flag {
                sps.sps_subpic_treated_as_pic_flag[i] = r.read_bit()?;
                sps.sps_loop_filter_across_subpic_enabled_flag[i] = r.read_bit()?;
            }
        }

        sps.sps_subpic_id_len_minus1 = r.read_ue_max(15)?;
        if (1usize << (usize::from(sps.sps_subpic_id_len_minus1) + 1)) < num_subpics {
            return Err(invalid_stream!(
                "sps_subpic_id_len_minus1 {} cannot address {} subpictures",
                sps.sps_subpic_id_len_minus1,
                num_subpics
            ));
        }

        sps.sps_subpic_id_mapping_explicitly_signalled_flag = r.read_bit()?;
        if sps.sps_subpic_id_mapping_explicitly_signalled_flag {
            sps.sps_subpic_id_mapping_present_flag = r.read_bit()?;
            if sps.sps_subpic_id_mapping_present_flag {
                let bits = usize::from(sps.sps_subpic_id_len_minus1) + 1;
                sps.sps_subpic_id = (0..num_subpics)
                    .map(|_| r.read_bits::<u16>(bits))
                    .collect::<Result<_, _>>()?;
            }
        }

        Ok(())
    }

    /// Number of direct reference layers of the layer carrying a parameter
    /// set that refers to VPS `vps_id`.
    fn num_direct_ref_layers(&self, vps_id: u8, nuh_layer_id: u8) -> ParseResult<usize> {
        if vps_id == 0 {
            return Ok(0);
        }

        let vps = self
            .active_vpses
            .get_header(usize::from(vps_id))
            .ok_or(ParseError::MissingParameterSet {
                kind: "VPS",
                id: u32::from(vps_id),
            })?;

        Ok(vps.num_direct_ref_layers(nuh_layer_id))
    }

    /// Parses a SPS and stores it. Nothing is stored if any part of the SPS
    /// fails to parse.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> ParseResult<Rc<Sps>> {
        check_nalu_type(nalu, &[NaluType::SpsNut])?;

        let mut r = self.reader(nalu);
        let mut sps = Sps {
            sps_seq_parameter_set_id: r.read_bits(4)?,
            sps_video_parameter_set_id: r.read_bits(4)?,
            sps_max_sublayers_minus1: r.read_bits_max(3, MAX_SUB_LAYERS as u32 - 1)?,
            sps_chroma_format_idc: r.read_bits(2)?,
            sps_log2_ctu_size_minus5: r.read_bits_max(2, 2)?,
            sps_ptl_dpb_hrd_params_present_flag: r.read_bit()?,
            ..Default::default()
        };

        if sps.sps_video_parameter_set_id == 0 && !sps.sps_ptl_dpb_hrd_params_present_flag {
            return Err(invalid_stream!(
                "SPS without VPS must carry its profile, DPB and HRD parameters"
            ));
        }

        if sps.sps_video_parameter_set_id > 0 {
            if let Some(vps) = self
                .active_vpses
                .get_header(usize::from(sps.sps_video_parameter_set_id))
            {
                if sps.sps_max_sublayers_minus1 > vps.vps_max_sublayers_minus1 {
                    return Err(invalid_stream!(
                        "sps_max_sublayers_minus1 {} exceeds the VPS maximum {}",
                        sps.sps_max_sublayers_minus1,
                        vps.vps_max_sublayers_minus1
                    ));
                }
            }
        }

        if sps.sps_ptl_dpb_hrd_params_present_flag {
            sps.profile_tier_level =
                Self::parse_profile_tier_level(&mut r, true, sps.sps_max_sublayers_minus1, None)?;
        }

        sps.sps_gdr_enabled_flag = r.read_bit()?;
        sps.sps_ref_pic_resampling_enabled_flag = r.read_bit()?;
        if sps.sps_ref_pic_resampling_enabled_flag {
            sps.sps_res_change_in_clvs_allowed_flag = r.read_bit()?;
        }

        sps.sps_pic_width_max_in_luma_samples = r.read_ue()?;
        sps.sps_pic_height_max_in_luma_samples = r.read_ue()?;
        if sps.sps_pic_width_max_in_luma_samples == 0 || sps.sps_pic_height_max_in_luma_samples == 0
        {
            return Err(invalid_stream!(
                "invalid maximum picture size {}x{}",
                sps.sps_pic_width_max_in_luma_samples,
                sps.sps_pic_height_max_in_luma_samples
            ));
        }

        let (sub_width_c, sub_height_c) = sps.sub_width_height_c();
        sps.sps_conformance_window_flag = r.read_bit()?;
        if sps.sps_conformance_window_flag {
            sps.sps_conf_win_left_offset = r.read_ue()?;
            sps.sps_conf_win_right_offset = r.read_ue()?;
            sps.sps_conf_win_top_offset = r.read_ue()?;
            sps.sps_conf_win_bottom_offset = r.read_ue()?;

            let horizontal = u64::from(sps.sps_conf_win_left_offset)
                + u64::from(sps.sps_conf_win_right_offset);
            let vertical = u64::from(sps.sps_conf_win_top_offset)
                + u64::from(sps.sps_conf_win_bottom_offset);
            if horizontal * u64::from(sub_width_c)
                >= u64::from(sps.sps_pic_width_max_in_luma_samples)
                || vertical * u64::from(sub_height_c)
                    >= u64::from(sps.sps_pic_height_max_in_luma_samples)
            {
                return Err(invalid_stream!("conformance window larger than the picture"));
            }
        }

        sps.sps_subpic_info_present_flag = r.read_bit()?;
        if sps.sps_subpic_info_present_flag {
            Self::parse_sps_subpic_info(&mut r, &mut sps)?;
        } else {
            sps.sps_subpic_width_minus1 = vec![sps.pic_width_max_in_ctbs() - 1];
            sps.sps_subpic_height_minus1 = vec![sps.pic_height_max_in_ctbs() - 1];
            sps.sps_subpic_ctu_top_left_x = vec![0];
            sps.sps_subpic_ctu_top_left_y = vec![0];
            sps.sps_subpic_treated_as_pic_flag = vec![true];
            sps.sps_loop_filter_across_subpic_enabled_flag = vec![false];
            sps.sps_independent_subpics_flag = true;
        }

        sps.subpics = (0..=usize::from(sps.sps_num_subpics_minus1))
            .map(|i| SubpicRect {
                top_left_x: sps.sps_subpic_ctu_top_left_x[i],
                top_left_y: sps.sps_subpic_ctu_top_left_y[i],
                width: sps.sps_subpic_width_minus1[i] + 1,
                height: sps.sps_subpic_height_minus1[i] + 1,
            })
            .collect();
        sps.ctb_to_subpic_idx = tiles::subpic_ctu_map(
            sps.pic_width_max_in_ctbs(),
            sps.pic_height_max_in_ctbs(),
            &sps.subpics,
        )?;

        sps.sps_bitdepth_minus8 = r.read_ue_max(8)?;
        sps.sps_entropy_coding_sync_enabled_flag = r.read_bit()?;
        sps.sps_entry_point_offsets_present_flag = r.read_bit()?;
        sps.sps_log2_max_pic_order_cnt_lsb_minus4 = r.read_bits_max(4, 12)?;
        sps.sps_poc_msb_cycle_flag = r.read_bit()?;
        if sps.sps_poc_msb_cycle_flag {
            sps.sps_poc_msb_cycle_len_minus1 =
                r.read_ue_max(32 - u32::from(sps.sps_log2_max_pic_order_cnt_lsb_minus4) - 5)?;
        }

        sps.sps_num_extra_ph_bytes = r.read_bits_max(2, 2)?;
        sps.sps_extra_ph_bit_present_flag = (0..usize::from(sps.sps_num_extra_ph_bytes) * 8)
            .map(|_| r.read_bit())
            .collect::<Result<_, _>>()?;
        sps.sps_num_extra_sh_bytes = r.read_bits_max(2, 2)?;
        sps.sps_extra_sh_bit_present_flag = (0..usize::from(sps.sps_num_extra_sh_bytes) * 8)
            .map(|_| r.read_bit())
            .collect::<Result<_, _>>()?;

        if sps.sps_ptl_dpb_hrd_params_present_flag {
            if sps.sps_max_sublayers_minus1 > 0 {
                sps.sps_sublayer_dpb_params_flag = r.read_bit()?;
            }
            sps.dpb_parameters = Self::parse_dpb_parameters(
                &mut r,
                sps.sps_max_sublayers_minus1,
                sps.sps_sublayer_dpb_params_flag,
            )?;
        }

        let ctb_log2 = sps.ctb_log2_size_y();
        sps.sps_log2_min_luma_coding_block_size_minus2 = r.read_ue_max((ctb_log2 - 2).min(4))?;
        let min_cb_log2 = sps.min_cb_log2_size_y();

        let min_size = std::cmp::max(8, sps.min_cb_size_y());
        if sps.sps_pic_width_max_in_luma_samples % min_size != 0
            || sps.sps_pic_height_max_in_luma_samples % min_size != 0
        {
            return Err(invalid_stream!(
                "maximum picture size is not a multiple of {}",
                min_size
            ));
        }

        sps.sps_partition_constraints_override_enabled_flag = r.read_bit()?;
        sps.sps_log2_diff_min_qt_min_cb_intra_slice_luma =
            r.read_ue_max(ctb_log2.min(6) - min_cb_log2)?;
        sps.sps_max_mtt_hierarchy_depth_intra_slice_luma =
            r.read_ue_max(2 * (ctb_log2 - min_cb_log2))?;
        if sps.sps_max_mtt_hierarchy_depth_intra_slice_luma != 0 {
            let min_qt_log2 =
                min_cb_log2 + u32::from(sps.sps_log2_diff_min_qt_min_cb_intra_slice_luma);
            sps.sps_log2_diff_max_bt_min_qt_intra_slice_luma =
                r.read_ue_max(ctb_log2.saturating_sub(min_qt_log2))?;
            sps.sps_log2_diff_max_tt_min_qt_intra_slice_luma =
                r.read_ue_max(ctb_log2.min(6).saturating_sub(min_qt_log2))?;
        }

        if sps.sps_chroma_format_idc != 0 {
            sps.sps_qtbtt_dual_tree_intra_flag = r.read_bit()?;
        }

        if sps.sps_qtbtt_dual_tree_intra_flag {
            sps.sps_log2_diff_min_qt_min_cb_intra_slice_chroma =
                r.read_ue_max(ctb_log2.min(6) - min_cb_log2)?;
            sps.sps_max_mtt_hierarchy_depth_intra_slice_chroma =
                r.read_ue_max(2 * (ctb_log2 - min_cb_log2))?;
            if sps.sps_max_mtt_hierarchy_depth_intra_slice_chroma != 0 {
                let min_qt_log2 =
                    min_cb_log2 + u32::from(sps.sps_log2_diff_min_qt_min_cb_intra_slice_chroma);
                sps.sps_log2_diff_max_bt_min_qt_intra_slice_chroma =
                    r.read_ue_max(ctb_log2.min(6).saturating_sub(min_qt_log2))?;
                sps.sps_log2_diff_max_tt_min_qt_intra_slice_chroma =
                    r.read_ue_max(ctb_log2.min(6).saturating_sub(min_qt_log2))?;
            }
        }

        sps.sps_log2_diff_min_qt_min_cb_inter_slice =
            r.read_ue_max(ctb_log2.min(6) - min_cb_log2)?;
        sps.sps_max_mtt_hierarchy_depth_inter_slice =
            r.read_ue_max(2 * (ctb_log2 - min_cb_log2))?;
        if sps.sps_max_mtt_hierarchy_depth_inter_slice != 0 {
            let min_qt_log2 = min_cb_log2 + u32::from(sps.sps_log2_diff_min_qt_min_cb_inter_slice);
            sps.sps_log2_diff_max_bt_min_qt_inter_slice =
                r.read_ue_max(ctb_log2.saturating_sub(min_qt_log2))?;
            sps.sps_log2_diff_max_tt_min_qt_inter_slice =
                r.read_ue_max(ctb_log2.min(6).saturating_sub(min_qt_log2))?;
        }

        if sps.ctb_size_y() > 32 {
            sps.sps_max_luma_transform_size_64_flag = r.read_bit()?;
        }

        sps.sps_transform_skip_enabled_flag = r.read_bit()?;
        if sps.sps_transform_skip_enabled_flag {
            sps.sps_log2_transform_skip_max_size_minus2 = r.read_ue_max(3)?;
            sps.sps_bdpcm_enabled_flag = r.read_bit()?;
        }

        sps.sps_mts_enabled_flag = r.read_bit()?;
        if sps.sps_mts_enabled_flag {
            sps.sps_explicit_mts_intra_enabled_flag = r.read_bit()?;
            sps.sps_explicit_mts_inter_enabled_flag = r.read_bit()?;
        }

        sps.sps_lfnst_enabled_flag = r.read_bit()?;

        if sps.sps_chroma_format_idc != 0 {
            sps.sps_joint_cbcr_enabled_flag = r.read_bit()?;
            sps.sps_same_qp_table_for_chroma_flag = r.read_bit()?;
            let num_qp_tables = if sps.sps_same_qp_table_for_chroma_flag {
                1
            } else if sps.sps_joint_cbcr_enabled_flag {
                3
            } else {
                2
            };

            let qp_bd_offset = sps.qp_bd_offset();
            for i in 0..num_qp_tables {
                sps.sps_qp_table_start_minus26[i] = r.read_se_bounded(-26 - qp_bd_offset, 36)?;
                sps.sps_num_points_in_qp_table_minus1[i] = r.read_ue_max(
                    (36 - i32::from(sps.sps_qp_table_start_minus26[i])) as u32,
                )?;

                let num_points = usize::from(sps.sps_num_points_in_qp_table_minus1[i]) + 1;
                for _ in 0..num_points {
                    sps.sps_delta_qp_in_val_minus1[i].push(r.read_ue_max(63)?);
                    sps.sps_delta_qp_diff_val[i].push(r.read_ue_max(63)?);
                }
            }
        }

        Self::derive_chroma_qp_tables(&mut sps)?;

        sps.sps_sao_enabled_flag = r.read_bit()?;
        sps.sps_alf_enabled_flag = r.read_bit()?;
        if sps.sps_alf_enabled_flag && sps.sps_chroma_format_idc != 0 {
            sps.sps_ccalf_enabled_flag = r.read_bit()?;
        }

        sps.sps_lmcs_enabled_flag = r.read_bit()?;
        sps.sps_weighted_pred_flag = r.read_bit()?;
        sps.sps_weighted_bipred_flag = r.read_bit()?;
        sps.sps_long_term_ref_pics_flag = r.read_bit()?;
        if sps.sps_video_parameter_set_id > 0 {
            sps.sps_inter_layer_prediction_enabled_flag = r.read_bit()?;
        }
        sps.sps_idr_rpl_present_flag = r.read_bit()?;
        sps.sps_rpl1_same_as_rpl0_flag = r.read_bit()?;

        let num_direct_ref_layers = if sps.sps_inter_layer_prediction_enabled_flag {
            self.num_direct_ref_layers(sps.sps_video_parameter_set_id, nalu.header.nuh_layer_id)?
        } else {
            0
        };

        let num_lists = if sps.sps_rpl1_same_as_rpl0_flag { 1 } else { 2 };
        for i in 0..num_lists {
            sps.sps_num_ref_pic_lists[i] = r.read_ue_max(MAX_NUM_REF_PIC_LISTS as u32)?;
            for j in 0..usize::from(sps.sps_num_ref_pic_lists[i]) {
                let rpl =
                    Self::parse_ref_pic_list_struct(&mut r, &sps, i, j, num_direct_ref_layers)?;
                sps.ref_pic_list_struct[i].push(rpl);
            }
        }

        if sps.sps_rpl1_same_as_rpl0_flag {
            sps.sps_num_ref_pic_lists[1] = sps.sps_num_ref_pic_lists[0];
            sps.ref_pic_list_struct[1] = sps.ref_pic_list_struct[0].clone();
        }

        sps.sps_ref_wraparound_enabled_flag = r.read_bit()?;
        sps.sps_temporal_mvp_enabled_flag = r.read_bit()?;
        if sps.sps_temporal_mvp_enabled_flag {
            sps.sps_sbtmvp_enabled_flag = r.read_bit()?;
        }

        sps.sps_amvr_enabled_flag = r.read_bit()?;
        sps.sps_bdof_enabled_flag = r.read_bit()?;
        if sps.sps_bdof_enabled_flag {
            sps.sps_bdof_control_present_in_ph_flag = r.read_bit()?;
        }

        sps.sps_smvd_enabled_flag = r.read_bit()?;
        sps.sps_dmvr_enabled_flag = r.read_bit()?;
        if sps.sps_dmvr_enabled_flag {
            sps.sps_dmvr_control_present_in_ph_flag = r.read_bit()?;
        }

        sps.sps_mmvd_enabled_flag = r.read_bit()?;
        if sps.sps_mmvd_enabled_flag {
            sps.sps_mmvd_fullpel_only_enabled_flag = r.read_bit()?;
        }

        sps.sps_six_minus_max_num_merge_cand = r.read_ue_max(5)?;
        sps.sps_sbt_enabled_flag = r.read_bit()?;
        sps.sps_affine_enabled_flag = r.read_bit()?;
        if sps.sps_affine_enabled_flag {
            sps.sps_five_minus_max_num_subblock_merge_cand =
                r.read_ue_max(5 - u32::from(sps.sps_sbtmvp_enabled_flag))?;
            sps.sps_6param_affine_enabled_flag = r.read_bit()?;
            if sps.sps_amvr_enabled_flag {
                sps.sps_affine_amvr_enabled_flag = r.read_bit()?;
            }
            sps.sps_affine_prof_enabled_flag = r.read_bit()?;
            if sps.sps_affine_prof_enabled_flag {
                sps.sps_prof_control_present_in_ph_flag = r.read_bit()?;
            }
        }

        sps.sps_bcw_enabled_flag = r.read_bit()?;
        sps.sps_ciip_enabled_flag = r.read_bit()?;
        let max_num_merge_cand = sps.max_num_merge_cand();
        if max_num_merge_cand >= 2 {
            sps.sps_gpm_enabled_flag = r.read_bit()?;
            if sps.sps_gpm_enabled_flag && max_num_merge_cand >= 3 {
                sps.sps_max_num_merge_cand_minus_max_num_gpm_cand =
                    r.read_ue_max(max_num_merge_cand - 2)?;
            }
        }

        sps.sps_log2_parallel_merge_level_minus2 = r.read_ue_max(ctb_log2 - 2)?;
        sps.sps_isp_enabled_flag = r.read_bit()?;
        sps.sps_mrl_enabled_flag = r.read_bit()?;
        sps.sps_mip_enabled_flag = r.read_bit()?;
        if sps.sps_chroma_format_idc != 0 {
            sps.sps_cclm_enabled_flag = r.read_bit()?;
        }

        sps.sps_chroma_horizontal_collocated_flag = true;
        sps.sps_chroma_vertical_collocated_flag = true;
        if sps.sps_chroma_format_idc == 1 {
            sps.sps_chroma_horizontal_collocated_flag = r.read_bit()?;
            sps.sps_chroma_vertical_collocated_flag = r.read_bit()?;
        }

        sps.sps_palette_enabled_flag = r.read_bit()?;
        if sps.sps_chroma_format_idc == 3 && !sps.sps_max_luma_transform_size_64_flag {
            sps.sps_act_enabled_flag = r.read_bit()?;
        }

        if sps.sps_transform_skip_enabled_flag || sps.sps_palette_enabled_flag {
            sps.sps_min_qp_prime_ts = r.read_ue_max(8)?;
        }

        sps.sps_ibc_enabled_flag = r.read_bit()?;
        if sps.sps_ibc_enabled_flag {
            sps.sps_six_minus_max_num_ibc_merge_cand = r.read_ue_max(5)?;
        }

        sps.sps_ladf_enabled_flag = r.read_bit()?;
        if sps.sps_ladf_enabled_flag {
            sps.sps_num_ladf_intervals_minus2 = r.read_bits(2)?;
            sps.sps_ladf_lowest_interval_qp_offset = r.read_se_bounded(-63, 63)?;
            let max_threshold = (1u32 << sps.bit_depth()) - 3;
            for i in 0..usize::from(sps.sps_num_ladf_intervals_minus2) + 1 {
                sps.sps_ladf_qp_offset[i] = r.read_se_bounded(-63, 63)?;
                sps.sps_ladf_delta_threshold_minus1[i] = r.read_ue_max(max_threshold)?;
            }
        }

        sps.sps_explicit_scaling_list_enabled_flag = r.read_bit()?;
        if sps.sps_lfnst_enabled_flag && sps.sps_explicit_scaling_list_enabled_flag {
            sps.sps_scaling_matrix_for_lfnst_disabled_flag = r.read_bit()?;
        }

        if sps.sps_act_enabled_flag && sps.sps_explicit_scaling_list_enabled_flag {
            sps.sps_scaling_matrix_for_alternative_colour_space_disabled_flag = r.read_bit()?;
        }

        if sps.sps_scaling_matrix_for_alternative_colour_space_disabled_flag {
            sps.sps_scaling_matrix_designated_colour_space_flag = r.read_bit()?;
        }

        sps.sps_dep_quant_enabled_flag = r.read_bit()?;
        sps.sps_sign_data_hiding_enabled_flag = r.read_bit()?;
        sps.sps_virtual_boundaries_enabled_flag = r.read_bit()?;

        if sps.sps_virtual_boundaries_enabled_flag
            && sps
                .profile_tier_level
                .general_constraints_info
                .gci_no_virtual_boundaries_constraint_flag
        {
            return Err(invalid_stream!(
                "virtual boundaries enabled despite gci_no_virtual_boundaries_constraint_flag"
            ));
        }

        if sps.sps_virtual_boundaries_enabled_flag {
            sps.sps_virtual_boundaries_present_flag = r.read_bit()?;
            if sps.sps_virtual_boundaries_present_flag {
                let width = sps.sps_pic_width_max_in_luma_samples;
                let height = sps.sps_pic_height_max_in_luma_samples;

                sps.sps_num_ver_virtual_boundaries = r.read_ue_max(if width <= 8 { 0 } else { 3 })?;
                for i in 0..usize::from(sps.sps_num_ver_virtual_boundaries) {
                    sps.sps_virtual_boundary_pos_x_minus1[i] =
                        r.read_ue_max(width.div_ceil(8) - 2)?;
                }

                sps.sps_num_hor_virtual_boundaries =
                    r.read_ue_max(if height <= 8 { 0 } else { 3 })?;
                for i in 0..usize::from(sps.sps_num_hor_virtual_boundaries) {
                    sps.sps_virtual_boundary_pos_y_minus1[i] =
                        r.read_ue_max(height.div_ceil(8) - 2)?;
                }
            }
        }

        if sps.sps_ptl_dpb_hrd_params_present_flag {
            sps.sps_timing_hrd_params_present_flag = r.read_bit()?;
            if sps.sps_timing_hrd_params_present_flag {
                sps.general_timing_hrd_parameters =
                    Self::parse_general_timing_hrd_parameters(&mut r)?;
                if sps.sps_max_sublayers_minus1 > 0 {
                    sps.sps_sublayer_cpb_params_present_flag = r.read_bit()?;
                }

                let first_sub_layer = if sps.sps_sublayer_cpb_params_present_flag {
                    0
                } else {
                    sps.sps_max_sublayers_minus1
                };

                sps.ols_timing_hrd_parameters = Self::parse_ols_timing_hrd_parameters(
                    &mut r,
                    &sps.general_timing_hrd_parameters,
                    first_sub_layer,
                    sps.sps_max_sublayers_minus1,
                )?;
            }
        }

        sps.sps_field_seq_flag = r.read_bit()?;
        sps.sps_vui_parameters_present_flag = r.read_bit()?;
        if sps.sps_vui_parameters_present_flag {
            sps.sps_vui_payload_size_minus1 = r.read_ue_max(MAX_VUI_PAYLOAD_SIZE - 1)?;

            // sps_vui_alignment_zero_bit
            if !r.skip_to_byte_boundary()? {
                return Err(invalid_stream!("non-zero sps_vui_alignment_zero_bit"));
            }

            let payload_bits = (u64::from(sps.sps_vui_payload_size_minus1) + 1) * 8;
            let start = r.position();
            sps.vui_parameters = Self::parse_vui_parameters(&mut r)?;
            let consumed = r.position() - start;
            if consumed > payload_bits {
                return Err(invalid_stream!(
                    "VUI parameters use {} bits of a {} bit payload",
                    consumed,
                    payload_bits
                ));
            }

            // vui_payload_extension_data and the payload trailing bits.
            r.skip_bits((payload_bits - consumed) as usize)?;
        }

        sps.sps_extension_flag = r.read_bit()?;
        if sps.sps_extension_flag {
            sps.sps_range_extension_flag = r.read_bit()?;
            sps.sps_extension_7bits = r.read_bits(7)?;
        }

        if sps.sps_range_extension_flag {
            sps.sps_extended_precision_flag = r.read_bit()?;
            if sps.sps_transform_skip_enabled_flag {
                sps.sps_ts_residual_coding_rice_present_in_sh_flag = r.read_bit()?;
            }
            sps.sps_rrc_rice_extension_flag = r.read_bit()?;
            sps.sps_persistent_rice_adaptation_enabled_flag = r.read_bit()?;
            sps.sps_reverse_last_sig_coeff_enabled_flag = r.read_bit()?;
        }

        if sps.sps_extension_7bits != 0 {
            skip_extension_data(&mut r)?;
        }

        finish_rbsp(&mut r)?;

        log::debug!(
            "SPS {}: {}x{}, CTB {}, {} subpicture(s)",
            sps.sps_seq_parameter_set_id,
            sps.sps_pic_width_max_in_luma_samples,
            sps.sps_pic_height_max_in_luma_samples,
            sps.ctb_size_y(),
            sps.subpics.len()
        );

        let key = usize::from(sps.sps_seq_parameter_set_id);
        Ok(self.active_spses.add_header(key, sps)?)
    }

    /// Reads the rectangular slice loop of the PPS and turns it into the
    /// per-entry syntax consumed by the slice map derivation.
    fn parse_pps_rect_slices(
        r: &mut BitReader,
        pps: &mut Pps,
        layout: &TileLayout,
    ) -> ParseResult<Vec<RectSliceSyntax>> {
        let num_slices = pps.pps_num_slices_in_pic_minus1 as usize + 1;
        let cols = layout.num_tile_columns();
        let rows = layout.num_tile_rows();
        let num_tiles = layout.num_tiles();

        pps.pps_slice_width_in_tiles_minus1 = vec![0; num_slices];
        pps.pps_slice_height_in_tiles_minus1 = vec![0; num_slices];
        pps.pps_num_exp_slices_in_tile = vec![0; num_slices];
        pps.pps_exp_slice_height_in_ctus_minus1 = vec![vec![]; num_slices];
        pps.pps_tile_idx_delta_val = vec![0; num_slices];

        let mut entries = Vec::new();
        let mut tile_idx: i64 = 0;
        let mut i = 0;

        while i < num_slices - 1 {
            if tile_idx < 0 || tile_idx >= i64::from(num_tiles) {
                return Err(PartitionError::TileIndexOutOfRange {
                    idx: tile_idx,
                    num_tiles,
                }
                .into());
            }

            let top_left = tile_idx as u32;
            let tile_x = top_left % cols;
            let tile_y = top_left / cols;

            if tile_x != cols - 1 {
                pps.pps_slice_width_in_tiles_minus1[i] = r.read_ue_max(cols - 1 - tile_x)?;
            }

            if tile_y != rows - 1 && (pps.pps_tile_idx_delta_present_flag || tile_x == 0) {
                pps.pps_slice_height_in_tiles_minus1[i] = r.read_ue_max(rows - 1 - tile_y)?;
            } else if tile_y != rows - 1 && i > 0 {
                pps.pps_slice_height_in_tiles_minus1[i] =
                    pps.pps_slice_height_in_tiles_minus1[i - 1];
            }

            let width = pps.pps_slice_width_in_tiles_minus1[i] + 1;
            let height = pps.pps_slice_height_in_tiles_minus1[i] + 1;
            let row_height = layout.row_height[tile_y as usize];
            let first = i;
            let mut entry = RectSliceSyntax {
                top_left_tile_idx: top_left,
                width_in_tiles: width,
                height_in_tiles: height,
                slice_heights: vec![],
            };

            if width == 1 && height == 1 && row_height > 1 {
                pps.pps_num_exp_slices_in_tile[i] = r.read_ue_max(row_height - 1)?;
                let mut exp_heights = Vec::new();
                for _ in 0..pps.pps_num_exp_slices_in_tile[i] {
                    let h: u32 = r.read_ue_max(row_height - 1)?;
                    pps.pps_exp_slice_height_in_ctus_minus1[i].push(h);
                    exp_heights.push(h + 1);
                }

                let heights = tiles::slices_in_tile(row_height, &exp_heights)?;
                if heights.len() > 1 {
                    i += heights.len() - 1;
                    if i >= num_slices {
                        return Err(invalid_stream!(
                            "tile {} holds more slices than the picture",
                            top_left
                        ));
                    }
                    entry.slice_heights = heights;
                }
            }

            entries.push(entry);

            if pps.pps_tile_idx_delta_present_flag && i < num_slices - 1 {
                let max = i32::try_from(num_tiles).unwrap_or(i32::MAX) - 1;
                let delta: i32 = r.read_se_bounded(-max, max)?;
                if delta == 0 {
                    return Err(invalid_stream!("pps_tile_idx_delta_val[{}] is 0", i));
                }
                pps.pps_tile_idx_delta_val[i] = delta;
                tile_idx += i64::from(delta);
            } else {
                tile_idx += i64::from(pps.pps_slice_width_in_tiles_minus1[first] + 1);
                if tile_idx % i64::from(cols) == 0 {
                    tile_idx +=
                        i64::from(pps.pps_slice_height_in_tiles_minus1[first]) * i64::from(cols);
                }
            }

            i += 1;
        }

        if i == num_slices - 1 {
            // The last slice covers whatever the other ones left over.
            if tile_idx < 0 || tile_idx >= i64::from(num_tiles) {
                return Err(PartitionError::TileIndexOutOfRange {
                    idx: tile_idx,
                    num_tiles,
                }
                .into());
            }

            let top_left = tile_idx as u32;
            let width = cols - top_left % cols;
            let height = rows - top_left / cols;
            pps.pps_slice_width_in_tiles_minus1[i] = width - 1;
            pps.pps_slice_height_in_tiles_minus1[i] = height - 1;
            entries.push(RectSliceSyntax {
                top_left_tile_idx: top_left,
                width_in_tiles: width,
                height_in_tiles: height,
                slice_heights: vec![],
            });
        }

        Ok(entries)
    }

    /// Parses a PPS and stores it. The tile grid and slice maps are derived
    /// before the PPS is stored, so every slice referring to it can rely on
    /// them.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> ParseResult<Rc<Pps>> {
        check_nalu_type(nalu, &[NaluType::PpsNut])?;

        let mut r = self.reader(nalu);
        let mut pps = Pps {
            pps_pic_parameter_set_id: r.read_bits(6)?,
            pps_seq_parameter_set_id: r.read_bits(4)?,
            ..Default::default()
        };

        let sps = Rc::clone(
            self.active_spses
                .get_header(usize::from(pps.pps_seq_parameter_set_id))
                .ok_or(ParseError::MissingParameterSet {
                    kind: "SPS",
                    id: u32::from(pps.pps_seq_parameter_set_id),
                })?,
        );

        pps.pps_mixed_nalu_types_in_pic_flag = r.read_bit()?;
        pps.pps_pic_width_in_luma_samples =
            r.read_ue_bounded(1, sps.sps_pic_width_max_in_luma_samples)?;
        pps.pps_pic_height_in_luma_samples =
            r.read_ue_bounded(1, sps.sps_pic_height_max_in_luma_samples)?;

        let min_size = std::cmp::max(8, sps.min_cb_size_y());
        if pps.pps_pic_width_in_luma_samples % min_size != 0
            || pps.pps_pic_height_in_luma_samples % min_size != 0
        {
            return Err(invalid_stream!("picture size is not a multiple of {}", min_size));
        }

        let max_size = pps.pps_pic_width_in_luma_samples == sps.sps_pic_width_max_in_luma_samples
            && pps.pps_pic_height_in_luma_samples == sps.sps_pic_height_max_in_luma_samples;

        if !sps.sps_res_change_in_clvs_allowed_flag && !max_size {
            return Err(invalid_stream!(
                "picture size {}x{} differs from the SPS maximum",
                pps.pps_pic_width_in_luma_samples,
                pps.pps_pic_height_in_luma_samples
            ));
        }

        pps.pps_conformance_window_flag = r.read_bit()?;
        if pps.pps_conformance_window_flag {
            if max_size {
                return Err(invalid_stream!(
                    "pps_conformance_window_flag set for a picture of the maximum size"
                ));
            }
            pps.pps_conf_win_left_offset = r.read_ue()?;
            pps.pps_conf_win_right_offset = r.read_ue()?;
            pps.pps_conf_win_top_offset = r.read_ue()?;
            pps.pps_conf_win_bottom_offset = r.read_ue()?;
        } else if max_size {
            pps.pps_conf_win_left_offset = sps.sps_conf_win_left_offset;
            pps.pps_conf_win_right_offset = sps.sps_conf_win_right_offset;
            pps.pps_conf_win_top_offset = sps.sps_conf_win_top_offset;
            pps.pps_conf_win_bottom_offset = sps.sps_conf_win_bottom_offset;
        }

        pps.pps_scaling_window_explicit_signalling_flag = r.read_bit()?;
        if pps.pps_scaling_window_explicit_signalling_flag {
            if !sps.sps_ref_pic_resampling_enabled_flag {
                return Err(invalid_stream!("explicit scaling window without resampling"));
            }
            pps.pps_scaling_win_left_offset = r.read_se()?;
            pps.pps_scaling_win_right_offset = r.read_se()?;
            pps.pps_scaling_win_top_offset = r.read_se()?;
            pps.pps_scaling_win_bottom_offset = r.read_se()?;
        } else {
            pps.pps_scaling_win_left_offset = pps.pps_conf_win_left_offset as i32;
            pps.pps_scaling_win_right_offset = pps.pps_conf_win_right_offset as i32;
            pps.pps_scaling_win_top_offset = pps.pps_conf_win_top_offset as i32;
            pps.pps_scaling_win_bottom_offset = pps.pps_conf_win_bottom_offset as i32;
        }

        pps.pps_output_flag_present_flag = r.read_bit()?;
        pps.pps_no_pic_partition_flag = r.read_bit()?;
        pps.pps_subpic_id_mapping_present_flag = r.read_bit()?;

        if pps.pps_no_pic_partition_flag
            && (sps.sps_num_subpics_minus1 > 0 || pps.pps_mixed_nalu_types_in_pic_flag)
        {
            return Err(invalid_stream!(
                "pps_no_pic_partition_flag set with subpictures or mixed NALU types"
            ));
        }

        if sps.sps_num_subpics_minus1 > 0 && !max_size {
            return Err(invalid_stream!(
                "a picture with subpictures must have the maximum size"
            ));
        }

        let num_subpics = usize::from(sps.sps_num_subpics_minus1) + 1;
        if pps.pps_subpic_id_mapping_present_flag {
            if !sps.sps_subpic_id_mapping_explicitly_signalled_flag
                || sps.sps_subpic_id_mapping_present_flag
            {
                return Err(invalid_stream!("unexpected subpicture ID mapping in the PPS"));
            }

            if !pps.pps_no_pic_partition_flag {
                pps.pps_num_subpics_minus1 = r.read_ue()?;
                if pps.pps_num_subpics_minus1 != sps.sps_num_subpics_minus1 {
                    return Err(invalid_stream!(
                        "pps_num_subpics_minus1 {} differs from the SPS",
                        pps.pps_num_subpics_minus1
                    ));
                }
            }

            pps.pps_subpic_id_len_minus1 = r.read_ue_max(15)?;
            if pps.pps_subpic_id_len_minus1 != sps.sps_subpic_id_len_minus1 {
                return Err(invalid_stream!(
                    "pps_subpic_id_len_minus1 {} differs from the SPS",
                    pps.pps_subpic_id_len_minus1
                ));
            }

            let bits = usize::from(pps.pps_subpic_id_len_minus1) + 1;
            pps.pps_subpic_id = (0..num_subpics)
                .map(|_| r.read_bits::<u16>(bits))
                .collect::<Result<_, _>>()?;
        } else {
            pps.pps_num_subpics_minus1 = sps.sps_num_subpics_minus1;
            pps.pps_subpic_id_len_minus1 = sps.sps_subpic_id_len_minus1;
        }

        pps.subpic_id_val = (0..num_subpics)
            .map(|i| {
                if !sps.sps_subpic_id_mapping_explicitly_signalled_flag {
                    i as u16
                } else if pps.pps_subpic_id_mapping_present_flag {
                    pps.pps_subpic_id[i]
                } else {
                    sps.sps_subpic_id.get(i).copied().unwrap_or(i as u16)
                }
            })
            .collect();

        let mut sorted = pps.subpic_id_val.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != num_subpics {
            return Err(invalid_stream!("subpicture IDs are not unique"));
        }

        let ctb_size = sps.ctb_size_y();
        let width_in_ctbs = pps.pps_pic_width_in_luma_samples.div_ceil(ctb_size);
        let height_in_ctbs = pps.pps_pic_height_in_luma_samples.div_ceil(ctb_size);

        // Subpictures of this picture. Without subpicture information the
        // whole picture is a single subpicture.
        let subpics = if sps.sps_subpic_info_present_flag {
            sps.subpics.clone()
        } else {
            vec![SubpicRect {
                top_left_x: 0,
                top_left_y: 0,
                width: width_in_ctbs,
                height: height_in_ctbs,
            }]
        };

        pps.pps_rect_slice_flag = true;
        pps.pps_loop_filter_across_slices_enabled_flag = false;
        let layout;
        let mut rect_entries = None;

        if !pps.pps_no_pic_partition_flag {
            pps.pps_log2_ctu_size_minus5 = r.read_bits(2)?;
            if pps.pps_log2_ctu_size_minus5 != sps.sps_log2_ctu_size_minus5 {
                return Err(invalid_stream!(
                    "pps_log2_ctu_size_minus5 {} differs from the SPS",
                    pps.pps_log2_ctu_size_minus5
                ));
            }

            pps.pps_num_exp_tile_columns_minus1 = r.read_ue_max(width_in_ctbs - 1)?;
            pps.pps_num_exp_tile_rows_minus1 = r.read_ue_max(height_in_ctbs - 1)?;
            for _ in 0..=pps.pps_num_exp_tile_columns_minus1 {
                pps.pps_tile_column_width_minus1.push(r.read_ue_max(width_in_ctbs - 1)?);
            }
            for _ in 0..=pps.pps_num_exp_tile_rows_minus1 {
                pps.pps_tile_row_height_minus1.push(r.read_ue_max(height_in_ctbs - 1)?);
            }

            let col_widths: Vec<u32> =
                pps.pps_tile_column_width_minus1.iter().map(|w| w + 1).collect();
            let row_heights: Vec<u32> =
                pps.pps_tile_row_height_minus1.iter().map(|h| h + 1).collect();
            layout = TileLayout::from_explicit(
                width_in_ctbs,
                height_in_ctbs,
                &col_widths,
                &row_heights,
            )?;

            if layout.num_tiles() > 1 {
                pps.pps_loop_filter_across_tiles_enabled_flag = r.read_bit()?;
                pps.pps_rect_slice_flag = r.read_bit()?;
            }

            if pps.pps_rect_slice_flag {
                pps.pps_single_slice_per_subpic_flag = r.read_bit()?;
            }

            if pps.pps_rect_slice_flag && !pps.pps_single_slice_per_subpic_flag {
                pps.pps_num_slices_in_pic_minus1 = r.read_ue_max(MAX_SLICES_PER_PIC as u32 - 1)?;
                if pps.pps_num_slices_in_pic_minus1 > 1 {
                    pps.pps_tile_idx_delta_present_flag = r.read_bit()?;
                }

                rect_entries = Some(Self::parse_pps_rect_slices(&mut r, &mut pps, &layout)?);
            }

            if !pps.pps_rect_slice_flag
                || pps.pps_single_slice_per_subpic_flag
                || pps.pps_num_slices_in_pic_minus1 > 0
            {
                pps.pps_loop_filter_across_slices_enabled_flag = r.read_bit()?;
            }
        } else {
            pps.pps_log2_ctu_size_minus5 = sps.sps_log2_ctu_size_minus5;
            layout = TileLayout::single(width_in_ctbs, height_in_ctbs);
        }

        if pps.pps_single_slice_per_subpic_flag {
            pps.pps_num_slices_in_pic_minus1 = u32::from(sps.sps_num_subpics_minus1);
        }

        pps.slice_map = if !pps.pps_rect_slice_flag {
            SliceMap::default()
        } else if pps.pps_single_slice_per_subpic_flag {
            tiles::derive_subpic_slices(&layout, &subpics)?
        } else if let Some(entries) = rect_entries {
            tiles::derive_rect_slices(&layout, &entries)?
        } else {
            tiles::derive_rect_slices(
                &layout,
                &[RectSliceSyntax {
                    top_left_tile_idx: 0,
                    width_in_tiles: layout.num_tile_columns(),
                    height_in_tiles: layout.num_tile_rows(),
                    slice_heights: vec![],
                }],
            )?
        };

        if pps.pps_rect_slice_flag {
            pps.subpic_slices = tiles::slices_in_subpics(width_in_ctbs, &subpics, &pps.slice_map);
            if let Some(i) = pps.subpic_slices.num_slices_in_subpic.iter().position(|n| *n == 0) {
                return Err(invalid_stream!("subpicture {} contains no slice", i));
            }
        }

        pps.tile_layout = layout;

        pps.pps_cabac_init_present_flag = r.read_bit()?;
        for i in 0..2 {
            pps.pps_num_ref_idx_default_active_minus1[i] = r.read_ue_max(14)?;
        }

        pps.pps_rpl1_idx_present_flag = r.read_bit()?;
        pps.pps_weighted_pred_flag = r.read_bit()?;
        pps.pps_weighted_bipred_flag = r.read_bit()?;
        if (pps.pps_weighted_pred_flag && !sps.sps_weighted_pred_flag)
            || (pps.pps_weighted_bipred_flag && !sps.sps_weighted_bipred_flag)
        {
            return Err(invalid_stream!("weighted prediction disabled in the SPS"));
        }

        pps.pps_ref_wraparound_enabled_flag = r.read_bit()?;
        if pps.pps_ref_wraparound_enabled_flag {
            let min_cb = sps.min_cb_size_y();
            if ctb_size / min_cb + 1 > pps.pps_pic_width_in_luma_samples / min_cb - 1 {
                return Err(invalid_stream!("picture too narrow for reference wraparound"));
            }
            pps.pps_pic_width_minus_wraparound_offset = r.read_ue_max(
                (pps.pps_pic_width_in_luma_samples / min_cb) - (ctb_size / min_cb) - 2,
            )?;
        }

        let qp_bd_offset = sps.qp_bd_offset();
        pps.pps_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset), 37)?;
        pps.pps_cu_qp_delta_enabled_flag = r.read_bit()?;
        pps.pps_chroma_tool_offsets_present_flag = r.read_bit()?;
        if pps.pps_chroma_tool_offsets_present_flag {
            pps.pps_cb_qp_offset = r.read_se_bounded(-12, 12)?;
            pps.pps_cr_qp_offset = r.read_se_bounded(-12, 12)?;
            pps.pps_joint_cbcr_qp_offset_present_flag = r.read_bit()?;
            if pps.pps_joint_cbcr_qp_offset_present_flag {
                pps.pps_joint_cbcr_qp_offset_value = r.read_se_bounded(-12, 12)?;
            }

            pps.pps_slice_chroma_qp_offsets_present_flag = r.read_bit()?;
            pps.pps_cu_chroma_qp_offset_list_enabled_flag = r.read_bit()?;
            if pps.pps_cu_chroma_qp_offset_list_enabled_flag {
                pps.pps_chroma_qp_offset_list_len_minus1 = r.read_ue_max(5)?;
                for i in 0..=usize::from(pps.pps_chroma_qp_offset_list_len_minus1) {
                    pps.pps_cb_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
                    pps.pps_cr_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
                    if pps.pps_joint_cbcr_qp_offset_present_flag {
                        pps.pps_joint_cbcr_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
                    }
                }
            }
        }

        pps.pps_deblocking_filter_control_present_flag = r.read_bit()?;
        if pps.pps_deblocking_filter_control_present_flag {
            pps.pps_deblocking_filter_override_enabled_flag = r.read_bit()?;
            pps.pps_deblocking_filter_disabled_flag = r.read_bit()?;
            if !pps.pps_no_pic_partition_flag && pps.pps_deblocking_filter_override_enabled_flag {
                pps.pps_dbf_info_in_ph_flag = r.read_bit()?;
            }

            if !pps.pps_deblocking_filter_disabled_flag {
                pps.pps_luma_beta_offset_div2 = r.read_se_bounded(-12, 12)?;
                pps.pps_luma_tc_offset_div2 = r.read_se_bounded(-12, 12)?;
                if pps.pps_chroma_tool_offsets_present_flag {
                    pps.pps_cb_beta_offset_div2 = r.read_se_bounded(-12, 12)?;
                    pps.pps_cb_tc_offset_div2 = r.read_se_bounded(-12, 12)?;
                    pps.pps_cr_beta_offset_div2 = r.read_se_bounded(-12, 12)?;
                    pps.pps_cr_tc_offset_div2 = r.read_se_bounded(-12, 12)?;
                } else {
                    pps.pps_cb_beta_offset_div2 = pps.pps_luma_beta_offset_div2;
                    pps.pps_cb_tc_offset_div2 = pps.pps_luma_tc_offset_div2;
                    pps.pps_cr_beta_offset_div2 = pps.pps_luma_beta_offset_div2;
                    pps.pps_cr_tc_offset_div2 = pps.pps_luma_tc_offset_div2;
                }
            }
        }

        if !pps.pps_no_pic_partition_flag {
            pps.pps_rpl_info_in_ph_flag = r.read_bit()?;
            pps.pps_sao_info_in_ph_flag = r.read_bit()?;
            pps.pps_alf_info_in_ph_flag = r.read_bit()?;
            if (pps.pps_weighted_pred_flag || pps.pps_weighted_bipred_flag)
                && pps.pps_rpl_info_in_ph_flag
            {
                pps.pps_wp_info_in_ph_flag = r.read_bit()?;
            }
            pps.pps_qp_delta_info_in_ph_flag = r.read_bit()?;
        }

        pps.pps_picture_header_extension_present_flag = r.read_bit()?;
        pps.pps_slice_header_extension_present_flag = r.read_bit()?;
        pps.pps_extension_flag = r.read_bit()?;
        if pps.pps_extension_flag {
            skip_extension_data(&mut r)?;
        }

        finish_rbsp(&mut r)?;

        log::debug!(
            "PPS {}: {}x{}, {} tile(s), {} slice(s), rect {}",
            pps.pps_pic_parameter_set_id,
            pps.pps_pic_width_in_luma_samples,
            pps.pps_pic_height_in_luma_samples,
            pps.tile_layout.num_tiles(),
            pps.slice_map.num_slices(),
            pps.pps_rect_slice_flag
        );

        pps.sps = sps;
        let key = usize::from(pps.pps_pic_parameter_set_id);
        Ok(self.active_ppses.add_header(key, pps)?)
    }

    fn parse_alf_coeff(r: &mut BitReader) -> ParseResult<i16> {
        let abs: i16 = r.read_ue_max(128)?;
        if abs > 0 && r.read_bit()? {
            Ok(-abs)
        } else {
            Ok(abs)
        }
    }

    fn parse_alf_data(r: &mut BitReader, aps_chroma_present_flag: bool) -> ParseResult<AlfData> {
        let mut alf = AlfData {
            alf_luma_filter_signal_flag: r.read_bit()?,
            ..Default::default()
        };

        if aps_chroma_present_flag {
            alf.alf_chroma_filter_signal_flag = r.read_bit()?;
            alf.alf_cc_cb_filter_signal_flag = r.read_bit()?;
            alf.alf_cc_cr_filter_signal_flag = r.read_bit()?;
        }

        if !alf.alf_luma_filter_signal_flag
            && !alf.alf_chroma_filter_signal_flag
            && !alf.alf_cc_cb_filter_signal_flag
            && !alf.alf_cc_cr_filter_signal_flag
        {
            return Err(invalid_stream!("ALF APS does not signal any filter"));
        }

        if alf.alf_luma_filter_signal_flag {
            alf.alf_luma_clip_flag = r.read_bit()?;
            alf.alf_luma_num_filters_signalled_minus1 = r.read_ue_max(NUM_ALF_FILTERS as u32 - 1)?;

            let num_filters = u32::from(alf.alf_luma_num_filters_signalled_minus1) + 1;
            if num_filters > 1 {
                let bits = ceil_log2(num_filters);
                for idx in alf.alf_luma_coeff_delta_idx.iter_mut() {
                    *idx = r.read_bits_max(bits, num_filters - 1)?;
                }
            }

            for _ in 0..num_filters {
                let mut coeff = [0i16; 12];
                for c in coeff.iter_mut() {
                    *c = Self::parse_alf_coeff(r)?;
                }
                alf.alf_luma_coeff.push(coeff);
            }

            alf.alf_luma_clip_idx = vec![[0; 12]; num_filters as usize];
            if alf.alf_luma_clip_flag {
                for clip in alf.alf_luma_clip_idx.iter_mut() {
                    for c in clip.iter_mut() {
                        *c = r.read_bits(2)?;
                    }
                }
            }
        }

        if alf.alf_chroma_filter_signal_flag {
            alf.alf_chroma_clip_flag = r.read_bit()?;
            alf.alf_chroma_num_alt_filters_minus1 = r.read_ue_max(7)?;
            for _ in 0..=alf.alf_chroma_num_alt_filters_minus1 {
                let mut coeff = [0i16; 6];
                for c in coeff.iter_mut() {
                    *c = Self::parse_alf_coeff(r)?;
                }
                alf.alf_chroma_coeff.push(coeff);

                let mut clip = [0u8; 6];
                if alf.alf_chroma_clip_flag {
                    for c in clip.iter_mut() {
                        *c = r.read_bits(2)?;
                    }
                }
                alf.alf_chroma_clip_idx.push(clip);
            }
        }

        if alf.alf_cc_cb_filter_signal_flag {
            alf.alf_cc_cb_filters_signalled_minus1 = r.read_ue_max(3)?;
            for _ in 0..=alf.alf_cc_cb_filters_signalled_minus1 {
                alf.alf_cc_cb_coeff.push(Self::parse_cc_alf_filter(r)?);
            }
        }

        if alf.alf_cc_cr_filter_signal_flag {
            alf.alf_cc_cr_filters_signalled_minus1 = r.read_ue_max(3)?;
            for _ in 0..=alf.alf_cc_cr_filters_signalled_minus1 {
                alf.alf_cc_cr_coeff.push(Self::parse_cc_alf_filter(r)?);
            }
        }

        Ok(alf)
    }

    /// Reads the 7 mapped coefficients of a cross component filter. A mapped
    /// magnitude `m` stands for the power of two 2^(m - 1).
    fn parse_cc_alf_filter(r: &mut BitReader) -> ParseResult<[i16; 7]> {
        let mut coeff = [0i16; 7];
        for c in coeff.iter_mut() {
            let abs: u8 = r.read_bits(3)?;
            if abs > 0 {
                let sign = r.read_bit()?;
                let value = 1i16 << (abs - 1);
                *c = if sign { -value } else { value };
            }
        }

        Ok(coeff)
    }

    fn parse_lmcs_data(r: &mut BitReader, aps_chroma_present_flag: bool) -> ParseResult<LmcsData> {
        let mut lmcs = LmcsData {
            lmcs_min_bin_idx: r.read_ue_max(15)?,
            lmcs_delta_max_bin_idx: r.read_ue_max(15)?,
            ..Default::default()
        };

        if lmcs.max_bin_idx() < lmcs.lmcs_min_bin_idx {
            return Err(invalid_stream!(
                "LmcsMaxBinIdx {} is lower than lmcs_min_bin_idx {}",
                lmcs.max_bin_idx(),
                lmcs.lmcs_min_bin_idx
            ));
        }

        lmcs.lmcs_delta_cw_prec_minus1 = r.read_ue_max(14)?;
        let bits = usize::from(lmcs.lmcs_delta_cw_prec_minus1) + 1;
        for i in lmcs.lmcs_min_bin_idx..=lmcs.max_bin_idx() {
            let abs: i32 = r.read_bits(bits)?;
            lmcs.lmcs_delta_cw[usize::from(i)] = if abs > 0 && r.read_bit()? { -abs } else { abs };
        }

        if aps_chroma_present_flag {
            let abs: i8 = r.read_bits(3)?;
            lmcs.lmcs_delta_crs = if abs > 0 && r.read_bit()? { -abs } else { abs };
        }

        Ok(lmcs)
    }

    /// Parses an APS, prefix or suffix, and stores it in the slot for its
    /// type and ID.
    pub fn parse_aps(&mut self, nalu: &Nalu) -> ParseResult<Rc<Aps>> {
        check_nalu_type(nalu, &[NaluType::PrefixApsNut, NaluType::SuffixApsNut])?;

        let mut r = self.reader(nalu);
        let type_: u8 = r.read_bits(3)?;
        let aps_params_type = ApsParamsType::n(type_)
            .ok_or_else(|| ParseError::Unsupported(format!("APS parameters type {}", type_)))?;

        let aps_adaptation_parameter_set_id: u8 =
            r.read_bits_max(5, aps_params_type.max_ids() as u32 - 1)?;
        let aps_chroma_present_flag = r.read_bit()?;

        let data = match aps_params_type {
            ApsParamsType::Alf => {
                ApsData::Alf(Self::parse_alf_data(&mut r, aps_chroma_present_flag)?)
            }
            ApsParamsType::Lmcs => {
                ApsData::Lmcs(Self::parse_lmcs_data(&mut r, aps_chroma_present_flag)?)
            }
            ApsParamsType::ScalingList => ApsData::ScalingList(Box::new(ScalingListData::parse(
                &mut r,
                aps_chroma_present_flag,
                &self.scan_tables,
            )?)),
        };

        let aps = Aps {
            aps_params_type,
            aps_adaptation_parameter_set_id,
            aps_chroma_present_flag,
            data,
            aps_extension_flag: r.read_bit()?,
            nuh_layer_id: nalu.header.nuh_layer_id,
        };

        if aps.aps_extension_flag {
            skip_extension_data(&mut r)?;
        }

        finish_rbsp(&mut r)?;

        log::debug!(
            "APS {:?} {} (chroma {})",
            aps.aps_params_type,
            aps.aps_adaptation_parameter_set_id,
            aps.aps_chroma_present_flag
        );

        let key = usize::from(aps.aps_adaptation_parameter_set_id);
        let store = match aps.aps_params_type {
            ApsParamsType::Alf => &mut self.active_alf_apses,
            ApsParamsType::Lmcs => &mut self.active_lmcs_apses,
            ApsParamsType::ScalingList => &mut self.active_scaling_list_apses,
        };

        Ok(store.add_header(key, aps)?)
    }

    /// Parses ref_pic_lists(), as found in picture and slice headers.
    fn parse_ref_pic_lists(
        r: &mut BitReader,
        sps: &Sps,
        pps: &Pps,
        num_direct_ref_layers: usize,
    ) -> ParseResult<RefPicLists> {
        let mut rpls = RefPicLists::default();

        for i in 0..2 {
            let num_lists = sps.sps_num_ref_pic_lists[i];
            let idx_signalled = i == 0 || pps.pps_rpl1_idx_present_flag;

            if num_lists > 0 && idx_signalled {
                rpls.rpl_sps_flag[i] = r.read_bit()?;
            } else if num_lists > 0 {
                rpls.rpl_sps_flag[i] = rpls.rpl_sps_flag[0];
            }

            if rpls.rpl_sps_flag[i] {
                if num_lists > 1 && idx_signalled {
                    let bits = ceil_log2(u32::from(num_lists));
                    rpls.rpl_idx[i] = r.read_bits_max(bits, u32::from(num_lists) - 1)?;
                } else if i == 1 && !pps.pps_rpl1_idx_present_flag && num_lists > 1 {
                    rpls.rpl_idx[1] = rpls.rpl_idx[0];
                }

                if rpls.rpl_idx[i] >= num_lists {
                    return Err(invalid_stream!(
                        "rpl_idx[{}] {} refers to a missing SPS list",
                        i,
                        rpls.rpl_idx[i]
                    ));
                }

                rpls.rpls_idx[i] = rpls.rpl_idx[i];
                rpls.rpl[i] = sps.ref_pic_list_struct[i][usize::from(rpls.rpl_idx[i])].clone();
            } else {
                rpls.rpls_idx[i] = num_lists;
                rpls.rpl[i] = Self::parse_ref_pic_list_struct(
                    r,
                    sps,
                    i,
                    usize::from(num_lists),
                    num_direct_ref_layers,
                )?;
            }

            let poc_lsb_bits = usize::from(sps.sps_log2_max_pic_order_cnt_lsb_minus4) + 4;
            let max_msb_cycle = 1u32 << (32 - poc_lsb_bits);

            for j in 0..usize::from(rpls.rpl[i].num_ltrp_entries) {
                if rpls.rpl[i].ltrp_in_header_flag {
                    rpls.poc_lsb_lt[i][j] = r.read_bits(poc_lsb_bits)?;
                    rpls.poc_lsb_lt_val[i][j] = rpls.poc_lsb_lt[i][j];
                } else {
                    rpls.poc_lsb_lt_val[i][j] = rpls.rpl[i].rpls_poc_lsb_lt[j];
                }

                rpls.delta_poc_msb_cycle_present_flag[i][j] = r.read_bit()?;
                if rpls.delta_poc_msb_cycle_present_flag[i][j] {
                    rpls.delta_poc_msb_cycle_lt[i][j] = r.read_ue_max(max_msb_cycle)?;
                }

                rpls.delta_poc_msb_cycle_lt_val[i][j] = if j == 0 {
                    rpls.delta_poc_msb_cycle_lt[i][j]
                } else {
                    rpls.delta_poc_msb_cycle_lt[i][j]
                        .saturating_add(rpls.delta_poc_msb_cycle_lt_val[i][j - 1])
                };
            }
        }

        Ok(rpls)
    }

    /// Parses pred_weight_table(). `num_ref_idx_active` is only used when the
    /// table is carried by a slice header.
    fn parse_pred_weight_table(
        r: &mut BitReader,
        sps: &Sps,
        pps: &Pps,
        rpls: &RefPicLists,
        num_ref_idx_active: [u8; 2],
    ) -> ParseResult<PredWeightTable> {
        let chroma = sps.sps_chroma_format_idc != 0;
        let mut pwt = PredWeightTable {
            luma_log2_weight_denom: r.read_ue_max(7)?,
            ..Default::default()
        };

        if chroma {
            let denom = i32::from(pwt.luma_log2_weight_denom);
            pwt.delta_chroma_log2_weight_denom = r.read_se_bounded(-denom, 7 - denom)?;
        }

        let max_weights = |list: usize| std::cmp::min(15, rpls.num_ref_entries(list)) as u32;

        if pps.pps_wp_info_in_ph_flag {
            pwt.num_l0_weights = r.read_ue_max(max_weights(0))?;
        }

        let num_weights_l0 = if pps.pps_wp_info_in_ph_flag {
            pwt.num_l0_weights
        } else {
            num_ref_idx_active[0]
        };

        Self::parse_pred_weights(r, sps, &mut pwt, 0, usize::from(num_weights_l0))?;

        if pps.pps_weighted_bipred_flag
            && pps.pps_wp_info_in_ph_flag
            && rpls.num_ref_entries(1) > 0
        {
            pwt.num_l1_weights = r.read_ue_max(max_weights(1))?;
        }

        let num_weights_l1 = if !pps.pps_weighted_bipred_flag
            || (pps.pps_wp_info_in_ph_flag && rpls.num_ref_entries(1) == 0)
        {
            0
        } else if pps.pps_wp_info_in_ph_flag {
            pwt.num_l1_weights
        } else {
            num_ref_idx_active[1]
        };

        Self::parse_pred_weights(r, sps, &mut pwt, 1, usize::from(num_weights_l1))?;

        Ok(pwt)
    }

    fn parse_pred_weights(
        r: &mut BitReader,
        sps: &Sps,
        pwt: &mut PredWeightTable,
        list: usize,
        num_weights: usize,
    ) -> ParseResult<()> {
        let chroma = sps.sps_chroma_format_idc != 0;
        let half_range = sps.wp_offset_half_range();

        if num_weights > 15 {
            return Err(invalid_stream!("{} weights in list {}", num_weights, list));
        }

        for i in 0..num_weights {
            pwt.luma_weight_flag[list][i] = r.read_bit()?;
        }

        if chroma {
            for i in 0..num_weights {
                pwt.chroma_weight_flag[list][i] = r.read_bit()?;
            }
        }

        let luma_denom = u32::from(pwt.luma_log2_weight_denom);
        let chroma_denom = pwt.chroma_log2_weight_denom() as u32;

        for i in 0..15 {
            pwt.luma_weight[list][i] = 1 << luma_denom;
            pwt.chroma_weight[list][i] = [1 << chroma_denom; 2];
        }

        for i in 0..num_weights {
            if pwt.luma_weight_flag[list][i] {
                pwt.delta_luma_weight[list][i] = r.read_se_bounded(-128, 127)?;
                pwt.luma_offset[list][i] = r.read_se_bounded(-half_range, half_range - 1)?;
                pwt.luma_weight[list][i] += i16::from(pwt.delta_luma_weight[list][i]);
            }

            if pwt.chroma_weight_flag[list][i] {
                for j in 0..2 {
                    let delta_weight: i8 = r.read_se_bounded(-128, 127)?;
                    let delta_offset: i32 =
                        r.read_se_bounded(-4 * half_range, 4 * half_range - 1)?;
                    pwt.delta_chroma_weight[list][i][j] = delta_weight;
                    pwt.delta_chroma_offset[list][i][j] = delta_offset;

                    let weight = (1i32 << chroma_denom) + i32::from(delta_weight);
                    let offset =
                        half_range + delta_offset - ((half_range * weight) >> chroma_denom);
                    pwt.chroma_weight[list][i][j] = weight as i16;
                    pwt.chroma_offset[list][i][j] =
                        offset.clamp(-half_range, half_range - 1) as i16;
                }
            }
        }

        Ok(())
    }

    fn get_pps_checked(&self, id: u8) -> ParseResult<Rc<Pps>> {
        self.active_ppses
            .get_header(usize::from(id))
            .cloned()
            .ok_or(ParseError::MissingParameterSet {
                kind: "PPS",
                id: u32::from(id),
            })
    }

    fn parse_partition_constraints(
        r: &mut BitReader,
        sps: &Sps,
        intra: bool,
        pc: &mut PartitionConstraints,
    ) -> ParseResult<()> {
        let ctb_log2 = sps.ctb_log2_size_y();
        let min_cb_log2 = sps.min_cb_log2_size_y();
        let max_min_qt = ctb_log2.min(6) - min_cb_log2;
        let max_mtt = 2 * (ctb_log2 - min_cb_log2);

        let read_tree = |r: &mut BitReader| -> ParseResult<(u8, u8, u8, u8)> {
            let min_qt: u8 = r.read_ue_max(max_min_qt)?;
            let mtt: u8 = r.read_ue_max(max_mtt)?;
            let (mut bt, mut tt) = (0, 0);
            if mtt != 0 {
                let min_qt_log2 = min_cb_log2 + u32::from(min_qt);
                bt = r.read_ue_max(ctb_log2 - min_qt_log2)?;
                tt = r.read_ue_max(ctb_log2.min(6) - min_qt_log2)?;
            }
            Ok((min_qt, mtt, bt, tt))
        };

        if intra {
            (
                pc.log2_diff_min_qt_min_cb_intra_slice_luma,
                pc.max_mtt_hierarchy_depth_intra_slice_luma,
                pc.log2_diff_max_bt_min_qt_intra_slice_luma,
                pc.log2_diff_max_tt_min_qt_intra_slice_luma,
            ) = read_tree(r)?;

            if sps.sps_qtbtt_dual_tree_intra_flag {
                (
                    pc.log2_diff_min_qt_min_cb_intra_slice_chroma,
                    pc.max_mtt_hierarchy_depth_intra_slice_chroma,
                    pc.log2_diff_max_bt_min_qt_intra_slice_chroma,
                    pc.log2_diff_max_tt_min_qt_intra_slice_chroma,
                ) = read_tree(r)?;
            }
        } else {
            (
                pc.log2_diff_min_qt_min_cb_inter_slice,
                pc.max_mtt_hierarchy_depth_inter_slice,
                pc.log2_diff_max_bt_min_qt_inter_slice,
                pc.log2_diff_max_tt_min_qt_inter_slice,
            ) = read_tree(r)?;
        }

        Ok(())
    }

    /// Largest cu_qp_delta_subdiv value allowed for a quadtree whose minimum
    /// size and multi-type depth are `min_qt_diff` and `max_mtt`.
    fn max_cu_qp_delta_subdiv(sps: &Sps, min_qt_diff: u8, max_mtt: u8) -> u32 {
        let min_qt_log2 = sps.min_cb_log2_size_y() + u32::from(min_qt_diff);
        2 * (sps.ctb_log2_size_y().saturating_sub(min_qt_log2) + u32::from(max_mtt))
    }

    fn parse_alf_info(r: &mut BitReader, sps: &Sps) -> ParseResult<AlfInfo> {
        let mut alf = AlfInfo {
            alf_enabled_flag: r.read_bit()?,
            ..Default::default()
        };

        if !alf.alf_enabled_flag {
            return Ok(alf);
        }

        alf.num_alf_aps_ids_luma = r.read_bits(3)?;
        for i in 0..usize::from(alf.num_alf_aps_ids_luma) {
            alf.alf_aps_id_luma[i] = r.read_bits(3)?;
        }

        if sps.sps_chroma_format_idc != 0 {
            alf.alf_cb_enabled_flag = r.read_bit()?;
            alf.alf_cr_enabled_flag = r.read_bit()?;
        }

        if alf.alf_cb_enabled_flag || alf.alf_cr_enabled_flag {
            alf.alf_aps_id_chroma = r.read_bits(3)?;
        }

        if sps.sps_ccalf_enabled_flag {
            alf.alf_cc_cb_enabled_flag = r.read_bit()?;
            if alf.alf_cc_cb_enabled_flag {
                alf.alf_cc_cb_aps_id = r.read_bits(3)?;
            }

            alf.alf_cc_cr_enabled_flag = r.read_bit()?;
            if alf.alf_cc_cr_enabled_flag {
                alf.alf_cc_cr_aps_id = r.read_bits(3)?;
            }
        }

        Ok(alf)
    }

    /// Reads the deblocking offsets following a `*_deblocking_filter_disabled_flag`
    /// equal to 0. Chroma offsets default to the luma ones.
    fn parse_deblocking_offsets(
        r: &mut BitReader,
        pps: &Pps,
        dbp: &mut DeblockingParams,
    ) -> ParseResult<()> {
        dbp.luma_beta_offset_div2 = r.read_se_bounded(-12, 12)?;
        dbp.luma_tc_offset_div2 = r.read_se_bounded(-12, 12)?;
        if pps.pps_chroma_tool_offsets_present_flag {
            dbp.cb_beta_offset_div2 = r.read_se_bounded(-12, 12)?;
            dbp.cb_tc_offset_div2 = r.read_se_bounded(-12, 12)?;
            dbp.cr_beta_offset_div2 = r.read_se_bounded(-12, 12)?;
            dbp.cr_tc_offset_div2 = r.read_se_bounded(-12, 12)?;
        } else {
            dbp.cb_beta_offset_div2 = dbp.luma_beta_offset_div2;
            dbp.cb_tc_offset_div2 = dbp.luma_tc_offset_div2;
            dbp.cr_beta_offset_div2 = dbp.luma_beta_offset_div2;
            dbp.cr_tc_offset_div2 = dbp.luma_tc_offset_div2;
        }

        Ok(())
    }

    fn parse_virtual_boundaries(
        r: &mut BitReader,
        size: u32,
        pos_minus1: &mut [u32; 3],
    ) -> ParseResult<u8> {
        let num: u8 = r.read_ue_max(if size <= 8 { 0 } else { 3 })?;
        for pos in pos_minus1.iter_mut().take(usize::from(num)) {
            *pos = r.read_ue_max(size.div_ceil(8) - 2)?;
        }

        Ok(num)
    }

    /// Parses picture_header_structure(), either from a PH NALU or from a
    /// slice header. The PPS and SPS it refers to become the current ones.
    fn parse_picture_header_structure(
        &mut self,
        r: &mut BitReader,
        nuh_layer_id: u8,
    ) -> ParseResult<PictureHeader> {
        let mut ph = PictureHeader {
            ph_gdr_or_irap_pic_flag: r.read_bit()?,
            ph_non_ref_pic_flag: r.read_bit()?,
            ..Default::default()
        };

        if ph.ph_gdr_or_irap_pic_flag {
            ph.ph_gdr_pic_flag = r.read_bit()?;
        }

        ph.ph_inter_slice_allowed_flag = r.read_bit()?;
        ph.ph_intra_slice_allowed_flag = true;
        if ph.ph_inter_slice_allowed_flag {
            ph.ph_intra_slice_allowed_flag = r.read_bit()?;
        }

        ph.ph_pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;
        let pps = self.get_pps_checked(ph.ph_pic_parameter_set_id)?;
        let sps = Rc::clone(&pps.sps);

        self.active_ppses.set_current(usize::from(ph.ph_pic_parameter_set_id));
        self.active_spses.set_current(usize::from(sps.sps_seq_parameter_set_id));

        if ph.ph_gdr_pic_flag && !sps.sps_gdr_enabled_flag {
            return Err(invalid_stream!("GDR picture while GDR is disabled in the SPS"));
        }

        let poc_lsb_bits = usize::from(sps.sps_log2_max_pic_order_cnt_lsb_minus4) + 4;
        ph.ph_pic_order_cnt_lsb = r.read_bits(poc_lsb_bits)?;
        if ph.ph_gdr_pic_flag {
            ph.ph_recovery_poc_cnt = r.read_ue_max(sps.max_pic_order_cnt_lsb())?;
        }

        r.skip_bits(sps.num_extra_ph_bits())?;

        if sps.sps_poc_msb_cycle_flag {
            ph.ph_poc_msb_cycle_present_flag = r.read_bit()?;
            if ph.ph_poc_msb_cycle_present_flag {
                let bits = usize::from(sps.sps_poc_msb_cycle_len_minus1) + 1;
                ph.ph_poc_msb_cycle_val = r.read_bits(bits)?;
            }
        }

        if sps.sps_alf_enabled_flag && pps.pps_alf_info_in_ph_flag {
            ph.alf = Self::parse_alf_info(r, &sps)?;
        }

        if sps.sps_lmcs_enabled_flag {
            ph.ph_lmcs_enabled_flag = r.read_bit()?;
            if ph.ph_lmcs_enabled_flag {
                ph.ph_lmcs_aps_id = r.read_bits(2)?;
                if sps.sps_chroma_format_idc != 0 {
                    ph.ph_chroma_residual_scale_flag = r.read_bit()?;
                }
            }
        }

        if sps.sps_explicit_scaling_list_enabled_flag {
            ph.ph_explicit_scaling_list_enabled_flag = r.read_bit()?;
            if ph.ph_explicit_scaling_list_enabled_flag {
                ph.ph_scaling_list_aps_id = r.read_bits(3)?;
            }
        }

        if sps.sps_virtual_boundaries_enabled_flag && !sps.sps_virtual_boundaries_present_flag {
            ph.ph_virtual_boundaries_present_flag = r.read_bit()?;
            if ph.ph_virtual_boundaries_present_flag {
                ph.ph_num_ver_virtual_boundaries = Self::parse_virtual_boundaries(
                    r,
                    pps.pps_pic_width_in_luma_samples,
                    &mut ph.ph_virtual_boundary_pos_x_minus1,
                )?;
                ph.ph_num_hor_virtual_boundaries = Self::parse_virtual_boundaries(
                    r,
                    pps.pps_pic_height_in_luma_samples,
                    &mut ph.ph_virtual_boundary_pos_y_minus1,
                )?;
            }
        }

        ph.ph_pic_output_flag = true;
        if pps.pps_output_flag_present_flag && !ph.ph_non_ref_pic_flag {
            ph.ph_pic_output_flag = r.read_bit()?;
        }

        if pps.pps_rpl_info_in_ph_flag {
            let num_direct_ref_layers = if sps.sps_inter_layer_prediction_enabled_flag {
                self.num_direct_ref_layers(sps.sps_video_parameter_set_id, nuh_layer_id)?
            } else {
                0
            };
            ph.ref_pic_lists = Self::parse_ref_pic_lists(r, &sps, &pps, num_direct_ref_layers)?;
        }

        if sps.sps_partition_constraints_override_enabled_flag {
            ph.ph_partition_constraints_override_flag = r.read_bit()?;
        }

        ph.partition_constraints = PartitionConstraints::from_sps(&sps);

        if ph.ph_intra_slice_allowed_flag {
            if ph.ph_partition_constraints_override_flag {
                Self::parse_partition_constraints(r, &sps, true, &mut ph.partition_constraints)?;
            }

            let pc = &ph.partition_constraints;
            let max_subdiv = Self::max_cu_qp_delta_subdiv(
                &sps,
                pc.log2_diff_min_qt_min_cb_intra_slice_luma,
                pc.max_mtt_hierarchy_depth_intra_slice_luma,
            );
            if pps.pps_cu_qp_delta_enabled_flag {
                ph.ph_cu_qp_delta_subdiv_intra_slice = r.read_ue_max(max_subdiv)?;
            }
            if pps.pps_cu_chroma_qp_offset_list_enabled_flag {
                ph.ph_cu_chroma_qp_offset_subdiv_intra_slice = r.read_ue_max(max_subdiv)?;
            }
        }

        ph.ph_collocated_from_l0_flag = true;
        ph.ph_mvd_l1_zero_flag = true;
        ph.ph_bdof_disabled_flag = if sps.sps_bdof_control_present_in_ph_flag {
            true
        } else {
            !sps.sps_bdof_enabled_flag
        };
        ph.ph_dmvr_disabled_flag = if sps.sps_dmvr_control_present_in_ph_flag {
            true
        } else {
            !sps.sps_dmvr_enabled_flag
        };
        ph.ph_prof_disabled_flag = !sps.sps_affine_prof_enabled_flag;

        if ph.ph_inter_slice_allowed_flag {
            if ph.ph_partition_constraints_override_flag {
                Self::parse_partition_constraints(r, &sps, false, &mut ph.partition_constraints)?;
            }

            let pc = &ph.partition_constraints;
            let max_subdiv = Self::max_cu_qp_delta_subdiv(
                &sps,
                pc.log2_diff_min_qt_min_cb_inter_slice,
                pc.max_mtt_hierarchy_depth_inter_slice,
            );
            if pps.pps_cu_qp_delta_enabled_flag {
                ph.ph_cu_qp_delta_subdiv_inter_slice = r.read_ue_max(max_subdiv)?;
            }
            if pps.pps_cu_chroma_qp_offset_list_enabled_flag {
                ph.ph_cu_chroma_qp_offset_subdiv_inter_slice = r.read_ue_max(max_subdiv)?;
            }

            let rpls = &ph.ref_pic_lists;
            if sps.sps_temporal_mvp_enabled_flag {
                ph.ph_temporal_mvp_enabled_flag = r.read_bit()?;
                if ph.ph_temporal_mvp_enabled_flag && pps.pps_rpl_info_in_ph_flag {
                    if rpls.num_ref_entries(1) > 0 {
                        ph.ph_collocated_from_l0_flag = r.read_bit()?;
                    }

                    let list = if ph.ph_collocated_from_l0_flag { 0 } else { 1 };
                    if rpls.num_ref_entries(list) > 1 {
                        ph.ph_collocated_ref_idx =
                            r.read_ue_max(rpls.num_ref_entries(list) as u32 - 1)?;
                    }
                }
            }

            if sps.sps_mmvd_fullpel_only_enabled_flag {
                ph.ph_mmvd_fullpel_only_flag = r.read_bit()?;
            }

            if !pps.pps_rpl_info_in_ph_flag || rpls.num_ref_entries(1) > 0 {
                ph.ph_mvd_l1_zero_flag = r.read_bit()?;
                if sps.sps_bdof_control_present_in_ph_flag {
                    ph.ph_bdof_disabled_flag = r.read_bit()?;
                }
                if sps.sps_dmvr_control_present_in_ph_flag {
                    ph.ph_dmvr_disabled_flag = r.read_bit()?;
                }
            }

            if sps.sps_prof_control_present_in_ph_flag {
                ph.ph_prof_disabled_flag = r.read_bit()?;
            }

            if (pps.pps_weighted_pred_flag || pps.pps_weighted_bipred_flag)
                && pps.pps_wp_info_in_ph_flag
            {
                ph.pred_weight_table =
                    Self::parse_pred_weight_table(r, &sps, &pps, &ph.ref_pic_lists, [0, 0])?;
            }
        }

        if pps.pps_qp_delta_info_in_ph_flag {
            let qp_bd_offset = sps.qp_bd_offset();
            let init_qp = 26 + i32::from(pps.pps_init_qp_minus26);
            ph.ph_qp_delta = r.read_se_bounded(-qp_bd_offset - init_qp, 63 - init_qp)?;
        }

        if sps.sps_joint_cbcr_enabled_flag {
            ph.ph_joint_cbcr_sign_flag = r.read_bit()?;
        }

        if sps.sps_sao_enabled_flag && pps.pps_sao_info_in_ph_flag {
            ph.ph_sao_luma_enabled_flag = r.read_bit()?;
            if sps.sps_chroma_format_idc != 0 {
                ph.ph_sao_chroma_enabled_flag = r.read_bit()?;
            }
        }

        ph.deblocking = DeblockingParams::from_pps(&pps);
        if pps.pps_dbf_info_in_ph_flag {
            ph.ph_deblocking_params_present_flag = r.read_bit()?;
            if ph.ph_deblocking_params_present_flag {
                ph.deblocking.deblocking_filter_disabled_flag = false;
                if !pps.pps_deblocking_filter_disabled_flag {
                    ph.deblocking.deblocking_filter_disabled_flag = r.read_bit()?;
                }

                if !ph.deblocking.deblocking_filter_disabled_flag {
                    Self::parse_deblocking_offsets(r, &pps, &mut ph.deblocking)?;
                }
            }
        }

        if pps.pps_picture_header_extension_present_flag {
            ph.ph_extension_length = r.read_ue_max(256)?;
            r.skip_bits(8 * usize::from(ph.ph_extension_length))?;
        }

        log::trace!(
            "Picture header: PPS {}, POC LSB {}, inter {}, intra {}",
            ph.ph_pic_parameter_set_id,
            ph.ph_pic_order_cnt_lsb,
            ph.ph_inter_slice_allowed_flag,
            ph.ph_intra_slice_allowed_flag
        );

        Ok(ph)
    }

    /// Parses a PH NALU. The picture header becomes the one used by the
    /// following slices that do not carry their own.
    pub fn parse_picture_header(&mut self, nalu: &Nalu) -> ParseResult<Rc<PictureHeader>> {
        check_nalu_type(nalu, &[NaluType::PhNut])?;

        let mut r = self.reader(nalu);
        let ph = self.parse_picture_header_structure(&mut r, nalu.header.nuh_layer_id)?;
        finish_rbsp(&mut r)?;

        let ph = Rc::new(ph);
        self.current_ph = Some(Rc::clone(&ph));
        Ok(ph)
    }

    /// Checks that the APSs a slice refers to are available and carry the
    /// data the slice needs.
    fn check_aps_refs(&self, hdr: &SliceHeader, ph: &PictureHeader, sps: &Sps) -> ParseResult<()> {
        let get = |store: &ParameterSetStore<Aps>, kind: &'static str, id: u8| {
            store
                .get_header(usize::from(id))
                .cloned()
                .ok_or(ParseError::MissingParameterSet {
                    kind,
                    id: u32::from(id),
                })
        };

        let alf = &hdr.alf;
        if alf.alf_enabled_flag {
            for id in &alf.alf_aps_id_luma[..usize::from(alf.num_alf_aps_ids_luma)] {
                let aps = get(&self.active_alf_apses, "ALF APS", *id)?;
                if !aps.alf().is_some_and(|a| a.alf_luma_filter_signal_flag) {
                    return Err(invalid_stream!("ALF APS {} has no luma filter", id));
                }
            }

            if alf.alf_cb_enabled_flag || alf.alf_cr_enabled_flag {
                let aps = get(&self.active_alf_apses, "ALF APS", alf.alf_aps_id_chroma)?;
                if !aps.alf().is_some_and(|a| a.alf_chroma_filter_signal_flag) {
                    return Err(invalid_stream!(
                        "ALF APS {} has no chroma filter",
                        alf.alf_aps_id_chroma
                    ));
                }
            }

            if alf.alf_cc_cb_enabled_flag {
                let aps = get(&self.active_alf_apses, "ALF APS", alf.alf_cc_cb_aps_id)?;
                if !aps.alf().is_some_and(|a| a.alf_cc_cb_filter_signal_flag) {
                    return Err(invalid_stream!(
                        "ALF APS {} has no Cb cross component filter",
                        alf.alf_cc_cb_aps_id
                    ));
                }
            }

            if alf.alf_cc_cr_enabled_flag {
                let aps = get(&self.active_alf_apses, "ALF APS", alf.alf_cc_cr_aps_id)?;
                if !aps.alf().is_some_and(|a| a.alf_cc_cr_filter_signal_flag) {
                    return Err(invalid_stream!(
                        "ALF APS {} has no Cr cross component filter",
                        alf.alf_cc_cr_aps_id
                    ));
                }
            }
        }

        if hdr.sh_lmcs_used_flag {
            get(&self.active_lmcs_apses, "LMCS APS", ph.ph_lmcs_aps_id)?;
        }

        if hdr.sh_explicit_scaling_list_used_flag {
            let aps = get(
                &self.active_scaling_list_apses,
                "scaling list APS",
                ph.ph_scaling_list_aps_id,
            )?;
            if aps.aps_chroma_present_flag != (sps.sps_chroma_format_idc != 0) {
                return Err(invalid_stream!(
                    "scaling list APS {} does not match the chroma format",
                    ph.ph_scaling_list_aps_id
                ));
            }
        }

        Ok(())
    }

    /// Parses the header of a slice. The picture header is either carried by
    /// the slice itself or is the last one received.
    pub fn parse_slice_header<'a>(&mut self, nalu: Nalu<'a>) -> ParseResult<Slice<'a>> {
        check_nalu_type(
            &nalu,
            &[
                NaluType::TrailNut,
                NaluType::StsaNut,
                NaluType::RadlNut,
                NaluType::RaslNut,
                NaluType::IdrWRadl,
                NaluType::IdrNLp,
                NaluType::CraNut,
                NaluType::GdrNut,
            ],
        )?;

        let nalu_type = nalu.header.type_;
        let mut r = self.reader(&nalu);
        let mut hdr = SliceHeader {
            sh_picture_header_in_slice_header_flag: r.read_bit()?,
            ..Default::default()
        };

        let ph = if hdr.sh_picture_header_in_slice_header_flag {
            let ph =
                Rc::new(self.parse_picture_header_structure(&mut r, nalu.header.nuh_layer_id)?);
            self.current_ph = Some(Rc::clone(&ph));
            ph
        } else {
            self.current_ph.clone().ok_or(ParseError::MissingParameterSet {
                kind: "picture header",
                id: 0,
            })?
        };

        let pps = self.get_pps_checked(ph.ph_pic_parameter_set_id)?;
        let sps = Rc::clone(&pps.sps);

        if sps.sps_subpic_info_present_flag {
            let bits = usize::from(sps.sps_subpic_id_len_minus1) + 1;
            hdr.sh_subpic_id = r.read_bits(bits)?;
            let idx = pps
                .subpic_id_val
                .iter()
                .position(|id| *id == hdr.sh_subpic_id)
                .ok_or_else(|| invalid_stream!("unknown subpicture ID {}", hdr.sh_subpic_id))?;
            hdr.curr_subpic_idx = idx as u16;
        }

        let num_tiles = pps.num_tiles_in_pic();
        let num_slices_in_subpic = pps
            .subpic_slices
            .num_slices_in_subpic
            .get(usize::from(hdr.curr_subpic_idx))
            .copied()
            .unwrap_or(1);

        if pps.pps_rect_slice_flag && num_slices_in_subpic > 1 {
            hdr.sh_slice_address =
                r.read_bits_max(ceil_log2(num_slices_in_subpic), num_slices_in_subpic - 1)?;
        } else if !pps.pps_rect_slice_flag && num_tiles > 1 {
            hdr.sh_slice_address = r.read_bits_max(ceil_log2(num_tiles), num_tiles - 1)?;
        }

        r.skip_bits(sps.num_extra_sh_bits())?;

        if !pps.pps_rect_slice_flag && num_tiles - hdr.sh_slice_address > 1 {
            hdr.sh_num_tiles_in_slice_minus1 =
                r.read_ue_max(num_tiles - 1 - hdr.sh_slice_address)?;
        }

        hdr.sh_slice_type = SliceType::I;
        if ph.ph_inter_slice_allowed_flag {
            let type_: u8 = r.read_ue_max(2)?;
            hdr.sh_slice_type = SliceType::n(type_)
                .ok_or_else(|| invalid_stream!("invalid slice type {}", type_))?;
        }

        if !ph.ph_intra_slice_allowed_flag && hdr.sh_slice_type.is_i() {
            return Err(invalid_stream!("I slice in a picture that forbids them"));
        }

        if nalu_type.is_irap()
            && !sps.sps_inter_layer_prediction_enabled_flag
            && !hdr.sh_slice_type.is_i()
        {
            return Err(invalid_stream!("{:?} slice in an IRAP picture", hdr.sh_slice_type));
        }

        if nalu_type.is_idr() || nalu_type.is_cra() || nalu_type.is_gdr() {
            hdr.sh_no_output_of_prior_pics_flag = r.read_bit()?;
        }

        let sh_alf_signalled = sps.sps_alf_enabled_flag && !pps.pps_alf_info_in_ph_flag;
        if sh_alf_signalled {
            hdr.sh_alf = Self::parse_alf_info(&mut r, &sps)?;
        }
        hdr.alf = resolve_field(
            pps.pps_alf_info_in_ph_flag,
            &ph.alf,
            sh_alf_signalled,
            &hdr.sh_alf,
        );

        if ph.ph_lmcs_enabled_flag && !hdr.sh_picture_header_in_slice_header_flag {
            hdr.sh_lmcs_used_flag = r.read_bit()?;
        } else {
            hdr.sh_lmcs_used_flag =
                hdr.sh_picture_header_in_slice_header_flag && ph.ph_lmcs_enabled_flag;
        }

        if ph.ph_explicit_scaling_list_enabled_flag && !hdr.sh_picture_header_in_slice_header_flag {
            hdr.sh_explicit_scaling_list_used_flag = r.read_bit()?;
        } else {
            hdr.sh_explicit_scaling_list_used_flag = hdr.sh_picture_header_in_slice_header_flag
                && ph.ph_explicit_scaling_list_enabled_flag;
        }

        let sh_rpl_signalled = !pps.pps_rpl_info_in_ph_flag
            && (!nalu_type.is_idr() || sps.sps_idr_rpl_present_flag);
        if sh_rpl_signalled {
            let num_direct_ref_layers = if sps.sps_inter_layer_prediction_enabled_flag {
                let layer_id = nalu.header.nuh_layer_id;
                self.num_direct_ref_layers(sps.sps_video_parameter_set_id, layer_id)?
            } else {
                0
            };
            hdr.sh_ref_pic_lists =
                Self::parse_ref_pic_lists(&mut r, &sps, &pps, num_direct_ref_layers)?;
        }
        hdr.ref_pic_lists = resolve_field(
            pps.pps_rpl_info_in_ph_flag,
            &ph.ref_pic_lists,
            sh_rpl_signalled,
            &hdr.sh_ref_pic_lists,
        );

        Self::parse_slice_ref_idx_active(&mut r, &mut hdr, &pps)?;

        hdr.collocated_from_l0_flag = true;
        if !hdr.sh_slice_type.is_i() {
            if pps.pps_cabac_init_present_flag {
                hdr.sh_cabac_init_flag = r.read_bit()?;
            }

            if ph.ph_temporal_mvp_enabled_flag {
                if pps.pps_rpl_info_in_ph_flag {
                    hdr.collocated_from_l0_flag =
                        !hdr.sh_slice_type.is_b() || ph.ph_collocated_from_l0_flag;
                    hdr.collocated_ref_idx = ph.ph_collocated_ref_idx;
                } else {
                    hdr.sh_collocated_from_l0_flag = true;
                    if hdr.sh_slice_type.is_b() {
                        hdr.sh_collocated_from_l0_flag = r.read_bit()?;
                    }

                    let list = if hdr.sh_collocated_from_l0_flag { 0 } else { 1 };
                    if hdr.num_ref_idx_active[list] > 1 {
                        hdr.sh_collocated_ref_idx =
                            r.read_ue_max(u32::from(hdr.num_ref_idx_active[list]) - 1)?;
                    }

                    hdr.collocated_from_l0_flag = hdr.sh_collocated_from_l0_flag;
                    hdr.collocated_ref_idx = hdr.sh_collocated_ref_idx;
                }

                let list = if hdr.collocated_from_l0_flag { 0 } else { 1 };
                if hdr.collocated_ref_idx >= hdr.num_ref_idx_active[list] {
                    return Err(invalid_stream!(
                        "collocated_ref_idx {} exceeds the {} active references",
                        hdr.collocated_ref_idx,
                        hdr.num_ref_idx_active[list]
                    ));
                }
            }

            let sh_wp_signalled = !pps.pps_wp_info_in_ph_flag
                && ((pps.pps_weighted_pred_flag && hdr.sh_slice_type.is_p())
                    || (pps.pps_weighted_bipred_flag && hdr.sh_slice_type.is_b()));
            if sh_wp_signalled {
                hdr.sh_pred_weight_table = Self::parse_pred_weight_table(
                    &mut r,
                    &sps,
                    &pps,
                    &hdr.ref_pic_lists,
                    hdr.num_ref_idx_active,
                )?;
            }
            hdr.pred_weight_table = resolve_field(
                pps.pps_wp_info_in_ph_flag,
                &ph.pred_weight_table,
                sh_wp_signalled,
                &hdr.sh_pred_weight_table,
            );
        }

        Self::parse_slice_qp(&mut r, &mut hdr, &ph, &pps, &sps)?;

        let sh_sao_signalled = sps.sps_sao_enabled_flag && !pps.pps_sao_info_in_ph_flag;
        if sh_sao_signalled {
            hdr.sh_sao_luma_used_flag = r.read_bit()?;
            if sps.sps_chroma_format_idc != 0 {
                hdr.sh_sao_chroma_used_flag = r.read_bit()?;
            }
        }
        hdr.sao_luma_used_flag = resolve_field(
            pps.pps_sao_info_in_ph_flag,
            &ph.ph_sao_luma_enabled_flag,
            sh_sao_signalled,
            &hdr.sh_sao_luma_used_flag,
        );
        hdr.sao_chroma_used_flag = resolve_field(
            pps.pps_sao_info_in_ph_flag,
            &ph.ph_sao_chroma_enabled_flag,
            sh_sao_signalled,
            &hdr.sh_sao_chroma_used_flag,
        );

        if pps.pps_deblocking_filter_override_enabled_flag && !pps.pps_dbf_info_in_ph_flag {
            hdr.sh_deblocking_params_present_flag = r.read_bit()?;
        }

        hdr.sh_deblocking = ph.deblocking;
        if hdr.sh_deblocking_params_present_flag {
            hdr.sh_deblocking.deblocking_filter_disabled_flag = false;
            if !pps.pps_deblocking_filter_disabled_flag {
                hdr.sh_deblocking.deblocking_filter_disabled_flag = r.read_bit()?;
            }

            if !hdr.sh_deblocking.deblocking_filter_disabled_flag {
                Self::parse_deblocking_offsets(&mut r, &pps, &mut hdr.sh_deblocking)?;
            }
        }
        hdr.deblocking = resolve_field(
            pps.pps_dbf_info_in_ph_flag,
            &ph.deblocking,
            hdr.sh_deblocking_params_present_flag,
            &hdr.sh_deblocking,
        );

        if sps.sps_dep_quant_enabled_flag {
            hdr.sh_dep_quant_used_flag = r.read_bit()?;
        }

        if sps.sps_sign_data_hiding_enabled_flag && !hdr.sh_dep_quant_used_flag {
            hdr.sh_sign_data_hiding_used_flag = r.read_bit()?;
        }

        if sps.sps_transform_skip_enabled_flag
            && !hdr.sh_dep_quant_used_flag
            && !hdr.sh_sign_data_hiding_used_flag
        {
            hdr.sh_ts_residual_coding_disabled_flag = r.read_bit()?;
        }

        if !hdr.sh_ts_residual_coding_disabled_flag
            && sps.sps_ts_residual_coding_rice_present_in_sh_flag
        {
            hdr.sh_ts_residual_coding_rice_idx_minus1 = r.read_bits(3)?;
        }

        if sps.sps_reverse_last_sig_coeff_enabled_flag {
            hdr.sh_reverse_last_sig_coeff_flag = r.read_bit()?;
        }

        if pps.pps_slice_header_extension_present_flag {
            hdr.sh_slice_header_extension_length = r.read_ue_max(256)?;
            r.skip_bits(8 * usize::from(hdr.sh_slice_header_extension_length))?;
        }

        hdr.ctb_addr_in_curr_slice = if pps.pps_rect_slice_flag {
            let pic_level_idx = pps
                .subpic_slices
                .slice_subpic_to_pic_idx
                .get(usize::from(hdr.curr_subpic_idx))
                .and_then(|slices| slices.get(hdr.sh_slice_address as usize))
                .ok_or_else(|| {
                    invalid_stream!("slice {} not found in its subpicture", hdr.sh_slice_address)
                })?;
            pps.slice_map.ctb_addr_in_slice[*pic_level_idx as usize].clone()
        } else {
            pps.tile_layout.raster_slice_ctb_addrs(
                hdr.sh_slice_address,
                hdr.sh_num_tiles_in_slice_minus1 + 1,
            )?
        };

        if sps.sps_entry_point_offsets_present_flag {
            hdr.num_entry_points = pps.tile_layout.num_entry_points(
                &hdr.ctb_addr_in_curr_slice,
                sps.sps_entropy_coding_sync_enabled_flag,
            );
        }

        if hdr.num_entry_points > 0 {
            hdr.sh_entry_offset_len_minus1 = r.read_ue_max(31)?;
            let bits = usize::from(hdr.sh_entry_offset_len_minus1) + 1;
            hdr.sh_entry_point_offset_minus1 = (0..hdr.num_entry_points)
                .map(|_| r.read_bits::<u32>(bits))
                .collect::<Result<_, _>>()?;
        }

        r.read_trailing_bits()?;
        r.check_overrun()?;

        hdr.header_bit_size = r.position();
        hdr.n_emulation_prevention_bytes = r.num_epb();

        self.check_aps_refs(&hdr, &ph, &sps)?;

        log::trace!(
            "{:?} slice at {} of PPS {}: {} CTUs, QP {}",
            hdr.sh_slice_type,
            hdr.sh_slice_address,
            pps.pps_pic_parameter_set_id,
            hdr.num_ctus_in_curr_slice(),
            hdr.slice_qp_y
        );

        hdr.picture_header = ph;
        hdr.pps = pps;

        Ok(Slice { header: hdr, nalu })
    }

    /// Reads the active reference index override and derives NumRefIdxActive
    /// (equation 138).
    fn parse_slice_ref_idx_active(
        r: &mut BitReader,
        hdr: &mut SliceHeader,
        pps: &Pps,
    ) -> ParseResult<()> {
        let rpls = &hdr.ref_pic_lists;
        let num_entries = [rpls.num_ref_entries(0), rpls.num_ref_entries(1)];
        let num_lists = match hdr.sh_slice_type {
            SliceType::B => 2,
            SliceType::P => 1,
            SliceType::I => 0,
        };

        hdr.sh_num_ref_idx_active_override_flag = true;
        if (num_lists > 0 && num_entries[0] > 1) || (num_lists > 1 && num_entries[1] > 1) {
            hdr.sh_num_ref_idx_active_override_flag = r.read_bit()?;
            if hdr.sh_num_ref_idx_active_override_flag {
                for i in 0..num_lists {
                    if num_entries[i] > 1 {
                        hdr.sh_num_ref_idx_active_minus1[i] = r.read_ue_max(14)?;
                    }
                }
            }
        }

        for i in 0..2 {
            hdr.num_ref_idx_active[i] = if i >= num_lists {
                0
            } else if hdr.sh_num_ref_idx_active_override_flag {
                hdr.sh_num_ref_idx_active_minus1[i] + 1
            } else {
                let default = pps.pps_num_ref_idx_default_active_minus1[i] + 1;
                std::cmp::min(usize::from(default), num_entries[i]) as u8
            };

            if i < num_lists && usize::from(hdr.num_ref_idx_active[i]) > num_entries[i] {
                return Err(invalid_stream!(
                    "{} active references in list {} but only {} entries",
                    hdr.num_ref_idx_active[i],
                    i,
                    num_entries[i]
                ));
            }

            if i < num_lists && hdr.num_ref_idx_active[i] == 0 {
                return Err(invalid_stream!(
                    "{:?} slice without references in list {}",
                    hdr.sh_slice_type,
                    i
                ));
            }
        }

        Ok(())
    }

    /// Reads the slice QP syntax and derives SliceQpY.
    fn parse_slice_qp(
        r: &mut BitReader,
        hdr: &mut SliceHeader,
        ph: &PictureHeader,
        pps: &Pps,
        sps: &Sps,
    ) -> ParseResult<()> {
        let qp_bd_offset = sps.qp_bd_offset();
        let init_qp = 26 + i32::from(pps.pps_init_qp_minus26);

        if !pps.pps_qp_delta_info_in_ph_flag {
            hdr.sh_qp_delta = r.read_se_bounded(-qp_bd_offset - init_qp, 63 - init_qp)?;
        }

        let qp_delta = if pps.pps_qp_delta_info_in_ph_flag {
            ph.ph_qp_delta
        } else {
            hdr.sh_qp_delta
        };
        hdr.slice_qp_y = init_qp + i32::from(qp_delta);

        if pps.pps_slice_chroma_qp_offsets_present_flag {
            hdr.sh_cb_qp_offset = r.read_se_bounded(-12, 12)?;
            hdr.sh_cr_qp_offset = r.read_se_bounded(-12, 12)?;
            if sps.sps_joint_cbcr_enabled_flag {
                hdr.sh_joint_cbcr_qp_offset = r.read_se_bounded(-12, 12)?;
            }
        }

        let sums = [
            i32::from(pps.pps_cb_qp_offset) + i32::from(hdr.sh_cb_qp_offset),
            i32::from(pps.pps_cr_qp_offset) + i32::from(hdr.sh_cr_qp_offset),
            i32::from(pps.pps_joint_cbcr_qp_offset_value) + i32::from(hdr.sh_joint_cbcr_qp_offset),
        ];
        if let Some(sum) = sums.iter().find(|s| !(-12..=12).contains(*s)) {
            return Err(invalid_stream!("chroma QP offset {} out of range", sum));
        }

        if pps.pps_cu_chroma_qp_offset_list_enabled_flag {
            hdr.sh_cu_chroma_qp_offset_enabled_flag = r.read_bit()?;
        }

        Ok(())
    }

    pub fn parse_opi(&mut self, nalu: &Nalu) -> ParseResult<Rc<Opi>> {
        check_nalu_type(nalu, &[NaluType::OpiNut])?;

        let mut r = self.reader(nalu);
        let mut opi = Opi {
            opi_ols_info_present_flag: r.read_bit()?,
            opi_htid_info_present_flag: r.read_bit()?,
            ..Default::default()
        };

        if opi.opi_ols_info_present_flag {
            opi.opi_ols_idx = r.read_ue()?;
        }

        if opi.opi_htid_info_present_flag {
            opi.opi_htid_plus1 = r.read_bits_max(3, MAX_SUB_LAYERS as u32)?;
        }

        if r.read_bit()? {
            skip_extension_data(&mut r)?;
        }

        finish_rbsp(&mut r)?;

        Ok(self.active_opis.add_header(0, opi)?)
    }

    pub fn parse_aud(&mut self, nalu: &Nalu) -> ParseResult<AccessUnitDelimiter> {
        check_nalu_type(nalu, &[NaluType::AudNut])?;

        let mut r = self.reader(nalu);
        let aud = AccessUnitDelimiter {
            aud_irap_or_gdr_flag: r.read_bit()?,
            aud_pic_type: r.read_bits_max(3, 2)?,
        };

        finish_rbsp(&mut r)?;

        Ok(aud)
    }

    pub fn get_opi(&self) -> Option<&Rc<Opi>> {
        self.active_opis.get_header(0)
    }

    pub fn get_vps(&self, vps_id: u8) -> Option<&Rc<Vps>> {
        self.active_vpses.get_header(usize::from(vps_id))
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get_header(usize::from(sps_id))
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get_header(usize::from(pps_id))
    }

    pub fn get_aps(&self, type_: ApsParamsType, aps_id: u8) -> Option<&Rc<Aps>> {
        let store = match type_ {
            ApsParamsType::Alf => &self.active_alf_apses,
            ApsParamsType::Lmcs => &self.active_lmcs_apses,
            ApsParamsType::ScalingList => &self.active_scaling_list_apses,
        };

        store.get_header(usize::from(aps_id))
    }

    /// The SPS referred to by the last picture header.
    pub fn active_sps(&self) -> Option<&Rc<Sps>> {
        self.active_spses.current()
    }

    /// The PPS referred to by the last picture header.
    pub fn active_pps(&self) -> Option<&Rc<Pps>> {
        self.active_ppses.current()
    }

    pub fn current_picture_header(&self) -> Option<&Rc<PictureHeader>> {
        self.current_ph.as_ref()
    }

    /// Drops the parser state. A partial reset keeps the currently active
    /// parameter set of each kind, so that decoding can go on with them.
    pub fn reset(&mut self, partial: bool) {
        self.active_opis.reset(partial);
        self.active_vpses.reset(partial);
        self.active_spses.reset(partial);
        self.active_ppses.reset(partial);
        self.active_alf_apses.reset(partial);
        self.active_lmcs_apses.reset(partial);
        self.active_scaling_list_apses.reset(partial);
        self.current_ph = None;
    }
}
