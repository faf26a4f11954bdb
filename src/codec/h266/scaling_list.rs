// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scaling list APS payloads: parsing of scaling_list_data() and
//! reconstruction of the scaling matrices of clause 7.4.3.20.

use crate::bitstream_utils::BitReader;
use crate::codec::h266::parser::invalid_stream;
use crate::codec::h266::parser::ParseError;

/// Number of scaling matrices carried by a scaling list APS.
pub const NUM_SCALING_LISTS: usize = 28;
/// Matrices with an id above this carry a DC coefficient.
const FIRST_DC_ID: usize = 14;
const NUM_DC_COEFS: usize = NUM_SCALING_LISTS - FIRST_DC_ID;

// See 6.5.2
fn up_right_diagonal(size: usize) -> Vec<(u8, u8)> {
    let mut ret = Vec::with_capacity(size * size);
    let mut x = 0i32;
    let mut y = 0i32;

    while ret.len() < size * size {
        while y >= 0 {
            if x < size as i32 && y < size as i32 {
                ret.push((x as u8, y as u8));
            }
            y -= 1;
            x += 1;
        }

        y = x;
        x = 0;
    }

    ret
}

/// Up-right diagonal scan orders for square blocks of 1x1 up to 8x8, as
/// `(x, y)` pairs. Built once per parser and shared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanTables {
    diag: [Vec<(u8, u8)>; 4],
}

impl Default for ScanTables {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanTables {
    pub fn new() -> Self {
        Self {
            diag: [
                up_right_diagonal(1),
                up_right_diagonal(2),
                up_right_diagonal(4),
                up_right_diagonal(8),
            ],
        }
    }

    /// DiagScanOrder[log2_size][log2_size].
    pub fn diag(&self, log2_size: usize) -> &[(u8, u8)] {
        &self.diag[log2_size]
    }
}

/// Width of scaling matrix `id`.
pub fn matrix_size(id: usize) -> usize {
    if id < 2 {
        2
    } else if id < 8 {
        4
    } else {
        8
    }
}

/// Largest value scaling_list_pred_id_delta may take for matrix `id`.
pub fn max_id_delta(id: usize) -> usize {
    if id < 2 {
        id
    } else if id < 8 {
        id - 2
    } else {
        id - 8
    }
}

fn is_luma(id: usize) -> bool {
    id % 3 == 2 || id == 27
}

/// Reconstructed scaling matrices, in raster order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingMatrices {
    /// ScalingMatrixRec, `matrix_size(id)` squared entries each, indexed by
    /// `y * size + x`.
    rec: Vec<Vec<u8>>,
    /// ScalingMatrixDcRec for ids 14 and up.
    dc: [u8; NUM_DC_COEFS],
}

impl Default for ScalingMatrices {
    fn default() -> Self {
        Self::flat()
    }
}

impl ScalingMatrices {
    /// All matrices set to 16, i.e. no frequency-dependent scaling.
    pub fn flat() -> Self {
        Self {
            rec: (0..NUM_SCALING_LISTS)
                .map(|id| vec![16; matrix_size(id) * matrix_size(id)])
                .collect(),
            dc: [16; NUM_DC_COEFS],
        }
    }

    /// ScalingMatrixRec[id][x][y].
    pub fn get(&self, id: usize, x: usize, y: usize) -> u8 {
        self.rec[id][y * matrix_size(id) + x]
    }

    /// ScalingMatrixDcRec[id - 14], for ids that carry a DC coefficient.
    pub fn dc(&self, id: usize) -> Option<u8> {
        id.checked_sub(FIRST_DC_ID).and_then(|i| self.dc.get(i).copied())
    }

    pub fn matrix(&self, id: usize) -> &[u8] {
        &self.rec[id]
    }
}

/// scaling_list_data() as carried by an APS, see 7.3.20.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalingListData {
    pub scaling_list_copy_mode_flag: [bool; NUM_SCALING_LISTS],
    pub scaling_list_pred_mode_flag: [bool; NUM_SCALING_LISTS],
    pub scaling_list_pred_id_delta: [u8; NUM_SCALING_LISTS],
    pub scaling_list_dc_coef: [i16; NUM_DC_COEFS],
    /// The matrices after prediction and delta decoding.
    pub matrices: ScalingMatrices,
}

impl ScalingListData {
    pub fn parse(
        r: &mut BitReader,
        aps_chroma_present_flag: bool,
        scan: &ScanTables,
    ) -> Result<Self, ParseError> {
        let mut data = ScalingListData::default();
        let scan8x8 = scan.diag(3);

        for id in 0..NUM_SCALING_LISTS {
            let size = matrix_size(id);
            let log2_size = size.trailing_zeros() as usize;
            // ScalingList[id][i], in diagonal scan order.
            let mut list = vec![0i32; size * size];

            if aps_chroma_present_flag || is_luma(id) {
                data.scaling_list_copy_mode_flag[id] = r.read_bit()?;
                if !data.scaling_list_copy_mode_flag[id] {
                    data.scaling_list_pred_mode_flag[id] = r.read_bit()?;
                }

                if (data.scaling_list_copy_mode_flag[id] || data.scaling_list_pred_mode_flag[id])
                    && id != 0
                    && id != 2
                    && id != 8
                {
                    data.scaling_list_pred_id_delta[id] = r.read_ue_max(max_id_delta(id) as u32)?;
                }

                if !data.scaling_list_copy_mode_flag[id] {
                    let mut next_coef = 0i32;
                    if id >= FIRST_DC_ID {
                        let dc: i16 = r.read_se_bounded(-254, 254)?;
                        data.scaling_list_dc_coef[id - FIRST_DC_ID] = dc;
                        next_coef += i32::from(dc);
                    }

                    for (i, entry) in list.iter_mut().enumerate() {
                        let (x, y) = scan8x8[i];
                        if !(id > 25 && x >= 4 && y >= 4) {
                            let delta: i32 = r.read_se_bounded(-128, 127)?;
                            next_coef += delta;
                        }
                        *entry = next_coef;
                    }
                }
            } else {
                // Chroma lists of a 4:0:0 APS.
                data.scaling_list_copy_mode_flag[id] = true;
            }

            data.reconstruct(id, log2_size, &list, scan)?;
        }

        Ok(data)
    }

    fn reconstruct(
        &mut self,
        id: usize,
        log2_size: usize,
        list: &[i32],
        scan: &ScanTables,
    ) -> Result<(), ParseError> {
        let size = 1 << log2_size;
        let copy = self.scaling_list_copy_mode_flag[id];
        let pred_mode = self.scaling_list_pred_mode_flag[id];
        let delta = usize::from(self.scaling_list_pred_id_delta[id]);

        let (pred, dc_pred): (Vec<u8>, i32) = if !copy && !pred_mode {
            (vec![8; size * size], 8)
        } else if delta == 0 {
            (vec![16; size * size], 16)
        } else {
            let ref_id = id - delta;
            let pred = self.matrices.rec[ref_id].clone();
            let dc_pred = match self.matrices.dc(ref_id) {
                Some(dc) => i32::from(dc),
                None => i32::from(pred[0]),
            };
            (pred, dc_pred)
        };

        let mut rec = vec![0u8; size * size];
        for (k, &(x, y)) in scan.diag(log2_size).iter().enumerate() {
            let (x, y) = (usize::from(x), usize::from(y));
            let pos = y * size + x;
            if id > 25 && x >= 4 && y >= 4 {
                continue;
            }

            let value = (i32::from(pred[pos]) + list[k]) & 255;
            if value == 0 {
                return Err(invalid_stream!(
                    "scaling matrix {} has a zero coefficient at ({}, {})",
                    id,
                    x,
                    y
                ));
            }
            rec[pos] = value as u8;
        }

        if id >= FIRST_DC_ID {
            let dc_coef = if copy {
                0
            } else {
                i32::from(self.scaling_list_dc_coef[id - FIRST_DC_ID])
            };
            let dc = (dc_pred + dc_coef) & 255;
            if dc == 0 {
                return Err(invalid_stream!("scaling matrix {} has a zero DC coefficient", id));
            }
            self.matrices.dc[id - FIRST_DC_ID] = dc as u8;
        }

        self.matrices.rec[id] = rec;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h266::nalu_writer::NaluWriter;

    #[test]
    fn diagonal_scan() {
        let scan = ScanTables::new();
        assert_eq!(scan.diag(0), &[(0, 0)]);
        assert_eq!(scan.diag(1), &[(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(&scan.diag(2)[0..6], &[(0, 0), (0, 1), (1, 0), (0, 2), (1, 1), (2, 0)]);
        assert_eq!(scan.diag(3).len(), 64);
        assert_eq!(scan.diag(3)[63], (7, 7));
    }

    #[test]
    fn matrix_geometry() {
        assert_eq!(matrix_size(1), 2);
        assert_eq!(matrix_size(7), 4);
        assert_eq!(matrix_size(27), 8);
        assert_eq!(max_id_delta(1), 1);
        assert_eq!(max_id_delta(5), 3);
        assert_eq!(max_id_delta(27), 19);
    }

    /// Writes a scaling_list_data() where every list is copied from the flat
    /// default, except for list `explicit_id` which is coded with all deltas
    /// equal to zero on top of the default prediction of 8.
    fn copy_all_but(explicit_id: usize, chroma: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::<&mut Vec<u8>>::new(&mut buf, false);
            for id in 0..NUM_SCALING_LISTS {
                if !(chroma || is_luma(id)) {
                    continue;
                }

                if id == explicit_id {
                    // copy_mode_flag, pred_mode_flag
                    w.write_f(1, false).unwrap();
                    w.write_f(1, false).unwrap();
                    if id >= FIRST_DC_ID {
                        w.write_se(0).unwrap();
                    }
                    let size = matrix_size(id);
                    let coded = if id > 25 { size * size - 16 } else { size * size };
                    for _ in 0..coded {
                        w.write_se(0).unwrap();
                    }
                } else {
                    w.write_f(1, true).unwrap();
                    if id != 0 && id != 2 && id != 8 {
                        w.write_ue(0u32).unwrap();
                    }
                }
            }
            w.write_trailing_bits().unwrap();
        }
        buf
    }

    #[test]
    fn parse_copy_and_default_prediction() {
        let scan = ScanTables::new();
        let buf = copy_all_but(20, true);
        let mut r = BitReader::new(&buf, false);

        let data = ScalingListData::parse(&mut r, true, &scan).unwrap();
        assert_eq!(data.matrices.get(0, 1, 1), 16);
        assert_eq!(data.matrices.get(20, 3, 5), 8);
        assert_eq!(data.matrices.dc(20), Some(8));
        assert_eq!(data.matrices.dc(19), Some(16));
        assert_eq!(data.matrices.dc(3), None);
        r.read_trailing_bits().unwrap();
    }

    #[test]
    fn parse_large_matrix_zeroes_high_frequencies() {
        let scan = ScanTables::new();
        let buf = copy_all_but(27, false);
        let mut r = BitReader::new(&buf, false);

        let data = ScalingListData::parse(&mut r, false, &scan).unwrap();
        assert_eq!(data.matrices.get(27, 3, 7), 8);
        assert_eq!(data.matrices.get(27, 5, 5), 0);
        // Chroma lists are inferred flat.
        assert_eq!(data.matrices.get(3, 0, 0), 16);
        r.read_trailing_bits().unwrap();
    }

    #[test]
    fn predict_from_reference_list() {
        let scan = ScanTables::new();
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::<&mut Vec<u8>>::new(&mut buf, false);
            // id 0: explicit, first delta 4 then constant: all 12.
            w.write_f(1, false).unwrap();
            w.write_f(1, false).unwrap();
            w.write_se(4).unwrap();
            for _ in 1..4 {
                w.write_se(0).unwrap();
            }
            // id 1: copy of id 0.
            w.write_f(1, true).unwrap();
            w.write_ue(1u32).unwrap();
            // Everything else copies the flat default.
            for id in 2..NUM_SCALING_LISTS {
                w.write_f(1, true).unwrap();
                if id != 2 && id != 8 {
                    w.write_ue(0u32).unwrap();
                }
            }
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf, false);
        let data = ScalingListData::parse(&mut r, true, &scan).unwrap();
        assert_eq!(data.matrices.matrix(0), &[12, 12, 12, 12]);
        assert_eq!(data.matrices.matrix(1), &[12, 12, 12, 12]);
    }

    #[test]
    fn zero_coefficient_is_rejected() {
        let scan = ScanTables::new();
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::<&mut Vec<u8>>::new(&mut buf, false);
            w.write_f(1, false).unwrap();
            w.write_f(1, false).unwrap();
            // 8 - 8 = 0
            w.write_se(-8).unwrap();
            for _ in 1..4 {
                w.write_se(0).unwrap();
            }
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf, false);
        let err = ScalingListData::parse(&mut r, true, &scan).unwrap_err();
        assert!(matches!(err, ParseError::InvalidStream(_)));
    }

    #[test]
    fn dc_coefficient_exceeds_delta_range() {
        let scan = ScanTables::new();
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::<&mut Vec<u8>>::new(&mut buf, false);
            for id in 0..NUM_SCALING_LISTS {
                if id == FIRST_DC_ID {
                    w.write_f(1, false).unwrap();
                    w.write_f(1, false).unwrap();
                    w.write_se(200).unwrap();
                    // Brings the AC coefficients back to 200 - 128.
                    w.write_se(-128).unwrap();
                    for _ in 1..64 {
                        w.write_se(0).unwrap();
                    }
                } else {
                    w.write_f(1, true).unwrap();
                    if id != 0 && id != 2 && id != 8 {
                        w.write_ue(0u32).unwrap();
                    }
                }
            }
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf, false);
        let data = ScalingListData::parse(&mut r, true, &scan).unwrap();
        assert_eq!(data.scaling_list_dc_coef[0], 200);
        assert_eq!(data.matrices.dc(FIRST_DC_ID), Some(208));
        assert_eq!(data.matrices.get(FIRST_DC_ID, 0, 0), 80);
        r.read_trailing_bits().unwrap();
    }

    #[test]
    fn dc_coefficient_out_of_range_is_rejected() {
        let scan = ScanTables::new();
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::<&mut Vec<u8>>::new(&mut buf, false);
            for id in 0..FIRST_DC_ID {
                w.write_f(1, true).unwrap();
                if id != 0 && id != 2 && id != 8 {
                    w.write_ue(0u32).unwrap();
                }
            }
            w.write_f(1, false).unwrap();
            w.write_f(1, false).unwrap();
            w.write_se(255).unwrap();
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf, false);
        assert!(ScalingListData::parse(&mut r, true, &scan).is_err());
    }
}
