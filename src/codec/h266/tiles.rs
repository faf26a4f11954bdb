// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CTU grid geometry: tiles, rectangular slices and subpictures, as derived
//! in clause 6.5.1 of the H.266 specification. Nothing here reads bits; the
//! parser feeds the decoded syntax elements in.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("a tile or slice size of zero was signalled")]
    ZeroSize,
    #[error("explicit sizes add up to {sum} CTBs, more than the {total} available")]
    SizesExceedPicture { sum: u32, total: u32 },
    #[error("tile index {idx} is outside of a picture with {num_tiles} tiles")]
    TileIndexOutOfRange { idx: i64, num_tiles: u32 },
    #[error("slice {slice} spans beyond the tile grid")]
    SliceOutsideTileGrid { slice: usize },
    #[error("CTB {0} belongs to more than one slice")]
    SliceOverlap(u32),
    #[error("{0} CTBs are not covered by any slice")]
    UncoveredCtbs(usize),
    #[error("slice heights in tile exceed the tile height")]
    SliceHeightsExceedTile,
    #[error("subpicture {0} is not aligned to tile boundaries")]
    SubpicNotAligned(usize),
    #[error("subpicture {0} lies outside of the picture")]
    SubpicOutsidePicture(usize),
    #[error("CTB {0} belongs to more than one subpicture")]
    SubpicOverlap(u32),
    #[error("{0} CTBs are not covered by any subpicture")]
    UncoveredBySubpics(usize),
}

/// Splits `total` CTBs into `count` parts whose sizes differ by at most one,
/// larger parts first.
///
/// A PPS always signals its tile sizes, so the parser never calls this. It is
/// meant for writers laying out an even tile grid, whose sizes can then be
/// signalled as explicit ones.
pub fn uniform_sizes(total: u32, count: u32) -> Vec<u32> {
    if count == 0 {
        return vec![];
    }

    let base = total / count;
    let extra = total % count;
    (0..count).map(|i| base + u32::from(i < extra)).collect()
}

/// Completes a list of explicitly signalled sizes: the last explicit size is
/// repeated while it fits in the remaining CTBs, and whatever is left becomes
/// a final, smaller, entry (equations 14 and 15).
pub fn explicit_sizes(total: u32, explicit: &[u32]) -> Result<Vec<u32>, PartitionError> {
    if explicit.iter().any(|&s| s == 0) {
        return Err(PartitionError::ZeroSize);
    }

    let sum = explicit.iter().sum::<u32>();
    if sum > total {
        return Err(PartitionError::SizesExceedPicture { sum, total });
    }

    let mut sizes = explicit.to_vec();
    let mut remaining = total - sum;

    if let Some(&uniform) = explicit.last() {
        while remaining >= uniform {
            sizes.push(uniform);
            remaining -= uniform;
        }
    }

    if remaining > 0 {
        sizes.push(remaining);
    }

    Ok(sizes)
}

fn boundaries(sizes: &[u32]) -> Vec<u32> {
    let mut bd = Vec::with_capacity(sizes.len() + 1);
    bd.push(0);
    for size in sizes {
        bd.push(bd[bd.len() - 1] + size);
    }
    bd
}

/// Maps each CTB coordinate to the index and start of the tile containing
/// it. Both vectors have an extra trailing entry for the picture edge.
fn ctb_to_tile(bd: &[u32], pic_size_in_ctbs: u32) -> (Vec<u32>, Vec<u32>) {
    let mut idx = Vec::with_capacity(pic_size_in_ctbs as usize + 1);
    let mut start = Vec::with_capacity(pic_size_in_ctbs as usize + 1);

    let mut tile = 0;
    for ctb in 0..pic_size_in_ctbs {
        if ctb == bd[tile + 1] {
            tile += 1;
        }
        idx.push(tile as u32);
        start.push(bd[tile]);
    }

    idx.push(bd.len() as u32 - 1);
    start.push(pic_size_in_ctbs);
    (idx, start)
}

/// The tile grid of a picture, with the lookup tables of equations 16-19.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TileLayout {
    pub pic_width_in_ctbs: u32,
    pub pic_height_in_ctbs: u32,
    /// ColWidthVal, in CTBs.
    pub col_width: Vec<u32>,
    /// RowHeightVal, in CTBs.
    pub row_height: Vec<u32>,
    /// tileColBd, NumTileColumns + 1 entries.
    pub col_bd: Vec<u32>,
    /// tileRowBd, NumTileRows + 1 entries.
    pub row_bd: Vec<u32>,
    pub ctb_to_tile_col_bd: Vec<u32>,
    pub ctb_to_tile_col_idx: Vec<u32>,
    pub ctb_to_tile_row_bd: Vec<u32>,
    pub ctb_to_tile_row_idx: Vec<u32>,
}

impl TileLayout {
    fn from_sizes(
        pic_width_in_ctbs: u32,
        pic_height_in_ctbs: u32,
        col_width: Vec<u32>,
        row_height: Vec<u32>,
    ) -> Self {
        let col_bd = boundaries(&col_width);
        let row_bd = boundaries(&row_height);
        let (ctb_to_tile_col_idx, ctb_to_tile_col_bd) = ctb_to_tile(&col_bd, pic_width_in_ctbs);
        let (ctb_to_tile_row_idx, ctb_to_tile_row_bd) = ctb_to_tile(&row_bd, pic_height_in_ctbs);

        Self {
            pic_width_in_ctbs,
            pic_height_in_ctbs,
            col_width,
            row_height,
            col_bd,
            row_bd,
            ctb_to_tile_col_bd,
            ctb_to_tile_col_idx,
            ctb_to_tile_row_bd,
            ctb_to_tile_row_idx,
        }
    }

    /// A picture made of a single tile.
    pub fn single(pic_width_in_ctbs: u32, pic_height_in_ctbs: u32) -> Self {
        Self::from_sizes(
            pic_width_in_ctbs,
            pic_height_in_ctbs,
            vec![pic_width_in_ctbs],
            vec![pic_height_in_ctbs],
        )
    }

    /// Builds the grid from the explicitly signalled column widths and row
    /// heights (pps_tile_column_width_minus1 + 1 and
    /// pps_tile_row_height_minus1 + 1).
    pub fn from_explicit(
        pic_width_in_ctbs: u32,
        pic_height_in_ctbs: u32,
        col_widths: &[u32],
        row_heights: &[u32],
    ) -> Result<Self, PartitionError> {
        let col_width = explicit_sizes(pic_width_in_ctbs, col_widths)?;
        let row_height = explicit_sizes(pic_height_in_ctbs, row_heights)?;

        Ok(Self::from_sizes(
            pic_width_in_ctbs,
            pic_height_in_ctbs,
            col_width,
            row_height,
        ))
    }

    pub fn num_tile_columns(&self) -> u32 {
        self.col_width.len() as u32
    }

    pub fn num_tile_rows(&self) -> u32 {
        self.row_height.len() as u32
    }

    pub fn num_tiles(&self) -> u32 {
        self.num_tile_columns() * self.num_tile_rows()
    }

    pub fn pic_size_in_ctbs(&self) -> u32 {
        self.pic_width_in_ctbs * self.pic_height_in_ctbs
    }

    /// Index, in tile raster order, of the tile containing `ctb_addr`.
    pub fn tile_idx_of_ctb(&self, ctb_addr: u32) -> u32 {
        let x = (ctb_addr % self.pic_width_in_ctbs) as usize;
        let y = (ctb_addr / self.pic_width_in_ctbs) as usize;
        self.ctb_to_tile_row_idx[y] * self.num_tile_columns() + self.ctb_to_tile_col_idx[x]
    }

    /// Raster addresses of the CTBs of tile `tile_idx`, in CTB raster order
    /// within the tile.
    pub fn tile_ctb_addrs(&self, tile_idx: u32) -> Vec<u32> {
        let cols = self.num_tile_columns();
        let tile_x = (tile_idx % cols) as usize;
        let tile_y = (tile_idx / cols) as usize;

        let mut addrs = Vec::new();
        self.add_ctbs(
            &mut addrs,
            self.col_bd[tile_x],
            self.col_bd[tile_x + 1],
            self.row_bd[tile_y],
            self.row_bd[tile_y + 1],
        );
        addrs
    }

    /// CTB addresses of a raster-scan slice covering `num_tiles` tiles
    /// starting at `first_tile_idx`.
    pub fn raster_slice_ctb_addrs(
        &self,
        first_tile_idx: u32,
        num_tiles: u32,
    ) -> Result<Vec<u32>, PartitionError> {
        let last = u64::from(first_tile_idx) + u64::from(num_tiles);
        if num_tiles == 0 || last > u64::from(self.num_tiles()) {
            return Err(PartitionError::TileIndexOutOfRange {
                idx: last as i64,
                num_tiles: self.num_tiles(),
            });
        }

        Ok((first_tile_idx..first_tile_idx + num_tiles)
            .flat_map(|t| self.tile_ctb_addrs(t))
            .collect())
    }

    /// Number of entry points of a slice made of `ctb_addrs` (equation 143).
    pub fn num_entry_points(&self, ctb_addrs: &[u32], entropy_coding_sync: bool) -> u32 {
        let w = self.pic_width_in_ctbs;
        ctb_addrs
            .windows(2)
            .filter(|pair| {
                let (prev_x, prev_y) = ((pair[0] % w) as usize, (pair[0] / w) as usize);
                let (x, y) = ((pair[1] % w) as usize, (pair[1] / w) as usize);
                self.ctb_to_tile_row_bd[y] != self.ctb_to_tile_row_bd[prev_y]
                    || self.ctb_to_tile_col_bd[x] != self.ctb_to_tile_col_bd[prev_x]
                    || (y != prev_y && entropy_coding_sync)
            })
            .count() as u32
    }

    // AddCtbsToSlice()
    fn add_ctbs(&self, addrs: &mut Vec<u32>, start_x: u32, stop_x: u32, start_y: u32, stop_y: u32) {
        for y in start_y..stop_y {
            for x in start_x..stop_x {
                addrs.push(y * self.pic_width_in_ctbs + x);
            }
        }
    }
}

/// Heights of the slices a tile of `tile_height` CTB rows is split into,
/// given pps_exp_slice_height_in_ctus_minus1 + 1 for the explicit ones.
pub fn slices_in_tile(tile_height: u32, exp_heights: &[u32]) -> Result<Vec<u32>, PartitionError> {
    if exp_heights.is_empty() {
        return Ok(vec![tile_height]);
    }

    explicit_sizes(tile_height, exp_heights).map_err(|e| match e {
        PartitionError::SizesExceedPicture { .. } => PartitionError::SliceHeightsExceedTile,
        e => e,
    })
}

/// One iteration of the rectangular slice loop of the PPS. An entry
/// describes either a single slice spanning whole tiles, or when
/// `slice_heights` holds more than one value, a tile split into several
/// slices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RectSliceSyntax {
    pub top_left_tile_idx: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    /// SliceHeightInCtus of the slices carved out of a single tile. Empty
    /// unless the entry covers exactly one tile.
    pub slice_heights: Vec<u32>,
}

impl RectSliceSyntax {
    /// Number of slices this entry accounts for.
    pub fn num_slices(&self) -> usize {
        self.slice_heights.len().max(1)
    }
}

/// Per-slice CTB geometry of a picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceMap {
    pub slice_top_left_tile_idx: Vec<u32>,
    /// SliceHeightInCtus, for slices that lie within a single tile. Zero
    /// otherwise.
    pub slice_height_in_ctus: Vec<u32>,
    /// CtbAddrInSlice, one vector per slice. NumCtusInSlice is the length of
    /// each vector.
    pub ctb_addr_in_slice: Vec<Vec<u32>>,
}

impl SliceMap {
    pub fn num_slices(&self) -> usize {
        self.ctb_addr_in_slice.len()
    }

    pub fn num_ctus_in_slice(&self, slice_idx: usize) -> usize {
        self.ctb_addr_in_slice.get(slice_idx).map_or(0, Vec::len)
    }

    /// Fails unless every CTB of the picture belongs to exactly one slice.
    fn check_coverage(&self, pic_size_in_ctbs: u32) -> Result<(), PartitionError> {
        let mut covered = vec![false; pic_size_in_ctbs as usize];
        for &addr in self.ctb_addr_in_slice.iter().flatten() {
            let slot = covered
                .get_mut(addr as usize)
                .ok_or(PartitionError::SliceOverlap(addr))?;
            if *slot {
                return Err(PartitionError::SliceOverlap(addr));
            }
            *slot = true;
        }

        match covered.iter().filter(|c| !**c).count() {
            0 => Ok(()),
            n => Err(PartitionError::UncoveredCtbs(n)),
        }
    }
}

/// Derives the CTBs of each rectangular slice from the PPS slice loop.
pub fn derive_rect_slices(
    layout: &TileLayout,
    entries: &[RectSliceSyntax],
) -> Result<SliceMap, PartitionError> {
    let cols = layout.num_tile_columns();
    let rows = layout.num_tile_rows();
    let mut map = SliceMap::default();

    for (i, entry) in entries.iter().enumerate() {
        let tile_x = entry.top_left_tile_idx % cols;
        let tile_y = entry.top_left_tile_idx / cols;
        if entry.width_in_tiles == 0
            || entry.height_in_tiles == 0
            || tile_x + entry.width_in_tiles > cols
            || tile_y + entry.height_in_tiles > rows
        {
            return Err(PartitionError::SliceOutsideTileGrid { slice: i });
        }

        let (tile_x, tile_y) = (tile_x as usize, tile_y as usize);

        if entry.slice_heights.len() > 1 {
            let mut ctb_y = layout.row_bd[tile_y];
            for &height in &entry.slice_heights {
                let mut addrs = Vec::new();
                layout.add_ctbs(
                    &mut addrs,
                    layout.col_bd[tile_x],
                    layout.col_bd[tile_x + 1],
                    ctb_y,
                    ctb_y + height,
                );
                ctb_y += height;

                map.slice_top_left_tile_idx.push(entry.top_left_tile_idx);
                map.slice_height_in_ctus.push(height);
                map.ctb_addr_in_slice.push(addrs);
            }
        } else {
            let mut addrs = Vec::new();
            for j in 0..entry.height_in_tiles as usize {
                for k in 0..entry.width_in_tiles as usize {
                    layout.add_ctbs(
                        &mut addrs,
                        layout.col_bd[tile_x + k],
                        layout.col_bd[tile_x + k + 1],
                        layout.row_bd[tile_y + j],
                        layout.row_bd[tile_y + j + 1],
                    );
                }
            }

            let single_tile = entry.width_in_tiles == 1 && entry.height_in_tiles == 1;
            map.slice_top_left_tile_idx.push(entry.top_left_tile_idx);
            map.slice_height_in_ctus
                .push(if single_tile { layout.row_height[tile_y] } else { 0 });
            map.ctb_addr_in_slice.push(addrs);
        }
    }

    map.check_coverage(layout.pic_size_in_ctbs())?;
    Ok(map)
}

/// A subpicture, in CTB units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubpicRect {
    pub top_left_x: u32,
    pub top_left_y: u32,
    pub width: u32,
    pub height: u32,
}

impl SubpicRect {
    fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.top_left_x
            && x < self.top_left_x + self.width
            && y >= self.top_left_y
            && y < self.top_left_y + self.height
    }
}

/// CtbToSubpicIdx: the subpicture index of each CTB of the picture. Fails
/// unless the subpictures tile the picture without overlap.
pub fn subpic_ctu_map(
    pic_width_in_ctbs: u32,
    pic_height_in_ctbs: u32,
    subpics: &[SubpicRect],
) -> Result<Vec<u16>, PartitionError> {
    let mut map = vec![u16::MAX; (pic_width_in_ctbs * pic_height_in_ctbs) as usize];

    for (i, sp) in subpics.iter().enumerate() {
        if sp.width == 0
            || sp.height == 0
            || sp.top_left_x + sp.width > pic_width_in_ctbs
            || sp.top_left_y + sp.height > pic_height_in_ctbs
        {
            return Err(PartitionError::SubpicOutsidePicture(i));
        }

        for y in sp.top_left_y..sp.top_left_y + sp.height {
            for x in sp.top_left_x..sp.top_left_x + sp.width {
                let addr = y * pic_width_in_ctbs + x;
                let slot = &mut map[addr as usize];
                if *slot != u16::MAX {
                    return Err(PartitionError::SubpicOverlap(addr));
                }
                *slot = i as u16;
            }
        }
    }

    match map.iter().filter(|&&idx| idx == u16::MAX).count() {
        0 => Ok(map),
        n => Err(PartitionError::UncoveredBySubpics(n)),
    }
}

/// Slices of a picture coded with one slice per subpicture. A subpicture
/// lying within a single tile maps onto its own CTBs; any other subpicture
/// must be made of complete tiles and is assembled tile by tile.
pub fn derive_subpic_slices(
    layout: &TileLayout,
    subpics: &[SubpicRect],
) -> Result<SliceMap, PartitionError> {
    let mut map = SliceMap::default();

    for (i, sp) in subpics.iter().enumerate() {
        let stop_x = sp.top_left_x + sp.width;
        let stop_y = sp.top_left_y + sp.height;
        if sp.width == 0
            || sp.height == 0
            || stop_x > layout.pic_width_in_ctbs
            || stop_y > layout.pic_height_in_ctbs
        {
            return Err(PartitionError::SubpicOutsidePicture(i));
        }

        let tile_x = layout.ctb_to_tile_col_idx[sp.top_left_x as usize];
        let tile_y = layout.ctb_to_tile_row_idx[sp.top_left_y as usize];
        let last_tile_x = layout.ctb_to_tile_col_idx[stop_x as usize - 1];
        let last_tile_y = layout.ctb_to_tile_row_idx[stop_y as usize - 1];

        let mut addrs = Vec::new();
        let height_in_ctus;
        if tile_x == last_tile_x && tile_y == last_tile_y {
            layout.add_ctbs(&mut addrs, sp.top_left_x, stop_x, sp.top_left_y, stop_y);
            height_in_ctus = sp.height;
        } else {
            let aligned = layout.col_bd[tile_x as usize] == sp.top_left_x
                && layout.row_bd[tile_y as usize] == sp.top_left_y
                && layout.col_bd[last_tile_x as usize + 1] == stop_x
                && layout.row_bd[last_tile_y as usize + 1] == stop_y;
            if !aligned {
                return Err(PartitionError::SubpicNotAligned(i));
            }

            for ty in tile_y as usize..=last_tile_y as usize {
                for tx in tile_x as usize..=last_tile_x as usize {
                    layout.add_ctbs(
                        &mut addrs,
                        layout.col_bd[tx],
                        layout.col_bd[tx + 1],
                        layout.row_bd[ty],
                        layout.row_bd[ty + 1],
                    );
                }
            }
            height_in_ctus = 0;
        }

        map.slice_top_left_tile_idx
            .push(tile_y * layout.num_tile_columns() + tile_x);
        map.slice_height_in_ctus.push(height_in_ctus);
        map.ctb_addr_in_slice.push(addrs);
    }

    map.check_coverage(layout.pic_size_in_ctbs())?;
    Ok(map)
}

/// Relationship between the rectangular slices and the subpictures of a
/// picture (equation 29).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubpicSliceMap {
    pub num_slices_in_subpic: Vec<u32>,
    pub subpic_idx_for_slice: Vec<u32>,
    pub subpic_level_slice_idx: Vec<u32>,
    /// SliceSubpicToPicIdx: picture-level slice index of each slice of each
    /// subpicture.
    pub slice_subpic_to_pic_idx: Vec<Vec<u32>>,
}

pub fn slices_in_subpics(
    pic_width_in_ctbs: u32,
    subpics: &[SubpicRect],
    slices: &SliceMap,
) -> SubpicSliceMap {
    let num_slices = slices.num_slices();
    let mut map = SubpicSliceMap {
        num_slices_in_subpic: vec![0; subpics.len()],
        subpic_idx_for_slice: vec![0; num_slices],
        subpic_level_slice_idx: vec![0; num_slices],
        slice_subpic_to_pic_idx: vec![vec![]; subpics.len()],
    };

    for (i, sp) in subpics.iter().enumerate() {
        for (j, addrs) in slices.ctb_addr_in_slice.iter().enumerate() {
            let Some(&first) = addrs.first() else {
                continue;
            };

            if sp.contains(first % pic_width_in_ctbs, first / pic_width_in_ctbs) {
                map.subpic_idx_for_slice[j] = i as u32;
                map.subpic_level_slice_idx[j] = map.num_slices_in_subpic[i];
                map.slice_subpic_to_pic_idx[i].push(j as u32);
                map.num_slices_in_subpic[i] += 1;
            }
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    impl TileLayout {
        /// A grid of `num_cols` by `num_rows` tiles of (almost) equal size.
        fn uniform(
            pic_width_in_ctbs: u32,
            pic_height_in_ctbs: u32,
            num_cols: u32,
            num_rows: u32,
        ) -> Result<Self, PartitionError> {
            if num_cols == 0
                || num_rows == 0
                || num_cols > pic_width_in_ctbs
                || num_rows > pic_height_in_ctbs
            {
                return Err(PartitionError::ZeroSize);
            }

            Ok(Self::from_sizes(
                pic_width_in_ctbs,
                pic_height_in_ctbs,
                uniform_sizes(pic_width_in_ctbs, num_cols),
                uniform_sizes(pic_height_in_ctbs, num_rows),
            ))
        }
    }

    #[test]
    fn uniform_sizes_front_loaded() {
        let sizes = uniform_sizes(17, 4);
        assert_eq!(sizes, vec![5, 4, 4, 4]);
        assert_eq!(sizes.iter().sum::<u32>(), 17);
        assert!(sizes.iter().all(|&s| s <= 17u32.div_ceil(4)));

        assert_eq!(uniform_sizes(8, 4), vec![2, 2, 2, 2]);
        assert!(uniform_sizes(8, 0).is_empty());
    }

    #[test]
    fn explicit_sizes_fill_remainder() {
        // One explicit column of 3 in a 17 CTB wide picture: 3+3+3+3+3+2.
        let sizes = explicit_sizes(17, &[3]).unwrap();
        assert_eq!(sizes, vec![3, 3, 3, 3, 3, 2]);
        assert_eq!(sizes.iter().sum::<u32>(), 17);

        let sizes = explicit_sizes(10, &[6, 2]).unwrap();
        assert_eq!(sizes, vec![6, 2, 2]);

        assert_eq!(explicit_sizes(5, &[5]).unwrap(), vec![5]);
    }

    #[test]
    fn explicit_sizes_reject_overflow() {
        assert_eq!(
            explicit_sizes(4, &[3, 2]),
            Err(PartitionError::SizesExceedPicture { sum: 5, total: 4 })
        );
        assert_eq!(explicit_sizes(4, &[0]), Err(PartitionError::ZeroSize));
    }

    #[test]
    fn tile_lookup_tables() {
        let layout = TileLayout::from_explicit(10, 4, &[4], &[1, 3]).unwrap();
        assert_eq!(layout.col_width, vec![4, 4, 2]);
        assert_eq!(layout.row_height, vec![1, 3]);
        assert_eq!(layout.col_bd, vec![0, 4, 8, 10]);
        assert_eq!(layout.row_bd, vec![0, 1, 4]);
        assert_eq!(layout.ctb_to_tile_col_idx, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 3]);
        assert_eq!(layout.ctb_to_tile_col_bd, vec![0, 0, 0, 0, 4, 4, 4, 4, 8, 8, 10]);
        assert_eq!(layout.ctb_to_tile_row_idx, vec![0, 1, 1, 1, 2]);
        assert_eq!(layout.num_tiles(), 6);

        assert_eq!(layout.tile_idx_of_ctb(0), 0);
        assert_eq!(layout.tile_idx_of_ctb(9), 2);
        assert_eq!(layout.tile_idx_of_ctb(10 + 5), 4);
        assert_eq!(layout.tile_ctb_addrs(2), vec![8, 9]);
        assert_eq!(layout.tile_ctb_addrs(5), vec![18, 19, 28, 29, 38, 39]);
    }

    #[test]
    fn entry_points() {
        let layout = TileLayout::uniform(4, 4, 2, 2).unwrap();
        let slice = layout.raster_slice_ctb_addrs(0, 2).unwrap();
        assert_eq!(slice, vec![0, 1, 4, 5, 2, 3, 6, 7]);
        // One tile change.
        assert_eq!(layout.num_entry_points(&slice, false), 1);
        // Plus one row change inside each tile.
        assert_eq!(layout.num_entry_points(&slice, true), 3);

        assert!(layout.raster_slice_ctb_addrs(3, 2).is_err());
    }

    #[test]
    fn rect_slices_over_tiles() {
        // 2x2 tiles of 2x2 CTBs. Slice 0 covers the left column of tiles,
        // slice 1 the top right tile which is split in two CTB rows, and the
        // last slice the remaining tile.
        let layout = TileLayout::uniform(4, 4, 2, 2).unwrap();
        let entries = [
            RectSliceSyntax {
                top_left_tile_idx: 0,
                width_in_tiles: 1,
                height_in_tiles: 2,
                slice_heights: vec![],
            },
            RectSliceSyntax {
                top_left_tile_idx: 1,
                width_in_tiles: 1,
                height_in_tiles: 1,
                slice_heights: slices_in_tile(2, &[1]).unwrap(),
            },
            RectSliceSyntax {
                top_left_tile_idx: 3,
                width_in_tiles: 1,
                height_in_tiles: 1,
                slice_heights: vec![],
            },
        ];

        let map = derive_rect_slices(&layout, &entries).unwrap();
        assert_eq!(map.num_slices(), 4);
        assert_eq!(map.ctb_addr_in_slice[0], vec![0, 1, 4, 5, 8, 9, 12, 13]);
        assert_eq!(map.ctb_addr_in_slice[1], vec![2, 3]);
        assert_eq!(map.ctb_addr_in_slice[2], vec![6, 7]);
        assert_eq!(map.ctb_addr_in_slice[3], vec![10, 11, 14, 15]);
        assert_eq!(map.slice_top_left_tile_idx, vec![0, 1, 1, 3]);
        assert_eq!(map.slice_height_in_ctus, vec![0, 1, 1, 2]);
    }

    #[test]
    fn rect_slices_must_cover_picture() {
        let layout = TileLayout::uniform(4, 4, 2, 2).unwrap();
        let entries = [RectSliceSyntax {
            top_left_tile_idx: 0,
            width_in_tiles: 2,
            height_in_tiles: 1,
            slice_heights: vec![],
        }];
        assert_eq!(
            derive_rect_slices(&layout, &entries),
            Err(PartitionError::UncoveredCtbs(8))
        );

        let entries = [RectSliceSyntax {
            top_left_tile_idx: 1,
            width_in_tiles: 2,
            height_in_tiles: 1,
            slice_heights: vec![],
        }];
        assert_eq!(
            derive_rect_slices(&layout, &entries),
            Err(PartitionError::SliceOutsideTileGrid { slice: 0 })
        );
    }

    #[test]
    fn subpics_within_and_across_tiles() {
        // 2x2 tiles of 2x2 CTBs. The top left tile holds two subpictures,
        // the right column of tiles forms a single one.
        let layout = TileLayout::from_explicit(4, 4, &[2], &[2]).unwrap();
        let subpics = [
            SubpicRect { top_left_x: 0, top_left_y: 0, width: 2, height: 1 },
            SubpicRect { top_left_x: 0, top_left_y: 1, width: 2, height: 1 },
            SubpicRect { top_left_x: 0, top_left_y: 2, width: 2, height: 2 },
            SubpicRect { top_left_x: 2, top_left_y: 0, width: 2, height: 4 },
        ];

        let map = derive_subpic_slices(&layout, &subpics).unwrap();
        assert_eq!(map.ctb_addr_in_slice[0], vec![0, 1]);
        assert_eq!(map.ctb_addr_in_slice[1], vec![4, 5]);
        assert_eq!(map.ctb_addr_in_slice[2], vec![8, 9, 12, 13]);
        assert_eq!(map.ctb_addr_in_slice[3], vec![2, 3, 6, 7, 10, 11, 14, 15]);
        assert_eq!(map.slice_top_left_tile_idx, vec![0, 0, 2, 1]);

        let ctu_map = subpic_ctu_map(4, 4, &subpics).unwrap();
        assert_eq!(&ctu_map[0..8], &[0, 0, 3, 3, 1, 1, 3, 3]);

        let sub = slices_in_subpics(4, &subpics, &map);
        assert_eq!(sub.num_slices_in_subpic, vec![1, 1, 1, 1]);
        assert_eq!(sub.subpic_idx_for_slice, vec![0, 1, 2, 3]);
    }

    #[test]
    fn subpic_must_align_with_tiles() {
        let layout = TileLayout::from_explicit(4, 4, &[2], &[2]).unwrap();
        let subpics = [
            SubpicRect { top_left_x: 0, top_left_y: 0, width: 3, height: 4 },
            SubpicRect { top_left_x: 3, top_left_y: 0, width: 1, height: 4 },
        ];
        assert_eq!(
            derive_subpic_slices(&layout, &subpics),
            Err(PartitionError::SubpicNotAligned(0))
        );
    }

    #[test]
    fn subpics_must_not_overlap() {
        let subpics = [
            SubpicRect { top_left_x: 0, top_left_y: 0, width: 2, height: 2 },
            SubpicRect { top_left_x: 1, top_left_y: 1, width: 1, height: 1 },
        ];
        assert_eq!(subpic_ctu_map(2, 2, &subpics), Err(PartitionError::SubpicOverlap(3)));

        let subpics = [SubpicRect { top_left_x: 0, top_left_y: 0, width: 2, height: 1 }];
        assert_eq!(subpic_ctu_map(2, 2, &subpics), Err(PartitionError::UncoveredBySubpics(2)));
    }
}
