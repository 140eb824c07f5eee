//! Intra prediction for VP8 macroblocks (RFC 6386, section 12)
//!
//! A [`Workspace`] holds one plane of a macroblock together with the row above
//! it and the column to its left. Whole-block modes and the ten subblock modes
//! fill the interior from that border; residuals are then added in place.

use super::transform;
use super::types::IntraMode;

/// Corner column, 16 luma pixels, then the 4 pixels above and to the right.
const ROW_LEN: usize = 1 + 16 + 4;

/// Value assumed for pixels above the first macroblock row.
const ABOVE_MISSING: u8 = 127;
/// Value assumed for pixels left of the first macroblock column.
const LEFT_MISSING: u8 = 129;

/// Predictors that cover a whole 16x16 luma or 8x8 chroma block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockPredictor {
    Dc,
    Vertical,
    Horizontal,
    TrueMotion,
}

/// One plane of a macroblock under reconstruction.
///
/// `rows[0]` is the row above the block and `rows[y][0]` the column to its left,
/// so pixel (x, y) of the block lives at `rows[y + 1][x + 1]`.
pub(crate) struct Workspace {
    rows: [[u8; ROW_LEN]; 17],
    size: usize,
    has_above: bool,
    has_left: bool,
}

impl Workspace {
    fn with_border(size: usize, above: Option<&[u8]>, left: Option<&[u8]>) -> Self {
        let mut rows = [[0u8; ROW_LEN]; 17];
        match above {
            Some(above) => rows[0][1..][..above.len()].copy_from_slice(above),
            None => rows[0][1..].fill(ABOVE_MISSING),
        }
        for (y, row) in rows[1..=size].iter_mut().enumerate() {
            row[0] = left.map_or(LEFT_MISSING, |left| left[1 + y]);
        }
        rows[0][0] = match (above, left) {
            (None, _) => ABOVE_MISSING,
            (Some(_), None) => LEFT_MISSING,
            (Some(_), Some(left)) => left[0],
        };
        Self {
            rows,
            size,
            has_above: above.is_some(),
            has_left: left.is_some(),
        }
    }

    /// Luma workspace for macroblock (`mbx`, `mby`) of a row `mbw` macroblocks wide.
    ///
    /// `top` is the bottom pixel row of the previous macroblock row. `left` holds
    /// the above-left corner followed by the right column of the previous macroblock.
    pub(crate) fn luma(mbx: usize, mby: usize, mbw: usize, top: &[u8], left: &[u8]) -> Self {
        let above = (mby > 0).then(|| {
            let mut row = [0u8; 20];
            let start = mbx * 16;
            row[..16].copy_from_slice(&top[start..][..16]);
            if mbx + 1 < mbw {
                row[16..].copy_from_slice(&top[start + 16..][..4]);
            } else {
                row[16..].fill(top[start + 15]);
            }
            row
        });
        let above = above.as_ref().map(|row| &row[..]);
        let mut ws = Self::with_border(16, above, (mbx > 0).then_some(left));

        // right-hand subblocks below the first row reuse the macroblock's above-right pixels
        let above_right: [u8; 4] = array_from(&ws.rows[0][17..]);
        for y in [4, 8, 12] {
            ws.rows[y][17..].copy_from_slice(&above_right);
        }
        ws
    }

    /// Chroma workspace; 8x8 prediction never reads past the block's width.
    pub(crate) fn chroma(mbx: usize, mby: usize, top: &[u8], left: &[u8]) -> Self {
        let above = (mby > 0).then(|| &top[mbx * 8..][..8]);
        Self::with_border(8, above, (mbx > 0).then_some(left))
    }

    pub(crate) fn predict(&mut self, predictor: BlockPredictor) {
        let n = self.size;
        let corner = i32::from(self.rows[0][0]);
        let above: [u8; 16] = array_from(&self.rows[0][1..]);
        match predictor {
            BlockPredictor::Dc => {
                let value = self.dc_value();
                for row in &mut self.rows[1..=n] {
                    row[1..=n].fill(value);
                }
            }
            BlockPredictor::Vertical => {
                for row in &mut self.rows[1..=n] {
                    row[1..=n].copy_from_slice(&above[..n]);
                }
            }
            BlockPredictor::Horizontal => {
                for row in &mut self.rows[1..=n] {
                    let left = row[0];
                    row[1..=n].fill(left);
                }
            }
            BlockPredictor::TrueMotion => {
                for row in &mut self.rows[1..=n] {
                    let delta = i32::from(row[0]) - corner;
                    for (px, &a) in row[1..=n].iter_mut().zip(&above) {
                        *px = clamp_pixel(delta + i32::from(a));
                    }
                }
            }
        }
    }

    fn dc_value(&self) -> u8 {
        let n = self.size;
        let mut sum = 0u32;
        let mut count = 0u32;
        if self.has_above {
            sum += self.rows[0][1..=n].iter().map(|&p| u32::from(p)).sum::<u32>();
            count += n as u32;
        }
        if self.has_left {
            sum += self.rows[1..=n].iter().map(|row| u32::from(row[0])).sum::<u32>();
            count += n as u32;
        }
        if count == 0 {
            128
        } else {
            ((sum + count / 2) / count) as u8
        }
    }

    /// Edge pixels of the 4x4 subblock at (`sbx`, `sby`), bottom-left first:
    /// the left column upwards, the corner, then eight pixels above.
    fn subblock_edge(&self, sbx: usize, sby: usize) -> [u8; 13] {
        let (top, left) = (sby * 4, sbx * 4);
        let mut edge = [0u8; 13];
        for (i, e) in edge[..4].iter_mut().enumerate() {
            *e = self.rows[top + 4 - i][left];
        }
        edge[4..].copy_from_slice(&self.rows[top][left..][..9]);
        edge
    }

    pub(crate) fn predict_subblock(&mut self, sbx: usize, sby: usize, mode: IntraMode) {
        let edge = self.subblock_edge(sbx, sby);
        let (top, left) = (sby * 4 + 1, sbx * 4 + 1);
        let mut pixels = [0u8; 16];
        match &SUBBLOCK_RULES[mode as usize] {
            SubblockRule::Dc => {
                let sum: u32 = edge[..4].iter().chain(&edge[5..9]).map(|&p| u32::from(p)).sum();
                pixels.fill(((sum + 4) >> 3) as u8);
            }
            SubblockRule::TrueMotion => {
                let corner = i32::from(edge[4]);
                for (i, px) in pixels.iter_mut().enumerate() {
                    let (r, c) = (i / 4, i % 4);
                    *px = clamp_pixel(i32::from(edge[3 - r]) + i32::from(edge[5 + c]) - corner);
                }
            }
            SubblockRule::Taps(taps) => {
                for (px, tap) in pixels.iter_mut().zip(taps) {
                    *px = tap.apply(&edge);
                }
            }
        }
        for (row, chunk) in self.rows[top..top + 4].iter_mut().zip(pixels.chunks_exact(4)) {
            row[left..left + 4].copy_from_slice(chunk);
        }
    }

    /// Inverse transforms `coeffs` onto the 4x4 block whose top-left pixel is
    /// (`x`, `y`), then zeroes `coeffs` for the next macroblock.
    pub(crate) fn add_residual(&mut self, x: usize, y: usize, coeffs: &mut [i32; 16]) {
        transform::inverse_transform(coeffs);
        for (row, residual) in self.rows[y + 1..][..4].iter_mut().zip(coeffs.chunks_exact(4)) {
            for (px, &r) in row[x + 1..][..4].iter_mut().zip(residual) {
                *px = clamp_pixel(i32::from(*px) + r);
            }
        }
        coeffs.fill(0);
    }

    /// Saves the block's bottom row into `top` and its right column into `left`,
    /// where the neighbouring macroblocks will find them.
    pub(crate) fn store_edges(&self, mbx: usize, top: &mut [u8], left: &mut [u8]) {
        let n = self.size;
        left[0] = self.rows[0][n];
        for (l, row) in left[1..=n].iter_mut().zip(&self.rows[1..=n]) {
            *l = row[n];
        }
        top[mbx * n..][..n].copy_from_slice(&self.rows[n][1..=n]);
    }

    /// Copies the reconstructed block into a plane `stride` pixels wide.
    pub(crate) fn write_to(&self, plane: &mut [u8], stride: usize, mbx: usize, mby: usize) {
        let n = self.size;
        for (y, row) in self.rows[1..=n].iter().enumerate() {
            plane[(mby * n + y) * stride + mbx * n..][..n].copy_from_slice(&row[1..=n]);
        }
    }
}

fn clamp_pixel(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn array_from<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&src[..N]);
    out
}

/// How one subblock pixel derives from the edge returned by `subblock_edge`.
#[derive(Clone, Copy, Debug)]
enum Tap {
    Copy(u8),
    Avg2(u8, u8),
    /// Weighted 1-2-1, the middle index counting twice.
    Avg3(u8, u8, u8),
}

impl Tap {
    fn apply(self, edge: &[u8; 13]) -> u8 {
        let e = |i: u8| u16::from(edge[usize::from(i)]);
        match self {
            Tap::Copy(i) => edge[usize::from(i)],
            Tap::Avg2(a, b) => ((e(a) + e(b) + 1) >> 1) as u8,
            Tap::Avg3(a, b, c) => ((e(a) + 2 * e(b) + e(c) + 2) >> 2) as u8,
        }
    }
}

const fn a2(i: u8) -> Tap {
    Tap::Avg2(i, i + 1)
}

const fn a3(i: u8) -> Tap {
    Tap::Avg3(i, i + 1, i + 2)
}

/// The bottom-left edge pixel averaged against itself.
const LAST_LEFT: Tap = Tap::Avg3(1, 0, 0);
const LAST_ABOVE: Tap = Tap::Avg3(11, 12, 12);

enum SubblockRule {
    Dc,
    TrueMotion,
    /// Row-major taps over the edge: 0..=3 left column bottom-up, 4 corner, 5.. above.
    Taps([Tap; 16]),
}

/// Indexed by `IntraMode` discriminant.
#[rustfmt::skip]
static SUBBLOCK_RULES: [SubblockRule; 10] = [
    SubblockRule::Dc,
    SubblockRule::TrueMotion,
    // VE
    SubblockRule::Taps([
        a3(4), a3(5), a3(6), a3(7),
        a3(4), a3(5), a3(6), a3(7),
        a3(4), a3(5), a3(6), a3(7),
        a3(4), a3(5), a3(6), a3(7),
    ]),
    // HE
    SubblockRule::Taps([
        a3(2), a3(2), a3(2), a3(2),
        a3(1), a3(1), a3(1), a3(1),
        a3(0), a3(0), a3(0), a3(0),
        LAST_LEFT, LAST_LEFT, LAST_LEFT, LAST_LEFT,
    ]),
    // LD
    SubblockRule::Taps([
        a3(5), a3(6), a3(7), a3(8),
        a3(6), a3(7), a3(8), a3(9),
        a3(7), a3(8), a3(9), a3(10),
        a3(8), a3(9), a3(10), LAST_ABOVE,
    ]),
    // RD
    SubblockRule::Taps([
        a3(3), a3(4), a3(5), a3(6),
        a3(2), a3(3), a3(4), a3(5),
        a3(1), a3(2), a3(3), a3(4),
        a3(0), a3(1), a3(2), a3(3),
    ]),
    // VR
    SubblockRule::Taps([
        a2(4), a2(5), a2(6), a2(7),
        a3(3), a3(4), a3(5), a3(6),
        a3(2), a2(4), a2(5), a2(6),
        a3(1), a3(3), a3(4), a3(5),
    ]),
    // VL
    SubblockRule::Taps([
        a2(5), a2(6), a2(7), a2(8),
        a3(5), a3(6), a3(7), a3(8),
        a2(6), a2(7), a2(8), a3(9),
        a3(6), a3(7), a3(8), a3(10),
    ]),
    // HD
    SubblockRule::Taps([
        a2(3), a3(3), a3(4), a3(5),
        a2(2), a3(2), a2(3), a3(3),
        a2(1), a3(1), a2(2), a3(2),
        a2(0), a3(0), a2(1), a3(1),
    ]),
    // HU
    SubblockRule::Taps([
        a2(2), a3(1), a2(1), a3(0),
        a2(1), a3(0), a2(0), LAST_LEFT,
        a2(0), LAST_LEFT, Tap::Copy(0), Tap::Copy(0),
        Tap::Copy(0), Tap::Copy(0), Tap::Copy(0), Tap::Copy(0),
    ]),
];

#[cfg(test)]
mod tests {
    use super::*;

    /// Macroblock (1, 1) of a 3 wide row whose first subblock sees the edge
    /// L3..L0 = 200 17 99 3, corner 141, above 8 250 33 77 190 5 61 222.
    fn irregular_edge() -> Workspace {
        let mut top = [0u8; 48];
        top[16..24].copy_from_slice(&[8, 250, 33, 77, 190, 5, 61, 222]);
        let mut left = [0u8; 17];
        left[..5].copy_from_slice(&[141, 3, 99, 17, 200]);
        Workspace::luma(1, 1, 3, &top, &left)
    }

    fn subblock(ws: &Workspace, sbx: usize, sby: usize) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (r, chunk) in out.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&ws.rows[sby * 4 + 1 + r][sbx * 4 + 1..][..4]);
        }
        out
    }

    #[test]
    fn subblock_modes_on_irregular_edge() {
        #[rustfmt::skip]
        let cases: [(IntraMode, [u8; 16]); 10] = [
            (IntraMode::DC, [86; 16]),
            (IntraMode::TM, [0, 112, 0, 0, 0, 208, 0, 35, 0, 126, 0, 0, 67, 255, 92, 136]),
            (IntraMode::VE, [102, 135, 98, 94, 102, 135, 98, 94, 102, 135, 98, 94, 102, 135, 98, 94]),
            (IntraMode::HE, [62, 62, 62, 62, 55, 55, 55, 55, 83, 83, 83, 83, 154, 154, 154, 154]),
            (IntraMode::LD, [135, 98, 94, 116, 98, 94, 116, 65, 94, 116, 65, 87, 116, 65, 87, 182]),
            (IntraMode::RD, [73, 102, 135, 98, 62, 73, 102, 135, 55, 62, 73, 102, 83, 55, 62, 73]),
            (IntraMode::VR, [75, 129, 142, 55, 73, 102, 135, 98, 62, 75, 129, 142, 55, 73, 102, 135]),
            (IntraMode::VL, [129, 142, 55, 134, 135, 98, 94, 116, 142, 55, 134, 65, 98, 94, 116, 87]),
            (IntraMode::HD, [72, 73, 102, 135, 51, 62, 72, 73, 58, 55, 51, 62, 109, 83, 58, 55]),
            (IntraMode::HU, [51, 55, 58, 83, 58, 83, 109, 154, 109, 154, 200, 200, 200, 200, 200, 200]),
        ];
        for (mode, expected) in cases {
            let mut ws = irregular_edge();
            ws.predict_subblock(0, 0, mode);
            assert_eq!(subblock(&ws, 0, 0), expected, "{mode:?}");
        }
    }

    #[test]
    fn first_macroblock_uses_fixed_borders() {
        let ws = Workspace::luma(0, 0, 1, &[], &[]);
        assert_eq!(
            ws.subblock_edge(0, 0),
            [129, 129, 129, 129, 127, 127, 127, 127, 127, 127, 127, 127, 127]
        );

        let mut ws = Workspace::chroma(0, 0, &[], &[]);
        ws.predict(BlockPredictor::Dc);
        assert!(ws.rows[1..=8].iter().all(|row| row[1..=8] == [128; 8]));
    }

    #[test]
    fn corner_depends_on_which_neighbours_exist() {
        let top = [50u8; 32];
        let left = [7u8; 17];
        assert_eq!(Workspace::luma(1, 0, 2, &top, &left).rows[0][0], 127);
        assert_eq!(Workspace::luma(0, 1, 2, &top, &left).rows[0][0], 129);
        assert_eq!(Workspace::luma(1, 1, 2, &top, &left).rows[0][0], 7);
    }

    #[test]
    fn last_macroblock_repeats_above_right() {
        let top: [u8; 16] = core::array::from_fn(|i| i as u8 * 10);
        let ws = Workspace::luma(0, 1, 1, &top, &[0; 17]);
        for sby in 0..4 {
            assert_eq!(ws.subblock_edge(3, sby)[9..], [150; 4], "subblock row {sby}");
        }

        let top: [u8; 32] = core::array::from_fn(|i| i as u8);
        let ws = Workspace::luma(0, 1, 2, &top, &[0; 17]);
        assert_eq!(ws.subblock_edge(3, 2)[9..], [16, 17, 18, 19]);
    }

    #[test]
    fn dc_averages_only_available_edges() {
        let mut left = [0u8; 17];
        left[1..].copy_from_slice(&[10, 20, 30, 40, 50, 60, 70, 80, 0, 0, 0, 0, 0, 0, 0, 1]);
        let mut ws = Workspace::luma(1, 0, 2, &[], &left);
        ws.predict(BlockPredictor::Dc);
        // (361 + 8) / 16
        assert_eq!(ws.rows[5][9], 23);

        let top = [200u8; 16];
        let mut ws = Workspace::chroma(1, 1, &top, &[0; 9]);
        ws.predict(BlockPredictor::Dc);
        // (8 * 200 + 8) / 16
        assert_eq!(ws.rows[8][8], 100);
    }

    #[test]
    fn true_motion_clamps() {
        let mut left = [10u8; 9];
        left[0] = 5;
        left[8] = 0;
        let mut ws = Workspace::chroma(1, 1, &[250; 16], &left);
        ws.predict(BlockPredictor::TrueMotion);
        // 10 + 250 - 5
        assert_eq!(ws.rows[1][1..=8], [255; 8]);

        let mut ws = Workspace::chroma(1, 1, &[2; 16], &left);
        ws.predict(BlockPredictor::TrueMotion);
        assert_eq!(ws.rows[1][1..=8], [7; 8]);
        assert_eq!(ws.rows[8][1..=8], [0; 8]);
    }

    #[test]
    fn residual_is_clamped_and_cleared() {
        let mut ws = Workspace::chroma(0, 1, &[250; 8], &[]);
        ws.predict(BlockPredictor::Vertical);
        let mut coeffs = [0i32; 16];
        coeffs[0] = 80;
        ws.add_residual(4, 0, &mut coeffs);
        assert_eq!(coeffs, [0; 16]);
        assert_eq!(ws.rows[1][5..9], [255; 4]);
        assert_eq!(ws.rows[4][5..9], [255; 4]);
        assert_eq!(ws.rows[1][1..5], [250; 4]);
        assert_eq!(ws.rows[5][5], 250);
    }

    #[test]
    fn edges_are_stored_for_neighbours() {
        let top: [u8; 16] = core::array::from_fn(|i| 100 + i as u8);
        let mut ws = Workspace::chroma(1, 1, &top, &[0; 9]);
        ws.predict(BlockPredictor::Vertical);

        let mut new_top = [0u8; 16];
        let mut new_left = [0u8; 9];
        ws.store_edges(1, &mut new_top, &mut new_left);
        assert_eq!(new_top[8..], top[8..]);
        assert_eq!(new_top[..8], [0; 8]);
        assert_eq!(new_left, [115; 9]);

        let mut plane = [0u8; 16 * 16];
        ws.write_to(&mut plane, 16, 1, 1);
        assert_eq!(plane[8 * 16 + 8..][..8], top[8..]);
        assert_eq!(plane[15 * 16 + 15], 115);
        assert_eq!(plane[7 * 16 + 15], 0);
    }
}
