//! Edge filters of the VP8 in-loop deblocking filter (RFC 6386, section 15).
//!
//! Every primitive works on one line of pixels crossing an edge: `point` indexes
//! the first pixel past the edge (q0) and `step` is the distance between
//! neighbouring pixels on that line, 1 for a vertical edge and the plane stride
//! for a horizontal one. Pixels before the edge are p0, p1, ...

/// Clamp to the signed 8-bit range
#[inline]
fn c(v: i32) -> i32 {
    v.clamp(-128, 127)
}

#[inline]
fn u2s(v: u8) -> i32 {
    i32::from(v) - 128
}

#[inline]
fn s2u(v: i32) -> u8 {
    (c(v) + 128) as u8
}

#[inline]
fn diff(a: u8, b: u8) -> i32 {
    i32::from(a.abs_diff(b))
}

/// Adjusts p0 and q0 toward each other, returning the filter value applied to q0.
#[inline]
fn common_adjust(use_outer_taps: bool, pixels: &mut [u8], point: usize, step: usize) -> i32 {
    let p1 = u2s(pixels[point - 2 * step]);
    let p0 = u2s(pixels[point - step]);
    let q0 = u2s(pixels[point]);
    let q1 = u2s(pixels[point + step]);

    let outer = if use_outer_taps { c(p1 - q1) } else { 0 };
    let a = c(outer + 3 * (q0 - p0));

    // b is a rounded down, a rounded up
    let b = c(a + 3) >> 3;
    let a = c(a + 4) >> 3;

    pixels[point] = s2u(q0 - a);
    pixels[point - step] = s2u(p0 + b);

    a
}

#[inline]
fn simple_threshold(edge_limit: i32, pixels: &[u8], point: usize, step: usize) -> bool {
    let p1 = pixels[point - 2 * step];
    let p0 = pixels[point - step];
    let q0 = pixels[point];
    let q1 = pixels[point + step];

    diff(p0, q0) * 2 + diff(p1, q1) / 2 <= edge_limit
}

#[inline]
fn should_filter(
    interior_limit: u8,
    edge_limit: u8,
    pixels: &[u8],
    point: usize,
    step: usize,
) -> bool {
    if !simple_threshold(i32::from(edge_limit), pixels, point, step) {
        return false;
    }
    let i = i32::from(interior_limit);
    let px = |k: isize| pixels[point.wrapping_add_signed(k * step as isize)];
    let (p3, p2, p1, p0) = (px(-4), px(-3), px(-2), px(-1));
    let (q0, q1, q2, q3) = (px(0), px(1), px(2), px(3));

    diff(p3, p2) <= i
        && diff(p2, p1) <= i
        && diff(p1, p0) <= i
        && diff(q3, q2) <= i
        && diff(q2, q1) <= i
        && diff(q1, q0) <= i
}

/// High edge variance: the edge is probably a real feature, only touch p0/q0.
#[inline]
fn hev(threshold: u8, pixels: &[u8], point: usize, step: usize) -> bool {
    let t = i32::from(threshold);
    let p1 = pixels[point - 2 * step];
    let p0 = pixels[point - step];
    let q0 = pixels[point];
    let q1 = pixels[point + step];

    diff(p1, p0) > t || diff(q1, q0) > t
}

/// Simple filter: luma only, adjusts p0 and q0.
pub(crate) fn simple_segment(edge_limit: u8, pixels: &mut [u8], point: usize, step: usize) {
    if simple_threshold(i32::from(edge_limit), pixels, point, step) {
        common_adjust(true, pixels, point, step);
    }
}

/// Normal filter for edges between subblocks inside a macroblock.
pub(crate) fn subblock_filter(
    hev_threshold: u8,
    interior_limit: u8,
    edge_limit: u8,
    pixels: &mut [u8],
    point: usize,
    step: usize,
) {
    if !should_filter(interior_limit, edge_limit, pixels, point, step) {
        return;
    }

    let hv = hev(hev_threshold, pixels, point, step);
    let a = (common_adjust(hv, pixels, point, step) + 1) >> 1;

    if !hv {
        let q1 = u2s(pixels[point + step]);
        let p1 = u2s(pixels[point - 2 * step]);
        pixels[point + step] = s2u(q1 - a);
        pixels[point - 2 * step] = s2u(p1 + a);
    }
}

/// Normal filter for edges between macroblocks, reaching three pixels deep.
pub(crate) fn macroblock_filter(
    hev_threshold: u8,
    interior_limit: u8,
    edge_limit: u8,
    pixels: &mut [u8],
    point: usize,
    step: usize,
) {
    if !should_filter(interior_limit, edge_limit, pixels, point, step) {
        return;
    }

    if hev(hev_threshold, pixels, point, step) {
        common_adjust(true, pixels, point, step);
        return;
    }

    let p2 = u2s(pixels[point - 3 * step]);
    let p1 = u2s(pixels[point - 2 * step]);
    let p0 = u2s(pixels[point - step]);
    let q0 = u2s(pixels[point]);
    let q1 = u2s(pixels[point + step]);
    let q2 = u2s(pixels[point + 2 * step]);

    let w = c(c(p1 - q1) + 3 * (q0 - p0));

    let a = c((27 * w + 63) >> 7);
    pixels[point] = s2u(q0 - a);
    pixels[point - step] = s2u(p0 + a);

    let a = c((18 * w + 63) >> 7);
    pixels[point + step] = s2u(q1 - a);
    pixels[point - 2 * step] = s2u(p1 + a);

    let a = c((9 * w + 63) >> 7);
    pixels[point + 2 * step] = s2u(q2 - a);
    pixels[point - 3 * step] = s2u(p2 + a);
}

/// Which filter runs along an edge, with its thresholds.
#[derive(Clone, Copy, Debug)]
pub(crate) enum EdgeFilter {
    Simple {
        edge_limit: u8,
    },
    Subblock {
        hev_threshold: u8,
        interior_limit: u8,
        edge_limit: u8,
    },
    Macroblock {
        hev_threshold: u8,
        interior_limit: u8,
        edge_limit: u8,
    },
}

impl EdgeFilter {
    #[inline]
    fn apply(self, pixels: &mut [u8], point: usize, step: usize) {
        match self {
            EdgeFilter::Simple { edge_limit } => simple_segment(edge_limit, pixels, point, step),
            EdgeFilter::Subblock {
                hev_threshold,
                interior_limit,
                edge_limit,
            } => subblock_filter(
                hev_threshold,
                interior_limit,
                edge_limit,
                pixels,
                point,
                step,
            ),
            EdgeFilter::Macroblock {
                hev_threshold,
                interior_limit,
                edge_limit,
            } => macroblock_filter(
                hev_threshold,
                interior_limit,
                edge_limit,
                pixels,
                point,
                step,
            ),
        }
    }
}

/// Filters the vertical edge just left of column `x`, for `len` rows starting at `y`.
pub(crate) fn filter_vertical_edge(
    filter: EdgeFilter,
    plane: &mut [u8],
    stride: usize,
    x: usize,
    y: usize,
    len: usize,
) {
    for row in y..y + len {
        filter.apply(plane, row * stride + x, 1);
    }
}

/// Filters the horizontal edge just above row `y`, for `len` columns starting at `x`.
pub(crate) fn filter_horizontal_edge(
    filter: EdgeFilter,
    plane: &mut [u8],
    stride: usize,
    x: usize,
    y: usize,
    len: usize,
) {
    for col in x..x + len {
        filter.apply(plane, y * stride + col, stride);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP_EDGE: [u8; 8] = [100, 100, 100, 100, 110, 110, 110, 110];

    #[test]
    fn flat_line_is_untouched() {
        let mut line = [77u8; 8];
        simple_segment(127, &mut line, 4, 1);
        macroblock_filter(0, 63, 127, &mut line, 4, 1);
        subblock_filter(0, 63, 127, &mut line, 4, 1);
        assert_eq!(line, [77u8; 8]);
    }

    #[test]
    fn simple_filter_smooths_small_step() {
        let mut line = STEP_EDGE;
        simple_segment(30, &mut line, 4, 1);
        assert_eq!(line, [100, 100, 100, 102, 107, 110, 110, 110]);
    }

    #[test]
    fn simple_filter_respects_edge_limit() {
        // 2 * 10 + 10 / 2 = 25 exceeds the limit
        let mut line = STEP_EDGE;
        simple_segment(24, &mut line, 4, 1);
        assert_eq!(line, STEP_EDGE);
    }

    #[test]
    fn macroblock_filter_reaches_three_pixels() {
        let mut line = STEP_EDGE;
        macroblock_filter(20, 10, 40, &mut line, 4, 1);
        assert_eq!(line, [100, 101, 103, 104, 106, 107, 109, 110]);
    }

    #[test]
    fn subblock_filter_adjusts_two_pixels() {
        let mut line = STEP_EDGE;
        subblock_filter(20, 10, 40, &mut line, 4, 1);
        // inner pair moves by (30 + 4) >> 3 = 4, outer pair by (4 + 1) >> 1 = 2
        assert_eq!(line, [100, 100, 102, 104, 106, 108, 110, 110]);
    }

    #[test]
    fn interior_limit_blocks_normal_filter() {
        let mut line = [100, 120, 100, 100, 110, 110, 110, 110];
        let before = line;
        macroblock_filter(20, 10, 127, &mut line, 4, 1);
        assert_eq!(line, before);
    }

    #[test]
    fn high_edge_variance_only_moves_inner_pixels() {
        let mut line = [100, 100, 100, 104, 110, 110, 110, 110];
        macroblock_filter(2, 10, 40, &mut line, 4, 1);
        assert_eq!(&line[..2], &[100, 100]);
        assert_eq!(&line[6..], &[110, 110]);
        assert_eq!(line[2], 100);
        assert_eq!(line[5], 110);
    }

    #[test]
    fn horizontal_edge_uses_stride() {
        // 8 rows of 2 columns, edge between rows 3 and 4
        let stride = 2;
        let mut plane = [0u8; 16];
        for (row, &v) in STEP_EDGE.iter().enumerate() {
            plane[row * stride] = v;
            plane[row * stride + 1] = v;
        }
        filter_horizontal_edge(
            EdgeFilter::Simple { edge_limit: 30 },
            &mut plane,
            stride,
            0,
            4,
            2,
        );
        let column: [u8; 8] = core::array::from_fn(|row| plane[row * stride + 1]);
        assert_eq!(column, [100, 100, 100, 102, 107, 110, 110, 110]);
    }
}
