//! Inverse transforms for VP8 residual reconstruction (RFC 6386, section 14).
//!
//! Both transforms are separable: a 4-point butterfly runs down every column
//! and then along every row, with rounding applied once at the end.

use core::array;

/// `cos(pi/8) * sqrt(2) - 1` in 16 bit fixed point.
const COS_MINUS_ONE: i64 = 20091;
/// `sin(pi/8) * sqrt(2)` in 16 bit fixed point.
const SIN: i64 = 35468;

fn mul_cos(x: i64) -> i64 {
    x + ((x * COS_MINUS_ONE) >> 16)
}

fn mul_sin(x: i64) -> i64 {
    (x * SIN) >> 16
}

/// Applies `butterfly` to each column, then to each row of the result.
fn separable<T: Copy + Default>(block: [T; 16], butterfly: impl Fn([T; 4]) -> [T; 4]) -> [T; 16] {
    let mut out = [T::default(); 16];
    for col in 0..4 {
        let column = butterfly(array::from_fn(|row| block[row * 4 + col]));
        for (row, v) in column.into_iter().enumerate() {
            out[row * 4 + col] = v;
        }
    }
    for row in out.chunks_exact_mut(4) {
        let done = butterfly(array::from_fn(|i| row[i]));
        row.copy_from_slice(&done);
    }
    out
}

fn idct_butterfly(x: [i64; 4]) -> [i64; 4] {
    let even_sum = x[0] + x[2];
    let even_diff = x[0] - x[2];
    let odd_lo = mul_sin(x[1]) - mul_cos(x[3]);
    let odd_hi = mul_cos(x[1]) + mul_sin(x[3]);
    [
        even_sum + odd_hi,
        even_diff + odd_lo,
        even_diff - odd_lo,
        even_sum - odd_hi,
    ]
}

fn wht_butterfly(x: [i32; 4]) -> [i32; 4] {
    let outer_sum = x[0] + x[3];
    let inner_sum = x[1] + x[2];
    let inner_diff = x[1] - x[2];
    let outer_diff = x[0] - x[3];
    [
        outer_sum + inner_sum,
        inner_diff + outer_diff,
        outer_sum - inner_sum,
        outer_diff - inner_diff,
    ]
}

/// Full 4x4 inverse DCT. Intermediates are widened to `i64`.
pub(crate) fn idct4x4(block: &mut [i32; 16]) {
    let spatial = separable(block.map(i64::from), idct_butterfly);
    *block = spatial.map(|v| ((v + 4) >> 3) as i32);
}

/// Inverse DCT of a block whose AC coefficients are all zero.
fn idct4x4_dc(block: &mut [i32; 16]) {
    let dc = (block[0] + 4) >> 3;
    block.fill(dc);
}

/// Inverse DCT, skipping the butterflies when only DC is set.
pub(crate) fn inverse_transform(block: &mut [i32; 16]) {
    if block[1..].iter().all(|&c| c == 0) {
        idct4x4_dc(block);
    } else {
        idct4x4(block);
    }
}

/// Inverse Walsh-Hadamard transform of the Y2 block (section 14.3).
pub(crate) fn iwht4x4(block: &mut [i32; 16]) {
    *block = separable(*block, wht_butterfly).map(|v| (v + 3) >> 3);
}
