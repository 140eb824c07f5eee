//! Inverse image transforms of the VP8L format.
//!
//! Pixels are packed `0xAARRGGBB` values. Every transform works in place on the
//! decoded image except color indexing, which expands the bundled indices of a
//! narrower image to the full width.

use alloc::vec::Vec;
use core::fmt;

use super::api::DecodingError;

/// Number of `2^bits` wide tiles covering `size` pixels.
#[inline]
pub(crate) fn subsample_size(size: usize, bits: u8) -> usize {
    size.div_ceil(1 << bits)
}

/// A transform read from the stream, with the data needed to undo it.
#[derive(Clone)]
pub(crate) enum Transform {
    /// One predictor mode per `2^size_bits` tile, in the green channel.
    Predictor { size_bits: u8, modes: Vec<u32> },
    /// Per-tile channel multipliers.
    CrossColor { size_bits: u8, multipliers: Vec<u32> },
    SubtractGreen,
    /// `2^width_bits` indices are bundled into the green channel of each coded pixel.
    ColorIndexing { width_bits: u8, palette: Vec<u32> },
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Predictor { size_bits, .. } => {
                write!(f, "Predictor(size_bits={size_bits})")
            }
            Transform::CrossColor { size_bits, .. } => {
                write!(f, "CrossColor(size_bits={size_bits})")
            }
            Transform::SubtractGreen => f.write_str("SubtractGreen"),
            Transform::ColorIndexing {
                width_bits,
                palette,
            } => write!(
                f,
                "ColorIndexing(width_bits={width_bits}, palette_len={})",
                palette.len()
            ),
        }
    }
}

impl Transform {
    /// Builds the color indexing transform from the delta-coded palette as read.
    ///
    /// The palette is padded with transparent black up to the number of values
    /// an index can take, so every index decodes to some color.
    pub(crate) fn color_indexing(raw: &[u32]) -> Self {
        let width_bits = match raw.len() {
            n if n > 16 => 0,
            n if n > 4 => 1,
            n if n > 2 => 2,
            _ => 3,
        };
        let capacity = 1usize << (8 >> width_bits);
        let mut palette = alloc::vec![0u32; capacity.max(raw.len())];
        let mut prev = 0;
        for (entry, &delta) in palette.iter_mut().zip(raw) {
            prev = add_pixels(prev, delta);
            *entry = prev;
        }
        Transform::ColorIndexing {
            width_bits,
            palette,
        }
    }

    /// Undoes this transform on an image that is `width` pixels wide once restored.
    pub(crate) fn apply_inverse(
        &self,
        pixels: &mut Vec<u32>,
        width: usize,
        height: usize,
    ) -> Result<(), DecodingError> {
        match self {
            Transform::ColorIndexing {
                width_bits,
                palette,
            } => {
                if pixels.len() != subsample_size(width, *width_bits) * height {
                    return Err(DecodingError::TransformError);
                }
                *pixels = expand_color_indexes(pixels, width, height, *width_bits, palette);
                return Ok(());
            }
            _ if pixels.len() != width * height => return Err(DecodingError::TransformError),
            Transform::Predictor { size_bits, modes } => {
                inverse_predictor(pixels, width, height, *size_bits, modes)
            }
            Transform::CrossColor {
                size_bits,
                multipliers,
            } => inverse_cross_color(pixels, width, *size_bits, multipliers),
            Transform::SubtractGreen => add_green(pixels),
        }
        Ok(())
    }
}

/// Adds two pixels channel by channel, modulo 256.
#[inline]
fn add_pixels(a: u32, b: u32) -> u32 {
    let alpha_green = (a & 0xff00ff00).wrapping_add(b & 0xff00ff00);
    let red_blue = (a & 0x00ff00ff).wrapping_add(b & 0x00ff00ff);
    (alpha_green & 0xff00ff00) | (red_blue & 0x00ff00ff)
}

/// Average two pixels component-wise, rounding down.
#[inline]
fn average2(a: u32, b: u32) -> u32 {
    (((a ^ b) & 0xfefefefe) >> 1) + (a & b)
}

#[inline]
fn channels(p: u32) -> [i16; 4] {
    p.to_be_bytes().map(i16::from)
}

#[inline]
fn from_channels(c: [i16; 4]) -> u32 {
    u32::from_be_bytes(c.map(|v| v.clamp(0, 255) as u8))
}

/// Chooses left or top, whichever is closer to the gradient estimate `L + T - TL`.
/// Ties go to top.
#[inline]
fn select(left: u32, top: u32, top_left: u32) -> u32 {
    let (l, t, tl) = (channels(left), channels(top), channels(top_left));
    let mut predict_left = 0;
    let mut predict_top = 0;
    for i in 0..4 {
        predict_left += (t[i] - tl[i]).abs();
        predict_top += (l[i] - tl[i]).abs();
    }
    if predict_left < predict_top {
        left
    } else {
        top
    }
}

#[inline]
fn clamp_add_subtract_full(left: u32, top: u32, top_left: u32) -> u32 {
    let (l, t, tl) = (channels(left), channels(top), channels(top_left));
    from_channels(core::array::from_fn(|i| l[i] + t[i] - tl[i]))
}

#[inline]
fn clamp_add_subtract_half(left: u32, top: u32, top_left: u32) -> u32 {
    let avg = channels(average2(left, top));
    let tl = channels(top_left);
    from_channels(core::array::from_fn(|i| avg[i] + (avg[i] - tl[i]) / 2))
}

/// Predicted value of a pixel for modes 0..=13; 14 and 15 behave like 0.
#[inline]
fn predict(mode: u32, left: u32, top: u32, top_left: u32, top_right: u32) -> u32 {
    match mode {
        1 => left,
        2 => top,
        3 => top_right,
        4 => top_left,
        5 => average2(average2(left, top_right), top),
        6 => average2(left, top_left),
        7 => average2(left, top),
        8 => average2(top_left, top),
        9 => average2(top, top_right),
        10 => average2(average2(left, top_left), average2(top, top_right)),
        11 => select(left, top, top_left),
        12 => clamp_add_subtract_full(left, top, top_left),
        13 => clamp_add_subtract_half(left, top, top_left),
        _ => 0xff000000,
    }
}

fn inverse_predictor(pixels: &mut [u32], width: usize, height: usize, bits: u8, modes: &[u32]) {
    // the first row predicts from black, then from the left
    pixels[0] = add_pixels(pixels[0], 0xff000000);
    for x in 1..width {
        pixels[x] = add_pixels(pixels[x], pixels[x - 1]);
    }

    let tiles_per_row = subsample_size(width, bits);
    for y in 1..height {
        let row = y * width;
        // the first column predicts from the top
        pixels[row] = add_pixels(pixels[row], pixels[row - width]);

        let tile_row = &modes[(y >> bits) * tiles_per_row..];
        for x in 1..width {
            let mode = (tile_row[x >> bits] >> 8) & 0xf;
            let i = row + x;
            // the rightmost pixel's top-right is the first pixel of the current row
            let predicted = predict(
                mode,
                pixels[i - 1],
                pixels[i - width],
                pixels[i - width - 1],
                pixels[i - width + 1],
            );
            pixels[i] = add_pixels(pixels[i], predicted);
        }
    }
}

#[inline]
fn color_transform_delta(multiplier: u8, color: u8) -> i32 {
    (i32::from(multiplier as i8) * i32::from(color as i8)) >> 5
}

fn inverse_cross_color(pixels: &mut [u32], width: usize, bits: u8, multipliers: &[u32]) {
    let tiles_per_row = subsample_size(width, bits);
    for (y, row) in pixels.chunks_exact_mut(width).enumerate() {
        let tile_row = &multipliers[(y >> bits) * tiles_per_row..];
        for (x, pixel) in row.iter_mut().enumerate() {
            let [_, red_to_blue, green_to_blue, green_to_red] = tile_row[x >> bits].to_be_bytes();
            let [_, red, green, blue] = pixel.to_be_bytes();

            let red = (i32::from(red) + color_transform_delta(green_to_red, green)) as u8;
            let blue = i32::from(blue)
                + color_transform_delta(green_to_blue, green)
                + color_transform_delta(red_to_blue, red);

            *pixel = (*pixel & 0xff00ff00) | (u32::from(red) << 16) | u32::from(blue as u8);
        }
    }
}

fn add_green(pixels: &mut [u32]) {
    for pixel in pixels.iter_mut() {
        let green = (*pixel >> 8) & 0xff;
        let red_blue = (*pixel & 0x00ff00ff).wrapping_add((green << 16) | green);
        *pixel = (*pixel & 0xff00ff00) | (red_blue & 0x00ff00ff);
    }
}

fn expand_color_indexes(
    packed: &[u32],
    width: usize,
    height: usize,
    bits: u8,
    palette: &[u32],
) -> Vec<u32> {
    let lookup = |index: u32| palette.get(index as usize).copied().unwrap_or(0);

    if bits == 0 {
        return packed.iter().map(|&p| lookup((p >> 8) & 0xff)).collect();
    }

    let packed_width = subsample_size(width, bits);
    let bits_per_index = 8 >> bits;
    let index_mask = (1u32 << bits_per_index) - 1;
    let x_mask = (1usize << bits) - 1;

    let mut out = Vec::with_capacity(width * height);
    for row in packed.chunks_exact(packed_width) {
        for x in 0..width {
            let green = (row[x >> bits] >> 8) & 0xff;
            let shift = (x & x_mask) * bits_per_index;
            out.push(lookup((green >> shift) & index_mask));
        }
    }
    out
}
