//! Decoding of VP8L (lossless) bitstreams.
//!
//! A VP8L stream is read least-significant bit first. The top-level image is
//! preceded by up to four transforms; every entropy-coded image (the main
//! image and the subimages carrying transform data, palettes and the
//! meta-Huffman index) uses the same layout: optional color cache, prefix code
//! groups, then literals, cache hits and LZ77 backward references.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace};

use super::api::DecodingError;
use super::huffman::HuffmanTree;
use super::limits::Limits;
use super::lossless_transform::{subsample_size, Transform};

const LOSSLESS_SIGNATURE: u8 = 0x2f;

const NUM_LITERAL_CODES: usize = 256;
const NUM_LENGTH_CODES: usize = 24;
const NUM_DISTANCE_CODES: usize = 40;

const CODE_LENGTH_CODES: usize = 19;
const CODE_LENGTH_CODE_ORDER: [usize; CODE_LENGTH_CODES] = [
    17, 18, 0, 1, 2, 3, 4, 5, 16, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
];
const DEFAULT_CODE_LENGTH: u8 = 8;

const COLOR_CACHE_MULT: u32 = 0x1e35a7bd;
const MAX_CACHE_BITS: u8 = 11;

/// Maps distance codes 1..=120 to (xoffset, yoffset) pairs around the current pixel.
#[rustfmt::skip]
const DISTANCE_MAP: [(i8, i8); 120] = [
    (0, 1),  (1, 0),  (1, 1),  (-1, 1), (0, 2),  (2, 0),  (1, 2),  (-1, 2),
    (2, 1),  (-2, 1), (2, 2),  (-2, 2), (0, 3),  (3, 0),  (1, 3),  (-1, 3),
    (3, 1),  (-3, 1), (2, 3),  (-2, 3), (3, 2),  (-3, 2), (0, 4),  (4, 0),
    (1, 4),  (-1, 4), (4, 1),  (-4, 1), (3, 3),  (-3, 3), (2, 4),  (-2, 4),
    (4, 2),  (-4, 2), (0, 5),  (3, 4),  (-3, 4), (4, 3),  (-4, 3), (5, 0),
    (1, 5),  (-1, 5), (5, 1),  (-5, 1), (2, 5),  (-2, 5), (5, 2),  (-5, 2),
    (4, 4),  (-4, 4), (3, 5),  (-3, 5), (5, 3),  (-5, 3), (0, 6),  (6, 0),
    (1, 6),  (-1, 6), (6, 1),  (-6, 1), (2, 6),  (-2, 6), (6, 2),  (-6, 2),
    (4, 5),  (-4, 5), (5, 4),  (-5, 4), (3, 6),  (-3, 6), (6, 3),  (-6, 3),
    (0, 7),  (7, 0),  (1, 7),  (-1, 7), (5, 5),  (-5, 5), (7, 1),  (-7, 1),
    (4, 6),  (-4, 6), (6, 4),  (-6, 4), (2, 7),  (-2, 7), (7, 2),  (-7, 2),
    (3, 7),  (-3, 7), (7, 3),  (-7, 3), (5, 6),  (-5, 6), (6, 5),  (-6, 5),
    (8, 0),  (4, 7),  (-4, 7), (7, 4),  (-7, 4), (8, 1),  (8, 2),  (6, 6),
    (-6, 6), (8, 3),  (5, 7),  (-5, 7), (7, 5),  (-7, 5), (8, 4),  (6, 7),
    (-6, 7), (7, 6),  (-7, 6), (8, 5),  (7, 7),  (-7, 7), (8, 6),  (8, 7)
];

/// LSB-first bit reader over a VP8L chunk.
///
/// Bits past the end of the data are never invented: consuming more bits than
/// remain is a [`DecodingError::BitStreamError`].
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buffer: u64,
    nbits: u8,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            buffer: 0,
            nbits: 0,
        }
    }

    #[inline]
    fn fill(&mut self) {
        while self.nbits <= 56 {
            let Some(&byte) = self.data.get(self.pos) else {
                break;
            };
            self.buffer |= u64::from(byte) << self.nbits;
            self.nbits += 8;
            self.pos += 1;
        }
    }

    /// Returns the next `n` bits without consuming them. Missing bits read as zero.
    #[inline]
    pub(crate) fn peek(&mut self, n: u8) -> u32 {
        debug_assert!(n <= 32);
        self.fill();
        (self.buffer & ((1u64 << n) - 1)) as u32
    }

    #[inline]
    pub(crate) fn consume(&mut self, n: u8) -> Result<(), DecodingError> {
        if n > self.nbits {
            return Err(DecodingError::BitStreamError);
        }
        self.buffer >>= n;
        self.nbits -= n;
        Ok(())
    }

    /// Reads an `n`-bit unsigned value, `n <= 32`.
    #[inline]
    pub(crate) fn read_bits(&mut self, n: u8) -> Result<u32, DecodingError> {
        let value = self.peek(n);
        self.consume(n)?;
        Ok(value)
    }

    #[inline]
    pub(crate) fn read_bit(&mut self) -> Result<bool, DecodingError> {
        Ok(self.read_bits(1)? == 1)
    }
}

/// Fields of the 5-byte VP8L header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LosslessHeader {
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Hint only; the decoded pixels carry the real alpha values.
    pub(crate) alpha_is_used: bool,
}

fn read_header(br: &mut BitReader<'_>) -> Result<LosslessHeader, DecodingError> {
    let mut read = |bits: u8| br.read_bits(bits).or(Err(DecodingError::NotEnoughInitData));
    let signature = read(8)? as u8;
    if signature != LOSSLESS_SIGNATURE {
        return Err(DecodingError::LosslessSignatureInvalid(signature));
    }

    let fields = read(32)?;
    let width = (fields & 0x3fff) + 1;
    let height = ((fields >> 14) & 0x3fff) + 1;
    let alpha_is_used = (fields >> 28) & 1 == 1;
    let version = (fields >> 29) as u8;
    if version != 0 {
        return Err(DecodingError::VersionNumberInvalid(version));
    }

    Ok(LosslessHeader {
        width,
        height,
        alpha_is_used,
    })
}

/// Parses only the header of a VP8L chunk payload.
pub(crate) fn read_lossless_header(data: &[u8]) -> Result<LosslessHeader, DecodingError> {
    read_header(&mut BitReader::new(data))
}

/// A decoded lossless image as packed `0xAARRGGBB` pixels.
#[derive(Clone, Debug)]
pub(crate) struct LosslessFrame {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) argb: Vec<u32>,
}

impl LosslessFrame {
    /// Non-premultiplied RGBA bytes, row-major.
    pub(crate) fn to_rgba(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.argb.len() * 4);
        for &argb in &self.argb {
            let [a, r, g, b] = argb.to_be_bytes();
            out.extend_from_slice(&[r, g, b, a]);
        }
        out
    }
}

struct ColorCache {
    colors: Vec<u32>,
    hash_shift: u32,
}

impl ColorCache {
    fn new(bits: u8) -> Self {
        Self {
            colors: vec![0; 1 << bits],
            hash_shift: 32 - u32::from(bits),
        }
    }

    #[inline]
    fn insert(&mut self, argb: u32) {
        let index = (COLOR_CACHE_MULT.wrapping_mul(argb) >> self.hash_shift) as usize;
        self.colors[index] = argb;
    }

    #[inline]
    fn lookup(&self, index: usize) -> Option<u32> {
        self.colors.get(index).copied()
    }
}

/// The five prefix codes used for one region of an image.
struct HuffmanGroup {
    green: HuffmanTree,
    red: HuffmanTree,
    blue: HuffmanTree,
    alpha: HuffmanTree,
    distance: HuffmanTree,
}

/// Code groups of one entropy-coded image and the map selecting between them.
struct HuffmanCodes {
    /// log2 of the tile size; 0 when the whole image uses group 0
    bits: u8,
    tiles_per_row: usize,
    group_index: Vec<u32>,
    groups: Vec<HuffmanGroup>,
}

impl HuffmanCodes {
    #[inline]
    fn group_at(&self, x: usize, y: usize) -> &HuffmanGroup {
        let index = if self.bits == 0 {
            0
        } else {
            self.group_index[(y >> self.bits) * self.tiles_per_row + (x >> self.bits)] as usize
        };
        &self.groups[index]
    }

    /// Mask of `x` bits that stay constant within a tile.
    fn tile_mask(&self) -> usize {
        if self.bits == 0 {
            usize::MAX
        } else {
            (1 << self.bits) - 1
        }
    }
}

/// Decodes the value of a length or distance prefix code and its extra bits.
#[inline]
fn copy_distance(br: &mut BitReader<'_>, prefix: u16) -> Result<usize, DecodingError> {
    if prefix < 4 {
        return Ok(usize::from(prefix) + 1);
    }
    let extra_bits = ((prefix - 2) >> 1) as u8;
    let offset = (2 + usize::from(prefix & 1)) << extra_bits;
    Ok(offset + br.read_bits(extra_bits)? as usize + 1)
}

/// Turns a distance code into a linear pixel distance for an image of width `xsize`.
#[inline]
fn plane_code_to_distance(xsize: usize, code: usize) -> usize {
    if code > DISTANCE_MAP.len() {
        return code - DISTANCE_MAP.len();
    }
    let (xoffset, yoffset) = DISTANCE_MAP[code - 1];
    let distance = isize::from(xoffset) + isize::from(yoffset) * xsize as isize;
    distance.max(1) as usize
}

/// Decoder state for one VP8L chunk.
pub(crate) struct LosslessDecoder<'a> {
    br: BitReader<'a>,
    limits: &'a Limits,
    /// Transforms in stream order, each with the image width it applies to.
    transforms: Vec<(Transform, usize)>,
}

impl<'a> LosslessDecoder<'a> {
    pub(crate) fn new(data: &'a [u8], limits: &'a Limits) -> Self {
        Self {
            br: BitReader::new(data),
            limits,
            transforms: Vec::new(),
        }
    }

    /// Decodes a complete VP8L chunk payload.
    pub(crate) fn decode_frame(
        data: &'a [u8],
        limits: &'a Limits,
    ) -> Result<LosslessFrame, DecodingError> {
        let mut decoder = Self::new(data, limits);
        decoder.decode_frame_()
    }

    fn decode_frame_(&mut self) -> Result<LosslessFrame, DecodingError> {
        let header = read_header(&mut self.br)?;
        self.limits.check_dimensions(header.width, header.height)?;
        let width = header.width as usize;
        let height = header.height as usize;
        // packed pixels plus the RGBA output
        self.limits.check_memory(width * height * 8)?;

        debug!(
            "VP8L image {}x{}, alpha hint {}",
            width, height, header.alpha_is_used
        );

        let mut argb = self.decode_image_stream(width, height, true)?;

        for (transform, xsize) in self.transforms.iter().rev() {
            transform.apply_inverse(&mut argb, *xsize, height)?;
        }

        Ok(LosslessFrame {
            width: header.width,
            height: header.height,
            argb,
        })
    }

    /// Decodes one entropy-coded image. Only the top-level image carries
    /// transforms and a meta-Huffman index.
    fn decode_image_stream(
        &mut self,
        xsize: usize,
        ysize: usize,
        is_level0: bool,
    ) -> Result<Vec<u32>, DecodingError> {
        let xsize = if is_level0 {
            self.read_transforms(xsize, ysize)?
        } else {
            xsize
        };

        let cache_bits = if self.br.read_bit()? {
            let bits = self.br.read_bits(4)? as u8;
            if !(1..=MAX_CACHE_BITS).contains(&bits) {
                return Err(DecodingError::InvalidColorCacheBits(bits));
            }
            Some(bits)
        } else {
            None
        };

        let codes = self.read_huffman_codes(xsize, ysize, cache_bits, is_level0)?;
        if is_level0 {
            debug!(
                "VP8L color cache bits {:?}, {} Huffman group(s)",
                cache_bits,
                codes.groups.len()
            );
        }

        let data = self.decode_pixels(xsize, ysize, &codes, cache_bits.map(ColorCache::new))?;
        trace!("VP8L image stream {xsize}x{ysize} decoded");
        Ok(data)
    }

    /// Reads the transform list and returns the width of the coded image.
    fn read_transforms(&mut self, mut xsize: usize, ysize: usize) -> Result<usize, DecodingError> {
        let mut seen = [false; 4];
        while self.br.read_bit()? {
            let kind = self.br.read_bits(2)? as usize;
            if seen[kind] {
                return Err(DecodingError::TransformError);
            }
            seen[kind] = true;

            let transform = match kind {
                0 | 1 => {
                    let size_bits = self.br.read_bits(3)? as u8 + 2;
                    let data = self.decode_image_stream(
                        subsample_size(xsize, size_bits),
                        subsample_size(ysize, size_bits),
                        false,
                    )?;
                    if kind == 0 {
                        Transform::Predictor {
                            size_bits,
                            modes: data,
                        }
                    } else {
                        Transform::CrossColor {
                            size_bits,
                            multipliers: data,
                        }
                    }
                }
                2 => Transform::SubtractGreen,
                _ => {
                    let table_size = self.br.read_bits(8)? as usize + 1;
                    let raw = self.decode_image_stream(table_size, 1, false)?;
                    Transform::color_indexing(&raw)
                }
            };
            debug!("VP8L transform {transform:?}");

            let coded_xsize = match &transform {
                Transform::ColorIndexing { width_bits, .. } => subsample_size(xsize, *width_bits),
                _ => xsize,
            };
            self.transforms.push((transform, xsize));
            xsize = coded_xsize;
        }
        Ok(xsize)
    }

    fn read_huffman_codes(
        &mut self,
        xsize: usize,
        ysize: usize,
        cache_bits: Option<u8>,
        allow_meta: bool,
    ) -> Result<HuffmanCodes, DecodingError> {
        let mut bits = 0;
        let mut tiles_per_row = 0;
        let mut group_index = Vec::new();
        let mut num_groups = 1;

        if allow_meta && self.br.read_bit()? {
            bits = self.br.read_bits(3)? as u8 + 2;
            tiles_per_row = subsample_size(xsize, bits);
            let image =
                self.decode_image_stream(tiles_per_row, subsample_size(ysize, bits), false)?;
            group_index = image.iter().map(|&p| (p >> 8) & 0xffff).collect();
            num_groups = group_index.iter().max().map_or(1, |&m| m as usize + 1);
        }

        let cache_size = cache_bits.map_or(0, |bits| 1usize << bits);
        let green_alphabet = NUM_LITERAL_CODES + NUM_LENGTH_CODES + cache_size;

        let mut groups = Vec::with_capacity(num_groups);
        for _ in 0..num_groups {
            groups.push(HuffmanGroup {
                green: self.read_huffman_code(green_alphabet)?,
                red: self.read_huffman_code(NUM_LITERAL_CODES)?,
                blue: self.read_huffman_code(NUM_LITERAL_CODES)?,
                alpha: self.read_huffman_code(NUM_LITERAL_CODES)?,
                distance: self.read_huffman_code(NUM_DISTANCE_CODES)?,
            });
        }

        Ok(HuffmanCodes {
            bits,
            tiles_per_row,
            group_index,
            groups,
        })
    }

    fn read_huffman_code(&mut self, alphabet_size: usize) -> Result<HuffmanTree, DecodingError> {
        let mut code_lengths = vec![0u8; alphabet_size];

        if self.br.read_bit()? {
            // simple code: one or two symbols of length 1
            let num_symbols = self.br.read_bits(1)? + 1;
            let first_bits = if self.br.read_bit()? { 8 } else { 1 };
            let first = self.br.read_bits(first_bits)? as usize;
            *code_lengths
                .get_mut(first)
                .ok_or(DecodingError::HuffmanError)? = 1;
            if num_symbols == 2 {
                let second = self.br.read_bits(8)? as usize;
                *code_lengths
                    .get_mut(second)
                    .ok_or(DecodingError::HuffmanError)? = 1;
            }
        } else {
            let num_codes = self.br.read_bits(4)? as usize + 4;
            let mut code_length_code_lengths = [0u8; CODE_LENGTH_CODES];
            for &symbol in &CODE_LENGTH_CODE_ORDER[..num_codes] {
                code_length_code_lengths[symbol] = self.br.read_bits(3)? as u8;
            }
            let tree = HuffmanTree::from_code_lengths(&code_length_code_lengths)?;
            self.read_code_lengths(&tree, &mut code_lengths)?;
        }

        HuffmanTree::from_code_lengths(&code_lengths)
    }

    fn read_code_lengths(
        &mut self,
        tree: &HuffmanTree,
        code_lengths: &mut [u8],
    ) -> Result<(), DecodingError> {
        let num_symbols = code_lengths.len();
        let mut max_tokens = num_symbols;
        if self.br.read_bit()? {
            let length_bits = 2 + 2 * self.br.read_bits(3)? as u8;
            max_tokens = 2 + self.br.read_bits(length_bits)? as usize;
            if max_tokens > num_symbols {
                return Err(DecodingError::HuffmanError);
            }
        }

        let mut prev_code_len = DEFAULT_CODE_LENGTH;
        let mut symbol = 0;
        while symbol < num_symbols {
            if max_tokens == 0 {
                break;
            }
            max_tokens -= 1;

            let code = tree.read_symbol(&mut self.br)?;
            if code < 16 {
                code_lengths[symbol] = code as u8;
                symbol += 1;
                if code != 0 {
                    prev_code_len = code as u8;
                }
                continue;
            }

            let (extra_bits, repeat_offset, value) = match code {
                16 => (2, 3, prev_code_len),
                17 => (3, 3, 0),
                _ => (7, 11, 0),
            };
            let repeat = self.br.read_bits(extra_bits)? as usize + repeat_offset;
            let end = symbol + repeat;
            if end > num_symbols {
                return Err(DecodingError::HuffmanError);
            }
            code_lengths[symbol..end].fill(value);
            symbol = end;
        }
        Ok(())
    }

    fn decode_pixels(
        &mut self,
        xsize: usize,
        ysize: usize,
        codes: &HuffmanCodes,
        mut cache: Option<ColorCache>,
    ) -> Result<Vec<u32>, DecodingError> {
        let total = xsize * ysize;
        let mut data = vec![0u32; total];
        let mask = codes.tile_mask();

        let mut pos = 0;
        let mut x = 0;
        let mut y = 0;
        let mut group = codes.group_at(0, 0);

        while pos < total {
            if x & mask == 0 {
                group = codes.group_at(x, y);
            }

            let code = usize::from(group.green.read_symbol(&mut self.br)?);
            if code < NUM_LITERAL_CODES {
                let red = u32::from(group.red.read_symbol(&mut self.br)?);
                let blue = u32::from(group.blue.read_symbol(&mut self.br)?);
                let alpha = u32::from(group.alpha.read_symbol(&mut self.br)?);
                let argb = (alpha << 24) | (red << 16) | ((code as u32) << 8) | blue;

                data[pos] = argb;
                if let Some(cache) = cache.as_mut() {
                    cache.insert(argb);
                }
                pos += 1;
                x += 1;
                if x == xsize {
                    x = 0;
                    y += 1;
                }
            } else if code < NUM_LITERAL_CODES + NUM_LENGTH_CODES {
                let length = copy_distance(&mut self.br, (code - NUM_LITERAL_CODES) as u16)?;
                let distance_symbol = group.distance.read_symbol(&mut self.br)?;
                let distance_code = copy_distance(&mut self.br, distance_symbol)?;
                let distance = plane_code_to_distance(xsize, distance_code);

                if distance > pos || length > total - pos {
                    return Err(DecodingError::BitStreamError);
                }
                // overlapping copies repeat the pattern, so go pixel by pixel
                for i in pos..pos + length {
                    let argb = data[i - distance];
                    data[i] = argb;
                    if let Some(cache) = cache.as_mut() {
                        cache.insert(argb);
                    }
                }

                pos += length;
                x += length;
                y += x / xsize;
                x %= xsize;
                if x & mask != 0 && pos < total {
                    group = codes.group_at(x, y);
                }
            } else {
                let index = code - (NUM_LITERAL_CODES + NUM_LENGTH_CODES);
                let cache = cache.as_mut().ok_or(DecodingError::BitStreamError)?;
                let argb = cache.lookup(index).ok_or(DecodingError::BitStreamError)?;
                // hits go back into the cache like every other emitted pixel
                cache.insert(argb);

                data[pos] = argb;
                pos += 1;
                x += 1;
                if x == xsize {
                    x = 0;
                    y += 1;
                }
            }
        }

        Ok(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::collections::BTreeSet;

    /// LSB-first bit writer for building VP8L streams.
    pub(crate) struct BitWriter {
        buffer: Vec<u8>,
        bits: u64,
        used: u8,
    }

    impl BitWriter {
        pub(crate) fn new() -> Self {
            Self {
                buffer: Vec::new(),
                bits: 0,
                used: 0,
            }
        }

        pub(crate) fn write_bits(&mut self, value: u64, n_bits: u8) {
            assert!(n_bits <= 32 && (n_bits == 32 || value >> n_bits == 0));
            self.bits |= value << self.used;
            self.used += n_bits;
            while self.used >= 8 {
                self.buffer.push(self.bits as u8);
                self.bits >>= 8;
                self.used -= 8;
            }
        }

        pub(crate) fn write_bit(&mut self, bit: bool) {
            self.write_bits(u64::from(bit), 1);
        }

        /// Writes a prefix code, most significant bit first.
        fn write_code(&mut self, code: u32, len: u8) {
            for bit in (0..len).rev() {
                self.write_bit((code >> bit) & 1 == 1);
            }
        }

        pub(crate) fn finish(mut self) -> Vec<u8> {
            if self.used > 0 {
                self.buffer.push(self.bits as u8);
            }
            self.buffer
        }
    }

    /// Canonical codes for a set of code lengths, assigned like the decoder does.
    fn canonical_codes(lengths: &[u8]) -> Vec<(u32, u8)> {
        let mut counts = [0u32; 16];
        for &len in lengths {
            counts[usize::from(len)] += 1;
        }
        counts[0] = 0;
        let mut next = [0u32; 16];
        let mut code = 0;
        for len in 1..16 {
            code = (code + counts[len - 1]) << 1;
            next[len] = code;
        }
        lengths
            .iter()
            .map(|&len| {
                let code = next[usize::from(len)];
                if len > 0 {
                    next[usize::from(len)] += 1;
                }
                (code, len)
            })
            .collect()
    }

    /// Complete lengths for `k` symbols: the first `2^L - k` get `L - 1` bits.
    fn flat_lengths(k: usize) -> Vec<u8> {
        if k == 1 {
            return vec![1];
        }
        let l = usize::BITS - (k - 1).leading_zeros();
        let short = (1usize << l) - k;
        (0..k)
            .map(|i| if i < short { l as u8 - 1 } else { l as u8 })
            .collect()
    }

    /// A prefix code over the symbols a test stream uses.
    pub(crate) struct TestCode {
        symbols: Vec<u16>,
        lengths: Vec<u8>,
        codes: Vec<(u32, u8)>,
    }

    impl TestCode {
        pub(crate) fn new(alphabet_size: usize, used: &BTreeSet<u16>) -> Self {
            let mut symbols: Vec<u16> = used.iter().copied().collect();
            if symbols.is_empty() {
                symbols.push(0);
            }
            let flat = flat_lengths(symbols.len());
            let mut lengths = vec![0u8; alphabet_size];
            for (&s, &len) in symbols.iter().zip(&flat) {
                lengths[usize::from(s)] = len;
            }
            let codes = canonical_codes(&lengths);
            Self {
                symbols,
                lengths,
                codes,
            }
        }

        pub(crate) fn single(alphabet_size: usize, symbol: u16) -> Self {
            Self::new(alphabet_size, &[symbol].into_iter().collect())
        }

        pub(crate) fn write_definition(&self, w: &mut BitWriter) {
            if self.symbols.len() <= 2 && self.symbols.iter().all(|&s| s < 256) {
                w.write_bit(true);
                w.write_bits(self.symbols.len() as u64 - 1, 1);
                let first = self.symbols[0];
                if first < 2 {
                    w.write_bit(false);
                    w.write_bits(u64::from(first), 1);
                } else {
                    w.write_bit(true);
                    w.write_bits(u64::from(first), 8);
                }
                if let Some(&second) = self.symbols.get(1) {
                    w.write_bits(u64::from(second), 8);
                }
                return;
            }

            // normal code: code lengths coded with a code over the used length values
            w.write_bit(false);
            let values: BTreeSet<u8> = self.lengths.iter().copied().collect();
            let values: Vec<u8> = values.into_iter().collect();
            let value_lengths = flat_lengths(values.len());
            let mut cl_lengths = [0u8; CODE_LENGTH_CODES];
            for (&v, &len) in values.iter().zip(&value_lengths) {
                cl_lengths[usize::from(v)] = len;
            }
            let num_codes = CODE_LENGTH_CODE_ORDER
                .iter()
                .rposition(|&s| cl_lengths[s] != 0)
                .map_or(4, |p| (p + 1).max(4));
            w.write_bits(num_codes as u64 - 4, 4);
            for &s in &CODE_LENGTH_CODE_ORDER[..num_codes] {
                w.write_bits(u64::from(cl_lengths[s]), 3);
            }
            w.write_bit(false);
            let cl_codes = canonical_codes(&cl_lengths);
            for &len in &self.lengths {
                let (code, n) = cl_codes[usize::from(len)];
                w.write_code(code, n);
            }
        }

        pub(crate) fn write_symbol(&self, w: &mut BitWriter, symbol: u16) {
            if self.symbols.len() > 1 {
                let (code, len) = self.codes[usize::from(symbol)];
                assert!(len > 0, "symbol {symbol} not in code");
                w.write_code(code, len);
            }
        }
    }

    #[derive(Clone, Copy, Debug)]
    pub(crate) enum Token {
        Literal(u32),
        Copy { length: usize, distance_code: usize },
        Cache(u16),
    }

    /// Prefix symbol and extra bits for a length or distance value.
    fn prefix_encode(value: usize) -> (u16, u8, u32) {
        if value <= 4 {
            return (value as u16 - 1, 0, 0);
        }
        let d = value - 1;
        let high = usize::BITS - 1 - d.leading_zeros();
        let second = (d >> (high - 1)) & 1;
        let extra_bits = high as u8 - 1;
        let prefix = 2 * high as u16 + second as u16;
        (prefix, extra_bits, (d & ((1 << extra_bits) - 1)) as u32)
    }

    /// Writes an entropy-coded image (cache flag onwards) using one code group.
    pub(crate) fn write_image(
        w: &mut BitWriter,
        tokens: &[Token],
        cache_bits: Option<u8>,
        is_level0: bool,
    ) {
        match cache_bits {
            Some(bits) => {
                w.write_bit(true);
                w.write_bits(u64::from(bits), 4);
            }
            None => w.write_bit(false),
        }
        if is_level0 {
            w.write_bit(false);
        }

        let mut used: [BTreeSet<u16>; 5] = Default::default();
        for token in tokens {
            match *token {
                Token::Literal(argb) => {
                    used[0].insert(((argb >> 8) & 0xff) as u16);
                    used[1].insert(((argb >> 16) & 0xff) as u16);
                    used[2].insert((argb & 0xff) as u16);
                    used[3].insert((argb >> 24) as u16);
                }
                Token::Copy {
                    length,
                    distance_code,
                } => {
                    used[0].insert(256 + prefix_encode(length).0);
                    used[4].insert(prefix_encode(distance_code).0);
                }
                Token::Cache(index) => {
                    used[0].insert(280 + index);
                }
            }
        }
        let cache_size = cache_bits.map_or(0, |bits| 1 << bits);
        let alphabets = [280 + cache_size, 256, 256, 256, 40];
        let codes: Vec<TestCode> = alphabets
            .iter()
            .zip(&used)
            .map(|(&size, used)| TestCode::new(size, used))
            .collect();
        for code in &codes {
            code.write_definition(w);
        }

        for token in tokens {
            match *token {
                Token::Literal(argb) => {
                    codes[0].write_symbol(w, ((argb >> 8) & 0xff) as u16);
                    codes[1].write_symbol(w, ((argb >> 16) & 0xff) as u16);
                    codes[2].write_symbol(w, (argb & 0xff) as u16);
                    codes[3].write_symbol(w, (argb >> 24) as u16);
                }
                Token::Copy {
                    length,
                    distance_code,
                } => {
                    let (prefix, n, extra) = prefix_encode(length);
                    codes[0].write_symbol(w, 256 + prefix);
                    w.write_bits(u64::from(extra), n);
                    let (prefix, n, extra) = prefix_encode(distance_code);
                    codes[4].write_symbol(w, prefix);
                    w.write_bits(u64::from(extra), n);
                }
                Token::Cache(index) => codes[0].write_symbol(w, 280 + index),
            }
        }
    }

    pub(crate) fn write_header(w: &mut BitWriter, width: u32, height: u32, alpha: bool) {
        w.write_bits(u64::from(LOSSLESS_SIGNATURE), 8);
        w.write_bits(u64::from(width - 1), 14);
        w.write_bits(u64::from(height - 1), 14);
        w.write_bit(alpha);
        w.write_bits(0, 3);
    }

    /// A complete VP8L payload of literal pixels without transforms.
    pub(crate) fn build_literal_stream(width: u32, height: u32, pixels: &[u32]) -> Vec<u8> {
        let mut w = BitWriter::new();
        write_header(&mut w, width, height, true);
        w.write_bit(false);
        let tokens: Vec<Token> = pixels.iter().map(|&p| Token::Literal(p)).collect();
        write_image(&mut w, &tokens, None, true);
        w.finish()
    }

    fn decode(data: &[u8]) -> Result<LosslessFrame, DecodingError> {
        LosslessDecoder::decode_frame(data, &Limits::default())
    }

    fn cache_index(argb: u32, bits: u8) -> u16 {
        (COLOR_CACHE_MULT.wrapping_mul(argb) >> (32 - u32::from(bits))) as u16
    }

    #[test]
    fn bit_reader_reads_lsb_first() {
        let data = [0b1010_1100, 0xff, 0x01];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_bits(2).unwrap(), 0b00);
        assert_eq!(br.read_bits(3).unwrap(), 0b011);
        assert!(br.read_bit().unwrap());
        assert_eq!(br.read_bits(10).unwrap(), 0b11_1111_1110);
        assert_eq!(br.read_bits(8).unwrap(), 0x01);
        assert!(matches!(br.read_bit(), Err(DecodingError::BitStreamError)));
    }

    #[test]
    fn bit_reader_spans_many_refills() {
        let mut w = BitWriter::new();
        for i in 0..200u32 {
            w.write_bits(u64::from(i % 32), 5);
            w.write_bits(u64::from(i.wrapping_mul(2654435761)), 32);
        }
        let data = w.finish();
        let mut br = BitReader::new(&data);
        for i in 0..200u32 {
            assert_eq!(br.read_bits(5).unwrap(), i % 32);
            assert_eq!(br.read_bits(32).unwrap(), i.wrapping_mul(2654435761));
        }
    }

    #[test]
    fn header_fields() {
        let mut w = BitWriter::new();
        write_header(&mut w, 400, 301, true);
        let data = w.finish();
        let header = read_lossless_header(&data).unwrap();
        assert_eq!(
            header,
            LosslessHeader {
                width: 400,
                height: 301,
                alpha_is_used: true
            }
        );
    }

    #[test]
    fn bad_signature_and_version() {
        assert!(matches!(
            read_lossless_header(&[0x2e, 0, 0, 0, 0]),
            Err(DecodingError::LosslessSignatureInvalid(0x2e))
        ));
        assert!(matches!(
            read_lossless_header(&[0x2f, 0, 0, 0, 0x20]),
            Err(DecodingError::VersionNumberInvalid(1))
        ));
        assert!(matches!(
            read_lossless_header(&[0x2f, 0, 0]),
            Err(DecodingError::NotEnoughInitData)
        ));
    }

    #[test]
    fn single_color_image_uses_no_pixel_bits() {
        let pixels = [0x80_40_20_10; 6];
        let data = build_literal_stream(3, 2, &pixels);
        let frame = decode(&data).unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert_eq!(frame.argb, pixels);
        assert_eq!(&frame.to_rgba()[..4], &[0x40, 0x20, 0x10, 0x80]);
    }

    #[test]
    fn literal_pixels_with_normal_codes() {
        let pixels: Vec<u32> = (0..12u32)
            .map(|i| 0xff00_0000 | (i * 0x0001_0307) & 0x00ff_ffff)
            .collect();
        let data = build_literal_stream(4, 3, &pixels);
        let frame = decode(&data).unwrap();
        assert_eq!(frame.argb, pixels);
    }

    #[test]
    fn backward_references_copy_rows() {
        let row = [0xff102030, 0xff405060, 0xff708090, 0xffa0b0c0];
        let mut tokens: Vec<Token> = row.iter().map(|&p| Token::Literal(p)).collect();
        // distance code 1 is the pixel straight above
        tokens.push(Token::Copy {
            length: 8,
            distance_code: 1,
        });
        // 120 + 2: two pixels back, overlapping the destination
        tokens.push(Token::Copy {
            length: 4,
            distance_code: 122,
        });

        let mut w = BitWriter::new();
        write_header(&mut w, 4, 4, false);
        w.write_bit(false);
        write_image(&mut w, &tokens, None, true);
        let frame = decode(&w.finish()).unwrap();

        let mut expected = Vec::new();
        for _ in 0..3 {
            expected.extend_from_slice(&row);
        }
        expected.extend_from_slice(&[row[2], row[3], row[2], row[3]]);
        assert_eq!(frame.argb, expected);
    }

    #[test]
    fn long_copy_uses_extra_bits() {
        let tokens = [
            Token::Literal(0xff000001),
            Token::Literal(0xff000002),
            Token::Copy {
                length: 98,
                distance_code: 122,
            },
        ];
        let mut w = BitWriter::new();
        write_header(&mut w, 10, 10, false);
        w.write_bit(false);
        write_image(&mut w, &tokens, None, true);
        let frame = decode(&w.finish()).unwrap();
        for (i, &p) in frame.argb.iter().enumerate() {
            assert_eq!(p, 0xff000001 + (i as u32 % 2), "pixel {i}");
        }
    }

    #[test]
    fn copy_before_start_is_rejected() {
        let tokens = [
            Token::Literal(0xff000001),
            Token::Copy {
                length: 3,
                distance_code: 1,
            },
        ];
        let mut w = BitWriter::new();
        write_header(&mut w, 4, 1, false);
        w.write_bit(false);
        write_image(&mut w, &tokens, None, true);
        assert!(matches!(
            decode(&w.finish()),
            Err(DecodingError::BitStreamError)
        ));
    }

    #[test]
    fn color_cache_hits() {
        let bits = 4;
        let a = 0xff123456;
        let b = 0x80abcdef;
        let tokens = [
            Token::Literal(a),
            Token::Literal(b),
            Token::Cache(cache_index(a, bits)),
            Token::Cache(cache_index(b, bits)),
        ];
        // a and b must not collide for the test to mean anything
        assert_ne!(cache_index(a, bits), cache_index(b, bits));

        let mut w = BitWriter::new();
        write_header(&mut w, 2, 2, true);
        w.write_bit(false);
        write_image(&mut w, &tokens, Some(bits), true);
        let frame = decode(&w.finish()).unwrap();
        assert_eq!(frame.argb, [a, b, a, b]);
    }

    #[test]
    fn color_cache_hits_are_inserted_again() {
        let bits = 4;
        // shares slot 0 with black
        let c = (1u32..).find(|&c| cache_index(c, bits) == 0).unwrap();
        let tokens = [
            Token::Literal(c),
            // black from a slot nothing wrote, which then replaces c in slot 0
            Token::Cache(5),
            Token::Cache(0),
        ];

        let mut w = BitWriter::new();
        write_header(&mut w, 3, 1, true);
        w.write_bit(false);
        write_image(&mut w, &tokens, Some(bits), true);
        let frame = decode(&w.finish()).unwrap();
        assert_eq!(frame.argb, [c, 0, 0]);
    }

    #[test]
    fn invalid_color_cache_bits() {
        for bits in [0u64, 12] {
            let mut w = BitWriter::new();
            write_header(&mut w, 1, 1, false);
            w.write_bit(false);
            w.write_bit(true);
            w.write_bits(bits, 4);
            w.write_bits(0, 32);
            assert!(matches!(
                decode(&w.finish()),
                Err(DecodingError::InvalidColorCacheBits(b)) if u64::from(b) == bits
            ));
        }
    }

    #[test]
    fn meta_huffman_groups_select_by_tile() {
        let mut w = BitWriter::new();
        write_header(&mut w, 8, 2, false);
        w.write_bit(false); // no transforms
        w.write_bit(false); // no cache
        w.write_bit(true); // meta codes
        w.write_bits(0, 3); // 4x4 tiles
        // 2x1 group index image: group 0 then group 1
        write_image(
            &mut w,
            &[Token::Literal(0x0000_0000), Token::Literal(0x0000_0100)],
            None,
            false,
        );
        for green in [0x11u16, 0x22] {
            TestCode::single(280, green).write_definition(&mut w);
            TestCode::single(256, 0).write_definition(&mut w);
            TestCode::single(256, 0).write_definition(&mut w);
            TestCode::single(256, 0xff).write_definition(&mut w);
            TestCode::single(40, 0).write_definition(&mut w);
        }
        let frame = decode(&w.finish()).unwrap();
        for y in 0..2 {
            for x in 0..8 {
                let expected = if x < 4 { 0xff00_1100 } else { 0xff00_2200 };
                assert_eq!(frame.argb[y * 8 + x], expected, "pixel {x},{y}");
            }
        }
    }

    /// Palette image with `palette.len()` colors and the given per-pixel indices.
    fn build_indexed_stream(width: u32, height: u32, palette: &[u32], indices: &[u8]) -> Vec<u8> {
        let width_bits = match palette.len() {
            n if n > 16 => 0,
            n if n > 4 => 1,
            n if n > 2 => 2,
            _ => 3,
        };
        let per_pixel = 1usize << width_bits;
        let bits_per_index = 8 >> width_bits;
        let packed_width = (width as usize).div_ceil(per_pixel);

        let mut w = BitWriter::new();
        write_header(&mut w, width, height, true);
        w.write_bit(true);
        w.write_bits(3, 2);
        w.write_bits(palette.len() as u64 - 1, 8);
        let mut prev = 0u32;
        let deltas: Vec<Token> = palette
            .iter()
            .map(|&c| {
                let bytes = c.to_le_bytes();
                let prev_bytes = prev.to_le_bytes();
                prev = c;
                Token::Literal(u32::from_le_bytes(core::array::from_fn(|i| {
                    bytes[i].wrapping_sub(prev_bytes[i])
                })))
            })
            .collect();
        write_image(&mut w, &deltas, None, false);
        w.write_bit(false);

        let mut packed = Vec::new();
        for row in indices.chunks(width as usize) {
            for chunk in row.chunks(per_pixel) {
                let mut green = 0u32;
                for (i, &index) in chunk.iter().enumerate() {
                    green |= u32::from(index) << (i * bits_per_index);
                }
                packed.push(Token::Literal(green << 8));
            }
        }
        assert_eq!(packed.len(), packed_width * height as usize);
        write_image(&mut w, &packed, None, true);
        w.finish()
    }

    fn check_indexed(num_colors: usize, width: u32, height: u32) {
        let palette: Vec<u32> = (0..num_colors as u32)
            .map(|i| 0xff00_0000 | i.wrapping_mul(0x0012_3457) & 0x00ff_ffff)
            .collect();
        let indices: Vec<u8> = (0..width * height)
            .map(|i| (i.wrapping_mul(7) % num_colors as u32) as u8)
            .collect();
        let data = build_indexed_stream(width, height, &palette, &indices);
        let frame = decode(&data).unwrap();
        let expected: Vec<u32> = indices.iter().map(|&i| palette[usize::from(i)]).collect();
        assert_eq!(frame.argb, expected, "{num_colors} colors");
    }

    #[test]
    fn color_indexing_one_bit() {
        check_indexed(2, 11, 3);
    }

    #[test]
    fn color_indexing_two_bits() {
        check_indexed(4, 9, 2);
    }

    #[test]
    fn color_indexing_four_bits() {
        check_indexed(13, 7, 3);
    }

    #[test]
    fn color_indexing_eight_bits() {
        check_indexed(40, 5, 4);
    }

    #[test]
    fn palette_index_past_end_is_transparent_black() {
        let palette = [0xff0000ff; 20];
        let data = build_indexed_stream(2, 1, &palette, &[3, 200]);
        let frame = decode(&data).unwrap();
        assert_eq!(frame.argb, [0xff0000ff, 0]);
    }

    #[test]
    fn subtract_green_stream() {
        let mut w = BitWriter::new();
        write_header(&mut w, 2, 1, false);
        w.write_bit(true);
        w.write_bits(2, 2);
        w.write_bit(false);
        write_image(
            &mut w,
            &[Token::Literal(0xff10_2030), Token::Literal(0xfff0_10f0)],
            None,
            true,
        );
        let frame = decode(&w.finish()).unwrap();
        assert_eq!(frame.argb, [0xff30_2050, 0xff00_1000]);
    }

    #[test]
    fn repeated_transform_is_rejected() {
        let mut w = BitWriter::new();
        write_header(&mut w, 2, 1, false);
        for _ in 0..2 {
            w.write_bit(true);
            w.write_bits(2, 2);
        }
        w.write_bits(0, 32);
        assert!(matches!(
            decode(&w.finish()),
            Err(DecodingError::TransformError)
        ));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let pixels: Vec<u32> = (0..64u32).map(|i| 0xff00_0000 | i * 0x010203).collect();
        let data = build_literal_stream(8, 8, &pixels);
        for len in [5, data.len() / 2, data.len() - 1] {
            assert!(decode(&data[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn dimensions_are_checked_before_decoding() {
        let data = build_literal_stream(64, 64, &[0xff000000; 64 * 64]);
        let limits = Limits::default().max_dimensions(32, 32);
        assert!(matches!(
            LosslessDecoder::decode_frame(&data, &limits),
            Err(DecodingError::ImageTooLarge)
        ));
    }
}
