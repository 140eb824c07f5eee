//! Canonical prefix codes for VP8L.
//!
//! Codes are rebuilt from their code lengths and stored as a two-level lookup
//! table: the first [`PRIMARY_BITS`] bits of the stream index the primary
//! table, and longer codes link into a secondary table sized for the longest
//! code sharing that prefix.

use alloc::vec;
use alloc::vec::Vec;

use super::api::DecodingError;
use super::lossless::BitReader;

/// Maximum allowed code length in VP8L.
pub(crate) const MAX_CODE_LENGTH: u8 = 15;

const PRIMARY_BITS: u8 = 8;
const PRIMARY_MASK: u32 = (1 << PRIMARY_BITS) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Entry {
    Symbol { symbol: u16, len: u8 },
    Link { offset: u32, bits: u8 },
    Invalid,
}

/// A decoded prefix code.
#[derive(Clone, Debug)]
pub(crate) enum HuffmanTree {
    /// Only one symbol is in use; reading it consumes no bits.
    Single(u16),
    Table {
        primary: Vec<Entry>,
        secondary: Vec<Entry>,
    },
}

/// Reverses the lowest `num_bits` bits of `bits`.
fn reverse_bits(num_bits: u8, bits: u32) -> u32 {
    const REVERSED_BITS: [u8; 16] = [
        0x0, 0x8, 0x4, 0xc, 0x2, 0xa, 0x6, 0xe, 0x1, 0x9, 0x5, 0xd, 0x3, 0xb, 0x7, 0xf,
    ];

    let mut retval = 0u32;
    let mut b = bits;
    let mut i = 0;
    while i < u32::from(num_bits) {
        i += 4;
        retval |= u32::from(REVERSED_BITS[(b & 0xf) as usize]) << (16 - i);
        b >>= 4;
    }
    retval >> (16 - u32::from(num_bits))
}

impl HuffmanTree {
    /// Builds the canonical code described by `code_lengths` (0 = unused symbol).
    ///
    /// The code must be complete unless exactly one symbol is used.
    pub(crate) fn from_code_lengths(code_lengths: &[u8]) -> Result<Self, DecodingError> {
        let mut counts = [0u32; MAX_CODE_LENGTH as usize + 1];
        let mut used = 0usize;
        let mut last_symbol = 0usize;
        for (symbol, &len) in code_lengths.iter().enumerate() {
            if len > MAX_CODE_LENGTH {
                return Err(DecodingError::HuffmanError);
            }
            if len > 0 {
                counts[usize::from(len)] += 1;
                used += 1;
                last_symbol = symbol;
            }
        }

        match used {
            0 => return Err(DecodingError::HuffmanError),
            1 => return Ok(HuffmanTree::Single(symbol_u16(last_symbol)?)),
            _ => {}
        }

        // Kraft sum must be exactly one
        let mut left: i64 = 1;
        for &count in &counts[1..] {
            left = (left << 1) - i64::from(count);
            if left < 0 {
                return Err(DecodingError::HuffmanError);
            }
        }
        if left != 0 {
            return Err(DecodingError::HuffmanError);
        }

        let mut next_code = [0u32; MAX_CODE_LENGTH as usize + 1];
        let mut code = 0u32;
        for len in 1..=usize::from(MAX_CODE_LENGTH) {
            code = (code + counts[len - 1]) << 1;
            next_code[len] = code;
        }

        // (symbol, length, reversed code) for every used symbol
        let mut codes = Vec::with_capacity(used);
        for (symbol, &len) in code_lengths.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let code = next_code[usize::from(len)];
            next_code[usize::from(len)] += 1;
            codes.push((symbol_u16(symbol)?, len, reverse_bits(len, code)));
        }

        let mut sub_bits = [0u8; 1 << PRIMARY_BITS];
        for &(_, len, rev) in &codes {
            if len > PRIMARY_BITS {
                let prefix = (rev & PRIMARY_MASK) as usize;
                sub_bits[prefix] = sub_bits[prefix].max(len - PRIMARY_BITS);
            }
        }

        let mut primary = vec![Entry::Invalid; 1 << PRIMARY_BITS];
        let mut offsets = [0u32; 1 << PRIMARY_BITS];
        let mut secondary_len = 0u32;
        for (prefix, &bits) in sub_bits.iter().enumerate() {
            if bits > 0 {
                offsets[prefix] = secondary_len;
                primary[prefix] = Entry::Link {
                    offset: secondary_len,
                    bits,
                };
                secondary_len += 1 << bits;
            }
        }
        let mut secondary = vec![Entry::Invalid; secondary_len as usize];

        for &(symbol, len, rev) in &codes {
            let entry = Entry::Symbol { symbol, len };
            if len <= PRIMARY_BITS {
                let mut i = rev as usize;
                while i < primary.len() {
                    primary[i] = entry;
                    i += 1 << len;
                }
            } else {
                let prefix = (rev & PRIMARY_MASK) as usize;
                let table_size = 1usize << sub_bits[prefix];
                let base = offsets[prefix] as usize;
                let mut i = (rev >> PRIMARY_BITS) as usize;
                while i < table_size {
                    secondary[base + i] = entry;
                    i += 1 << (len - PRIMARY_BITS);
                }
            }
        }

        Ok(HuffmanTree::Table { primary, secondary })
    }

    /// Decodes the next symbol.
    #[inline]
    pub(crate) fn read_symbol(&self, br: &mut BitReader<'_>) -> Result<u16, DecodingError> {
        let (primary, secondary) = match self {
            HuffmanTree::Single(symbol) => return Ok(*symbol),
            HuffmanTree::Table { primary, secondary } => (primary, secondary),
        };

        let bits = br.peek(MAX_CODE_LENGTH);
        let entry = match primary[(bits & PRIMARY_MASK) as usize] {
            Entry::Link { offset, bits: sub } => {
                let index = offset + ((bits >> PRIMARY_BITS) & ((1 << sub) - 1));
                secondary[index as usize]
            }
            entry => entry,
        };
        match entry {
            Entry::Symbol { symbol, len } => {
                br.consume(len)?;
                Ok(symbol)
            }
            _ => Err(DecodingError::HuffmanError),
        }
    }
}

fn symbol_u16(symbol: usize) -> Result<u16, DecodingError> {
    u16::try_from(symbol).map_err(|_| DecodingError::HuffmanError)
}
