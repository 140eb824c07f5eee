//! VP8 boolean entropy decoder (RFC 6386, section 7).
//!
//! Bytes are shifted into a wide window several at a time, the range is kept
//! minus one so it fits in [127, 254] between reads, and renormalization is a
//! single shift computed from `leading_zeros()`.

use super::api::DecodingError;
use crate::common::types::Prob;

/// Bits added to the window per refill; any multiple of 8 up to 56.
#[cfg(target_pointer_width = "64")]
const REFILL_BITS: i32 = 56;
#[cfg(not(target_pointer_width = "64"))]
const REFILL_BITS: i32 = 24;

const REFILL_BYTES: usize = REFILL_BITS as usize / 8;

/// Where a tree walk goes after reading one bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Branch {
    /// Continue at this node index.
    Node(u8),
    /// Stop with this decoded value.
    Leaf(i8),
}

/// Node of a probability tree; `branches[bit]` is followed after reading `bit`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TreeNode {
    pub(crate) branches: [Branch; 2],
    /// Probability of reading a zero.
    pub(crate) prob: Prob,
}

impl TreeNode {
    pub(crate) const EMPTY: TreeNode = TreeNode {
        branches: [Branch::Leaf(0); 2],
        prob: 0,
    };
}

/// Converts a tree from its `[i8; 2 * M]` table layout into nodes. Positive
/// entries index the next pair of entries, the rest are negated leaf values.
pub(crate) const fn tree_nodes<const N: usize, const M: usize>(
    tree: [i8; N],
    probs: [Prob; M],
) -> [TreeNode; M] {
    const fn branch(entry: i8) -> Branch {
        if entry > 0 {
            Branch::Node(entry as u8 / 2)
        } else {
            Branch::Leaf(-entry)
        }
    }

    assert!(N == 2 * M, "tree and probability table sizes disagree");
    let mut nodes = [TreeNode::EMPTY; M];
    let mut i = 0;
    while i < M {
        nodes[i] = TreeNode {
            branches: [branch(tree[2 * i]), branch(tree[2 * i + 1])],
            prob: probs[i],
        };
        i += 1;
    }
    nodes
}

/// Boolean decoder over one partition of a VP8 frame.
///
/// The first partition (frame header and modes) and every token partition each
/// get their own reader with an independent cursor.
pub(crate) struct BoolReader<'a> {
    window: u64,
    /// Range minus one.
    range: u32,
    /// Position of the next undecoded bit in `window`; negative when a refill is due.
    bit_pos: i32,
    rest: &'a [u8],
    /// Set once a zero byte past the end had to be shifted in.
    eof: bool,
}

impl<'a> BoolReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        let mut reader = Self {
            window: 0,
            range: 254,
            bit_pos: -8,
            rest: data,
            eof: false,
        };
        reader.refill();
        reader
    }

    #[inline(always)]
    fn refill(&mut self) {
        if let Some((head, rest)) = self.rest.split_first_chunk::<REFILL_BYTES>() {
            let mut word = [0u8; 8];
            word[8 - REFILL_BYTES..].copy_from_slice(head);
            self.window = (self.window << REFILL_BITS) | u64::from_be_bytes(word);
            self.bit_pos += REFILL_BITS;
            self.rest = rest;
        } else {
            self.refill_tail();
        }
    }

    /// Byte-at-a-time refill near the end; past it, zeros are shifted in once.
    #[cold]
    fn refill_tail(&mut self) {
        match self.rest.split_first() {
            Some((&byte, rest)) => {
                self.window = (self.window << 8) | u64::from(byte);
                self.bit_pos += 8;
                self.rest = rest;
            }
            None if !self.eof => {
                self.window <<= 8;
                self.bit_pos += 8;
                self.eof = true;
            }
            // keeps shift amounts in range; results are garbage but `check` reports them
            None => self.bit_pos = 0,
        }
    }

    /// Reads one bit that is zero with probability `prob / 256`.
    #[inline(always)]
    pub(crate) fn get_bit(&mut self, prob: Prob) -> i32 {
        if self.bit_pos < 0 {
            self.refill();
        }

        let split = (self.range * u32::from(prob)) >> 8;
        let top = (self.window >> self.bit_pos) as u32;
        let (bit, range) = if top > split {
            self.window -= (u64::from(split) + 1) << self.bit_pos;
            (1, self.range - split)
        } else {
            (0, split + 1)
        };

        // bring the range back to [128, 255]
        let shift = range.leading_zeros() as i32 - 24;
        self.range = (range << shift) - 1;
        self.bit_pos -= shift;
        bit
    }

    #[inline(always)]
    pub(crate) fn read_bool(&mut self, prob: Prob) -> bool {
        self.get_bit(prob) == 1
    }

    #[inline(always)]
    pub(crate) fn read_flag(&mut self) -> bool {
        self.read_bool(128)
    }

    /// Reads an `n`-bit unsigned literal, most significant bit first.
    pub(crate) fn read_literal(&mut self, n: u8) -> u8 {
        (0..n).fold(0u8, |acc, _| (acc << 1) | self.get_bit(128) as u8)
    }

    /// Flag, then `n`-bit magnitude, then sign (set means negative).
    pub(crate) fn read_optional_signed_value(&mut self, n: u8) -> i32 {
        if !self.read_flag() {
            return 0;
        }
        let magnitude = i32::from(self.read_literal(n));
        if self.read_flag() {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Walks a probability tree from its root node.
    pub(crate) fn read_with_tree<const N: usize>(&mut self, tree: &[TreeNode; N]) -> i8 {
        self.read_with_tree_from(tree, 0)
    }

    /// Walks `tree` starting at node `start` instead of the root.
    pub(crate) fn read_with_tree_from(&mut self, tree: &[TreeNode], start: usize) -> i8 {
        let mut node = tree[start];
        loop {
            let bit = self.read_bool(node.prob);
            match node.branches[usize::from(bit)] {
                Branch::Node(next) => node = tree[usize::from(next)],
                Branch::Leaf(value) => return value,
            }
        }
    }

    /// Passes `value` through unless the reader ran out of data.
    pub(crate) fn check<T>(&self, value: T) -> Result<T, DecodingError> {
        if self.eof {
            return Err(DecodingError::BitStreamError);
        }
        Ok(value)
    }
}

/// Boolean encoder mirroring [`BoolReader`] (RFC 6386, section 7.3), used to
/// build synthetic frames in tests.
#[cfg(test)]
pub(crate) struct BoolWriter {
    bytes: alloc::vec::Vec<u8>,
    low: u32,
    /// Kept in [128, 255] between writes.
    range: u32,
    /// Shifts left before the top byte of `low` is complete.
    bits_to_byte: i32,
}

#[cfg(test)]
impl BoolWriter {
    pub(crate) fn new() -> Self {
        Self {
            bytes: alloc::vec::Vec::new(),
            low: 0,
            range: 255,
            bits_to_byte: 24,
        }
    }

    /// Adds one to the bytes already written, rippling through any `0xff` run.
    fn carry(&mut self) {
        match self.bytes.iter().rposition(|&b| b != 0xff) {
            Some(i) => {
                self.bytes[i] += 1;
                self.bytes[i + 1..].fill(0);
            }
            None => {
                self.bytes.fill(0);
                self.bytes.insert(0, 1);
            }
        }
    }

    fn shift_out_bit(&mut self) {
        self.range <<= 1;
        if self.low & 0x8000_0000 != 0 {
            self.carry();
        }
        self.low <<= 1;
        self.bits_to_byte -= 1;
        if self.bits_to_byte == 0 {
            self.bytes.push((self.low >> 24) as u8);
            self.low &= 0x00ff_ffff;
            self.bits_to_byte = 8;
        }
    }

    pub(crate) fn write_bool(&mut self, bit: bool, prob: Prob) {
        let split = 1 + (((self.range - 1) * u32::from(prob)) >> 8);
        if bit {
            self.low += split;
            self.range -= split;
        } else {
            self.range = split;
        }
        while self.range < 128 {
            self.shift_out_bit();
        }
    }

    pub(crate) fn write_flag(&mut self, flag: bool) {
        self.write_bool(flag, 128);
    }

    pub(crate) fn write_literal(&mut self, n: u8, value: u8) {
        for bit in (0..n).rev() {
            self.write_flag((value >> bit) & 1 == 1);
        }
    }

    pub(crate) fn write_optional_signed_value(&mut self, n: u8, value: Option<i8>) {
        self.write_flag(value.is_some());
        if let Some(v) = value {
            self.write_literal(n, v.unsigned_abs());
            self.write_flag(v < 0);
        }
    }

    /// Encodes `value` with a tree in the `[i8; 2 * probs.len()]` layout of the tables.
    pub(crate) fn write_with_tree(&mut self, tree: &[i8], probs: &[Prob], value: i8) {
        self.write_with_tree_from(tree, probs, value, 0);
    }

    /// Like [`Self::write_with_tree`], leaving out the branches above node `start`.
    pub(crate) fn write_with_tree_from(
        &mut self,
        tree: &[i8],
        probs: &[Prob],
        value: i8,
        start: usize,
    ) {
        let mut path = alloc::vec::Vec::new();
        let mut index = tree
            .iter()
            .position(|&t| t == -value && (t != 0 || value == 0))
            .expect("value not in tree");
        loop {
            path.push((index % 2 == 1, probs[index / 2]));
            let node = index - index % 2;
            if node == 2 * start {
                break;
            }
            index = tree
                .iter()
                .position(|&t| t == node as i8)
                .expect("dangling tree node");
        }
        for &(bit, prob) in path.iter().rev() {
            self.write_bool(bit, prob);
        }
    }

    pub(crate) fn finish(mut self) -> alloc::vec::Vec<u8> {
        let pending = self.bits_to_byte;
        if self.low & (1 << (32 - pending)) != 0 {
            self.carry();
        }
        let tail = self.low << pending;
        self.bytes.extend_from_slice(&tail.to_be_bytes());
        self.bytes
    }
}
