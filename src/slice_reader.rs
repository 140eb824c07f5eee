//! Bounds-checked cursor over the input bytes.
//!
//! Container and frame headers are parsed straight from the caller's slice.
//! Reading past the end is [`DecodingError::UnexpectedEof`] and leaves the
//! cursor where it was.

use byteorder_lite::{ByteOrder, LittleEndian};
use core::fmt;

use crate::DecodingError;

#[derive(Clone)]
pub(crate) struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    #[inline]
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    #[inline]
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Everything not yet consumed, borrowed from the input.
    #[inline]
    pub(crate) fn remaining_slice(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    #[inline]
    pub(crate) fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DecodingError> {
        buf.copy_from_slice(self.take_slice(buf.len())?);
        Ok(())
    }

    #[inline]
    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodingError> {
        let [byte] = self.take_array()?;
        Ok(byte)
    }

    #[inline]
    pub(crate) fn read_u16_le(&mut self) -> Result<u16, DecodingError> {
        self.take_array().map(u16::from_le_bytes)
    }

    /// Three bytes, little-endian, as used for VP8 frame tags and chunk sizes.
    #[inline]
    pub(crate) fn read_u24_le(&mut self) -> Result<u32, DecodingError> {
        Ok(LittleEndian::read_u24(self.take_slice(3)?))
    }

    #[inline]
    pub(crate) fn skip(&mut self, n: usize) -> Result<(), DecodingError> {
        self.take_slice(n).map(drop)
    }

    #[inline]
    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodingError> {
        let mut bytes = [0; N];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// The next `n` bytes, borrowed from the input.
    #[inline]
    pub(crate) fn take_slice(&mut self, n: usize) -> Result<&'a [u8], DecodingError> {
        let rest = &self.data[self.pos..];
        let taken = rest.get(..n).ok_or(DecodingError::UnexpectedEof)?;
        self.pos += n;
        Ok(taken)
    }
}

impl fmt::Debug for SliceReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SliceReader({}/{})", self.pos, self.data.len())
    }
}
