//! RIFF container parsing.
//!
//! A WebP file is a RIFF container holding either a single `VP8 `/`VP8L` chunk
//! or a `VP8X` header followed by the image chunk and optional metadata chunks.
//! Two walks are provided: a header-only scan over any [`ByteSource`] that
//! stops at the first image chunk, and a full walk over an in-memory file that
//! validates every chunk and indexes their payloads.

use alloc::format;
use core::ops::Range;

use hashbrown::HashMap;
use log::debug;

use super::api::{BitstreamFormat, DecodingError};
use super::lossless::read_lossless_header;
use crate::slice_reader::SliceReader;

/// RIFF chunks a WebP file may contain.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Hash, Eq)]
pub(crate) enum WebPRiffChunk {
    VP8,
    VP8L,
    VP8X,
    ANIM,
    ANMF,
    ALPH,
    ICCP,
    EXIF,
    XMP,
    Unknown([u8; 4]),
}

impl WebPRiffChunk {
    pub(crate) const fn from_fourcc(chunk_fourcc: [u8; 4]) -> Self {
        match &chunk_fourcc {
            b"VP8 " => Self::VP8,
            b"VP8L" => Self::VP8L,
            b"VP8X" => Self::VP8X,
            b"ANIM" => Self::ANIM,
            b"ANMF" => Self::ANMF,
            b"ALPH" => Self::ALPH,
            b"ICCP" => Self::ICCP,
            b"EXIF" => Self::EXIF,
            b"XMP " => Self::XMP,
            _ => Self::Unknown(chunk_fourcc),
        }
    }

    pub(crate) const fn to_fourcc(self) -> [u8; 4] {
        match self {
            Self::VP8 => *b"VP8 ",
            Self::VP8L => *b"VP8L",
            Self::VP8X => *b"VP8X",
            Self::ANIM => *b"ANIM",
            Self::ANMF => *b"ANMF",
            Self::ALPH => *b"ALPH",
            Self::ICCP => *b"ICCP",
            Self::EXIF => *b"EXIF",
            Self::XMP => *b"XMP ",
            Self::Unknown(fourcc) => fourcc,
        }
    }
}

/// Where the container walk gets its bytes from.
pub(crate) trait ByteSource {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DecodingError>;
    fn skip(&mut self, n: usize) -> Result<(), DecodingError>;
}

impl ByteSource for SliceReader<'_> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DecodingError> {
        SliceReader::read_exact(self, buf)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodingError> {
        SliceReader::skip(self, n)
    }
}

/// Adapts a [`std::io::Read`] to [`ByteSource`].
#[cfg(feature = "std")]
pub(crate) struct ReadSource<R>(pub(crate) R);

#[cfg(feature = "std")]
fn io_error(e: std::io::Error) -> DecodingError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        DecodingError::UnexpectedEof
    } else {
        DecodingError::IoError(e)
    }
}

#[cfg(feature = "std")]
impl<R: std::io::Read> ByteSource for ReadSource<R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DecodingError> {
        self.0.read_exact(buf).map_err(io_error)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodingError> {
        use std::io::Read;

        let skipped = std::io::copy(&mut self.0.by_ref().take(n as u64), &mut std::io::sink())
            .map_err(io_error)?;
        if skipped < n as u64 {
            return Err(DecodingError::UnexpectedEof);
        }
        Ok(())
    }
}

fn read_fourcc<S: ByteSource>(r: &mut S) -> Result<[u8; 4], DecodingError> {
    let mut fourcc = [0; 4];
    r.read_exact(&mut fourcc)?;
    Ok(fourcc)
}

fn read_u32_le<S: ByteSource>(r: &mut S) -> Result<u32, DecodingError> {
    Ok(u32::from_le_bytes(read_fourcc(r)?))
}

/// Reads a chunk header, returning the chunk, its payload size and the size
/// rounded up to the even boundary the next chunk starts at.
pub(crate) fn read_chunk_header<S: ByteSource>(
    r: &mut S,
) -> Result<(WebPRiffChunk, usize, usize), DecodingError> {
    let chunk = WebPRiffChunk::from_fourcc(read_fourcc(r)?);
    let chunk_size = read_u32_le(r)?;
    let chunk_size_rounded = chunk_size.saturating_add(chunk_size & 1);
    Ok((chunk, chunk_size as usize, chunk_size_rounded as usize))
}

/// Checks the `RIFF....WEBP` preamble and returns the declared RIFF size.
fn read_riff_header<S: ByteSource>(r: &mut S) -> Result<u32, DecodingError> {
    let riff = read_fourcc(r)?;
    if &riff != b"RIFF" {
        return Err(DecodingError::RiffSignatureInvalid(riff));
    }
    let riff_size = read_u32_le(r)?;
    let webp = read_fourcc(r)?;
    if &webp != b"WEBP" {
        return Err(DecodingError::WebpSignatureInvalid(webp));
    }
    Ok(riff_size)
}

/// Contents of the 10-byte `VP8X` payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ExtendedInfo {
    pub(crate) icc_profile: bool,
    pub(crate) alpha: bool,
    pub(crate) exif_metadata: bool,
    pub(crate) xmp_metadata: bool,
    pub(crate) animation: bool,
    pub(crate) canvas_width: u32,
    pub(crate) canvas_height: u32,
}

pub(crate) fn read_extended_header(payload: &[u8]) -> Result<ExtendedInfo, DecodingError> {
    let mut r = SliceReader::new(payload);
    let read = |e: DecodingError| match e {
        DecodingError::UnexpectedEof => DecodingError::InvalidChunkSize,
        e => e,
    };

    let flags = r.read_u8().map_err(read)?;
    r.skip(3).map_err(read)?;
    let canvas_width = r.read_u24_le().map_err(read)? + 1;
    let canvas_height = r.read_u24_le().map_err(read)? + 1;

    let info = ExtendedInfo {
        icc_profile: flags & 0b0010_0000 != 0,
        alpha: flags & 0b0001_0000 != 0,
        exif_metadata: flags & 0b0000_1000 != 0,
        xmp_metadata: flags & 0b0000_0100 != 0,
        animation: flags & 0b0000_0010 != 0,
        canvas_width,
        canvas_height,
    };
    debug!("VP8X header: {info:?}");

    if info.animation {
        return Err(DecodingError::UnsupportedFeature("animated images".into()));
    }
    Ok(info)
}

/// What the first bytes of an image chunk say about the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BitstreamHeader {
    pub(crate) format: BitstreamFormat,
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Lossless alpha hint; always false for lossy.
    pub(crate) alpha_hint: bool,
}

/// Bytes of an image chunk needed to read its header.
const fn header_len(chunk: WebPRiffChunk) -> usize {
    match chunk {
        WebPRiffChunk::VP8 => 10,
        _ => 5,
    }
}

fn parse_vp8_header(payload: &[u8]) -> Result<BitstreamHeader, DecodingError> {
    let mut r = SliceReader::new(payload);
    let short = |_| DecodingError::NotEnoughInitData;

    let tag = r.read_u24_le().map_err(short)?;
    if tag & 1 != 0 {
        return Err(DecodingError::UnsupportedFeature("non-keyframe frames".into()));
    }
    let version = (tag >> 1) & 7;
    if version > 3 {
        return Err(DecodingError::UnsupportedFeature(format!(
            "VP8 version {version}"
        )));
    }

    let mut magic = [0u8; 3];
    r.read_exact(&mut magic).map_err(short)?;
    if magic != [0x9d, 0x01, 0x2a] {
        return Err(DecodingError::Vp8MagicInvalid(magic));
    }

    let width = u32::from(r.read_u16_le().map_err(short)? & 0x3fff);
    let height = u32::from(r.read_u16_le().map_err(short)? & 0x3fff);
    if width == 0 || height == 0 {
        return Err(DecodingError::ZeroDimensions);
    }

    Ok(BitstreamHeader {
        format: BitstreamFormat::Lossy,
        width,
        height,
        alpha_hint: false,
    })
}

/// Parses the header at the start of a `VP8 ` or `VP8L` payload.
pub(crate) fn parse_bitstream_header(
    chunk: WebPRiffChunk,
    payload: &[u8],
) -> Result<BitstreamHeader, DecodingError> {
    match chunk {
        WebPRiffChunk::VP8 => parse_vp8_header(payload),
        WebPRiffChunk::VP8L => {
            let header = read_lossless_header(payload)?;
            Ok(BitstreamHeader {
                format: BitstreamFormat::Lossless,
                width: header.width,
                height: header.height,
                alpha_hint: header.alpha_is_used,
            })
        }
        other => Err(DecodingError::ChunkHeaderInvalid(other.to_fourcc())),
    }
}

/// Result of a header-only scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HeaderInfo {
    pub(crate) bitstream: BitstreamHeader,
    pub(crate) extended: Option<ExtendedInfo>,
}

impl HeaderInfo {
    /// Canvas size for extended files, bitstream size otherwise.
    pub(crate) fn dimensions(&self) -> (u32, u32) {
        match &self.extended {
            Some(ext) => (ext.canvas_width, ext.canvas_height),
            None => (self.bitstream.width, self.bitstream.height),
        }
    }

    pub(crate) fn has_alpha(&self) -> bool {
        match &self.extended {
            Some(ext) => ext.alpha,
            None => self.bitstream.alpha_hint,
        }
    }
}

/// Reads the container up to and including the header of the first image chunk.
///
/// The declared RIFF size is not checked against the real stream length, and
/// nothing past the image chunk header is read.
pub(crate) fn read_header_info<S: ByteSource>(r: &mut S) -> Result<HeaderInfo, DecodingError> {
    read_riff_header(r)?;

    let mut extended = None;
    let mut first = true;
    loop {
        let (chunk, chunk_size, chunk_size_rounded) = read_chunk_header(r)?;
        match chunk {
            WebPRiffChunk::VP8 | WebPRiffChunk::VP8L => {
                let mut buf = [0u8; 10];
                let prefix = &mut buf[..header_len(chunk)];
                if chunk_size < prefix.len() {
                    return Err(DecodingError::NotEnoughInitData);
                }
                r.read_exact(prefix)?;
                let bitstream = parse_bitstream_header(chunk, prefix)?;
                return Ok(HeaderInfo {
                    bitstream,
                    extended,
                });
            }
            WebPRiffChunk::VP8X if first => {
                if chunk_size < 10 {
                    return Err(DecodingError::InvalidChunkSize);
                }
                let mut payload = [0u8; 10];
                r.read_exact(&mut payload)?;
                extended = Some(read_extended_header(&payload)?);
                r.skip(chunk_size_rounded - 10)?;
            }
            WebPRiffChunk::ANIM | WebPRiffChunk::ANMF => {
                return Err(DecodingError::UnsupportedFeature("animated images".into()));
            }
            _ if first => return Err(DecodingError::ChunkHeaderInvalid(chunk.to_fourcc())),
            _ => {
                debug!("skipping {chunk:?} chunk ({chunk_size} bytes)");
                r.skip(chunk_size_rounded)?;
            }
        }
        first = false;
    }
}

/// A fully walked in-memory WebP file.
#[derive(Debug)]
pub(crate) struct Container<'a> {
    data: &'a [u8],
    /// First payload of each chunk type, as a range of `data`.
    chunks: HashMap<WebPRiffChunk, Range<usize>>,
    pub(crate) info: HeaderInfo,
    /// Payload of the image chunk.
    pub(crate) bitstream: &'a [u8],
}

impl<'a> Container<'a> {
    pub(crate) fn parse(data: &'a [u8]) -> Result<Self, DecodingError> {
        let mut r = SliceReader::new(data);
        let riff_size = read_riff_header(&mut r)? as usize;
        let riff_end = riff_size
            .checked_add(8)
            .filter(|&end| riff_size >= 4 && end <= data.len())
            .ok_or(DecodingError::InvalidChunkSize)?;

        let mut r = SliceReader::new(&data[..riff_end]);
        r.skip(12)?;

        let mut chunks = HashMap::new();
        let mut extended = None;
        let mut image = None;
        let mut first = true;

        while r.remaining() > 0 {
            let (chunk, chunk_size, _) = read_chunk_header(&mut r)?;
            let start = r.position();
            let payload = r
                .take_slice(chunk_size)
                .map_err(|_| DecodingError::InvalidChunkSize)?;
            // the final pad byte is sometimes left out
            if chunk_size & 1 == 1 && r.remaining() > 0 {
                r.skip(1)?;
            }

            match chunk {
                WebPRiffChunk::VP8X if first => {
                    extended = Some(read_extended_header(payload)?);
                }
                WebPRiffChunk::VP8 | WebPRiffChunk::VP8L => {
                    if image.is_none() {
                        image = Some((chunk, payload));
                    }
                }
                WebPRiffChunk::ANIM | WebPRiffChunk::ANMF => {
                    return Err(DecodingError::UnsupportedFeature("animated images".into()));
                }
                _ if first => return Err(DecodingError::ChunkHeaderInvalid(chunk.to_fourcc())),
                _ => debug!("{chunk:?} chunk ({chunk_size} bytes) is not used for decoding"),
            }

            chunks.entry(chunk).or_insert(start..start + chunk_size);
            first = false;
        }

        let (chunk, bitstream) = image.ok_or(DecodingError::ChunkMissing)?;
        let header = parse_bitstream_header(chunk, bitstream)?;
        if let Some(ext) = &extended {
            if (ext.canvas_width, ext.canvas_height) != (header.width, header.height) {
                return Err(DecodingError::InconsistentImageSizes);
            }
        }
        debug!(
            "{} image {}x{} in a {} byte {:?} chunk",
            header.format,
            header.width,
            header.height,
            bitstream.len(),
            chunk
        );

        Ok(Self {
            data,
            chunks,
            info: HeaderInfo {
                bitstream: header,
                extended,
            },
            bitstream,
        })
    }

    /// Payload of the first chunk with this identifier.
    pub(crate) fn chunk(&self, fourcc: [u8; 4]) -> Option<&'a [u8]> {
        let range = self.chunks.get(&WebPRiffChunk::from_fourcc(fourcc))?;
        self.data.get(range.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Wraps chunks in a RIFF container, padding odd payloads.
    pub(crate) fn riff(chunks: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
        let mut body = Vec::from(*b"WEBP");
        for (fourcc, payload) in chunks {
            body.extend_from_slice(*fourcc);
            body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            body.extend_from_slice(payload);
            if payload.len() % 2 == 1 {
                body.push(0);
            }
        }
        let mut out = Vec::from(*b"RIFF");
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub(crate) fn vp8x(flags: u8, width: u32, height: u32) -> Vec<u8> {
        let mut payload = alloc::vec![flags, 0, 0, 0];
        payload.extend_from_slice(&(width - 1).to_le_bytes()[..3]);
        payload.extend_from_slice(&(height - 1).to_le_bytes()[..3]);
        payload
    }

    /// A keyframe header only; enough for the container to route it.
    fn vp8_header(width: u16, height: u16) -> Vec<u8> {
        let mut payload = alloc::vec![0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a];
        payload.extend_from_slice(&width.to_le_bytes());
        payload.extend_from_slice(&height.to_le_bytes());
        payload
    }

    fn vp8l_header(width: u32, height: u32, alpha: bool) -> Vec<u8> {
        let bits = (width - 1) | ((height - 1) << 14) | (u32::from(alpha) << 28);
        let mut payload = alloc::vec![0x2f];
        payload.extend_from_slice(&bits.to_le_bytes());
        payload
    }

    #[test]
    fn simple_lossy_file() {
        let payload = vp8_header(300, 200);
        let data = riff(&[(b"VP8 ", &payload)]);
        let container = Container::parse(&data).unwrap();
        assert_eq!(container.info.bitstream.format, BitstreamFormat::Lossy);
        assert_eq!(container.info.dimensions(), (300, 200));
        assert!(!container.info.has_alpha());
        assert_eq!(container.bitstream, &payload[..]);
        assert_eq!(container.chunk(*b"VP8 "), Some(&payload[..]));
        assert_eq!(container.chunk(*b"ICCP"), None);
    }

    #[test]
    fn scale_bits_are_ignored() {
        let payload = vp8_header(0xc000 | 17, 0x4000 | 9);
        let data = riff(&[(b"VP8 ", &payload)]);
        assert_eq!(Container::parse(&data).unwrap().info.dimensions(), (17, 9));
    }

    #[test]
    fn extended_file_with_metadata() {
        let header = vp8x(0b0011_1000, 64, 32);
        let image = vp8l_header(64, 32, false);
        let data = riff(&[
            (b"VP8X", &header),
            (b"ICCP", b"icc"),
            (b"VP8L", &image),
            (b"EXIF", b"exif data"),
            (b"XYZW", b""),
        ]);
        let container = Container::parse(&data).unwrap();
        let ext = container.info.extended.unwrap();
        assert!(ext.icc_profile && ext.alpha && ext.exif_metadata);
        assert!(!ext.xmp_metadata);
        assert_eq!(container.info.dimensions(), (64, 32));
        assert!(container.info.has_alpha());
        assert_eq!(container.info.bitstream.format, BitstreamFormat::Lossless);
        assert_eq!(container.bitstream, &image[..]);
        assert_eq!(container.chunk(*b"ICCP"), Some(&b"icc"[..]));
        assert_eq!(container.chunk(*b"EXIF"), Some(&b"exif data"[..]));
        assert_eq!(container.chunk(*b"XYZW"), Some(&b""[..]));
    }

    #[test]
    fn canvas_must_match_bitstream() {
        let header = vp8x(0, 64, 33);
        let image = vp8l_header(64, 32, false);
        let data = riff(&[(b"VP8X", &header), (b"VP8L", &image)]);
        assert!(matches!(
            Container::parse(&data),
            Err(DecodingError::InconsistentImageSizes)
        ));
    }

    #[test]
    fn animation_is_unsupported() {
        let animated = riff(&[(b"VP8X", &vp8x(0b10, 8, 8))]);
        assert!(matches!(
            Container::parse(&animated),
            Err(DecodingError::UnsupportedFeature(_))
        ));

        let anmf = riff(&[(b"VP8X", &vp8x(0, 8, 8)), (b"ANMF", &[0; 16])]);
        assert!(matches!(
            Container::parse(&anmf),
            Err(DecodingError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            read_header_info(&mut SliceReader::new(&anmf)),
            Err(DecodingError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn missing_image_chunk() {
        let data = riff(&[(b"VP8X", &vp8x(0, 8, 8)), (b"EXIF", b"x")]);
        assert!(matches!(
            Container::parse(&data),
            Err(DecodingError::ChunkMissing)
        ));
    }

    #[test]
    fn bad_signatures_and_first_chunk() {
        let mut data = riff(&[(b"VP8 ", &vp8_header(1, 1))]);
        data[0] = b'X';
        assert!(matches!(
            Container::parse(&data),
            Err(DecodingError::RiffSignatureInvalid(sig)) if &sig == b"XIFF"
        ));

        let mut data = riff(&[(b"VP8 ", &vp8_header(1, 1))]);
        data[11] = b'Q';
        assert!(matches!(
            Container::parse(&data),
            Err(DecodingError::WebpSignatureInvalid(_))
        ));

        let data = riff(&[(b"EXIF", b"x"), (b"VP8 ", &vp8_header(1, 1))]);
        assert!(matches!(
            Container::parse(&data),
            Err(DecodingError::ChunkHeaderInvalid(fourcc)) if &fourcc == b"EXIF"
        ));
    }

    #[test]
    fn sizes_must_fit_the_file() {
        // declared RIFF size runs past the end
        let mut data = riff(&[(b"VP8 ", &vp8_header(1, 1))]);
        data.truncate(data.len() - 2);
        assert!(matches!(
            Container::parse(&data),
            Err(DecodingError::InvalidChunkSize)
        ));

        // chunk size runs past the RIFF end
        let mut data = riff(&[(b"VP8 ", &vp8_header(1, 1))]);
        data[16] = 0x40;
        assert!(matches!(
            Container::parse(&data),
            Err(DecodingError::InvalidChunkSize)
        ));
    }

    #[test]
    fn header_scan_stops_at_image_chunk() {
        let header = vp8x(0b1_0000, 16, 16);
        let image = vp8_header(16, 16);
        let data = riff(&[(b"VP8X", &header), (b"XMP ", b"xml"), (b"VP8 ", &image)]);
        let info = read_header_info(&mut SliceReader::new(&data)).unwrap();
        assert_eq!(info.dimensions(), (16, 16));
        assert!(info.has_alpha());
        assert_eq!(info.bitstream.format, BitstreamFormat::Lossy);

        // the declared RIFF size is only checked by the full walk
        let mut cut = riff(&[(b"VP8L", &vp8l_header(5, 7, true))]);
        cut[4] = 0xff;
        let info = read_header_info(&mut SliceReader::new(&cut)).unwrap();
        assert_eq!(info.dimensions(), (5, 7));
        assert!(info.has_alpha());
        assert!(Container::parse(&cut).is_err());
    }

    #[test]
    fn header_scan_rejects_short_image_chunk() {
        let data = riff(&[(b"VP8 ", &[0x10, 0, 0, 0x9d])]);
        assert!(matches!(
            read_header_info(&mut SliceReader::new(&data)),
            Err(DecodingError::NotEnoughInitData)
        ));
    }

    #[test]
    fn interframes_and_bad_magic() {
        let mut payload = vp8_header(4, 4);
        payload[0] |= 1;
        assert!(matches!(
            parse_bitstream_header(WebPRiffChunk::VP8, &payload),
            Err(DecodingError::UnsupportedFeature(_))
        ));

        let mut payload = vp8_header(4, 4);
        payload[4] = 0;
        assert!(matches!(
            parse_bitstream_header(WebPRiffChunk::VP8, &payload),
            Err(DecodingError::Vp8MagicInvalid([0x9d, 0, 0x2a]))
        ));

        assert!(matches!(
            parse_bitstream_header(WebPRiffChunk::VP8, &vp8_header(0, 4)),
            Err(DecodingError::ZeroDimensions)
        ));
    }

    #[cfg(feature = "std")]
    #[test]
    fn header_scan_over_reader() {
        let data = riff(&[
            (b"VP8X", &vp8x(0, 3, 2)),
            (b"ICCP", &[7; 33]),
            (b"VP8L", &vp8l_header(3, 2, false)),
        ]);
        let info = read_header_info(&mut ReadSource(std::io::Cursor::new(&data))).unwrap();
        assert_eq!(info.dimensions(), (3, 2));
        assert!(!info.has_alpha());

        let truncated = &data[..30];
        assert!(matches!(
            read_header_info(&mut ReadSource(truncated)),
            Err(DecodingError::UnexpectedEof)
        ));
    }
}
