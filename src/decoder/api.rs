use alloc::string::String;
use alloc::vec::Vec;
use thiserror::Error;

/// Why a decode failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodingError {
    /// Reading the input failed.
    #[cfg(feature = "std")]
    #[error("read failed: {0}")]
    IoError(#[from] std::io::Error),

    /// The input ended before a complete structure could be read.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// The file does not start with `RIFF`.
    #[error("not a RIFF file, found {0:x?}")]
    RiffSignatureInvalid([u8; 4]),

    /// The RIFF form type is not `WEBP`.
    #[error("not a WebP file, found form type {0:x?}")]
    WebpSignatureInvalid([u8; 4]),

    /// A chunk the layout requires is absent.
    #[error("required chunk missing")]
    ChunkMissing,

    /// A chunk tag that is unknown or out of place.
    #[error("unexpected chunk {0:x?}")]
    ChunkHeaderInvalid([u8; 4]),

    /// A chunk or the RIFF container claims more bytes than are present.
    #[error("chunk size runs past the end of its container")]
    InvalidChunkSize,

    /// The image is over a configured [`Limits`] cap or too big to address.
    #[error("image dimensions over the configured limit")]
    ImageTooLarge,

    /// The bitstream declares a zero width or height.
    #[error("image has zero width or height")]
    ZeroDimensions,

    /// A VP8L stream that does not start with `0x2f`.
    #[error("bad VP8L signature byte {0:#04x}")]
    LosslessSignatureInvalid(u8),

    /// A VP8L version other than 0.
    #[error("unsupported VP8L version {0}")]
    VersionNumberInvalid(u8),

    /// Colour cache size bits outside 1..=11.
    #[error("colour cache bits {0} out of range")]
    InvalidColorCacheBits(u8),

    /// A prefix code that cannot be built or walked.
    #[error("malformed prefix code")]
    HuffmanError,

    /// The entropy-coded data is inconsistent or ends early.
    #[error("corrupt bitstream")]
    BitStreamError,

    /// A VP8L transform that is repeated or malformed.
    #[error("malformed VP8L transform")]
    TransformError,

    /// The VP8 start code `9d 01 2a` is absent.
    #[error("bad VP8 start code {0:x?}")]
    Vp8MagicInvalid([u8; 3]),

    /// The VP8 frame header or first partition is cut short.
    #[error("VP8 frame header truncated")]
    NotEnoughInitData,

    /// A VP8 colour space other than 0 (YUV).
    #[error("unsupported VP8 colour space {0}")]
    ColorSpaceInvalid(u8),

    /// A macroblock luma mode outside the keyframe tree.
    #[error("bad VP8 luma mode {0}")]
    LumaPredictionModeInvalid(i8),

    /// A subblock mode outside the keyframe tree.
    #[error("bad VP8 subblock mode {0}")]
    IntraPredictionModeInvalid(i8),

    /// A chroma mode outside the keyframe tree.
    #[error("bad VP8 chroma mode {0}")]
    ChromaPredictionModeInvalid(i8),

    /// The VP8X canvas and the image bitstream disagree on the size.
    #[error("canvas and bitstream sizes differ")]
    InconsistentImageSizes,

    /// Well-formed input using something this decoder does not handle.
    #[error("unsupported: {0}")]
    UnsupportedFeature(String),

    /// The input or a request was refused, with the reason.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Decoder buffers would exceed [`Limits::max_memory`].
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,
}

/// Broad classes of [`DecodingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The input is not a well-formed WebP file.
    Format,
    /// The input may be valid but uses something this decoder does not handle.
    Unsupported,
    /// Reading from the underlying source failed.
    Io,
    /// A configured [`Limits`] value refused the input.
    Limit,
}

impl DecodingError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            #[cfg(feature = "std")]
            Self::IoError(_) => ErrorKind::Io,
            Self::UnsupportedFeature(_) => ErrorKind::Unsupported,
            Self::ImageTooLarge | Self::InvalidParameter(_) | Self::MemoryLimitExceeded => {
                ErrorKind::Limit
            }
            _ => ErrorKind::Format,
        }
    }
}

use log::debug;

use super::demux::{self, Container, HeaderInfo};
use super::limits::Limits;
use super::lossless::LosslessDecoder;
use super::vp8::Vp8Decoder;
use crate::slice_reader::SliceReader;

/// Bitstream compression format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum BitstreamFormat {
    /// Lossy compression (VP8).
    #[default]
    Lossy,
    /// Lossless compression (VP8L).
    Lossless,
}

impl core::fmt::Display for BitstreamFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BitstreamFormat::Lossy => f.write_str("lossy"),
            BitstreamFormat::Lossless => f.write_str("lossless"),
        }
    }
}

/// Pixel layout a full decode produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorModel {
    /// Planar Y, U and V with 2x2 chroma subsampling.
    Yuv420,
    /// Interleaved 8-bit red, green, blue, alpha, not premultiplied.
    Rgba,
}

impl From<BitstreamFormat> for ColorModel {
    fn from(format: BitstreamFormat) -> Self {
        match format {
            BitstreamFormat::Lossy => ColorModel::Yuv420,
            BitstreamFormat::Lossless => ColorModel::Rgba,
        }
    }
}

/// Image information obtained from WebP data header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image width in pixels (the canvas width for extended files).
    pub width: u32,
    /// Image height in pixels (the canvas height for extended files).
    pub height: u32,
    /// Bitstream format (lossy or lossless).
    pub format: BitstreamFormat,
    /// Layout of the pixels a full decode returns.
    pub color_model: ColorModel,
    /// Whether the file signals an alpha channel.
    ///
    /// Taken from the VP8X flags when present, otherwise from the lossless
    /// alpha hint. A lossy image's `ALPH` chunk is not decoded.
    pub has_alpha: bool,
}

impl ImageInfo {
    /// Parse image information from WebP data.
    ///
    /// Only the container and image chunk headers are read, so a truncated
    /// file still reports its size.
    pub fn from_webp(data: &[u8]) -> Result<Self, DecodingError> {
        let header = demux::read_header_info(&mut SliceReader::new(data))?;
        Ok(Self::from_header(&header))
    }

    fn from_header(header: &HeaderInfo) -> Self {
        let (width, height) = header.dimensions();
        Self {
            width,
            height,
            format: header.bitstream.format,
            color_model: header.bitstream.format.into(),
            has_alpha: header.has_alpha(),
        }
    }
}

/// Decoded YUV 4:2:0 planar image data.
///
/// Contains separate Y, U, and V planes at their native resolutions.
/// Y is full resolution, U and V are half resolution in each dimension,
/// rounded up.
#[derive(Debug, Clone)]
pub struct YuvPlanes {
    /// Luma plane (full resolution).
    pub y: Vec<u8>,
    /// Chroma blue plane (half resolution in each dimension).
    pub u: Vec<u8>,
    /// Chroma red plane (half resolution in each dimension).
    pub v: Vec<u8>,
    /// Width of the luma plane in pixels.
    pub y_width: u32,
    /// Height of the luma plane in pixels.
    pub y_height: u32,
    /// Width of each chroma plane in pixels.
    pub uv_width: u32,
    /// Height of each chroma plane in pixels.
    pub uv_height: u32,
}

/// Decoded interleaved RGBA image data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `width * height * 4` bytes, row-major, non-premultiplied.
    pub data: Vec<u8>,
}

/// A fully decoded image in the layout native to its bitstream.
#[derive(Debug, Clone)]
pub enum DecodedImage {
    /// Output of a lossy (VP8) image.
    Yuv420(YuvPlanes),
    /// Output of a lossless (VP8L) image.
    Rgba(RgbaImage),
}

impl DecodedImage {
    /// Width and height of the image.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            DecodedImage::Yuv420(planes) => (planes.y_width, planes.y_height),
            DecodedImage::Rgba(image) => (image.width, image.height),
        }
    }

    /// The pixel layout of this image.
    pub fn color_model(&self) -> ColorModel {
        match self {
            DecodedImage::Yuv420(_) => ColorModel::Yuv420,
            DecodedImage::Rgba(_) => ColorModel::Rgba,
        }
    }
}

/// Decoder configuration.
///
/// ```rust
/// use zenwebp_decode::{DecodeConfig, Limits};
///
/// let config = DecodeConfig::default().with_limits(Limits::default().max_dimensions(1024, 1024));
/// assert_eq!(config.limits.max_width, Some(1024));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[non_exhaustive]
pub struct DecodeConfig {
    /// Resource limits applied before any pixel buffer is allocated.
    pub limits: Limits,
}

impl DecodeConfig {
    /// Replace the resource limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// A decode of one in-memory file under a given configuration.
///
/// ```rust,no_run
/// use zenwebp_decode::{DecodeConfig, DecodeRequest};
///
/// let config = DecodeConfig::default();
/// let webp_data: &[u8] = &[]; // your WebP data
/// let image = DecodeRequest::new(&config, webp_data).decode()?;
/// # Ok::<(), zenwebp_decode::DecodingError>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DecodeRequest<'a> {
    config: &'a DecodeConfig,
    data: &'a [u8],
}

impl<'a> DecodeRequest<'a> {
    /// Create a new decode request.
    pub fn new(config: &'a DecodeConfig, data: &'a [u8]) -> Self {
        Self { config, data }
    }

    /// Decode to the bitstream's native layout.
    pub fn decode(self) -> Result<DecodedImage, DecodingError> {
        WebPDecoder::new_with_config(self.data, self.config)?.decode()
    }

    /// Decode a lossy image to YUV 4:2:0 planes.
    pub fn decode_yuv420(self) -> Result<YuvPlanes, DecodingError> {
        WebPDecoder::new_with_config(self.data, self.config)?.decode_yuv420()
    }

    /// Decode a lossless image to RGBA.
    pub fn decode_rgba(self) -> Result<RgbaImage, DecodingError> {
        WebPDecoder::new_with_config(self.data, self.config)?.decode_rgba()
    }

    /// Read only the header information.
    pub fn info(self) -> Result<ImageInfo, DecodingError> {
        self.config.limits.check_file_size(self.data.len() as u64)?;
        ImageInfo::from_webp(self.data)
    }
}

/// WebP image decoder over an in-memory file.
///
/// Construction walks the whole container and validates it; the pixel data is
/// decoded on request.
#[derive(Debug)]
pub struct WebPDecoder<'a> {
    container: Container<'a>,
    limits: Limits,
}

impl<'a> WebPDecoder<'a> {
    /// Create a new `WebPDecoder` from the data slice, using default limits.
    pub fn new(data: &'a [u8]) -> Result<Self, DecodingError> {
        Self::new_with_config(data, &DecodeConfig::default())
    }

    /// Create a new `WebPDecoder` with the given configuration.
    pub fn new_with_config(data: &'a [u8], config: &DecodeConfig) -> Result<Self, DecodingError> {
        config.limits.check_file_size(data.len() as u64)?;
        let container = Container::parse(data)?;
        let (width, height) = container.info.dimensions();
        config.limits.check_dimensions(width, height)?;

        Ok(Self {
            container,
            limits: config.limits.clone(),
        })
    }

    /// Header information for the image.
    pub fn info(&self) -> ImageInfo {
        ImageInfo::from_header(&self.container.info)
    }

    /// Returns the (width, height) of the image in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        self.container.info.dimensions()
    }

    /// Returns whether the image is lossy or lossless.
    pub fn format(&self) -> BitstreamFormat {
        self.container.info.bitstream.format
    }

    /// Returns true if the file signals an alpha channel.
    pub fn has_alpha(&self) -> bool {
        self.container.info.has_alpha()
    }

    /// Returns the payload of the first chunk with this identifier, uninterpreted.
    ///
    /// Useful for `ICCP`, `EXIF`, `XMP ` and `ALPH`. Identifiers are four bytes,
    /// space padded.
    pub fn raw_chunk(&self, fourcc: [u8; 4]) -> Option<&'a [u8]> {
        self.container.chunk(fourcc)
    }

    /// Decode to the bitstream's native layout.
    pub fn decode(&self) -> Result<DecodedImage, DecodingError> {
        match self.format() {
            BitstreamFormat::Lossy => self.decode_yuv420().map(DecodedImage::Yuv420),
            BitstreamFormat::Lossless => self.decode_rgba().map(DecodedImage::Rgba),
        }
    }

    /// Decode a lossy image to YUV 4:2:0 planes.
    ///
    /// Lossless images have no YUV representation and return
    /// [`DecodingError::UnsupportedFeature`].
    pub fn decode_yuv420(&self) -> Result<YuvPlanes, DecodingError> {
        if self.format() != BitstreamFormat::Lossy {
            return Err(DecodingError::UnsupportedFeature(
                "YUV 4:2:0 output from a lossless image".into(),
            ));
        }
        debug!("decoding {} byte VP8 bitstream", self.container.bitstream.len());

        let frame = Vp8Decoder::decode_frame(self.container.bitstream, &self.limits)?;
        Ok(YuvPlanes {
            y_width: u32::from(frame.width),
            y_height: u32::from(frame.height),
            uv_width: u32::from(frame.chroma_width()),
            uv_height: u32::from(frame.chroma_height()),
            y: frame.y,
            u: frame.u,
            v: frame.v,
        })
    }

    /// Decode a lossless image to RGBA.
    ///
    /// Lossy images are not converted and return
    /// [`DecodingError::UnsupportedFeature`].
    pub fn decode_rgba(&self) -> Result<RgbaImage, DecodingError> {
        if self.format() != BitstreamFormat::Lossless {
            return Err(DecodingError::UnsupportedFeature("RGBA output from a lossy image".into()));
        }
        debug!("decoding {} byte VP8L bitstream", self.container.bitstream.len());

        let frame = LosslessDecoder::decode_frame(self.container.bitstream, &self.limits)?;
        Ok(RgbaImage {
            width: frame.width,
            height: frame.height,
            data: frame.to_rgba(),
        })
    }
}

/// Decode WebP data to the bitstream's native layout.
pub fn decode(data: &[u8]) -> Result<DecodedImage, DecodingError> {
    WebPDecoder::new(data)?.decode()
}

/// Decode lossy WebP data to YUV 4:2:0 planes.
pub fn decode_yuv420(data: &[u8]) -> Result<YuvPlanes, DecodingError> {
    WebPDecoder::new(data)?.decode_yuv420()
}

/// Decode lossless WebP data to RGBA pixels.
pub fn decode_rgba(data: &[u8]) -> Result<RgbaImage, DecodingError> {
    WebPDecoder::new(data)?.decode_rgba()
}

/// Read a whole WebP file from `reader` and decode it.
///
/// At most [`Limits::max_file_size`] bytes are read.
#[cfg(feature = "std")]
pub fn decode_reader<R: std::io::Read>(reader: R) -> Result<DecodedImage, DecodingError> {
    use std::io::Read;

    let config = DecodeConfig::default();
    // one byte past the limit is enough for the size check to refuse it
    let cap = config
        .limits
        .max_file_size
        .map_or(u64::MAX, |max| max.saturating_add(1));
    let mut data = Vec::new();
    reader.take(cap).read_to_end(&mut data)?;
    DecodeRequest::new(&config, &data).decode()
}

/// Read only the header information from `reader`.
///
/// Stops after the first bytes of the image chunk; nothing past that is read.
#[cfg(feature = "std")]
pub fn read_info<R: std::io::Read>(reader: R) -> Result<ImageInfo, DecodingError> {
    let header = demux::read_header_info(&mut demux::ReadSource(reader))?;
    Ok(ImageInfo::from_header(&header))
}
