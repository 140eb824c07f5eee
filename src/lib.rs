//! Decoding of still WebP images
//!
//! This crate decodes the two WebP bitstreams found in still images:
//!
//! - lossy `VP8 ` chunks, returned as planar YUV 4:2:0 ([`YuvPlanes`]);
//! - lossless `VP8L` chunks, returned as interleaved RGBA ([`RgbaImage`]).
//!
//! Both simple files and extended (`VP8X`) files are accepted. Metadata chunks
//! such as `ICCP`, `EXIF` and `XMP ` are not interpreted but can be fetched with
//! [`WebPDecoder::raw_chunk`]. Animated files are refused.
//!
//! # Features
//!
//! - `std` (default): `std::io::Read` entry points ([`decode_reader`],
//!   [`read_info`]) and `std::error::Error` on [`DecodingError`].
//!
//! # `no_std`
//!
//! Without `std` the crate needs only `alloc`:
//! ```toml
//! [dependencies]
//! zenwebp-decode = { version = "...", default-features = false }
//! ```
//!
//! Every decoding entry point takes the whole file as a `&[u8]`.
//!
//! # Decoding
//!
//! One call decodes whatever the file holds:
//!
//! ```rust,no_run
//! use zenwebp_decode::DecodedImage;
//!
//! let webp_data: &[u8] = &[];
//! match zenwebp_decode::decode(webp_data)? {
//!     DecodedImage::Yuv420(planes) => println!("lossy {}x{}", planes.y_width, planes.y_height),
//!     DecodedImage::Rgba(image) => println!("lossless {}x{}", image.width, image.height),
//! }
//! # Ok::<(), zenwebp_decode::DecodingError>(())
//! ```
//!
//! [`WebPDecoder`] splits header parsing from decoding:
//!
//! ```rust,no_run
//! use zenwebp_decode::WebPDecoder;
//!
//! let webp_data: &[u8] = &[];
//! let decoder = WebPDecoder::new(webp_data)?;
//! let (_width, _height) = decoder.dimensions();
//! let icc = decoder.raw_chunk(*b"ICCP");
//! let image = decoder.decode()?;
//! # Ok::<(), zenwebp_decode::DecodingError>(())
//! ```
//!
//! Header-only inspection reads just the container and bitstream headers:
//!
//! ```rust,no_run
//! let webp_data: &[u8] = &[];
//! let info = zenwebp_decode::ImageInfo::from_webp(webp_data)?;
//! println!("{}x{} {}", info.width, info.height, info.format);
//! # Ok::<(), zenwebp_decode::DecodingError>(())
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

extern crate alloc;

mod common;
pub mod decoder;

mod slice_reader;

pub use decoder::{
    decode, decode_rgba, decode_yuv420, BitstreamFormat, ColorModel, DecodeConfig, DecodeRequest,
    DecodedImage, DecodingError, ErrorKind, ImageInfo, Limits, RgbaImage, WebPDecoder, YuvPlanes,
};
#[cfg(feature = "std")]
pub use decoder::{decode_reader, read_info};
