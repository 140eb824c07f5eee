//! WebP decoder implementation

mod api;
mod bit_reader;
mod demux;
mod huffman;
mod limits;
mod loop_filter;
mod lossless;
mod lossless_transform;
mod vp8;

// Re-export public API
pub use api::{
    decode, decode_rgba, decode_yuv420, BitstreamFormat, ColorModel, DecodeConfig, DecodeRequest,
    DecodedImage, DecodingError, ErrorKind, ImageInfo, RgbaImage, WebPDecoder, YuvPlanes,
};
#[cfg(feature = "std")]
pub use api::{decode_reader, read_info};
pub use limits::Limits;
