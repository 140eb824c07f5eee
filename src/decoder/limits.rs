//! Resource caps applied before decoding allocates.
//!
//! The container is checked against [`Limits::max_file_size`] up front, the
//! frame size as soon as a bitstream header has been read, and the estimated
//! buffer footprint right before the first pixel buffer is created.

use super::api::DecodingError;

/// Upper bounds on what a single decode may consume. Each bound is optional
/// and `None` disables it.
///
/// ```rust
/// use zenwebp_decode::Limits;
///
/// let thumbnails = Limits::default()
///     .max_dimensions(4096, 4096)
///     .max_memory(256 << 20);
/// assert_eq!(thumbnails.max_width, Some(4096));
///
/// let trusted = Limits::none();
/// assert_eq!(trusted.max_memory, None);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Limits {
    /// Widest accepted image, in pixels.
    pub max_width: Option<u32>,
    /// Tallest accepted image, in pixels.
    pub max_height: Option<u32>,
    /// Largest accepted `width * height`, which also catches long thin images.
    pub max_total_pixels: Option<u64>,
    /// Largest accepted input, in bytes.
    pub max_file_size: Option<u64>,
    /// Largest accepted estimate of decoder buffers, in bytes.
    pub max_memory: Option<u64>,
}

/// Canvas dimensions are 14 bit in VP8 and VP8X headers.
const FORMAT_MAX_DIMENSION: u32 = 1 << 14;

impl Default for Limits {
    /// Caps for untrusted input: the largest canvas the format can describe,
    /// 100 megapixels, 100 MiB of input and 1 GiB of buffers.
    fn default() -> Self {
        Self {
            max_width: Some(FORMAT_MAX_DIMENSION),
            max_height: Some(FORMAT_MAX_DIMENSION),
            max_total_pixels: Some(100_000_000),
            max_file_size: Some(100 << 20),
            max_memory: Some(1 << 30),
        }
    }
}

/// `Some(limit)` when `value` is over `limit`.
fn exceeded<T: PartialOrd + Copy>(limit: Option<T>, value: T) -> Option<T> {
    limit.filter(|&limit| value > limit)
}

impl Limits {
    /// No caps at all. Only for input you trust.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_width: None,
            max_height: None,
            max_total_pixels: None,
            max_file_size: None,
            max_memory: None,
        }
    }

    /// Caps width and height separately.
    #[must_use]
    pub fn max_dimensions(self, width: u32, height: u32) -> Self {
        Self {
            max_width: Some(width),
            max_height: Some(height),
            ..self
        }
    }

    /// Caps `width * height`.
    #[must_use]
    pub fn max_total_pixels(self, pixels: u64) -> Self {
        Self {
            max_total_pixels: Some(pixels),
            ..self
        }
    }

    /// Caps the input size.
    #[must_use]
    pub fn max_file_size(self, bytes: u64) -> Self {
        Self {
            max_file_size: Some(bytes),
            ..self
        }
    }

    /// Caps the estimated decoder buffer size.
    #[must_use]
    pub fn max_memory(self, bytes: u64) -> Self {
        Self {
            max_memory: Some(bytes),
            ..self
        }
    }

    /// Fails with [`DecodingError::ImageTooLarge`] when either side or the
    /// pixel count is over its cap.
    pub fn check_dimensions(&self, width: u32, height: u32) -> Result<(), DecodingError> {
        let pixels = u64::from(width) * u64::from(height);
        let too_wide = exceeded(self.max_width, width).is_some();
        let too_tall = exceeded(self.max_height, height).is_some();
        let too_many = exceeded(self.max_total_pixels, pixels).is_some();
        if too_wide || too_tall || too_many {
            log::debug!(
                "image {width}x{height} rejected, limits {:?}x{:?} and {:?} pixels",
                self.max_width,
                self.max_height,
                self.max_total_pixels
            );
            return Err(DecodingError::ImageTooLarge);
        }
        Ok(())
    }

    /// Fails with [`DecodingError::InvalidParameter`] when `size` is over the cap.
    pub fn check_file_size(&self, size: u64) -> Result<(), DecodingError> {
        match exceeded(self.max_file_size, size) {
            Some(max) => Err(DecodingError::InvalidParameter(alloc::format!(
                "input of {size} bytes is over the {max} byte limit"
            ))),
            None => Ok(()),
        }
    }

    /// Fails with [`DecodingError::MemoryLimitExceeded`] when `bytes` is over the cap.
    pub fn check_memory(&self, bytes: usize) -> Result<(), DecodingError> {
        let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
        match exceeded(self.max_memory, bytes) {
            Some(max) => {
                log::debug!("decoder buffers need {bytes} bytes, limit is {max}");
                Err(DecodingError::MemoryLimitExceeded)
            }
            None => Ok(()),
        }
    }
}
