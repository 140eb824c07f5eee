//! VP8 tables, intra prediction and inverse transforms

pub(crate) mod prediction;
/// DCT/IDCT transform functions
pub(crate) mod transform;
pub(crate) mod types;
