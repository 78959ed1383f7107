//! Deterministic software stand-in for the VPU middleware.
//!
//! No compression happens here. A picture is summarised by the mean of its
//! luma and chroma planes and carried in a minimal bitstream that still has
//! the shape the sessions care about: Annex B NAL units with emulation
//! prevention for H.264, start-code delimited VOPs for MPEG-4. Decoding
//! rebuilds solid planes from those means.

mod decoder;
mod encoder;
pub mod wire;

pub use decoder::SimDecoder;
pub use encoder::SimEncoder;
