//! Engine boundary for SH-Mobile VPU video codecs.
//!
//! This crate defines everything the sequencing core in `shcodecs` needs
//! from the hardware side, without implementing any compression itself:
//!
//! - **Engine traits** ([`EncoderEngine`], [`DecoderEngine`]): the unit-level
//!   calls of the VPU middleware, returning raw status codes
//! - **Status codes** ([`status`]): the middleware's return codes and the
//!   extension traits that turn them into `Result`s
//! - **Frame buffers** ([`FramePool`], [`FrameSlot`]): 16-pixel aligned
//!   YCbCr 4:2:0 planes with explicit client/engine ownership
//! - **Shared context** ([`Vpu`]): one engine per process behind a lock
//! - **Simulation** (`sim` feature): a deterministic software engine
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use shcodecs_vpu::{sim::SimEncoder, Vpu};
//!
//! let vpu = Arc::new(Vpu::new(SimEncoder::new()));
//! let mut engine = vpu.lock()?;
//! // engine calls happen while the guard is alive
//! ```
//!
//! # Feature Flags
//!
//! - `sim` - Enable the software engine used by tests and the loopback tool

mod error;
mod frame;
pub mod status;
mod traits;
mod types;
mod vpu;

pub use error::CodecError;
pub use frame::{
    align16, plane_sizes, FramePool, FrameSlot, Owner, PlaneGeometry, StreamBuffer, MACROBLOCK,
};
pub use status::{DecodeStatusExt, EncodeStatus, EncodeStatusExt};
pub use traits::{
    DecodeInit, DecoderEngine, EncodeInit, EncodeTargets, EncoderEngine, FrameStatus,
    OutputRequest, Picture, SliceStat, StreamBackup,
};
pub use types::{
    DecoderConfig, EncoderConfig, Format, PictureType, SeiConfig, SeiMessage, MAX_HEIGHT,
    MAX_WIDTH,
};
pub use vpu::{Vpu, VpuGuard};

// Software engine
#[cfg(feature = "sim")]
pub mod sim;
