//! shcodecs - frame sequencing for SH-Mobile VPU video codecs.
//!
//! The VPU compresses and decompresses single units; everything around
//! that lives here:
//!
//! - **Encoding** ([`EncodeSession`]): per-frame cycle of input, slice
//!   encoding, parameter set and SEI placement, reference buffer rotation
//!   and rate-control resets, with the engine's stream context saved and
//!   restored so several streams can share one VPU
//! - **Decoding** ([`DecodeSession`]): start-code slicing with lookahead,
//!   picture completion tracking, error recovery and display-order output
//! - **Flow control** ([`Flow`]): every callback can pause the session
//!
//! The hardware boundary (engine traits, status codes, frame buffers) is in
//! the `shcodecs-vpu` crate, re-exported as [`vpu`].
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use shcodecs::{EncodeSession, EncoderConfig, Flow};
//! use shcodecs::vpu::{sim::SimEncoder, Vpu};
//!
//! let vpu = Arc::new(Vpu::new(SimEncoder::new()));
//! let mut session = EncodeSession::new(vpu, EncoderConfig::new(320, 240))?;
//! session.set_output_callback(|unit| {
//!     println!("{:?} {} bytes", unit.kind, unit.len());
//!     Flow::Continue
//! });
//! let mut frames = 0;
//! session.set_input_callback(move |input| {
//!     input.planes_mut().0.fill(16);
//!     frames += 1;
//!     if frames > 30 { Flow::Pause } else { Flow::Continue }
//! });
//! session.run()?;
//! ```

pub mod bitstream;
pub mod clock;
pub mod control;
pub mod decoder;
pub mod encoder;
pub mod rate_control;
pub mod slicer;

pub use bitstream::{is_well_ordered, BitstreamUnit, UnitKind};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use control::Flow;
pub use decoder::{DecodeSession, DecodedFrame};
pub use encoder::{EncodeSession, EncoderInput};
pub use rate_control::RateControlSnapshot;

pub use shcodecs_vpu as vpu;
pub use shcodecs_vpu::{CodecError, DecoderConfig, EncoderConfig, Format, PictureType};
