//! Error types for VPU codec operations.

use thiserror::Error;

use crate::Owner;

/// Errors that can occur while driving the VPU encoder or decoder.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The middleware returned a negative status for an operation.
    #[error("{op} failed with code {code} ({reason})")]
    Engine {
        op: &'static str,
        code: i64,
        reason: &'static str,
    },

    /// The middleware returned a status the caller did not expect at this point.
    #[error("{op} returned unexpected status {code}")]
    UnexpectedStatus { op: &'static str, code: i64 },

    /// Out of memory while allocating frame or stream buffers.
    #[error("out of memory")]
    OutOfMemory,

    /// Invalid frame dimensions.
    #[error("invalid frame dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Invalid parameter passed to a session or engine.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Unsupported parameter.
    #[error("unsupported parameter: {0}")]
    UnsupportedParam(String),

    /// A frame slot was used by a party that does not own it.
    #[error("frame slot {index} is owned by {owner:?}")]
    SlotOwnership { index: usize, owner: Owner },

    /// A frame slot index outside the pool.
    #[error("frame slot {index} out of range (pool has {len})")]
    SlotOutOfRange { index: usize, len: usize },

    /// Advancing the input cursor would pass the end of the buffered data.
    #[error("cursor overrun: {position} + {advance} exceeds {size}")]
    CursorOverrun {
        position: usize,
        advance: usize,
        size: usize,
    },

    /// A stream buffer is too small for the requested unit.
    #[error("buffer not large enough: need {needed}, have {capacity}")]
    NotEnoughBuffer { needed: usize, capacity: usize },

    /// The shared engine lock was poisoned by a panicking holder.
    #[error("vpu lock poisoned")]
    LockPoisoned,

    /// Operation does not apply to the session's stream format.
    #[error("operation not supported for {0:?} streams")]
    WrongFormat(crate::Format),

    /// Plane data supplied by the client does not match the slot geometry.
    #[error("plane size mismatch: expected {expected} bytes, got {actual}")]
    PlaneSize { expected: usize, actual: usize },

    /// Generic/unknown error.
    #[error("codec error: {0}")]
    Generic(String),
}

impl CodecError {
    /// Create an InvalidParam error with a message.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create an UnsupportedParam error with a message.
    pub fn unsupported_param(msg: impl Into<String>) -> Self {
        Self::UnsupportedParam(msg.into())
    }

    /// Create a Generic error with a message.
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Raw middleware code carried by this error, if any.
    #[must_use]
    pub fn engine_code(&self) -> Option<i64> {
        match self {
            Self::Engine { code, .. } | Self::UnexpectedStatus { code, .. } => Some(*code),
            _ => None,
        }
    }
}
