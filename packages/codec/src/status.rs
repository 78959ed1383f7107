//! Return codes of the VPU middleware and their classification.
//!
//! The middleware reports every call as a signed integer: zero or a small
//! positive value for the various success outcomes, a negative value for
//! failures. The extension traits here turn those raw codes into
//! `Result`s so no code is silently dropped.

use crate::CodecError;

/// Encoder return codes.
pub mod encode {
    pub const SUCCESS: i64 = 0;
    pub const FRAME_SKIPPED: i64 = 1;
    pub const EMPTY_VOP: i64 = 2;
    pub const B_VOP_OUTPUT: i64 = 4;
    pub const SLICE_REMAIN: i64 = 5;
    pub const SPS_OUTPUT: i64 = 6;
    pub const PPS_OUTPUT: i64 = 7;

    pub const PARAM_ERROR: i64 = -1;
    pub const SEQUENCE_ERROR: i64 = -2;
    pub const OUTPUT_BUFFER_SHORT: i64 = -3;
    pub const VPU_ERROR: i64 = -4;
    pub const TEMPORARY_BUFFER_SHORT: i64 = -5;
    pub const VUI_MISSING: i64 = -6;
    pub const QUANT_MATRIX_MISSING: i64 = -7;
    pub const WORK_AREA_SHORT: i64 = -8;
    pub const NOT_INITIALIZED: i64 = -9;
}

/// Decoder return codes.
pub mod decode {
    pub const OK: i64 = 0;

    pub const PARAM_ERROR: i64 = -1;
    pub const PIC_TIMEOUT: i64 = -2;
    pub const PIC_ABORT: i64 = -3;
    pub const PIC_EOS: i64 = -4;
    pub const PIC_TOO_LARGE: i64 = -5;
    pub const PIC_FEWER_MB: i64 = -6;
    pub const PIC_FORMAT_ERROR: i64 = -7;
    pub const PIC_ERROR: i64 = -8;
    pub const MB_OVERRUN: i64 = -9;
    pub const ILLEGAL_DATA: i64 = -10;
    pub const ILLEGAL_CODE: i64 = -11;
    pub const ILLEGAL_MB_TYPE: i64 = -12;
    pub const BUFFER_OVERRUN: i64 = -13;
    pub const EXCESS_FRAME: i64 = -14;
    pub const EXCESS_PPS: i64 = -15;
    pub const TEMPORARY_BUFFER_SHORT: i64 = -16;
    pub const VPU_ERROR: i64 = -17;
    pub const NO_VOP_HEADER: i64 = -18;
}

/// Human readable reason for an encoder code.
#[must_use]
pub fn describe_encode(code: i64) -> &'static str {
    match code {
        encode::SUCCESS => "success",
        encode::FRAME_SKIPPED => "frame skipped",
        encode::EMPTY_VOP => "empty VOP",
        encode::B_VOP_OUTPUT => "B-VOP output",
        encode::SLICE_REMAIN => "slices remain",
        encode::SPS_OUTPUT => "SPS output",
        encode::PPS_OUTPUT => "PPS output",
        encode::PARAM_ERROR => "parameter error",
        encode::SEQUENCE_ERROR => "call out of sequence",
        encode::OUTPUT_BUFFER_SHORT => "output buffer too small",
        encode::VPU_ERROR => "VPU error after encoding",
        encode::TEMPORARY_BUFFER_SHORT => "temporary buffer too small",
        encode::VUI_MISSING => "VUI parameters not set",
        encode::QUANT_MATRIX_MISSING => "quantisation matrix not set",
        encode::WORK_AREA_SHORT => "work area too small",
        encode::NOT_INITIALIZED => "encoder not initialised",
        _ => "unknown encoder status",
    }
}

/// Human readable reason for a decoder code.
#[must_use]
pub fn describe_decode(code: i64) -> &'static str {
    match code {
        decode::OK => "ok",
        decode::PARAM_ERROR => "parameter error",
        decode::PIC_TIMEOUT => "picture timeout",
        decode::PIC_ABORT => "picture aborted",
        decode::PIC_EOS => "end of stream",
        decode::PIC_TOO_LARGE => "picture too large",
        decode::PIC_FEWER_MB => "fewer macroblocks than expected",
        decode::PIC_FORMAT_ERROR => "picture format error",
        decode::PIC_ERROR => "picture error",
        decode::MB_OVERRUN => "macroblock overrun",
        decode::ILLEGAL_DATA => "illegal data",
        decode::ILLEGAL_CODE => "illegal code",
        decode::ILLEGAL_MB_TYPE => "illegal macroblock type",
        decode::BUFFER_OVERRUN => "buffer overrun",
        decode::EXCESS_FRAME => "too many frames",
        decode::EXCESS_PPS => "too many PPS",
        decode::TEMPORARY_BUFFER_SHORT => "temporary buffer too small",
        decode::VPU_ERROR => "VPU error",
        decode::NO_VOP_HEADER => "no VOP header",
        _ => "unknown decoder status",
    }
}

/// Outcome of one encoder call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    /// The frame (or its last slice) was encoded.
    Success,
    /// The engine dropped the frame to hold the bitrate.
    FrameSkipped,
    /// MPEG-4 VOP without coded macroblocks.
    EmptyVop,
    /// MPEG-4 B-VOP produced.
    BVop,
    /// A slice was produced and more remain for this frame.
    SliceRemain,
    /// A sequence parameter set was produced.
    SpsOutput,
    /// A picture parameter set was produced.
    PpsOutput,
}

/// Extension trait for converting encoder return codes to Results.
pub trait EncodeStatusExt {
    /// Classify a code returned by `op`.
    fn classify(self, op: &'static str) -> Result<EncodeStatus, CodecError>;

    /// Accept only zero.
    fn check(self, op: &'static str) -> Result<(), CodecError>;

    /// Accept a positive byte count.
    fn length(self, op: &'static str) -> Result<usize, CodecError>;
}

impl EncodeStatusExt for i64 {
    fn classify(self, op: &'static str) -> Result<EncodeStatus, CodecError> {
        match self {
            encode::SUCCESS => Ok(EncodeStatus::Success),
            encode::FRAME_SKIPPED => Ok(EncodeStatus::FrameSkipped),
            encode::EMPTY_VOP => Ok(EncodeStatus::EmptyVop),
            encode::B_VOP_OUTPUT => Ok(EncodeStatus::BVop),
            encode::SLICE_REMAIN => Ok(EncodeStatus::SliceRemain),
            encode::SPS_OUTPUT => Ok(EncodeStatus::SpsOutput),
            encode::PPS_OUTPUT => Ok(EncodeStatus::PpsOutput),
            code if code < 0 => Err(CodecError::Engine {
                op,
                code,
                reason: describe_encode(code),
            }),
            code => Err(CodecError::UnexpectedStatus { op, code }),
        }
    }

    fn check(self, op: &'static str) -> Result<(), CodecError> {
        match self {
            0 => Ok(()),
            code if code < 0 => Err(CodecError::Engine {
                op,
                code,
                reason: describe_encode(code),
            }),
            code => Err(CodecError::UnexpectedStatus { op, code }),
        }
    }

    fn length(self, op: &'static str) -> Result<usize, CodecError> {
        match self {
            code if code > 0 => Ok(code as usize),
            0 => Err(CodecError::UnexpectedStatus { op, code: 0 }),
            code => Err(CodecError::Engine {
                op,
                code,
                reason: describe_encode(code),
            }),
        }
    }
}

/// Extension trait for converting decoder return codes to Results.
pub trait DecodeStatusExt {
    /// Accept zero, map negative codes to [`CodecError::Engine`].
    fn check(self, op: &'static str) -> Result<(), CodecError>;

    /// Whether the code is the recoverable macroblock overrun.
    fn is_mb_overrun(self) -> bool;
}

impl DecodeStatusExt for i64 {
    fn check(self, op: &'static str) -> Result<(), CodecError> {
        match self {
            decode::OK => Ok(()),
            code if code < 0 => Err(CodecError::Engine {
                op,
                code,
                reason: describe_decode(code),
            }),
            code => Err(CodecError::UnexpectedStatus { op, code }),
        }
    }

    fn is_mb_overrun(self) -> bool {
        self == decode::MB_OVERRUN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success_codes() {
        assert_eq!(encode::SUCCESS.classify("op").unwrap(), EncodeStatus::Success);
        assert_eq!(
            encode::SLICE_REMAIN.classify("op").unwrap(),
            EncodeStatus::SliceRemain
        );
        assert_eq!(
            encode::FRAME_SKIPPED.classify("op").unwrap(),
            EncodeStatus::FrameSkipped
        );
    }

    #[test]
    fn test_classify_failure_keeps_code() {
        let err = encode::OUTPUT_BUFFER_SHORT.classify("encode_picture").unwrap_err();
        assert_eq!(err.engine_code(), Some(encode::OUTPUT_BUFFER_SHORT));
        assert!(err.to_string().contains("encode_picture"));

        let err = 3i64.classify("encode_picture").unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedStatus { code: 3, .. }));
    }

    #[test]
    fn test_length() {
        assert_eq!(12i64.length("put_sei").unwrap(), 12);
        assert!(0i64.length("put_sei").is_err());
        assert!(encode::PARAM_ERROR.length("put_sei").is_err());
    }

    #[test]
    fn test_decode_check() {
        assert!(decode::OK.check("init_sequence").is_ok());
        let err = decode::ILLEGAL_DATA.check("init_sequence").unwrap_err();
        assert_eq!(err.engine_code(), Some(decode::ILLEGAL_DATA));
        assert!(decode::MB_OVERRUN.is_mb_overrun());
        assert!(!decode::PIC_ERROR.is_mb_overrun());
    }
}
