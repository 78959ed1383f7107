//! The boundary to the VPU middleware.
//!
//! Both traits mirror the middleware's calling convention: every call
//! returns a raw `i64` status (see [`crate::status`]) and statistics are
//! fetched with separate calls afterwards. Sessions classify the codes;
//! engines never panic on bad input.

use crate::{FramePool, FrameSlot, Format, PictureType, SeiMessage, StreamBuffer};

/// Parameters for starting an encode stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeInit {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub h263: bool,
    pub bitrate: u32,
    pub frame_rate_x10: u32,
    pub idr_interval: u32,
    pub ref_frame_num: u32,
    pub b_vop_num: u32,
    pub rate_control_skip: bool,
    pub filler_output: bool,
}

/// Which unit the encoder is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRequest {
    /// H.264 sequence parameter set.
    Sps,
    /// H.264 picture parameter set.
    Pps,
    /// One H.264 slice of the current picture.
    Slice,
    /// One whole MPEG-4 VOP.
    Frame,
}

/// The buffers one encoded picture works on.
pub struct Picture<'a> {
    /// Frame number in stream time units.
    pub frame_no: u64,
    /// Start a new IDR picture regardless of the engine's own schedule.
    pub force_idr: bool,
    /// Source image.
    pub input: &'a FrameSlot,
    /// Local decode buffer the reconstruction is written to.
    pub local: &'a mut FrameSlot,
    /// Reference picture for prediction.
    pub reference: &'a FrameSlot,
}

/// Output buffers for one encode call.
pub struct EncodeTargets<'a> {
    pub stream: &'a mut StreamBuffer,
    pub aud: Option<&'a mut StreamBuffer>,
    pub filler: Option<&'a mut StreamBuffer>,
}

/// Statistics of the last unit produced by the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceStat {
    pub encoded_bits: u64,
    pub pic_type: PictureType,
    pub aud_bytes: usize,
    pub sps_bytes: usize,
    pub pps_bytes: usize,
    pub filler_bytes: usize,
}

impl SliceStat {
    /// Size of the unit in whole bytes.
    #[must_use]
    pub fn unit_bytes(&self) -> usize {
        ((self.encoded_bits + 7) / 8) as usize
    }
}

/// Opaque copy of the engine's stream context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamBackup {
    pub data: Vec<u8>,
}

/// A hardware (or simulated) encoder.
pub trait EncoderEngine: Send {
    /// Start a stream. Must be called once before any other call.
    fn init_encode(&mut self, init: &EncodeInit) -> i64;

    /// Load a stream context previously saved with `get_backup`.
    fn set_backup(&mut self, backup: &StreamBackup) -> i64;

    /// Save the stream context so another stream can use the engine.
    fn get_backup(&mut self, backup: &mut StreamBackup) -> i64;

    /// Produce the requested unit for `picture`.
    fn encode_picture(
        &mut self,
        picture: Picture<'_>,
        request: OutputRequest,
        targets: EncodeTargets<'_>,
    ) -> i64;

    /// Statistics of the unit produced by the last `encode_picture`.
    fn last_slice_stat(&self) -> SliceStat;

    /// Write one SEI message. Returns its length in bytes.
    fn put_sei(&mut self, message: SeiMessage, out: &mut StreamBuffer) -> i64;

    /// Write the end-of-stream code. Returns its length in bytes.
    fn put_end_code(&mut self, out: &mut StreamBuffer) -> i64;

    /// Clear the rate-control accumulator.
    fn reset_rate_control(&mut self) -> i64;
}

/// Parameters for starting a decode stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeInit {
    pub format: Format,
    pub max_width: u32,
    pub max_height: u32,
    pub ref_frames: usize,
}

/// Status of the last unit submitted to the decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStatus {
    /// Zero or a negative decoder code.
    pub error: i64,
    /// Slices of the current picture read so far.
    pub read_slices: u32,
    /// One past the last macroblock decoded in the current picture.
    pub last_macroblock_pos: u32,
    /// Bits consumed from the submitted data.
    pub read_bits: u64,
    /// The unit carried a new sequence header.
    pub sps_detected: bool,
}

/// A hardware (or simulated) decoder.
pub trait DecoderEngine: Send {
    /// Prepare for a stream of at most the given size.
    fn init_sequence(&mut self, init: &DecodeInit) -> i64;

    /// Offset of the first VOP header in `data`, or a negative code.
    fn search_vop_header(&self, data: &[u8]) -> i64;

    /// Decode one unit into an engine-owned slot of `frames`.
    fn decode_picture(&mut self, unit: &[u8], frames: &mut FramePool) -> i64;

    /// Status of the last `decode_picture`.
    fn last_frame_status(&self, status: &mut FrameStatus) -> i64;

    /// Current picture size from the last sequence header.
    fn frame_size(&self) -> (u32, u32);

    /// Next picture ready for display, if any. `flush` empties the reorder queue.
    fn decoded_frame(&mut self, flush: bool) -> Option<usize>;
}
