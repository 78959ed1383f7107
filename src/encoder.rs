//! Encode session: drives one stream through the VPU encoder.
//!
//! Each call to [`EncodeSession::encode_frame`] runs one frame cycle:
//! fetch input, restore the engine's stream context, encode slice by slice
//! while emitting the units that must precede the first slice, rotate the
//! local-decode/reference buffers, advance counters and rate control, and
//! save the stream context again so the engine can serve other streams in
//! between.

use std::sync::Arc;

use bytes::Bytes;
use shcodecs_vpu::{
    CodecError, EncodeInit, EncodeStatus, EncodeStatusExt, EncodeTargets, EncoderConfig,
    EncoderEngine, Format, FramePool, FrameSlot, OutputRequest, Owner, Picture, PictureType,
    PlaneGeometry, SliceStat, StreamBackup, StreamBuffer, Vpu,
};

use crate::bitstream::{BitstreamAssembler, BitstreamUnit, PrologueStep, UnitKind};
use crate::clock::{Clock, MonotonicClock};
use crate::control::Flow;
use crate::rate_control::{RateControlSnapshot, RateController};

/// Input slots cycled by the session.
pub const INPUT_FRAMES: usize = 2;
/// Local decode buffers for one reference frame (reconstruction + reference).
pub const LOCAL_DECODE_FRAMES: usize = 2;

const AUD_BUFFER: usize = 16;
const PARAMETER_SET_BUFFER: usize = 256;
const SEI_BUFFER: usize = 256;
const END_CODE_BUFFER: usize = 16;

/// Size of the per-picture stream output buffer.
#[must_use]
pub fn stream_buffer_size(width: u32, height: u32) -> usize {
    let pixels = width as usize * height as usize;
    let mut size = pixels * 3 / 2;
    if pixels >= 720 * 480 {
        size /= 4;
    } else {
        size /= 2;
    }
    let size = size.max(640_000);
    (size + 31) & !31
}

pub type InputCallback = Box<dyn FnMut(&mut EncoderInput<'_>) -> Flow + Send>;
pub type ReleaseCallback = Box<dyn FnMut(&[u8], &[u8]) -> Flow + Send>;
pub type OutputCallback = Box<dyn FnMut(&BitstreamUnit) -> Flow + Send>;

/// The input slot for the next frame, lent to the client.
pub struct EncoderInput<'a> {
    slot: &'a mut FrameSlot,
}

impl EncoderInput<'_> {
    #[must_use]
    pub fn width(&self) -> u32 {
        self.slot.geometry().width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.slot.geometry().height
    }

    #[must_use]
    pub fn geometry(&self) -> PlaneGeometry {
        self.slot.geometry()
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.slot.index()
    }

    /// Luma plane to write the next image into.
    pub fn luma_mut(&mut self) -> &mut [u8] {
        self.slot.luma_mut()
    }

    /// Packed chroma plane to write the next image into.
    pub fn chroma_mut(&mut self) -> &mut [u8] {
        self.slot.chroma_mut()
    }

    /// Both planes at once.
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        self.slot.planes_mut()
    }

    /// Copy externally owned planes into the slot.
    pub fn provide(&mut self, luma: &[u8], chroma: &[u8]) -> Result<(), CodecError> {
        self.slot.fill(luma, chroma)
    }
}

struct Buffers {
    stream: StreamBuffer,
    aud: StreamBuffer,
    sps: StreamBuffer,
    pps: StreamBuffer,
    sei: StreamBuffer,
    filler: StreamBuffer,
    end_code: StreamBuffer,
}

impl Buffers {
    fn new(width: u32, height: u32) -> Result<Self, CodecError> {
        let stream_size = stream_buffer_size(width, height);
        Ok(Self {
            stream: StreamBuffer::new(stream_size)?,
            aud: StreamBuffer::new(AUD_BUFFER)?,
            sps: StreamBuffer::new(PARAMETER_SET_BUFFER)?,
            pps: StreamBuffer::new(PARAMETER_SET_BUFFER)?,
            sei: StreamBuffer::new(SEI_BUFFER)?,
            filler: StreamBuffer::new(stream_size)?,
            end_code: StreamBuffer::new(END_CODE_BUFFER)?,
        })
    }
}

/// One encode stream bound to a shared VPU.
pub struct EncodeSession<E: EncoderEngine> {
    vpu: Arc<Vpu<E>>,
    config: EncoderConfig,
    geometry: PlaneGeometry,
    started: bool,
    inputs: FramePool,
    next_input: usize,
    local: FramePool,
    ldec: usize,
    ref1: usize,
    buffers: Buffers,
    sps_len: usize,
    pps_len: usize,
    parameter_sets_sent: bool,
    backup: StreamBackup,
    frame_number: u64,
    frame_counter: u64,
    frame_skip_count: u64,
    frame_num_delta: u32,
    rate: RateController,
    clock: Box<dyn Clock>,
    assembler: BitstreamAssembler,
    input: Option<InputCallback>,
    release: Option<ReleaseCallback>,
    output: Option<OutputCallback>,
    error_return_code: Option<i64>,
}

impl<E: EncoderEngine> EncodeSession<E> {
    /// Validate `config` and allocate every buffer the stream needs.
    ///
    /// The engine itself is initialised lazily on the first frame.
    pub fn new(vpu: Arc<Vpu<E>>, config: EncoderConfig) -> Result<Self, CodecError> {
        config.validate()?;
        let geometry = PlaneGeometry::new(config.width, config.height);
        let inputs = FramePool::new(INPUT_FRAMES, geometry, Owner::Client)?;
        let local_frames = LOCAL_DECODE_FRAMES + config.ref_frame_num as usize - 1;
        let local = FramePool::new(local_frames, geometry, Owner::Engine)?;
        let buffers = Buffers::new(config.width, config.height)?;
        let (bitrate, _) = config.engine_rate();
        let rate = RateController::new(config.rate_control_skip, bitrate, config.idr_interval);
        let assembler = BitstreamAssembler::new(config.sei, config.filler_output);

        tracing::info!(
            "Encode session {}x{} {:?} at {} bps ({} local frames, {} byte stream buffer)",
            config.width,
            config.height,
            config.format,
            config.bitrate,
            local_frames,
            buffers.stream.capacity()
        );

        Ok(Self {
            vpu,
            config,
            geometry,
            started: false,
            inputs,
            next_input: 0,
            local,
            ldec: 0,
            ref1: 1,
            buffers,
            sps_len: 0,
            pps_len: 0,
            parameter_sets_sent: false,
            backup: StreamBackup::default(),
            frame_number: 0,
            frame_counter: 0,
            frame_skip_count: 0,
            frame_num_delta: 0,
            rate,
            clock: Box::new(MonotonicClock),
            assembler,
            input: None,
            release: None,
            output: None,
            error_return_code: None,
        })
    }

    /// Use another time source for rate-control scheduling.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Called before every frame to fill (or confirm) the next input slot.
    pub fn set_input_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut EncoderInput<'_>) -> Flow + Send + 'static,
    {
        self.input = Some(Box::new(callback));
    }

    /// Called after every frame with the planes that were consumed.
    pub fn set_release_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&[u8], &[u8]) -> Flow + Send + 'static,
    {
        self.release = Some(Box::new(callback));
    }

    /// Called once per emitted bitstream unit.
    pub fn set_output_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&BitstreamUnit) -> Flow + Send + 'static,
    {
        self.output = Some(Box::new(callback));
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    #[must_use]
    pub fn format(&self) -> Format {
        self.config.format
    }

    #[must_use]
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Input frames the client must have queued before encoding starts.
    #[must_use]
    pub fn min_input_frames(&self) -> usize {
        1
    }

    /// Frame periods since the last emitted picture.
    #[must_use]
    pub fn frame_num_delta(&self) -> u32 {
        self.frame_num_delta
    }

    /// Input frames processed, skipped ones included.
    #[must_use]
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Input frames the engine skipped.
    #[must_use]
    pub fn frame_skip_count(&self) -> u64 {
        self.frame_skip_count
    }

    /// Current `(ldec, ref1)` local buffer indices.
    #[must_use]
    pub fn reference_indices(&self) -> (usize, usize) {
        (self.ldec, self.ref1)
    }

    /// Last negative engine code that aborted an operation.
    #[must_use]
    pub fn error_return_code(&self) -> Option<i64> {
        self.error_return_code
    }

    #[must_use]
    pub fn rate_control_debug(&self) -> Option<RateControlSnapshot> {
        self.rate.snapshot()
    }

    /// The next input slot, for clients that write frames without a callback.
    pub fn input_slot(&mut self) -> Result<EncoderInput<'_>, CodecError> {
        let slot = self.inputs.owned_mut(self.next_input, Owner::Client)?;
        Ok(EncoderInput { slot })
    }

    /// Encode one frame from the next input slot.
    ///
    /// The input callback (if any) fills the slot first; a pause from it
    /// returns without consuming a frame.
    pub fn encode_frame(&mut self) -> Result<Flow, CodecError> {
        let index = self.next_input;
        if let Some(input) = self.input.as_mut() {
            let slot = self.inputs.owned_mut(index, Owner::Client)?;
            if input(&mut EncoderInput { slot }).is_pause() {
                tracing::debug!("Input paused before frame {}", self.frame_counter);
                return Ok(Flow::Pause);
            }
        }
        let flow = self.submit(index)?;
        let released = match self.release.as_mut() {
            Some(release) => {
                let slot = self.inputs.owned(index, Owner::Client)?;
                release(slot.luma(), slot.chroma())
            }
            None => Flow::Continue,
        };
        self.next_input = (index + 1) % self.inputs.len();
        Ok(flow.merge(released))
    }

    /// Encode one frame from planes the client keeps ownership of.
    ///
    /// The planes are copied into the next input slot; the release
    /// callback receives the same slices back.
    pub fn encode_planes(&mut self, luma: &[u8], chroma: &[u8]) -> Result<Flow, CodecError> {
        let index = self.next_input;
        self.inputs
            .owned_mut(index, Owner::Client)?
            .fill(luma, chroma)?;
        let flow = self.submit(index)?;
        let released = match self.release.as_mut() {
            Some(release) => release(luma, chroma),
            None => Flow::Continue,
        };
        self.next_input = (index + 1) % self.inputs.len();
        Ok(flow.merge(released))
    }

    /// Encode frames until a callback pauses, then end the stream.
    ///
    /// A later call starts a new coded sequence with an IDR picture.
    pub fn run(&mut self) -> Result<(), CodecError> {
        while !self.encode_frame()?.is_pause() {}
        self.finish()?;
        Ok(())
    }

    /// Emit the end-of-stream unit.
    pub fn finish(&mut self) -> Result<Flow, CodecError> {
        if !self.started {
            return Ok(Flow::Continue);
        }
        let result = self.end_code();
        let data = self.record(result)?;
        self.parameter_sets_sent = false;
        self.rate.request_idr();
        tracing::info!(
            "Encode stream finished after {} frames ({} skipped)",
            self.frame_counter,
            self.frame_skip_count
        );
        Ok(self.deliver(UnitKind::EndOfStream, data))
    }

    fn end_code(&mut self) -> Result<Bytes, CodecError> {
        let vpu = Arc::clone(&self.vpu);
        let mut engine = vpu.lock()?;
        if self.frame_counter != 0 {
            engine.set_backup(&self.backup).check("set_backup")?;
        }
        let len = engine
            .put_end_code(&mut self.buffers.end_code)
            .length("put_end_code")?;
        engine.get_backup(&mut self.backup).check("get_backup")?;
        Ok(Bytes::copy_from_slice(self.buffers.end_code.prefix(len)?))
    }

    fn record<T>(&mut self, result: Result<T, CodecError>) -> Result<T, CodecError> {
        if let Err(err) = &result {
            if let Some(code) = err.engine_code() {
                self.error_return_code = Some(code);
            }
            tracing::warn!("Encoder error at frame {}: {}", self.frame_counter, err);
        }
        result
    }

    fn submit(&mut self, index: usize) -> Result<Flow, CodecError> {
        self.inputs.transfer(index, Owner::Engine)?;
        let result = self.encode_locked(index);
        self.inputs.transfer(index, Owner::Client)?;
        self.record(result)
    }

    fn encode_locked(&mut self, index: usize) -> Result<Flow, CodecError> {
        let vpu = Arc::clone(&self.vpu);
        let mut engine = vpu.lock()?;
        self.start(&mut engine)?;
        if self.frame_counter != 0 {
            engine.set_backup(&self.backup).check("set_backup")?;
        }
        let force_idr = self.rate.pending_idr();
        let flow = match self.config.format {
            Format::H264 => self.encode_h264(&mut engine, index, force_idr)?,
            Format::Mpeg4 => self.encode_mpeg4(&mut engine, index, force_idr)?,
        };
        engine.get_backup(&mut self.backup).check("get_backup")?;
        Ok(flow)
    }

    fn start(&mut self, engine: &mut E) -> Result<(), CodecError> {
        if self.started {
            return Ok(());
        }
        let (bitrate, frame_rate_x10) = self.config.engine_rate();
        if frame_rate_x10 != self.config.frame_rate_x10 {
            tracing::debug!(
                "Frame rate {} clamped to {}, bitrate {} -> {}",
                self.config.frame_rate_x10,
                frame_rate_x10,
                self.config.bitrate,
                bitrate
            );
        }
        let init = EncodeInit {
            width: self.config.width,
            height: self.config.height,
            format: self.config.format,
            h263: self.config.h263,
            bitrate,
            frame_rate_x10,
            idr_interval: self.config.idr_interval,
            ref_frame_num: self.config.ref_frame_num,
            b_vop_num: self.config.b_vop_num,
            rate_control_skip: self.config.rate_control_skip,
            filler_output: self.config.filler_output,
        };
        engine.init_encode(&init).check("init_encode")?;
        self.started = true;
        Ok(())
    }

    fn encode_parameter_sets(
        &mut self,
        engine: &mut E,
        index: usize,
        force_idr: bool,
    ) -> Result<(), CodecError> {
        for request in [OutputRequest::Sps, OutputRequest::Pps] {
            let code = {
                let (local, reference) = self.local.engine_pair(self.ldec, self.ref1)?;
                let picture = Picture {
                    frame_no: self.frame_number,
                    force_idr,
                    input: self.inputs.owned(index, Owner::Engine)?,
                    local,
                    reference,
                };
                let stream = match request {
                    OutputRequest::Sps => &mut self.buffers.sps,
                    _ => &mut self.buffers.pps,
                };
                let targets = EncodeTargets {
                    stream,
                    aud: None,
                    filler: None,
                };
                engine.encode_picture(picture, request, targets)
            };
            let status = code.classify("encode_picture")?;
            let stat = engine.last_slice_stat();
            match (request, status) {
                (OutputRequest::Sps, EncodeStatus::SpsOutput) => self.sps_len = stat.sps_bytes,
                (OutputRequest::Pps, EncodeStatus::PpsOutput) => self.pps_len = stat.pps_bytes,
                _ => {
                    return Err(CodecError::UnexpectedStatus {
                        op: "encode_picture",
                        code,
                    })
                }
            }
        }
        Ok(())
    }

    fn encode_h264(
        &mut self,
        engine: &mut E,
        index: usize,
        force_idr: bool,
    ) -> Result<Flow, CodecError> {
        if !self.parameter_sets_sent {
            self.encode_parameter_sets(engine, index, force_idr)?;
        }
        self.rate.arm(self.clock.now());

        let mut flow = Flow::Continue;
        let mut first_slice = true;
        loop {
            let code = {
                let (local, reference) = self.local.engine_pair(self.ldec, self.ref1)?;
                let picture = Picture {
                    frame_no: self.frame_number,
                    force_idr,
                    input: self.inputs.owned(index, Owner::Engine)?,
                    local,
                    reference,
                };
                let targets = EncodeTargets {
                    stream: &mut self.buffers.stream,
                    aud: Some(&mut self.buffers.aud),
                    filler: Some(&mut self.buffers.filler),
                };
                engine.encode_picture(picture, OutputRequest::Slice, targets)
            };
            let status = code.classify("encode_picture")?;
            match status {
                EncodeStatus::FrameSkipped => {
                    self.frame_num_delta += 1;
                    self.frame_skip_count += 1;
                    tracing::debug!("Frame {} skipped by the encoder", self.frame_number);
                }
                EncodeStatus::SliceRemain | EncodeStatus::Success => {
                    let stat = engine.last_slice_stat();
                    if first_slice {
                        flow = flow.merge(self.emit_prologue(engine, index, &stat)?);
                        self.frame_num_delta += 1;
                        first_slice = false;
                    }
                    let data =
                        Bytes::copy_from_slice(self.buffers.stream.prefix(stat.unit_bytes())?);
                    flow = flow.merge(self.deliver(UnitKind::slice(stat.pic_type), data));
                    if stat.pic_type.is_intra() {
                        self.rate.on_idr_emitted();
                    }
                    self.frame_num_delta = 0;
                }
                _ => {
                    return Err(CodecError::UnexpectedStatus {
                        op: "encode_picture",
                        code,
                    })
                }
            }
            if status == EncodeStatus::Success {
                self.swap_references();
            }
            if matches!(status, EncodeStatus::Success | EncodeStatus::FrameSkipped) {
                self.advance_frame(engine)?;
                return Ok(flow);
            }
        }
    }

    fn emit_prologue(
        &mut self,
        engine: &mut E,
        index: usize,
        stat: &SliceStat,
    ) -> Result<Flow, CodecError> {
        let idr = stat.pic_type == PictureType::Idr;
        if self.parameter_sets_sent && idr {
            self.encode_parameter_sets(engine, index, true)?;
        }
        let parameter_sets = !self.parameter_sets_sent || idr;

        let mut flow = Flow::Continue;
        for step in self.assembler.prologue(parameter_sets, stat.filler_bytes) {
            let (kind, bytes) = match step {
                PrologueStep::Aud => (UnitKind::Aud, self.buffers.aud.prefix(stat.aud_bytes)?),
                PrologueStep::Sps => (UnitKind::Sps, self.buffers.sps.prefix(self.sps_len)?),
                PrologueStep::Pps => (UnitKind::Pps, self.buffers.pps.prefix(self.pps_len)?),
                PrologueStep::Sei(message) => {
                    let len = engine
                        .put_sei(message, &mut self.buffers.sei)
                        .length("put_sei")?;
                    (UnitKind::Sei, self.buffers.sei.prefix(len)?)
                }
                PrologueStep::Filler => (
                    UnitKind::Filler,
                    self.buffers.filler.prefix(stat.filler_bytes)?,
                ),
            };
            let data = Bytes::copy_from_slice(bytes);
            flow = flow.merge(self.deliver(kind, data));
        }
        self.parameter_sets_sent = true;
        Ok(flow)
    }

    fn encode_mpeg4(
        &mut self,
        engine: &mut E,
        index: usize,
        force_idr: bool,
    ) -> Result<Flow, CodecError> {
        self.rate.arm(self.clock.now());
        let code = {
            let (local, reference) = self.local.engine_pair(self.ldec, self.ref1)?;
            let picture = Picture {
                frame_no: self.frame_number,
                force_idr,
                input: self.inputs.owned(index, Owner::Engine)?,
                local,
                reference,
            };
            let targets = EncodeTargets {
                stream: &mut self.buffers.stream,
                aud: None,
                filler: None,
            };
            engine.encode_picture(picture, OutputRequest::Frame, targets)
        };
        let status = code.classify("encode_picture")?;
        let mut flow = Flow::Continue;
        match status {
            EncodeStatus::FrameSkipped => {
                self.frame_num_delta += 1;
                self.frame_skip_count += 1;
                tracing::debug!("Frame {} skipped by the encoder", self.frame_number);
            }
            EncodeStatus::Success | EncodeStatus::BVop | EncodeStatus::EmptyVop => {
                let stat = engine.last_slice_stat();
                self.frame_num_delta += 1;
                let data = Bytes::copy_from_slice(self.buffers.stream.prefix(stat.unit_bytes())?);
                flow = self.deliver(UnitKind::slice(stat.pic_type), data);
                if stat.pic_type.is_intra() {
                    self.rate.on_idr_emitted();
                }
                self.frame_num_delta = 0;
            }
            _ => {
                return Err(CodecError::UnexpectedStatus {
                    op: "encode_picture",
                    code,
                })
            }
        }
        if status == EncodeStatus::Success {
            self.swap_references();
        }
        self.advance_frame(engine)?;
        Ok(flow)
    }

    fn swap_references(&mut self) {
        std::mem::swap(&mut self.ldec, &mut self.ref1);
    }

    fn advance_frame(&mut self, engine: &mut E) -> Result<(), CodecError> {
        self.frame_number += u64::from(self.config.frame_no_increment);
        self.frame_counter += 1;
        if self.rate.enabled() {
            self.rate.on_frame_advance();
            let now = self.clock.now();
            if self.rate.should_reset(now) {
                engine.reset_rate_control().check("reset_rate_control")?;
                self.rate.on_reset(now);
                tracing::debug!("Rate control reset after frame {}", self.frame_counter);
            }
        }
        tracing::debug!(
            "Frame {} done (ldec={}, ref1={})",
            self.frame_counter,
            self.ldec,
            self.ref1
        );
        Ok(())
    }

    fn deliver(&mut self, kind: UnitKind, data: Bytes) -> Flow {
        if data.is_empty() {
            return Flow::Continue;
        }
        tracing::trace!("Emit {:?} ({} bytes)", kind, data.len());
        let unit = BitstreamUnit::new(kind, data, self.frame_num_delta);
        match self.output.as_mut() {
            Some(output) => output(&unit),
            None => Flow::Continue,
        }
    }
}

impl<E: EncoderEngine> Drop for EncodeSession<E> {
    fn drop(&mut self) {
        tracing::info!(
            "Encode session closed ({} frames, {} skipped)",
            self.frame_counter,
            self.frame_skip_count
        );
    }
}
