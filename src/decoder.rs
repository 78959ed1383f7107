//! Decode session: feeds a byte stream through the VPU decoder.
//!
//! `decode` walks the caller's bytes in windows of at most
//! [`max_nal_size`] bytes. For each window the session slices units out,
//! submits them until the engine reports a complete picture, then drains
//! every picture the engine has ready for display into the decoded-frame
//! callback. Bytes are only consumed once the engine has accepted them, so
//! a caller that gets a short count simply pushes the rest again together
//! with new data.

use std::sync::Arc;

use shcodecs_vpu::status::describe_decode;
use shcodecs_vpu::{
    plane_sizes, CodecError, DecodeInit, DecodeStatusExt, DecoderConfig, DecoderEngine, Format,
    FramePool, FrameStatus, Owner, PlaneGeometry, Vpu,
};

use crate::control::Flow;
use crate::slicer::{lookahead_margin, slicer_for, InputCursor, InputSlicer, Slice};

/// Largest frame size (luma bytes) that still gets the full reference pool.
const LARGE_FRAME: usize = 720 * 576;

/// Reference frames allocated for frames of the given size.
#[must_use]
pub fn reference_frames(geometry: PlaneGeometry) -> usize {
    if geometry.luma_bytes() > LARGE_FRAME {
        2
    } else {
        4
    }
}

/// Upper bound on the bytes handed to one decode cycle.
#[must_use]
pub fn max_nal_size(width: u32, height: u32) -> usize {
    let pixels = width as usize * height as usize;
    let size = pixels * 3 / 2 / 2;
    if pixels > LARGE_FRAME {
        size / 2
    } else {
        size
    }
}

pub type DecodedCallback = Box<dyn FnMut(&DecodedFrame<'_>) -> Flow + Send>;

/// A decoded picture lent to the client for the duration of the callback.
#[derive(Debug)]
pub struct DecodedFrame<'a> {
    /// Reference slot the picture lives in.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub luma: &'a [u8],
    pub chroma: &'a [u8],
}

impl DecodedFrame<'_> {
    #[must_use]
    pub fn luma_size(&self) -> usize {
        self.luma.len()
    }

    #[must_use]
    pub fn chroma_size(&self) -> usize {
        self.chroma.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    /// The engine finished a picture.
    Complete,
    /// A macroblock overrun; the offending unit was skipped.
    Recovered,
    /// No further unit can be taken from the window.
    NeedData,
    /// The engine rejected a unit.
    Failed(i64),
}

/// One decode stream bound to a shared VPU.
pub struct DecodeSession<E: DecoderEngine> {
    vpu: Arc<Vpu<E>>,
    config: DecoderConfig,
    width: u32,
    height: u32,
    macroblock_budget: u32,
    frames: FramePool,
    slicer: Box<dyn InputSlicer>,
    cursor: InputCursor,
    max_nal_size: usize,
    needs_finalization: bool,
    /// The current window ends the stream; margins no longer apply.
    final_window: bool,
    frame_count: u64,
    last_flow: Flow,
    last_error: Option<i64>,
    decoded: Option<DecodedCallback>,
}

impl<E: DecoderEngine> DecodeSession<E> {
    /// Validate `config`, allocate the reference pool and start the engine.
    pub fn new(vpu: Arc<Vpu<E>>, config: DecoderConfig) -> Result<Self, CodecError> {
        config.validate()?;
        let geometry = PlaneGeometry::new(config.max_width, config.max_height);
        let ref_frames = reference_frames(geometry);
        let frames = FramePool::new(ref_frames, geometry, Owner::Engine)?;
        let margin = lookahead_margin(config.max_width, config.max_height);
        let slicer = slicer_for(config.format, margin, config.frame_by_frame);

        vpu.lock()?
            .init_sequence(&DecodeInit {
                format: config.format,
                max_width: config.max_width,
                max_height: config.max_height,
                ref_frames,
            })
            .check("init_sequence")?;

        let max_nal_size = max_nal_size(config.max_width, config.max_height);
        tracing::info!(
            "Decode session {:?} up to {}x{} ({} reference frames, {} byte window)",
            config.format,
            config.max_width,
            config.max_height,
            ref_frames,
            max_nal_size
        );

        Ok(Self {
            vpu,
            width: config.max_width,
            height: config.max_height,
            macroblock_budget: geometry.macroblocks(),
            config,
            frames,
            slicer,
            cursor: InputCursor::default(),
            max_nal_size,
            needs_finalization: false,
            final_window: false,
            frame_count: 0,
            last_flow: Flow::Continue,
            last_error: None,
            decoded: None,
        })
    }

    /// Called once per picture leaving the decoded picture buffer.
    pub fn set_decoded_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&DecodedFrame<'_>) -> Flow + Send + 'static,
    {
        self.decoded = Some(Box::new(callback));
    }

    /// Every `decode` call carries exactly one whole frame (MPEG-4 only).
    pub fn set_frame_by_frame(&mut self, enabled: bool) -> Result<(), CodecError> {
        if enabled && self.config.format != Format::Mpeg4 {
            return Err(CodecError::WrongFormat(self.config.format));
        }
        self.config.frame_by_frame = enabled;
        let margin = lookahead_margin(self.config.max_width, self.config.max_height);
        self.slicer = slicer_for(self.config.format, margin, enabled);
        Ok(())
    }

    /// Accepted for compatibility; planes are always delivered as slices.
    pub fn set_use_physical(&mut self, enabled: bool) {
        self.config.use_physical = enabled;
    }

    /// Current picture width, from the last sequence header.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Current picture height, from the last sequence header.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn format(&self) -> Format {
        self.config.format
    }

    /// Pictures delivered to the decoded-frame callback so far.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    #[must_use]
    pub fn max_nal_size(&self) -> usize {
        self.max_nal_size
    }

    #[must_use]
    pub fn macroblock_budget(&self) -> u32 {
        self.macroblock_budget
    }

    #[must_use]
    pub fn reference_frames(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_finalizing(&self) -> bool {
        self.needs_finalization
    }

    /// Last negative engine code reported for a unit.
    #[must_use]
    pub fn error_return_code(&self) -> Option<i64> {
        self.last_error
    }

    /// Decode as much of `data` as possible.
    ///
    /// Returns the number of bytes consumed. Unconsumed bytes must be
    /// supplied again, followed by more data, on the next call.
    pub fn decode(&mut self, data: &[u8]) -> Result<usize, CodecError> {
        self.last_flow = Flow::Continue;
        let mut consumed = 0;
        while consumed < data.len() {
            let len = self.max_nal_size.min(data.len() - consumed);
            let window = &data[consumed..consumed + len];
            self.final_window = self.needs_finalization && consumed + len == data.len();
            self.cursor.reset(window.len());
            let used = self.run_cycle(window)?;
            if used == 0 {
                break;
            }
            consumed += used;
            if self.last_flow.is_pause() {
                break;
            }
        }
        Ok(consumed)
    }

    /// Decode the final bytes of the stream and flush every buffered picture.
    pub fn finalize(&mut self, data: &[u8]) -> Result<usize, CodecError> {
        self.needs_finalization = true;
        let mut consumed = self.decode(data)?;
        if !self.last_flow.is_pause() {
            let rest = &data[consumed..];
            self.final_window = true;
            self.cursor.reset(rest.len());
            consumed += self.run_cycle(rest)?;
        }
        tracing::info!(
            "Decode stream finalized after {} frames",
            self.frame_count
        );
        Ok(consumed)
    }

    fn run_cycle(&mut self, window: &[u8]) -> Result<usize, CodecError> {
        let vpu = Arc::clone(&self.vpu);
        loop {
            let outcome = self.decode_frame(&vpu, window)?;
            let decoded = matches!(outcome, FrameOutcome::Complete | FrameOutcome::Recovered);
            if !decoded && !self.final_window {
                return Ok(self.cursor.position());
            }
            let flow = self.drain(&vpu, !decoded)?;
            self.last_flow = flow;
            if let FrameOutcome::Failed(code) = outcome {
                return Err(CodecError::Engine {
                    op: "decode_picture",
                    code,
                    reason: describe_decode(code),
                });
            }
            if !decoded || flow.is_pause() {
                return Ok(self.cursor.position());
            }
        }
    }

    fn decode_frame(&mut self, vpu: &Vpu<E>, window: &[u8]) -> Result<FrameOutcome, CodecError> {
        loop {
            let unit = match self
                .slicer
                .next_unit(window, &mut self.cursor, self.final_window)?
            {
                Slice::Unit(unit) => unit,
                Slice::NeedData | Slice::Insufficient | Slice::NoUnit => {
                    return Ok(FrameOutcome::NeedData)
                }
            };

            let mut engine = vpu.lock()?;
            if self.config.format == Format::Mpeg4 {
                let found = engine.search_vop_header(&unit.payload);
                let trailing_code = self.final_window && unit.payload.starts_with(&[0, 0]);
                if found < 0 && !trailing_code {
                    tracing::debug!("No VOP header in {} bytes", unit.payload.len());
                    return Ok(FrameOutcome::NeedData);
                }
            }
            let code = engine.decode_picture(&unit.payload, &mut self.frames);
            let mut status = FrameStatus::default();
            engine
                .last_frame_status(&mut status)
                .check("last_frame_status")?;
            let error = status.error.min(code);
            if error >= 0 && status.sps_detected {
                let (width, height) = engine.frame_size();
                self.width = width;
                self.height = height;
                self.macroblock_budget = PlaneGeometry::new(width, height).macroblocks();
                tracing::debug!(
                    "Sequence header {}x{} ({} macroblocks)",
                    width,
                    height,
                    self.macroblock_budget
                );
            }
            drop(engine);

            let consumed = match self.config.format {
                Format::H264 => unit.consumed,
                Format::Mpeg4 => {
                    let bytes = ((status.read_bits + 7) / 8) as usize;
                    self.cursor.set_len(self.cursor.len().saturating_sub(bytes));
                    bytes
                }
            };

            if error < 0 {
                if error.is_mb_overrun() {
                    tracing::warn!("Macroblock overrun, skipping {} byte unit", consumed);
                    if let Err(err) = self.cursor.advance(consumed) {
                        tracing::warn!("{}", err);
                        return Ok(FrameOutcome::Complete);
                    }
                    return Ok(FrameOutcome::Recovered);
                }
                tracing::warn!(
                    "Decoder rejected unit at {}: {} ({})",
                    self.cursor.position(),
                    error,
                    describe_decode(error)
                );
                self.last_error = Some(error);
                return Ok(if self.final_window {
                    FrameOutcome::Failed(error)
                } else {
                    FrameOutcome::NeedData
                });
            }

            if let Err(err) = self.cursor.advance(consumed) {
                tracing::warn!("{}", err);
                return Ok(FrameOutcome::Complete);
            }
            if status.read_slices > 0 && status.last_macroblock_pos >= self.macroblock_budget {
                return Ok(FrameOutcome::Complete);
            }
        }
    }

    fn drain(&mut self, vpu: &Vpu<E>, flush: bool) -> Result<Flow, CodecError> {
        loop {
            let ready = vpu.lock()?.decoded_frame(flush);
            let Some(index) = ready else {
                return Ok(Flow::Continue);
            };
            if self.extract_frame(index)?.is_pause() {
                return Ok(Flow::Pause);
            }
        }
    }

    fn extract_frame(&mut self, index: usize) -> Result<Flow, CodecError> {
        self.frames.transfer(index, Owner::Client)?;
        let flow = match self.decoded.as_mut() {
            Some(decoded) => {
                let slot = self.frames.owned(index, Owner::Client)?;
                let (luma_size, chroma_size) = plane_sizes(self.width, self.height);
                let luma = slot.luma().get(..luma_size).unwrap_or(slot.luma());
                let chroma = slot.chroma().get(..chroma_size).unwrap_or(slot.chroma());
                decoded(&DecodedFrame {
                    index,
                    width: self.width,
                    height: self.height,
                    luma,
                    chroma,
                })
            }
            None => Flow::Continue,
        };
        self.frames.transfer(index, Owner::Engine)?;
        self.frame_count += 1;
        tracing::trace!("Frame {} out of slot {}", self.frame_count, index);
        Ok(flow)
    }
}

impl<E: DecoderEngine> Drop for DecodeSession<E> {
    fn drop(&mut self) {
        tracing::info!("Decode session closed ({} frames)", self.frame_count);
    }
}
