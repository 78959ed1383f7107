//! Decode input slicing.
//!
//! A decode session sees the caller's bytes through an [`InputCursor`] and
//! asks an [`InputSlicer`] for the next unit to hand to the engine. H.264
//! streams are split at Annex B start codes; MPEG-4 streams are handed over
//! whole and the engine reports how much it consumed.

use std::borrow::Cow;

use shcodecs_vpu::{CodecError, Format};

/// Read position over the bytes of one `decode` window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputCursor {
    position: usize,
    len: usize,
    size: usize,
}

impl InputCursor {
    /// A cursor at the start of `size` buffered bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            position: 0,
            len: size,
            size,
        }
    }

    /// Start over on a new window of `size` bytes.
    pub fn reset(&mut self, size: usize) {
        *self = Self::new(size);
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Length of the current unit (or of the pending data, for MPEG-4).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes between the position and the end of the window.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.size - self.position
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    /// Move forward by `n` bytes.
    ///
    /// Fails without moving if that would pass the end of the window.
    pub fn advance(&mut self, n: usize) -> Result<(), CodecError> {
        match self.position.checked_add(n) {
            Some(next) if next <= self.size => {
                self.position = next;
                Ok(())
            }
            _ => Err(CodecError::CursorOverrun {
                position: self.position,
                advance: n,
                size: self.size,
            }),
        }
    }
}

/// One unit ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicedUnit<'a> {
    /// Bytes to submit: the unescaped NAL (no start code) or the raw window.
    pub payload: Cow<'a, [u8]>,
    /// Raw bytes the unit spans from the cursor position.
    pub consumed: usize,
}

/// Result of asking the slicer for the next unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slice<'a> {
    Unit(SlicedUnit<'a>),
    /// Not enough lookahead; call again with more bytes.
    NeedData,
    /// Fewer bytes than any unit can have.
    Insufficient,
    /// No start code in the remaining bytes.
    NoUnit,
}

/// Splits buffered bytes into decodable units.
pub trait InputSlicer: Send {
    /// Extract the next unit at the cursor.
    ///
    /// `data` is the whole window the cursor indexes into.
    fn next_unit<'a>(
        &mut self,
        data: &'a [u8],
        cursor: &mut InputCursor,
        finalizing: bool,
    ) -> Result<Slice<'a>, CodecError>;
}

/// Minimum bytes to hold back before slicing a unit out of a stream.
#[must_use]
pub fn lookahead_margin(max_width: u32, max_height: u32) -> usize {
    max_width as usize * max_height as usize / 4
}

/// Offset of the next start code, including the leading zero of a
/// four-byte code.
#[must_use]
pub fn find_start_code(data: &[u8]) -> Option<usize> {
    let at = data.windows(3).position(|w| w == [0, 0, 1])?;
    if at > 0 && data[at - 1] == 0 {
        Some(at - 1)
    } else {
        Some(at)
    }
}

/// Remove emulation prevention bytes (`00 00 03` -> `00 00`).
#[must_use]
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte == 3 {
            zeros = 0;
            continue;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Start-code scanner for H.264 byte streams.
#[derive(Debug, Clone)]
pub struct NalSlicer {
    margin: usize,
}

impl NalSlicer {
    #[must_use]
    pub fn new(margin: usize) -> Self {
        Self { margin }
    }
}

impl InputSlicer for NalSlicer {
    fn next_unit<'a>(
        &mut self,
        data: &'a [u8],
        cursor: &mut InputCursor,
        finalizing: bool,
    ) -> Result<Slice<'a>, CodecError> {
        if !finalizing && cursor.remaining() < self.margin {
            return Ok(Slice::NeedData);
        }
        let window = &data[cursor.position()..cursor.size()];
        let Some(gap) = find_start_code(window) else {
            return Ok(Slice::NoUnit);
        };
        cursor.advance(gap)?;

        let unit = &window[gap..];
        let code_len = if unit.starts_with(&[0, 0, 0, 1]) { 4 } else { 3 };
        let body = &unit[code_len..];
        if body.is_empty() {
            return Ok(Slice::NoUnit);
        }
        let end = find_start_code(body).unwrap_or(body.len());
        let mut raw = &body[..end];
        while let [rest @ .., 0] = raw {
            raw = rest;
        }
        let consumed = code_len + end;
        cursor.set_len(consumed);
        Ok(Slice::Unit(SlicedUnit {
            payload: Cow::Owned(unescape(raw)),
            consumed,
        }))
    }
}

/// Whole-buffer pass-through for MPEG-4 streams.
#[derive(Debug, Clone)]
pub struct PassThroughSlicer {
    margin: usize,
    frame_by_frame: bool,
}

impl PassThroughSlicer {
    #[must_use]
    pub fn new(margin: usize, frame_by_frame: bool) -> Self {
        Self {
            margin,
            frame_by_frame,
        }
    }
}

impl InputSlicer for PassThroughSlicer {
    fn next_unit<'a>(
        &mut self,
        data: &'a [u8],
        cursor: &mut InputCursor,
        finalizing: bool,
    ) -> Result<Slice<'a>, CodecError> {
        let start = cursor.position();
        if self.frame_by_frame {
            let len = cursor.len().min(cursor.remaining());
            if len == 0 {
                return Ok(Slice::NeedData);
            }
            return Ok(Slice::Unit(SlicedUnit {
                payload: Cow::Borrowed(&data[start..start + len]),
                consumed: len,
            }));
        }

        let len = cursor.remaining();
        if len < 3 {
            return Ok(Slice::Insufficient);
        }
        if !finalizing && len < self.margin {
            return Ok(Slice::NeedData);
        }
        cursor.set_len(len);
        Ok(Slice::Unit(SlicedUnit {
            payload: Cow::Borrowed(&data[start..start + len]),
            consumed: len,
        }))
    }
}

/// The slicer matching a stream format.
#[must_use]
pub fn slicer_for(format: Format, margin: usize, frame_by_frame: bool) -> Box<dyn InputSlicer> {
    match format {
        Format::H264 => Box::new(NalSlicer::new(margin)),
        Format::Mpeg4 => Box::new(PassThroughSlicer::new(margin, frame_by_frame)),
    }
}
