//! Physical frame buffers shared between the client and the VPU.
//!
//! The VPU works on 16-pixel aligned YCbCr 4:2:0 planes: one luma plane of
//! `align16(w) * align16(h)` bytes and one packed chroma plane of half that.
//! A [`FramePool`] owns a fixed number of such slots for the lifetime of a
//! session; only ownership and content change, never the slot identity.

use crate::CodecError;

/// Width/height of one macroblock in pixels.
pub const MACROBLOCK: u32 = 16;

/// Round up to the macroblock grid.
#[must_use]
pub fn align16(value: u32) -> u32 {
    (value + MACROBLOCK - 1) & !(MACROBLOCK - 1)
}

/// Luma and chroma plane sizes in bytes for a frame of the given size.
#[must_use]
pub fn plane_sizes(width: u32, height: u32) -> (usize, usize) {
    let luma = align16(width) as usize * align16(height) as usize;
    (luma, luma / 2)
}

pub(crate) fn alloc_zeroed(len: usize) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| CodecError::OutOfMemory)?;
    data.resize(len, 0);
    Ok(data)
}

/// Visible and aligned dimensions of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    pub width: u32,
    pub height: u32,
}

impl PlaneGeometry {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub fn aligned_width(&self) -> u32 {
        align16(self.width)
    }

    #[must_use]
    pub fn aligned_height(&self) -> u32 {
        align16(self.height)
    }

    /// Size of the luma plane in bytes.
    #[must_use]
    pub fn luma_bytes(&self) -> usize {
        plane_sizes(self.width, self.height).0
    }

    /// Size of the packed chroma plane in bytes.
    #[must_use]
    pub fn chroma_bytes(&self) -> usize {
        plane_sizes(self.width, self.height).1
    }

    /// Number of macroblocks in one frame.
    #[must_use]
    pub fn macroblocks(&self) -> u32 {
        (self.aligned_width() / MACROBLOCK) * (self.aligned_height() / MACROBLOCK)
    }
}

/// Party currently allowed to touch a slot's planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Client,
    Engine,
}

/// One physical frame buffer.
#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    owner: Owner,
    geometry: PlaneGeometry,
    luma: Vec<u8>,
    chroma: Vec<u8>,
}

impl FrameSlot {
    fn new(index: usize, geometry: PlaneGeometry, owner: Owner) -> Result<Self, CodecError> {
        Ok(Self {
            index,
            owner,
            geometry,
            luma: alloc_zeroed(geometry.luma_bytes())?,
            chroma: alloc_zeroed(geometry.chroma_bytes())?,
        })
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn owner(&self) -> Owner {
        self.owner
    }

    #[must_use]
    pub fn geometry(&self) -> PlaneGeometry {
        self.geometry
    }

    #[must_use]
    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    #[must_use]
    pub fn chroma(&self) -> &[u8] {
        &self.chroma
    }

    pub fn luma_mut(&mut self) -> &mut [u8] {
        &mut self.luma
    }

    pub fn chroma_mut(&mut self) -> &mut [u8] {
        &mut self.chroma
    }

    /// Both planes mutably at once.
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut self.luma, &mut self.chroma)
    }

    /// Copy client planes into this slot. Sizes must match exactly.
    pub fn fill(&mut self, luma: &[u8], chroma: &[u8]) -> Result<(), CodecError> {
        if luma.len() != self.luma.len() {
            return Err(CodecError::PlaneSize {
                expected: self.luma.len(),
                actual: luma.len(),
            });
        }
        if chroma.len() != self.chroma.len() {
            return Err(CodecError::PlaneSize {
                expected: self.chroma.len(),
                actual: chroma.len(),
            });
        }
        self.luma.copy_from_slice(luma);
        self.chroma.copy_from_slice(chroma);
        Ok(())
    }

    /// Set every sample of both planes.
    pub fn fill_solid(&mut self, luma: u8, chroma: u8) {
        self.luma.fill(luma);
        self.chroma.fill(chroma);
    }
}

/// Fixed set of frame slots addressed by index.
#[derive(Debug)]
pub struct FramePool {
    slots: Vec<FrameSlot>,
}

impl FramePool {
    /// Allocate `count` slots, all initially owned by `owner`.
    ///
    /// Any allocation failure releases the slots created so far and
    /// returns [`CodecError::OutOfMemory`].
    pub fn new(count: usize, geometry: PlaneGeometry, owner: Owner) -> Result<Self, CodecError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| CodecError::OutOfMemory)?;
        for index in 0..count {
            slots.push(FrameSlot::new(index, geometry, owner)?);
        }
        Ok(Self { slots })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot> {
        self.slots.iter()
    }

    pub fn slot(&self, index: usize) -> Result<&FrameSlot, CodecError> {
        let len = self.slots.len();
        self.slots
            .get(index)
            .ok_or(CodecError::SlotOutOfRange { index, len })
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut FrameSlot, CodecError> {
        let len = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(CodecError::SlotOutOfRange { index, len })
    }

    /// Shared access for the party that currently owns the slot.
    pub fn owned(&self, index: usize, by: Owner) -> Result<&FrameSlot, CodecError> {
        let slot = self.slot(index)?;
        if slot.owner != by {
            return Err(CodecError::SlotOwnership {
                index,
                owner: slot.owner,
            });
        }
        Ok(slot)
    }

    /// Mutable access for the party that currently owns the slot.
    pub fn owned_mut(&mut self, index: usize, by: Owner) -> Result<&mut FrameSlot, CodecError> {
        let slot = self.slot_mut(index)?;
        if slot.owner != by {
            return Err(CodecError::SlotOwnership {
                index,
                owner: slot.owner,
            });
        }
        Ok(slot)
    }

    /// Hand a slot from its current owner to `to`.
    ///
    /// Handing a slot to the party that already owns it is an error: it
    /// means both sides believe they hold the buffer.
    pub fn transfer(&mut self, index: usize, to: Owner) -> Result<(), CodecError> {
        let slot = self.slot_mut(index)?;
        if slot.owner == to {
            return Err(CodecError::SlotOwnership {
                index,
                owner: slot.owner,
            });
        }
        tracing::trace!("Frame slot {} -> {:?}", index, to);
        slot.owner = to;
        Ok(())
    }

    /// One slot mutably and a different one shared, both engine-owned.
    pub fn engine_pair(
        &mut self,
        write: usize,
        read: usize,
    ) -> Result<(&mut FrameSlot, &FrameSlot), CodecError> {
        if write == read {
            return Err(CodecError::invalid_param(format!(
                "slot {write} cannot be both written and read"
            )));
        }
        self.owned(write, Owner::Engine)?;
        self.owned(read, Owner::Engine)?;
        if write < read {
            let (head, tail) = self.slots.split_at_mut(read);
            Ok((&mut head[write], &tail[0]))
        } else {
            let (head, tail) = self.slots.split_at_mut(write);
            Ok((&mut tail[0], &head[read]))
        }
    }
}

/// Fixed-capacity byte buffer the engine writes compressed units into.
#[derive(Debug)]
pub struct StreamBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl StreamBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, CodecError> {
        Ok(Self {
            data: alloc_zeroed(capacity)?,
            filled: 0,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written by the last producer.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Forget the previous content.
    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Replace the content with `bytes`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, CodecError> {
        self.clear();
        self.append(bytes)
    }

    /// Append `bytes` after the current content.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, CodecError> {
        let end = self.filled + bytes.len();
        if end > self.data.len() {
            return Err(CodecError::NotEnoughBuffer {
                needed: end,
                capacity: self.data.len(),
            });
        }
        self.data[self.filled..end].copy_from_slice(bytes);
        self.filled = end;
        Ok(bytes.len())
    }

    /// The first `len` bytes, as reported by engine statistics.
    pub fn prefix(&self, len: usize) -> Result<&[u8], CodecError> {
        self.data.get(..len).ok_or(CodecError::NotEnoughBuffer {
            needed: len,
            capacity: self.data.len(),
        })
    }
}
