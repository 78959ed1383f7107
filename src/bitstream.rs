//! Bitstream units and their order inside an access unit.

use bytes::Bytes;
use shcodecs_vpu::{PictureType, SeiConfig, SeiMessage};

/// Kind of a compressed unit handed to the output callback.
///
/// The declaration order is the order units appear in within one access
/// unit, slices excepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitKind {
    Sei,
    Sps,
    Pps,
    Aud,
    ISlice,
    PSlice,
    BSlice,
    Filler,
    EndOfStream,
}

impl UnitKind {
    /// Slice kind for a picture type.
    #[must_use]
    pub fn slice(pic_type: PictureType) -> Self {
        match pic_type {
            PictureType::Idr | PictureType::I => Self::ISlice,
            PictureType::P => Self::PSlice,
            PictureType::B => Self::BSlice,
        }
    }

    #[must_use]
    pub fn is_slice(&self) -> bool {
        matches!(self, Self::ISlice | Self::PSlice | Self::BSlice)
    }
}

/// One compressed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitstreamUnit {
    pub kind: UnitKind,
    pub data: Bytes,
    /// Frame periods since the previously emitted picture, counting skipped
    /// input frames; zero once the picture's slice has been emitted.
    pub frame_delta: u32,
}

impl BitstreamUnit {
    #[must_use]
    pub fn new(kind: UnitKind, data: Bytes, frame_delta: u32) -> Self {
        Self {
            kind,
            data,
            frame_delta,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A unit to emit ahead of the first slice of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrologueStep {
    Aud,
    Sps,
    Pps,
    Sei(SeiMessage),
    Filler,
}

/// Ordering policy for the units preceding a picture's first slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitstreamAssembler {
    sei: SeiConfig,
    filler: bool,
}

impl BitstreamAssembler {
    #[must_use]
    pub fn new(sei: SeiConfig, filler: bool) -> Self {
        Self { sei, filler }
    }

    /// Units to emit before the first slice, in order.
    ///
    /// `parameter_sets` is set for the first picture of a stream and for
    /// every IDR picture after it.
    #[must_use]
    pub fn prologue(&self, parameter_sets: bool, filler_bytes: usize) -> Vec<PrologueStep> {
        let mut steps = vec![PrologueStep::Aud];
        if parameter_sets {
            steps.push(PrologueStep::Sps);
            steps.push(PrologueStep::Pps);
        }
        steps.extend(self.sei.iter().map(PrologueStep::Sei));
        if self.filler && filler_bytes > 0 {
            steps.push(PrologueStep::Filler);
        }
        steps
    }
}

/// Check the unit order of one H.264 access unit.
///
/// AUD first, then optional SPS+PPS, then SEI, then optional filler, then
/// one or more slices of a single kind. An end-of-stream unit may only
/// close the sequence.
#[must_use]
pub fn is_well_ordered(kinds: &[UnitKind]) -> bool {
    let mut rest = kinds;
    if rest.first() != Some(&UnitKind::Aud) {
        return false;
    }
    rest = &rest[1..];
    if rest.first() == Some(&UnitKind::Sps) {
        if rest.get(1) != Some(&UnitKind::Pps) {
            return false;
        }
        rest = &rest[2..];
    }
    while rest.first() == Some(&UnitKind::Sei) {
        rest = &rest[1..];
    }
    if rest.first() == Some(&UnitKind::Filler) {
        rest = &rest[1..];
    }
    let Some(first_slice) = rest.first().copied() else {
        return false;
    };
    first_slice.is_slice() && rest.iter().all(|kind| *kind == first_slice)
}
