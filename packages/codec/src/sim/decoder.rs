//! Simulated VPU decoder.

use std::collections::VecDeque;

use super::wire::{self, mpeg4, nal, SliceHeader};
use crate::status::decode;
use crate::{
    DecodeInit, DecoderEngine, Format, FramePool, FrameStatus, Owner, PlaneGeometry,
};

#[derive(Debug, Clone, Copy)]
struct Pending {
    slot: usize,
    decoded_mb: u32,
    slices: u32,
}

/// Software decoder for the sim bitstream.
#[derive(Debug, Default)]
pub struct SimDecoder {
    init: Option<DecodeInit>,
    width: u32,
    height: u32,
    reorder_delay: usize,
    current: Option<Pending>,
    reference: Option<usize>,
    queue: VecDeque<usize>,
    status: FrameStatus,
    pictures: u64,
}

impl SimDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pictures fully decoded so far.
    #[must_use]
    pub fn pictures(&self) -> u64 {
        self.pictures
    }

    fn macroblocks(&self) -> u32 {
        PlaneGeometry::new(self.width, self.height).macroblocks()
    }

    fn fail(&mut self, code: i64) -> i64 {
        self.status.error = code;
        code
    }

    fn free_slot(&self, frames: &FramePool) -> Option<usize> {
        frames.iter().map(|slot| slot.index()).find(|index| {
            !self.queue.contains(index)
                && self.reference != Some(*index)
                && self.current.map(|p| p.slot) != Some(*index)
                && frames
                    .slot(*index)
                    .map(|slot| slot.owner() == Owner::Engine)
                    .unwrap_or(false)
        })
    }

    fn set_size(&mut self, width: u32, height: u32) -> Result<(), i64> {
        let Some(init) = self.init.as_ref() else {
            return Err(decode::PARAM_ERROR);
        };
        if width == 0 || height == 0 || width > init.max_width || height > init.max_height {
            return Err(decode::PIC_TOO_LARGE);
        }
        self.width = width;
        self.height = height;
        self.status.sps_detected = true;
        Ok(())
    }

    fn complete(&mut self, pending: Pending) {
        self.queue.push_back(pending.slot);
        self.reference = Some(pending.slot);
        self.current = None;
        self.pictures += 1;
    }

    /// Write `count` macroblocks of a picture, starting a new one at `first == 0`.
    fn paint(
        &mut self,
        frames: &mut FramePool,
        first: u32,
        count: u32,
        luma: u8,
        chroma: u8,
    ) -> i64 {
        let total = self.macroblocks();
        if first + count > total {
            return self.fail(decode::MB_OVERRUN);
        }
        let mut pending = if first == 0 {
            match self.free_slot(frames) {
                Some(slot) => Pending {
                    slot,
                    decoded_mb: 0,
                    slices: 0,
                },
                None => return self.fail(decode::EXCESS_FRAME),
            }
        } else {
            match self.current {
                Some(pending) if pending.decoded_mb == first => pending,
                _ => return self.fail(decode::PIC_ERROR),
            }
        };
        match frames.owned_mut(pending.slot, Owner::Engine) {
            Ok(slot) => {
                if first == 0 {
                    slot.fill_solid(luma, chroma);
                }
            }
            Err(_) => return self.fail(decode::BUFFER_OVERRUN),
        }
        pending.decoded_mb += count;
        pending.slices += 1;
        self.status.read_slices = pending.slices;
        self.status.last_macroblock_pos = pending.decoded_mb;
        if pending.decoded_mb >= total {
            self.complete(pending);
        } else {
            self.current = Some(pending);
        }
        decode::OK
    }

    fn decode_nal(&mut self, unit: &[u8], frames: &mut FramePool) -> i64 {
        let Some((&header, payload)) = unit.split_first() else {
            return self.fail(decode::ILLEGAL_DATA);
        };
        self.status.read_bits = unit.len() as u64 * 8;
        match header & 0x1F {
            nal::SPS => match wire::parse_sps(payload) {
                Some((width, height)) => match self.set_size(width, height) {
                    Ok(()) => decode::OK,
                    Err(code) => self.fail(code),
                },
                None => self.fail(decode::ILLEGAL_DATA),
            },
            nal::PPS | nal::AUD | nal::SEI | nal::FILLER | nal::END_OF_STREAM => decode::OK,
            nal::IDR | nal::SLICE => match SliceHeader::parse(payload) {
                Some(slice) => self.paint(
                    frames,
                    u32::from(slice.first_mb),
                    u32::from(slice.mb_count),
                    slice.luma,
                    slice.chroma,
                ),
                None => self.fail(decode::ILLEGAL_DATA),
            },
            _ => self.fail(decode::ILLEGAL_CODE),
        }
    }

    fn decode_vop_stream(&mut self, data: &[u8], frames: &mut FramePool) -> i64 {
        let mut pos = 0;
        loop {
            let rest = &data[pos..];
            if rest.len() < 4 || rest[..3] != [0, 0, 1] {
                self.status.read_bits = pos as u64 * 8;
                return self.fail(decode::ILLEGAL_DATA);
            }
            let body = &rest[4..];
            match rest[3] {
                mpeg4::VOS if body.is_empty() => {
                    self.status.read_bits = pos as u64 * 8;
                    return self.fail(decode::PIC_FEWER_MB);
                }
                mpeg4::VOS => pos += 5,
                mpeg4::VOL => {
                    let Some(dims) = body.get(..wire::VOL_BODY) else {
                        self.status.read_bits = pos as u64 * 8;
                        return self.fail(decode::PIC_FEWER_MB);
                    };
                    let dims = wire::from_nibbles(dims);
                    let width = u32::from(u16::from_be_bytes([dims[0], dims[1]]));
                    let height = u32::from(u16::from_be_bytes([dims[2], dims[3]]));
                    if let Err(code) = self.set_size(width, height) {
                        return self.fail(code);
                    }
                    pos += 4 + wire::VOL_BODY;
                }
                mpeg4::VOSE => {
                    self.status.read_bits = (pos as u64 + 4) * 8;
                    return decode::OK;
                }
                mpeg4::VOP => {
                    let Some(vop) = body.get(..wire::VOP_BODY) else {
                        self.status.read_bits = pos as u64 * 8;
                        return self.fail(decode::PIC_FEWER_MB);
                    };
                    let fields = wire::from_nibbles(&vop[1..]);
                    self.status.read_bits = (pos + 4 + wire::VOP_BODY) as u64 * 8;
                    let total = self.macroblocks();
                    return self.paint(frames, 0, total, fields[4], fields[5]);
                }
                _ => {
                    self.status.read_bits = pos as u64 * 8;
                    return self.fail(decode::ILLEGAL_CODE);
                }
            }
        }
    }
}

impl DecoderEngine for SimDecoder {
    fn init_sequence(&mut self, init: &DecodeInit) -> i64 {
        if init.ref_frames < 2 || init.max_width == 0 || init.max_height == 0 {
            return decode::PARAM_ERROR;
        }
        tracing::debug!(
            "sim decoder init {:?} up to {}x{} with {} frames",
            init.format,
            init.max_width,
            init.max_height,
            init.ref_frames
        );
        // One frame of display latency when the pool has room for it.
        self.reorder_delay = usize::from(init.ref_frames >= 4);
        self.width = init.max_width;
        self.height = init.max_height;
        self.init = Some(init.clone());
        self.current = None;
        self.reference = None;
        self.queue.clear();
        decode::OK
    }

    fn search_vop_header(&self, data: &[u8]) -> i64 {
        data.windows(4)
            .position(|w| w == wire::mpeg4_start(mpeg4::VOP))
            .map_or(decode::NO_VOP_HEADER, |offset| offset as i64)
    }

    fn decode_picture(&mut self, unit: &[u8], frames: &mut FramePool) -> i64 {
        self.status = FrameStatus::default();
        let Some(format) = self.init.as_ref().map(|init| init.format) else {
            return self.fail(decode::PARAM_ERROR);
        };
        match format {
            Format::H264 => self.decode_nal(unit, frames),
            Format::Mpeg4 => self.decode_vop_stream(unit, frames),
        }
    }

    fn last_frame_status(&self, status: &mut FrameStatus) -> i64 {
        *status = self.status;
        decode::OK
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn decoded_frame(&mut self, flush: bool) -> Option<usize> {
        if self.queue.len() > self.reorder_delay || (flush && !self.queue.is_empty()) {
            self.queue.pop_front()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(format: Format, ref_frames: usize) -> DecodeInit {
        DecodeInit {
            format,
            max_width: 64,
            max_height: 32,
            ref_frames,
        }
    }

    fn slice(first_mb: u16, mb_count: u16, luma: u8) -> Vec<u8> {
        let header = SliceHeader {
            frame_no: 0,
            first_mb,
            mb_count,
            luma,
            chroma: 128,
        };
        let mut unit = vec![0x65];
        unit.extend(header.to_bytes());
        unit
    }

    #[test]
    fn test_slices_accumulate_into_one_picture() {
        let mut engine = SimDecoder::new();
        let mut frames = FramePool::new(4, PlaneGeometry::new(64, 32), Owner::Engine).unwrap();
        assert_eq!(engine.init_sequence(&init(Format::H264, 4)), decode::OK);

        assert_eq!(engine.decode_picture(&slice(0, 4, 50), &mut frames), decode::OK);
        let mut status = FrameStatus::default();
        engine.last_frame_status(&mut status);
        assert_eq!((status.read_slices, status.last_macroblock_pos), (1, 4));
        assert_eq!(engine.decoded_frame(true), None);

        assert_eq!(engine.decode_picture(&slice(4, 4, 50), &mut frames), decode::OK);
        engine.last_frame_status(&mut status);
        assert_eq!((status.read_slices, status.last_macroblock_pos), (2, 8));

        // Held back by the reorder delay until flushed.
        assert_eq!(engine.decoded_frame(false), None);
        let index = engine.decoded_frame(true).unwrap();
        assert_eq!(frames.slot(index).unwrap().luma()[0], 50);
    }

    #[test]
    fn test_mb_overrun() {
        let mut engine = SimDecoder::new();
        let mut frames = FramePool::new(4, PlaneGeometry::new(64, 32), Owner::Engine).unwrap();
        engine.init_sequence(&init(Format::H264, 4));
        assert_eq!(
            engine.decode_picture(&slice(6, 4, 50), &mut frames),
            decode::MB_OVERRUN
        );
    }

    #[test]
    fn test_mpeg4_headers_and_vop() {
        let mut engine = SimDecoder::new();
        let mut frames = FramePool::new(2, PlaneGeometry::new(64, 32), Owner::Engine).unwrap();
        engine.init_sequence(&init(Format::Mpeg4, 2));

        let mut data = wire::mpeg4_headers(32, 16);
        let vop_at = data.len();
        data.extend(wire::mpeg4_vop(mpeg4::VOP_I, 0, 90, 120));
        data.extend(wire::mpeg4_vop(mpeg4::VOP_P, 1, 91, 120));

        assert_eq!(engine.search_vop_header(&data), vop_at as i64);
        assert_eq!(engine.decode_picture(&data, &mut frames), decode::OK);
        let mut status = FrameStatus::default();
        engine.last_frame_status(&mut status);
        assert!(status.sps_detected);
        assert_eq!(engine.frame_size(), (32, 16));
        assert_eq!(status.read_bits as usize, (vop_at + 4 + wire::VOP_BODY) * 8);

        let index = engine.decoded_frame(false).unwrap();
        assert_eq!(frames.slot(index).unwrap().luma()[0], 90);
    }

    #[test]
    fn test_pool_exhaustion_reports_excess_frame() {
        let mut engine = SimDecoder::new();
        let mut frames = FramePool::new(2, PlaneGeometry::new(64, 32), Owner::Engine).unwrap();
        engine.init_sequence(&init(Format::H264, 2));
        assert_eq!(engine.decode_picture(&slice(0, 8, 1), &mut frames), decode::OK);
        assert_eq!(engine.decode_picture(&slice(0, 8, 2), &mut frames), decode::OK);
        // Neither picture was taken out of the queue.
        assert_eq!(
            engine.decode_picture(&slice(0, 8, 3), &mut frames),
            decode::EXCESS_FRAME
        );
    }
}
