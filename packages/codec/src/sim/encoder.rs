//! Simulated VPU encoder.

use std::collections::{HashMap, HashSet};

use super::wire::{self, nal, SliceHeader};
use crate::status::encode;
use crate::{
    EncodeInit, EncodeTargets, EncoderEngine, Format, OutputRequest, Picture, PictureType,
    PlaneGeometry, SeiMessage, SliceStat, StreamBackup, StreamBuffer,
};

const STATE_LEN: usize = 8 + 4 + 4 + 1 + 1 + 1 + 1;
const INIT_LEN: usize = 7 * 4 + 4;

/// Per-stream context the real middleware keeps in its work area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StreamState {
    pictures: u64,
    since_intra: u32,
    slice: u32,
    intra: bool,
    luma: u8,
    chroma: u8,
    headers_sent: bool,
}

impl StreamState {
    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATE_LEN);
        out.extend(self.pictures.to_be_bytes());
        out.extend(self.since_intra.to_be_bytes());
        out.extend(self.slice.to_be_bytes());
        out.push(u8::from(self.intra));
        out.push(self.luma);
        out.push(self.chroma);
        out.push(u8::from(self.headers_sent));
        out
    }

    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != STATE_LEN {
            return None;
        }
        let mut pictures = [0u8; 8];
        pictures.copy_from_slice(&data[..8]);
        let mut since_intra = [0u8; 4];
        since_intra.copy_from_slice(&data[8..12]);
        let mut slice = [0u8; 4];
        slice.copy_from_slice(&data[12..16]);
        Some(Self {
            pictures: u64::from_be_bytes(pictures),
            since_intra: u32::from_be_bytes(since_intra),
            slice: u32::from_be_bytes(slice),
            intra: data[16] != 0,
            luma: data[17],
            chroma: data[18],
            headers_sent: data[19] != 0,
        })
    }
}

fn init_to_bytes(init: &EncodeInit) -> Vec<u8> {
    let mut out = Vec::with_capacity(INIT_LEN);
    for value in [
        init.width,
        init.height,
        init.bitrate,
        init.frame_rate_x10,
        init.idr_interval,
        init.ref_frame_num,
        init.b_vop_num,
    ] {
        out.extend(value.to_be_bytes());
    }
    out.push(u8::from(init.format == Format::Mpeg4));
    out.push(u8::from(init.h263));
    out.push(u8::from(init.rate_control_skip));
    out.push(u8::from(init.filler_output));
    out
}

fn init_from_bytes(data: &[u8]) -> Option<EncodeInit> {
    if data.len() != INIT_LEN {
        return None;
    }
    let word = |i: usize| {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&data[i * 4..i * 4 + 4]);
        u32::from_be_bytes(bytes)
    };
    Some(EncodeInit {
        width: word(0),
        height: word(1),
        bitrate: word(2),
        frame_rate_x10: word(3),
        idr_interval: word(4),
        ref_frame_num: word(5),
        b_vop_num: word(6),
        format: if data[28] != 0 { Format::Mpeg4 } else { Format::H264 },
        h263: data[29] != 0,
        rate_control_skip: data[30] != 0,
        filler_output: data[31] != 0,
    })
}

/// Software encoder producing the sim bitstream.
#[derive(Debug, Default)]
pub struct SimEncoder {
    init: Option<EncodeInit>,
    state: StreamState,
    stat: SliceStat,
    slices_per_frame: u32,
    skip: HashSet<u64>,
    failures: HashMap<u64, i64>,
    filler_bytes: usize,
    rate_control_resets: u32,
    backups_restored: u32,
}

impl SimEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slices_per_frame: 1,
            ..Default::default()
        }
    }

    /// Split every H.264 picture into `slices` slices.
    #[must_use]
    pub fn slices_per_frame(mut self, slices: u32) -> Self {
        self.slices_per_frame = slices.max(1);
        self
    }

    /// Skip the given frame numbers (unless an IDR is forced).
    #[must_use]
    pub fn skip_frames(mut self, frames: impl IntoIterator<Item = u64>) -> Self {
        self.skip.extend(frames);
        self
    }

    /// Report a filler unit of `bytes` payload with every H.264 picture.
    #[must_use]
    pub fn filler_bytes(mut self, bytes: usize) -> Self {
        self.filler_bytes = bytes;
        self
    }

    /// Fail with `code` when asked to encode frame `frame_no`.
    #[must_use]
    pub fn fail_on_frame(mut self, frame_no: u64, code: i64) -> Self {
        self.failures.insert(frame_no, code);
        self
    }

    /// Number of rate-control resets requested so far.
    #[must_use]
    pub fn rate_control_resets(&self) -> u32 {
        self.rate_control_resets
    }

    /// Number of stream contexts loaded with `set_backup`.
    #[must_use]
    pub fn backups_restored(&self) -> u32 {
        self.backups_restored
    }

    fn geometry(init: &EncodeInit) -> PlaneGeometry {
        PlaneGeometry::new(init.width, init.height)
    }

    fn mean(plane: &[u8]) -> u8 {
        if plane.is_empty() {
            return 0;
        }
        let sum: u64 = plane.iter().map(|b| u64::from(*b)).sum();
        (sum / plane.len() as u64) as u8
    }

    fn picture_means(init: &EncodeInit, picture: &Picture<'_>) -> (u8, u8) {
        let luma = Self::mean(picture.input.luma());
        let chroma = Self::mean(picture.input.chroma());
        if init.h263 {
            (luma.clamp(1, 254), chroma.clamp(1, 254))
        } else {
            (luma, chroma)
        }
    }

    fn wants_intra(&self, init: &EncodeInit, force_idr: bool) -> bool {
        force_idr
            || self.state.pictures == 0
            || (init.idr_interval > 0 && self.state.since_intra >= init.idr_interval)
    }

    fn finish_picture(&mut self) {
        self.state.pictures += 1;
        self.state.since_intra = if self.state.intra {
            1
        } else {
            self.state.since_intra + 1
        };
        self.state.slice = 0;
    }

    fn skip_this(&self, picture: &Picture<'_>) -> bool {
        !picture.force_idr && self.state.pictures > 0 && self.skip.contains(&picture.frame_no)
    }

    fn encode_slice(
        &mut self,
        init: &EncodeInit,
        picture: Picture<'_>,
        targets: EncodeTargets<'_>,
    ) -> i64 {
        if self.state.slice == 0 {
            if self.skip_this(&picture) {
                self.stat = SliceStat::default();
                return encode::FRAME_SKIPPED;
            }
            self.state.intra = self.wants_intra(init, picture.force_idr);
            let (luma, chroma) = Self::picture_means(init, &picture);
            self.state.luma = luma;
            self.state.chroma = chroma;
        }

        let mut stat = SliceStat {
            pic_type: if self.state.intra {
                PictureType::Idr
            } else {
                PictureType::P
            },
            ..Default::default()
        };

        if self.state.slice == 0 {
            if let Some(aud) = targets.aud {
                let unit = wire::nal_unit(nal::AUD, &[0xF0]);
                match aud.write(&unit) {
                    Ok(len) => stat.aud_bytes = len,
                    Err(_) => return encode::OUTPUT_BUFFER_SHORT,
                }
            }
            if let Some(filler) = targets.filler {
                if init.filler_output && self.filler_bytes > 0 {
                    let unit = wire::nal_unit(nal::FILLER, &vec![0xFF; self.filler_bytes]);
                    match filler.write(&unit) {
                        Ok(len) => stat.filler_bytes = len,
                        Err(_) => return encode::OUTPUT_BUFFER_SHORT,
                    }
                }
            }
        }

        let total = Self::geometry(init).macroblocks();
        let slices = self.slices_per_frame.min(total).max(1);
        let per_slice = (total + slices - 1) / slices;
        let first = self.state.slice * per_slice;
        let count = per_slice.min(total - first);
        let header = SliceHeader {
            frame_no: picture.frame_no as u32,
            first_mb: first as u16,
            mb_count: count as u16,
            luma: self.state.luma,
            chroma: self.state.chroma,
        };
        let nal_type = if self.state.intra { nal::IDR } else { nal::SLICE };
        let unit = wire::nal_unit(nal_type, &header.to_bytes());
        match targets.stream.write(&unit) {
            Ok(len) => stat.encoded_bits = len as u64 * 8,
            Err(_) => return encode::OUTPUT_BUFFER_SHORT,
        }
        self.stat = stat;

        tracing::trace!(
            "sim slice frame={} mb={}+{} intra={}",
            picture.frame_no,
            first,
            count,
            self.state.intra
        );

        if first + count >= total {
            picture.local.fill_solid(self.state.luma, self.state.chroma);
            self.finish_picture();
            encode::SUCCESS
        } else {
            self.state.slice += 1;
            encode::SLICE_REMAIN
        }
    }

    fn encode_vop(
        &mut self,
        init: &EncodeInit,
        picture: Picture<'_>,
        targets: EncodeTargets<'_>,
    ) -> i64 {
        if self.skip_this(&picture) {
            self.stat = SliceStat::default();
            return encode::FRAME_SKIPPED;
        }
        self.state.intra = self.wants_intra(init, picture.force_idr);
        let (luma, chroma) = Self::picture_means(init, &picture);
        self.state.luma = luma;
        self.state.chroma = chroma;

        let mut unit = Vec::new();
        if !self.state.headers_sent {
            unit.extend(wire::mpeg4_headers(init.width, init.height));
        }
        let vop_type = if self.state.intra {
            wire::mpeg4::VOP_I
        } else {
            wire::mpeg4::VOP_P
        };
        unit.extend(wire::mpeg4_vop(vop_type, picture.frame_no as u32, luma, chroma));

        let len = match targets.stream.write(&unit) {
            Ok(len) => len,
            Err(_) => return encode::OUTPUT_BUFFER_SHORT,
        };
        self.state.headers_sent = true;
        self.stat = SliceStat {
            encoded_bits: len as u64 * 8,
            pic_type: if self.state.intra {
                PictureType::I
            } else {
                PictureType::P
            },
            ..Default::default()
        };
        picture.local.fill_solid(luma, chroma);
        self.finish_picture();
        encode::SUCCESS
    }
}

impl EncoderEngine for SimEncoder {
    fn init_encode(&mut self, init: &EncodeInit) -> i64 {
        if init.width == 0 || init.height == 0 || init.bitrate == 0 {
            return encode::PARAM_ERROR;
        }
        tracing::debug!(
            "sim encoder init {}x{} {:?} {} bps",
            init.width,
            init.height,
            init.format,
            init.bitrate
        );
        self.init = Some(init.clone());
        self.state = StreamState::default();
        encode::SUCCESS
    }

    fn set_backup(&mut self, backup: &StreamBackup) -> i64 {
        if backup.data.len() != STATE_LEN + INIT_LEN {
            return encode::PARAM_ERROR;
        }
        let (state, init) = backup.data.split_at(STATE_LEN);
        match (StreamState::from_bytes(state), init_from_bytes(init)) {
            (Some(state), Some(init)) => {
                self.state = state;
                self.init = Some(init);
                self.backups_restored += 1;
                encode::SUCCESS
            }
            _ => encode::PARAM_ERROR,
        }
    }

    fn get_backup(&mut self, backup: &mut StreamBackup) -> i64 {
        let Some(init) = self.init.as_ref() else {
            return encode::NOT_INITIALIZED;
        };
        let mut data = self.state.to_bytes();
        data.extend(init_to_bytes(init));
        backup.data = data;
        encode::SUCCESS
    }

    fn encode_picture(
        &mut self,
        picture: Picture<'_>,
        request: OutputRequest,
        targets: EncodeTargets<'_>,
    ) -> i64 {
        let Some(init) = self.init.clone() else {
            return encode::NOT_INITIALIZED;
        };
        if let Some(code) = self.failures.get(&picture.frame_no) {
            if matches!(request, OutputRequest::Slice | OutputRequest::Frame) {
                return *code;
            }
        }
        match (init.format, request) {
            (Format::H264, OutputRequest::Sps) => {
                let unit = wire::nal_unit(nal::SPS, &wire::sps_payload(init.width, init.height));
                match targets.stream.write(&unit) {
                    Ok(len) => {
                        self.stat = SliceStat {
                            encoded_bits: len as u64 * 8,
                            sps_bytes: len,
                            ..Default::default()
                        };
                        encode::SPS_OUTPUT
                    }
                    Err(_) => encode::OUTPUT_BUFFER_SHORT,
                }
            }
            (Format::H264, OutputRequest::Pps) => {
                let unit = wire::nal_unit(nal::PPS, &[0xCE]);
                match targets.stream.write(&unit) {
                    Ok(len) => {
                        self.stat = SliceStat {
                            encoded_bits: len as u64 * 8,
                            pps_bytes: len,
                            ..Default::default()
                        };
                        encode::PPS_OUTPUT
                    }
                    Err(_) => encode::OUTPUT_BUFFER_SHORT,
                }
            }
            (Format::H264, OutputRequest::Slice) => self.encode_slice(&init, picture, targets),
            (Format::Mpeg4, OutputRequest::Frame) => self.encode_vop(&init, picture, targets),
            _ => encode::SEQUENCE_ERROR,
        }
    }

    fn last_slice_stat(&self) -> SliceStat {
        self.stat
    }

    fn put_sei(&mut self, message: SeiMessage, out: &mut StreamBuffer) -> i64 {
        match self.init.as_ref().map(|init| init.format) {
            Some(Format::H264) => {}
            Some(Format::Mpeg4) => return encode::SEQUENCE_ERROR,
            None => return encode::NOT_INITIALIZED,
        }
        let unit = wire::nal_unit(nal::SEI, &[message.payload_type(), 1, 0xFF]);
        match out.write(&unit) {
            Ok(len) => len as i64,
            Err(_) => encode::OUTPUT_BUFFER_SHORT,
        }
    }

    fn put_end_code(&mut self, out: &mut StreamBuffer) -> i64 {
        let unit = match self.init.as_ref().map(|init| init.format) {
            Some(Format::H264) => {
                let mut unit = wire::START_CODE.to_vec();
                unit.push(nal::END_OF_STREAM);
                unit
            }
            Some(Format::Mpeg4) => wire::mpeg4_start(wire::mpeg4::VOSE).to_vec(),
            None => return encode::NOT_INITIALIZED,
        };
        match out.write(&unit) {
            Ok(len) => len as i64,
            Err(_) => encode::OUTPUT_BUFFER_SHORT,
        }
    }

    fn reset_rate_control(&mut self) -> i64 {
        if self.init.is_none() {
            return encode::NOT_INITIALIZED;
        }
        self.rate_control_resets += 1;
        encode::SUCCESS
    }
}
