//! Bitstream syntax produced and parsed by the sim engine.

/// Four-byte Annex B start code.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// H.264 NAL unit types used by the sim.
pub mod nal {
    pub const SLICE: u8 = 1;
    pub const IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
    pub const END_OF_STREAM: u8 = 11;
    pub const FILLER: u8 = 12;
}

/// MPEG-4 start code suffixes used by the sim.
pub mod mpeg4 {
    pub const VOS: u8 = 0xB0;
    pub const VOSE: u8 = 0xB1;
    pub const VOL: u8 = 0x20;
    pub const VOP: u8 = 0xB6;

    pub const VOP_I: u8 = 0x10;
    pub const VOP_P: u8 = 0x50;
    pub const VOP_B: u8 = 0x90;
}

/// Slice payload length after the NAL header.
pub const SLICE_PAYLOAD: usize = 10;
/// SPS payload length after the NAL header.
pub const SPS_PAYLOAD: usize = 7;
/// VOP body length after the start code.
pub const VOP_BODY: usize = 1 + 2 * 6;
/// VOL body length after the start code.
pub const VOL_BODY: usize = 2 * 4;

/// Insert emulation prevention bytes.
#[must_use]
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 2);
    let mut zeros = 0;
    for &byte in payload {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

fn nal_ref_idc(nal_type: u8) -> u8 {
    match nal_type {
        nal::SPS | nal::PPS | nal::IDR => 3 << 5,
        nal::SLICE => 2 << 5,
        _ => 0,
    }
}

/// A complete NAL unit: start code, header, escaped payload, stop bit.
#[must_use]
pub fn nal_unit(nal_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut rbsp = payload.to_vec();
    rbsp.push(0x80);
    let mut out = START_CODE.to_vec();
    out.push(nal_ref_idc(nal_type) | nal_type);
    out.extend(escape(&rbsp));
    out
}

/// Slice fields carried in the sim payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHeader {
    pub frame_no: u32,
    pub first_mb: u16,
    pub mb_count: u16,
    pub luma: u8,
    pub chroma: u8,
}

impl SliceHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SLICE_PAYLOAD] {
        let mut out = [0u8; SLICE_PAYLOAD];
        out[..4].copy_from_slice(&self.frame_no.to_be_bytes());
        out[4..6].copy_from_slice(&self.first_mb.to_be_bytes());
        out[6..8].copy_from_slice(&self.mb_count.to_be_bytes());
        out[8] = self.luma;
        out[9] = self.chroma;
        out
    }

    /// Parse from an unescaped payload (header byte already stripped).
    #[must_use]
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let bytes = payload.get(..SLICE_PAYLOAD)?;
        Some(Self {
            frame_no: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            first_mb: u16::from_be_bytes([bytes[4], bytes[5]]),
            mb_count: u16::from_be_bytes([bytes[6], bytes[7]]),
            luma: bytes[8],
            chroma: bytes[9],
        })
    }
}

/// SPS payload: profile, constraints, level, width, height.
#[must_use]
pub fn sps_payload(width: u32, height: u32) -> [u8; SPS_PAYLOAD] {
    let w = (width as u16).to_be_bytes();
    let h = (height as u16).to_be_bytes();
    [66, 0, 30, w[0], w[1], h[0], h[1]]
}

/// Picture size from an SPS payload.
#[must_use]
pub fn parse_sps(payload: &[u8]) -> Option<(u32, u32)> {
    let bytes = payload.get(..SPS_PAYLOAD)?;
    let width = u16::from_be_bytes([bytes[3], bytes[4]]);
    let height = u16::from_be_bytes([bytes[5], bytes[6]]);
    Some((u32::from(width), u32::from(height)))
}

/// Spread each byte over two non-zero bytes so no start code can appear.
#[must_use]
pub fn nibbles(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .flat_map(|b| [0x10 | (b >> 4), 0x10 | (b & 0x0F)])
        .collect()
}

/// Inverse of [`nibbles`].
#[must_use]
pub fn from_nibbles(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2)
        .map(|pair| ((pair[0] & 0x0F) << 4) | (pair[1] & 0x0F))
        .collect()
}

/// MPEG-4 start code with the given suffix.
#[must_use]
pub fn mpeg4_start(code: u8) -> [u8; 4] {
    [0, 0, 1, code]
}

/// Visual object sequence + visual object layer headers.
#[must_use]
pub fn mpeg4_headers(width: u32, height: u32) -> Vec<u8> {
    let mut out = mpeg4_start(mpeg4::VOS).to_vec();
    out.push(0x01);
    out.extend(mpeg4_start(mpeg4::VOL));
    let mut dims = (width as u16).to_be_bytes().to_vec();
    dims.extend((height as u16).to_be_bytes());
    out.extend(nibbles(&dims));
    out
}

/// One VOP.
#[must_use]
pub fn mpeg4_vop(vop_type: u8, frame_no: u32, luma: u8, chroma: u8) -> Vec<u8> {
    let mut out = mpeg4_start(mpeg4::VOP).to_vec();
    out.push(vop_type);
    let mut body = frame_no.to_be_bytes().to_vec();
    body.push(luma);
    body.push(chroma);
    out.extend(nibbles(&body));
    out
}

/// Offset of the first `00 00 01` in `data`.
#[must_use]
pub fn find_start(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|w| w == [0, 0, 1])
}
