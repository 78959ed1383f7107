//! Core types for VPU encoding/decoding.

use crate::CodecError;

/// Largest frame the VPU accepts, in pixels.
pub const MAX_WIDTH: u32 = 1920;
/// Largest frame the VPU accepts, in pixels.
pub const MAX_HEIGHT: u32 = 1080;

/// Compressed stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// H.264/AVC, NAL units with Annex B start codes.
    H264,
    /// MPEG-4 Part 2 (and H.263 carried the same way), one VOP per frame.
    Mpeg4,
}

impl Default for Format {
    fn default() -> Self {
        Self::H264
    }
}

impl Format {
    /// Map the `stream_type` control value onto a format.
    ///
    /// Returns the format and whether the stream is H.263 flavoured.
    pub fn from_stream_type(value: i64) -> Result<(Self, bool), CodecError> {
        match value {
            0 => Ok((Self::Mpeg4, false)),
            1 => Ok((Self::Mpeg4, true)),
            2 => Ok((Self::H264, false)),
            other => Err(CodecError::invalid_param(format!(
                "stream_type {other} (expected 0, 1 or 2)"
            ))),
        }
    }
}

/// Picture coding type reported by the engine for an encoded unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PictureType {
    /// Instantaneous decoder refresh picture.
    Idr,
    /// Intra picture that does not reset prediction.
    I,
    /// Predicted picture.
    P,
    /// Bidirectionally predicted picture (MPEG-4 only).
    B,
}

impl Default for PictureType {
    fn default() -> Self {
        Self::P
    }
}

impl PictureType {
    /// Returns true for IDR and I pictures.
    #[must_use]
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::Idr | Self::I)
    }
}

/// Supplemental enhancement information messages the encoder can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SeiMessage {
    BufferingPeriod,
    PictureTiming,
    PanScanRect,
    FillerPayload,
    RecoveryPoint,
}

impl SeiMessage {
    /// All messages in the order they must appear in an access unit.
    pub const ORDER: [SeiMessage; 5] = [
        SeiMessage::BufferingPeriod,
        SeiMessage::PictureTiming,
        SeiMessage::PanScanRect,
        SeiMessage::FillerPayload,
        SeiMessage::RecoveryPoint,
    ];

    /// H.264 SEI payload type number.
    #[must_use]
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::BufferingPeriod => 0,
            Self::PictureTiming => 1,
            Self::PanScanRect => 2,
            Self::FillerPayload => 3,
            Self::RecoveryPoint => 6,
        }
    }
}

/// Per-message SEI enable switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeiConfig {
    pub buffering_period: bool,
    pub picture_timing: bool,
    pub pan_scan_rect: bool,
    pub filler_payload: bool,
    pub recovery_point: bool,
}

impl SeiConfig {
    /// Whether a given message is switched on.
    #[must_use]
    pub fn enabled(&self, message: SeiMessage) -> bool {
        match message {
            SeiMessage::BufferingPeriod => self.buffering_period,
            SeiMessage::PictureTiming => self.picture_timing,
            SeiMessage::PanScanRect => self.pan_scan_rect,
            SeiMessage::FillerPayload => self.filler_payload,
            SeiMessage::RecoveryPoint => self.recovery_point,
        }
    }

    /// Switch a message on or off.
    #[must_use]
    pub fn with(mut self, message: SeiMessage, on: bool) -> Self {
        let flag = match message {
            SeiMessage::BufferingPeriod => &mut self.buffering_period,
            SeiMessage::PictureTiming => &mut self.picture_timing,
            SeiMessage::PanScanRect => &mut self.pan_scan_rect,
            SeiMessage::FillerPayload => &mut self.filler_payload,
            SeiMessage::RecoveryPoint => &mut self.recovery_point,
        };
        *flag = on;
        self
    }

    /// Enabled messages in emission order.
    pub fn iter(&self) -> impl Iterator<Item = SeiMessage> + '_ {
        SeiMessage::ORDER
            .into_iter()
            .filter(move |message| self.enabled(*message))
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<(), CodecError> {
    if width == 0
        || height == 0
        || width % 2 != 0
        || height % 2 != 0
        || width > MAX_WIDTH
        || height > MAX_HEIGHT
    {
        return Err(CodecError::InvalidDimensions { width, height });
    }
    Ok(())
}

/// Configuration for creating an encode session.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Stream format to produce.
    pub format: Format,
    /// MPEG-4 stream carrying H.263 baseline pictures.
    pub h263: bool,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    /// Frame rate multiplied by ten (300 = 30.0 fps).
    pub frame_rate_x10: u32,
    /// Frames between forced IDR/I pictures. 0 disables periodic IDR.
    pub idr_interval: u32,
    /// Let the engine skip frames and reset its rate control periodically.
    pub rate_control_skip: bool,
    /// Frame-number step per input frame (frame-rate subsampling).
    pub frame_no_increment: u32,
    /// Emit filler data units when the engine reports them.
    pub filler_output: bool,
    /// Number of reference frames (1 or 2).
    pub ref_frame_num: u32,
    /// B-VOPs between anchor pictures (MPEG-4 only).
    pub b_vop_num: u32,
    /// SEI message switches (H.264 only).
    pub sei: SeiConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: Format::H264,
            h263: false,
            bitrate: 1_000_000,
            frame_rate_x10: 300,
            idr_interval: 30,
            rate_control_skip: false,
            frame_no_increment: 1,
            filler_output: false,
            ref_frame_num: 1,
            b_vop_num: 0,
            sei: SeiConfig::default(),
        }
    }
}

impl EncoderConfig {
    /// Create a new encoder configuration with the given dimensions.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Set the stream format.
    #[must_use]
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the target bitrate in bits per second.
    #[must_use]
    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set the frame rate, in tenths of a frame per second.
    #[must_use]
    pub fn frame_rate_x10(mut self, frame_rate_x10: u32) -> Self {
        self.frame_rate_x10 = frame_rate_x10;
        self
    }

    /// Set the IDR interval in frames.
    #[must_use]
    pub fn idr_interval(mut self, frames: u32) -> Self {
        self.idr_interval = frames;
        self
    }

    /// Enable engine frame skipping and periodic rate-control resets.
    #[must_use]
    pub fn rate_control_skip(mut self, enabled: bool) -> Self {
        self.rate_control_skip = enabled;
        self
    }

    /// Set the frame-number increment.
    #[must_use]
    pub fn frame_no_increment(mut self, increment: u32) -> Self {
        self.frame_no_increment = increment;
        self
    }

    /// Emit filler data units.
    #[must_use]
    pub fn filler_output(mut self, enabled: bool) -> Self {
        self.filler_output = enabled;
        self
    }

    /// Set the number of reference frames.
    #[must_use]
    pub fn ref_frame_num(mut self, frames: u32) -> Self {
        self.ref_frame_num = frames;
        self
    }

    /// Set the number of B-VOPs between anchors.
    #[must_use]
    pub fn b_vop_num(mut self, frames: u32) -> Self {
        self.b_vop_num = frames;
        self
    }

    /// Set the SEI switches.
    #[must_use]
    pub fn sei(mut self, sei: SeiConfig) -> Self {
        self.sei = sei;
        self
    }

    /// Build a configuration from control-file style `key = value` options.
    ///
    /// Unknown keys are logged and ignored.
    pub fn from_options<I, K, V>(options: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            let number = || {
                value.parse::<i64>().map_err(|_| {
                    CodecError::invalid_param(format!("{key}: cannot parse {value:?}"))
                })
            };
            let unsigned = || {
                value.parse::<u32>().map_err(|_| {
                    CodecError::invalid_param(format!("{key}: cannot parse {value:?}"))
                })
            };
            match key {
                "stream_type" => {
                    let (format, h263) = Format::from_stream_type(number()?)?;
                    config.format = format;
                    config.h263 = h263;
                }
                "bitrate" => config.bitrate = unsigned()?,
                "x_pic_size" => config.width = unsigned()?,
                "y_pic_size" => config.height = unsigned()?,
                "frame_rate" => config.frame_rate_x10 = unsigned()?,
                "I_vop_interval" => config.idr_interval = unsigned()?,
                "rate_ctrl_skip_enable" => config.rate_control_skip = number()? != 0,
                "filler_output_on" => config.filler_output = number()? != 0,
                "frame_no_increment" => config.frame_no_increment = unsigned()?,
                "ref_frame_num" => config.ref_frame_num = unsigned()?,
                "b_vop_num" => config.b_vop_num = unsigned()?,
                "out_buffering_period_SEI" => {
                    config.sei.buffering_period = number()? != 0;
                }
                "out_pic_timing_SEI" => config.sei.picture_timing = number()? != 0,
                "out_pan_scan_rect_SEI" => config.sei.pan_scan_rect = number()? != 0,
                "out_filler_payload_SEI" => config.sei.filler_payload = number()? != 0,
                "out_recovery_point_SEI" => config.sei.recovery_point = number()? != 0,
                other => {
                    tracing::warn!("Ignoring unknown encoder option {:?}", other);
                }
            }
        }
        Ok(config)
    }

    /// Check the configuration before a session is built from it.
    pub fn validate(&self) -> Result<(), CodecError> {
        check_dimensions(self.width, self.height)?;
        if self.frame_rate_x10 == 0 {
            return Err(CodecError::invalid_param("frame_rate must be non-zero"));
        }
        if self.frame_no_increment == 0 {
            return Err(CodecError::invalid_param(
                "frame_no_increment must be non-zero",
            ));
        }
        if !(1..=2).contains(&self.ref_frame_num) {
            return Err(CodecError::invalid_param(format!(
                "ref_frame_num {} (expected 1 or 2)",
                self.ref_frame_num
            )));
        }
        if self.format == Format::H264 && self.b_vop_num > 0 {
            return Err(CodecError::unsupported_param("B pictures in H.264 streams"));
        }
        if self.format == Format::H264 && self.h263 {
            return Err(CodecError::invalid_param("H.263 flag on an H.264 stream"));
        }
        Ok(())
    }

    /// Bitrate and frame rate as submitted to the engine.
    ///
    /// H.264 above 30 fps is clamped to 30 fps with the bitrate scaled down
    /// so the per-frame budget stays the same.
    #[must_use]
    pub fn engine_rate(&self) -> (u32, u32) {
        if self.format == Format::H264 && self.frame_rate_x10 > 300 {
            let scaled = u64::from(self.bitrate) * 300 / u64::from(self.frame_rate_x10);
            (scaled as u32, 300)
        } else {
            (self.bitrate, self.frame_rate_x10)
        }
    }
}

/// Configuration for creating a decode session.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Stream format to decode.
    pub format: Format,
    /// Largest frame width the stream may carry.
    pub max_width: u32,
    /// Largest frame height the stream may carry.
    pub max_height: u32,
    /// Input arrives one complete frame per `decode` call.
    pub frame_by_frame: bool,
    /// Client wants physical plane addresses (accepted, planes are always slices).
    pub use_physical: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            format: Format::H264,
            max_width: 640,
            max_height: 480,
            frame_by_frame: false,
            use_physical: false,
        }
    }
}

impl DecoderConfig {
    /// Create a new decoder configuration for frames up to the given size.
    #[must_use]
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width,
            max_height,
            ..Default::default()
        }
    }

    /// Set the stream format.
    #[must_use]
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Treat every `decode` call as carrying exactly one frame.
    #[must_use]
    pub fn frame_by_frame(mut self, enabled: bool) -> Self {
        self.frame_by_frame = enabled;
        self
    }

    /// Request physical plane addresses.
    #[must_use]
    pub fn use_physical(mut self, enabled: bool) -> Self {
        self.use_physical = enabled;
        self
    }

    /// Check the configuration before a session is built from it.
    pub fn validate(&self) -> Result<(), CodecError> {
        check_dimensions(self.max_width, self.max_height)?;
        if self.frame_by_frame && self.format != Format::Mpeg4 {
            return Err(CodecError::WrongFormat(self.format));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_mapping() {
        assert_eq!(Format::from_stream_type(0).unwrap(), (Format::Mpeg4, false));
        assert_eq!(Format::from_stream_type(1).unwrap(), (Format::Mpeg4, true));
        assert_eq!(Format::from_stream_type(2).unwrap(), (Format::H264, false));
        assert!(Format::from_stream_type(3).is_err());
    }

    #[test]
    fn test_sei_order() {
        let sei = SeiConfig::default()
            .with(SeiMessage::RecoveryPoint, true)
            .with(SeiMessage::BufferingPeriod, true);
        let order: Vec<_> = sei.iter().collect();
        assert_eq!(
            order,
            vec![SeiMessage::BufferingPeriod, SeiMessage::RecoveryPoint]
        );
    }

    #[test]
    fn test_from_options() {
        let config = EncoderConfig::from_options([
            ("stream_type", "2"),
            ("x_pic_size", "320"),
            ("y_pic_size", "240"),
            ("bitrate", "500000"),
            ("I_vop_interval", "15"),
            ("rate_ctrl_skip_enable", "1"),
            ("out_pic_timing_SEI", "1"),
            ("some_unknown_key", "7"),
        ])
        .unwrap();
        assert_eq!(config.format, Format::H264);
        assert_eq!((config.width, config.height), (320, 240));
        assert_eq!(config.bitrate, 500_000);
        assert_eq!(config.idr_interval, 15);
        assert!(config.rate_control_skip);
        assert!(config.sei.picture_timing);
        assert!(!config.sei.buffering_period);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_options_rejects_garbage() {
        let err = EncoderConfig::from_options([("bitrate", "fast")]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidParam(_)));
    }

    #[test]
    fn test_validate_dimensions() {
        assert!(EncoderConfig::new(0, 240).validate().is_err());
        assert!(EncoderConfig::new(321, 240).validate().is_err());
        assert!(EncoderConfig::new(3840, 2160).validate().is_err());
        assert!(EncoderConfig::new(1920, 1080).validate().is_ok());
        assert!(DecoderConfig::new(176, 144).validate().is_ok());
    }

    #[test]
    fn test_b_frames_only_for_mpeg4() {
        let h264 = EncoderConfig::new(320, 240).b_vop_num(1);
        assert!(h264.validate().is_err());
        let mpeg4 = EncoderConfig::new(320, 240).format(Format::Mpeg4).b_vop_num(1);
        assert!(mpeg4.validate().is_ok());
    }

    #[test]
    fn test_frame_by_frame_only_for_mpeg4() {
        let h264 = DecoderConfig::new(176, 144).frame_by_frame(true);
        assert!(matches!(
            h264.validate(),
            Err(CodecError::WrongFormat(Format::H264))
        ));
        let mpeg4 = DecoderConfig::new(176, 144)
            .format(Format::Mpeg4)
            .frame_by_frame(true);
        assert!(mpeg4.validate().is_ok());
    }

    #[test]
    fn test_engine_rate_clamp() {
        let config = EncoderConfig::new(320, 240)
            .bitrate(2_000_000)
            .frame_rate_x10(600);
        assert_eq!(config.engine_rate(), (1_000_000, 300));

        let mpeg4 = config.clone().format(Format::Mpeg4);
        assert_eq!(mpeg4.engine_rate(), (2_000_000, 600));
    }
}
