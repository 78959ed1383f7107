mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shcodecs::vpu::sim::SimEncoder;
use shcodecs::vpu::status::encode;
use shcodecs::vpu::{
    plane_sizes, EncodeInit, EncodeTargets, EncoderEngine, OutputRequest, Picture, PictureType,
    SeiConfig, SeiMessage, SliceStat, StreamBackup, StreamBuffer, Vpu,
};
use shcodecs::{
    is_well_ordered, CodecError, EncodeSession, EncoderConfig, Flow, Format, ManualClock,
    UnitKind,
};

use common::{access_units, collect_units, encode_all, frame_luma, init_tracing, kinds, snapshot};

fn h264(width: u32, height: u32) -> EncoderConfig {
    EncoderConfig::new(width, height).format(Format::H264)
}

#[test]
fn test_reference_indices_alternate() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let mut session = EncodeSession::new(vpu, h264(64, 32))?;
    assert_eq!(session.reference_indices(), (0, 1));

    let mut seen = Vec::new();
    for _ in 0..6 {
        assert_eq!(session.encode_frame()?, Flow::Continue);
        let (ldec, ref1) = session.reference_indices();
        assert_eq!(ldec + ref1, 1);
        seen.push(ldec);
    }
    assert_eq!(seen, vec![1, 0, 1, 0, 1, 0]);
    assert_eq!(session.frame_counter(), 6);
    assert_eq!(session.min_input_frames(), 1);
    Ok(())
}

#[test]
fn test_parameter_sets_once_and_per_idr() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let mut session = EncodeSession::new(vpu, h264(64, 32).idr_interval(3))?;
    let units = encode_all(&mut session, 7)?;

    let access_units = access_units(&units);
    assert_eq!(access_units.len(), 7);
    for (index, access_unit) in access_units.iter().enumerate() {
        assert!(is_well_ordered(access_unit), "frame {index}: {access_unit:?}");
        let idr = index % 3 == 0;
        let sps = access_unit.iter().filter(|k| **k == UnitKind::Sps).count();
        let pps = access_unit.iter().filter(|k| **k == UnitKind::Pps).count();
        assert_eq!((sps, pps), if idr { (1, 1) } else { (0, 0) }, "frame {index}");
        let slice = if idr { UnitKind::ISlice } else { UnitKind::PSlice };
        assert_eq!(access_unit.last(), Some(&slice));
    }
    assert_eq!(units.last().map(|unit| unit.kind), Some(UnitKind::EndOfStream));
    Ok(())
}

#[test]
fn test_prologue_with_sei_and_filler() -> anyhow::Result<()> {
    init_tracing();
    let engine = SimEncoder::new().slices_per_frame(3).filler_bytes(8);
    let vpu = Arc::new(Vpu::new(engine));
    let sei = SeiConfig::default()
        .with(SeiMessage::RecoveryPoint, true)
        .with(SeiMessage::PictureTiming, true);
    let config = h264(64, 32).sei(sei).filler_output(true);
    let mut session = EncodeSession::new(vpu, config)?;
    let units = encode_all(&mut session, 2)?;

    use UnitKind::*;
    let access_units = access_units(&units);
    assert_eq!(
        access_units[0],
        vec![Aud, Sps, Pps, Sei, Sei, Filler, ISlice, ISlice, ISlice]
    );
    assert_eq!(
        access_units[1],
        vec![Aud, Sei, Sei, Filler, PSlice, PSlice, PSlice]
    );
    // Picture timing before recovery point.
    let sei_types: Vec<u8> = units
        .iter()
        .filter(|unit| unit.kind == Sei)
        .take(2)
        .map(|unit| unit.data[5])
        .collect();
    assert_eq!(
        sei_types,
        vec![
            SeiMessage::PictureTiming.payload_type(),
            SeiMessage::RecoveryPoint.payload_type()
        ]
    );
    Ok(())
}

#[test]
fn test_frame_num_delta_counts_skips() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SimEncoder::new().skip_frames([2, 3])));
    let mut session = EncodeSession::new(vpu, h264(64, 32))?;
    let units = collect_units(&mut session);

    let mut deltas = Vec::new();
    for _ in 0..6 {
        session.encode_frame()?;
        deltas.push(session.frame_num_delta());
    }
    assert_eq!(deltas, vec![0, 0, 1, 2, 0, 0]);
    assert_eq!(session.frame_skip_count(), 2);
    assert_eq!(session.frame_counter(), 6);

    let units = snapshot(&units);
    let aud_deltas: Vec<u32> = units
        .iter()
        .filter(|unit| unit.kind == UnitKind::Aud)
        .map(|unit| unit.frame_delta)
        .collect();
    assert_eq!(aud_deltas, vec![0, 0, 2, 0]);
    // The slice closes the gap, counting itself.
    let slice_deltas: Vec<u32> = units
        .iter()
        .filter(|unit| unit.kind.is_slice())
        .map(|unit| unit.frame_delta)
        .collect();
    assert_eq!(slice_deltas, vec![1, 1, 3, 1]);
    Ok(())
}

#[test]
fn test_rate_control_reset_schedule() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let clock = ManualClock::new();
    let config = h264(64, 32)
        .bitrate(4_000_000)
        .idr_interval(2)
        .rate_control_skip(true);
    let mut session = EncodeSession::new(Arc::clone(&vpu), config)?.with_clock(clock.clone());
    let units = collect_units(&mut session);

    let snapshot_before = session.rate_control_debug().unwrap();
    assert_eq!(snapshot_before.reset_interval, Duration::from_secs(3600));
    assert_eq!(snapshot_before.idr_interval, 2);
    assert!(snapshot_before.next_reset.is_none());

    for _ in 0..4 {
        session.encode_frame()?;
    }
    assert_eq!(vpu.lock()?.rate_control_resets(), 0);
    assert!(session.rate_control_debug().unwrap().next_reset.is_some());

    clock.advance(Duration::from_secs(3600));
    // Frame 4 is intra and restarts the countdown; frame 5 brings it to zero.
    session.encode_frame()?;
    assert_eq!(vpu.lock()?.rate_control_resets(), 0);
    session.encode_frame()?;
    assert_eq!(vpu.lock()?.rate_control_resets(), 1);

    // The frame after a reset is forced to IDR.
    let before = snapshot(&units).len();
    session.encode_frame()?;
    let after = snapshot(&units);
    assert!(after[before..].iter().any(|unit| unit.kind == UnitKind::ISlice));

    // Not again inside the same window.
    clock.advance(Duration::from_secs(1800));
    for _ in 0..3 {
        session.encode_frame()?;
    }
    assert_eq!(vpu.lock()?.rate_control_resets(), 1);

    clock.advance(Duration::from_secs(1800));
    for _ in 0..2 {
        session.encode_frame()?;
    }
    assert_eq!(vpu.lock()?.rate_control_resets(), 2);
    Ok(())
}

/// Sim encoder that drops chosen frames, forced or not, and records the
/// IDR request seen with every picture.
struct SkippingEncoder {
    inner: SimEncoder,
    skip: HashSet<u64>,
    forced: Vec<(u64, bool)>,
}

impl SkippingEncoder {
    fn new(skip: impl IntoIterator<Item = u64>) -> Self {
        Self {
            inner: SimEncoder::new(),
            skip: skip.into_iter().collect(),
            forced: Vec::new(),
        }
    }
}

impl EncoderEngine for SkippingEncoder {
    fn init_encode(&mut self, init: &EncodeInit) -> i64 {
        self.inner.init_encode(init)
    }

    fn set_backup(&mut self, backup: &StreamBackup) -> i64 {
        self.inner.set_backup(backup)
    }

    fn get_backup(&mut self, backup: &mut StreamBackup) -> i64 {
        self.inner.get_backup(backup)
    }

    fn encode_picture(
        &mut self,
        picture: Picture<'_>,
        request: OutputRequest,
        targets: EncodeTargets<'_>,
    ) -> i64 {
        if request == OutputRequest::Slice {
            self.forced.push((picture.frame_no, picture.force_idr));
            if self.skip.contains(&picture.frame_no) {
                return encode::FRAME_SKIPPED;
            }
        }
        self.inner.encode_picture(picture, request, targets)
    }

    fn last_slice_stat(&self) -> SliceStat {
        self.inner.last_slice_stat()
    }

    fn put_sei(&mut self, message: SeiMessage, out: &mut StreamBuffer) -> i64 {
        self.inner.put_sei(message, out)
    }

    fn put_end_code(&mut self, out: &mut StreamBuffer) -> i64 {
        self.inner.put_end_code(out)
    }

    fn reset_rate_control(&mut self) -> i64 {
        self.inner.reset_rate_control()
    }
}

#[test]
fn test_skipped_first_frame_keeps_idr_request() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SkippingEncoder::new([0])));
    let mut session = EncodeSession::new(Arc::clone(&vpu), h264(64, 32).idr_interval(100))?;
    let units = collect_units(&mut session);

    for _ in 0..3 {
        session.encode_frame()?;
    }
    assert_eq!(session.frame_skip_count(), 1);
    assert_eq!(
        vpu.lock()?.forced,
        vec![(0, true), (1, true), (2, false)]
    );

    use UnitKind::*;
    let access_units = access_units(&snapshot(&units));
    assert_eq!(access_units[0], vec![Aud, Sps, Pps, ISlice]);
    assert_eq!(access_units[1], vec![Aud, PSlice]);
    Ok(())
}

#[test]
fn test_skipped_frame_after_reset_keeps_idr_request() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SkippingEncoder::new([6])));
    let clock = ManualClock::new();
    let config = h264(64, 32)
        .bitrate(4_000_000)
        .idr_interval(2)
        .rate_control_skip(true);
    let mut session = EncodeSession::new(Arc::clone(&vpu), config)?.with_clock(clock.clone());

    for _ in 0..4 {
        session.encode_frame()?;
    }
    clock.advance(Duration::from_secs(3600));
    for _ in 0..2 {
        session.encode_frame()?;
    }
    assert_eq!(vpu.lock()?.inner.rate_control_resets(), 1);

    // Frame 6 is dropped; the request moves on to frame 7.
    for _ in 0..3 {
        session.encode_frame()?;
    }
    assert_eq!(session.frame_skip_count(), 1);
    let forced = vpu.lock()?.forced.clone();
    assert_eq!(&forced[6..], &[(6, true), (7, true), (8, false)]);
    Ok(())
}

#[test]
fn test_rate_control_disabled() -> anyhow::Result<()> {
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let clock = ManualClock::new();
    let mut session = EncodeSession::new(Arc::clone(&vpu), h264(64, 32).idr_interval(1))?
        .with_clock(clock.clone());
    assert!(session.rate_control_debug().is_none());
    for _ in 0..3 {
        session.encode_frame()?;
        clock.advance(Duration::from_secs(100_000));
    }
    assert_eq!(vpu.lock()?.rate_control_resets(), 0);
    Ok(())
}

#[test]
fn test_fatal_engine_code_is_surfaced() -> anyhow::Result<()> {
    init_tracing();
    let engine = SimEncoder::new().fail_on_frame(2, encode::VPU_ERROR);
    let vpu = Arc::new(Vpu::new(engine));
    let mut session = EncodeSession::new(vpu, h264(64, 32))?;
    let units = collect_units(&mut session);

    session.encode_frame()?;
    session.encode_frame()?;
    let emitted = snapshot(&units).len();
    let err = session.encode_frame().unwrap_err();
    assert!(matches!(
        err,
        CodecError::Engine {
            code: encode::VPU_ERROR,
            ..
        }
    ));
    assert_eq!(session.error_return_code(), Some(encode::VPU_ERROR));
    assert_eq!(session.frame_counter(), 2);
    assert_eq!(snapshot(&units).len(), emitted);

    // The input slot went back to the client.
    assert!(session.input_slot().is_ok());
    Ok(())
}

#[test]
fn test_input_pause_and_resume() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let mut session = EncodeSession::new(vpu, h264(64, 32).idr_interval(100))?;
    let units = collect_units(&mut session);
    let mut calls = 0u32;
    session.set_input_callback(move |input| {
        calls += 1;
        if calls % 4 == 0 {
            return Flow::Pause;
        }
        input.luma_mut().fill(frame_luma(u64::from(calls)));
        Flow::Continue
    });

    session.run()?;
    assert_eq!(session.frame_counter(), 3);
    let first = snapshot(&units);
    assert_eq!(first.last().map(|unit| unit.kind), Some(UnitKind::EndOfStream));

    session.run()?;
    assert_eq!(session.frame_counter(), 6);
    let all = snapshot(&units);
    let resumed = access_units(&all[first.len()..]);
    assert_eq!(resumed.len(), 3);
    // A resumed stream starts over with parameter sets and an IDR picture.
    assert_eq!(
        resumed[0],
        vec![UnitKind::Aud, UnitKind::Sps, UnitKind::Pps, UnitKind::ISlice]
    );
    assert_eq!(resumed[1], vec![UnitKind::Aud, UnitKind::PSlice]);
    Ok(())
}

#[test]
fn test_release_pause_stops_after_frame() -> anyhow::Result<()> {
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let mut session = EncodeSession::new(vpu, h264(64, 32))?;
    common::solid_input(&mut session, 10);
    let released = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&released);
    session.set_release_callback(move |luma, _chroma| {
        let mut released = sink.lock().unwrap();
        released.push(luma[0]);
        if released.len() == 2 {
            Flow::Pause
        } else {
            Flow::Continue
        }
    });
    session.run()?;
    assert_eq!(session.frame_counter(), 2);
    assert_eq!(snapshot(&released), vec![frame_luma(0), frame_luma(1)]);
    Ok(())
}

#[test]
fn test_encode_planes() -> anyhow::Result<()> {
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let mut session = EncodeSession::new(vpu, h264(64, 32))?;
    let units = collect_units(&mut session);
    let released = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&released);
    session.set_release_callback(move |luma, chroma| {
        sink.lock().unwrap().push((luma.len(), chroma.len(), luma[0]));
        Flow::Continue
    });

    let (luma_size, chroma_size) = plane_sizes(64, 32);
    let luma = vec![77u8; luma_size];
    let chroma = vec![128u8; chroma_size];
    assert_eq!(session.encode_planes(&luma, &chroma)?, Flow::Continue);
    assert_eq!(snapshot(&released), vec![(luma_size, chroma_size, 77)]);
    assert!(snapshot(&units).iter().any(|unit| unit.kind == UnitKind::ISlice));

    let err = session.encode_planes(&luma[..10], &chroma).unwrap_err();
    assert!(matches!(err, CodecError::PlaneSize { .. }));
    assert_eq!(session.frame_counter(), 1);
    Ok(())
}

#[test]
fn test_sessions_share_one_engine() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let mut first = EncodeSession::new(Arc::clone(&vpu), h264(64, 32).idr_interval(100))?;
    let mut second = EncodeSession::new(
        Arc::clone(&vpu),
        EncoderConfig::new(32, 32)
            .format(Format::Mpeg4)
            .idr_interval(100),
    )?;
    let first_units = collect_units(&mut first);
    let second_units = collect_units(&mut second);

    for _ in 0..3 {
        first.encode_frame()?;
        second.encode_frame()?;
    }
    assert_eq!(vpu.lock()?.backups_restored(), 4);

    fn slices(units: &[shcodecs::BitstreamUnit]) -> Vec<UnitKind> {
        kinds(units)
            .into_iter()
            .filter(|kind| kind.is_slice())
            .collect()
    }
    use UnitKind::*;
    assert_eq!(slices(&snapshot(&first_units)), vec![ISlice, PSlice, PSlice]);
    assert_eq!(slices(&snapshot(&second_units)), vec![ISlice, PSlice, PSlice]);
    let parameter_sets = snapshot(&first_units)
        .iter()
        .filter(|unit| unit.kind == Sps)
        .count();
    assert_eq!(parameter_sets, 1);
    Ok(())
}

#[test]
fn test_mpeg4_stream() -> anyhow::Result<()> {
    init_tracing();
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let config = EncoderConfig::new(64, 32)
        .format(Format::Mpeg4)
        .idr_interval(2);
    let mut session = EncodeSession::new(vpu, config)?;
    let units = encode_all(&mut session, 4)?;

    use UnitKind::*;
    assert_eq!(kinds(&units), vec![ISlice, PSlice, ISlice, PSlice, EndOfStream]);
    assert_eq!(&units[0].data[..4], &[0, 0, 1, 0xB0]);
    assert_eq!(units[4].data.as_ref(), &[0, 0, 1, 0xB1]);
    Ok(())
}

/// Sim encoder that reports chosen MPEG-4 frames as B-VOPs or empty VOPs.
struct ScriptedEncoder {
    inner: SimEncoder,
    b_vops: HashSet<u64>,
    empty_vops: HashSet<u64>,
    last_b: bool,
}

impl EncoderEngine for ScriptedEncoder {
    fn init_encode(&mut self, init: &EncodeInit) -> i64 {
        self.inner.init_encode(init)
    }

    fn set_backup(&mut self, backup: &StreamBackup) -> i64 {
        self.inner.set_backup(backup)
    }

    fn get_backup(&mut self, backup: &mut StreamBackup) -> i64 {
        self.inner.get_backup(backup)
    }

    fn encode_picture(
        &mut self,
        picture: Picture<'_>,
        request: OutputRequest,
        targets: EncodeTargets<'_>,
    ) -> i64 {
        let frame_no = picture.frame_no;
        let code = self.inner.encode_picture(picture, request, targets);
        self.last_b = false;
        if code != encode::SUCCESS {
            return code;
        }
        if self.b_vops.contains(&frame_no) {
            self.last_b = true;
            encode::B_VOP_OUTPUT
        } else if self.empty_vops.contains(&frame_no) {
            encode::EMPTY_VOP
        } else {
            code
        }
    }

    fn last_slice_stat(&self) -> SliceStat {
        let mut stat = self.inner.last_slice_stat();
        if self.last_b {
            stat.pic_type = PictureType::B;
        }
        stat
    }

    fn put_sei(&mut self, message: SeiMessage, out: &mut StreamBuffer) -> i64 {
        self.inner.put_sei(message, out)
    }

    fn put_end_code(&mut self, out: &mut StreamBuffer) -> i64 {
        self.inner.put_end_code(out)
    }

    fn reset_rate_control(&mut self) -> i64 {
        self.inner.reset_rate_control()
    }
}

#[test]
fn test_b_vop_and_empty_vop_keep_references() -> anyhow::Result<()> {
    init_tracing();
    let engine = ScriptedEncoder {
        inner: SimEncoder::new(),
        b_vops: HashSet::from([2]),
        empty_vops: HashSet::from([3]),
        last_b: false,
    };
    let vpu = Arc::new(Vpu::new(engine));
    let config = EncoderConfig::new(64, 32)
        .format(Format::Mpeg4)
        .b_vop_num(1)
        .idr_interval(100);
    let mut session = EncodeSession::new(vpu, config)?;
    let units = collect_units(&mut session);

    let mut indices = Vec::new();
    for _ in 0..4 {
        session.encode_frame()?;
        indices.push(session.reference_indices());
    }
    assert_eq!(indices, vec![(1, 0), (0, 1), (0, 1), (0, 1)]);

    use UnitKind::*;
    assert_eq!(kinds(&snapshot(&units)), vec![ISlice, PSlice, BSlice, PSlice]);
    assert_eq!(session.frame_counter(), 4);
    Ok(())
}

#[test]
fn test_session_from_options() -> anyhow::Result<()> {
    let options = [
        ("stream_type", "2"),
        ("x_pic_size", "64"),
        ("y_pic_size", "32"),
        ("bitrate", "500000"),
        ("I_vop_interval", "5"),
        ("out_pic_timing_SEI", "1"),
    ];
    let config = EncoderConfig::from_options(options)?;
    assert_eq!(config.format, Format::H264);
    let vpu = Arc::new(Vpu::new(SimEncoder::new()));
    let mut session = EncodeSession::new(vpu, config)?;
    assert_eq!((session.width(), session.height()), (64, 32));
    let units = encode_all(&mut session, 1)?;
    assert_eq!(
        access_units(&units)[0],
        vec![
            UnitKind::Aud,
            UnitKind::Sps,
            UnitKind::Pps,
            UnitKind::Sei,
            UnitKind::ISlice
        ]
    );
    Ok(())
}
