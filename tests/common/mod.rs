//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use shcodecs::vpu::{DecoderEngine, EncoderEngine};
use shcodecs::{BitstreamUnit, DecodeSession, EncodeSession, Flow, UnitKind};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Luma value of synthetic frame `index`.
pub fn frame_luma(index: u64) -> u8 {
    (16 + (index * 7) % 220) as u8
}

pub type Shared<T> = Arc<Mutex<Vec<T>>>;

pub fn snapshot<T: Clone>(shared: &Shared<T>) -> Vec<T> {
    shared.lock().unwrap().clone()
}

/// Record every unit the session emits.
pub fn collect_units<E: EncoderEngine>(session: &mut EncodeSession<E>) -> Shared<BitstreamUnit> {
    let units = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&units);
    session.set_output_callback(move |unit| {
        sink.lock().unwrap().push(unit.clone());
        Flow::Continue
    });
    units
}

/// Feed `frames` solid frames, then pause.
pub fn solid_input<E: EncoderEngine>(session: &mut EncodeSession<E>, frames: u64) {
    let mut next = 0;
    session.set_input_callback(move |input| {
        if next >= frames {
            return Flow::Pause;
        }
        let (luma, chroma) = input.planes_mut();
        luma.fill(frame_luma(next));
        chroma.fill(128);
        next += 1;
        Flow::Continue
    });
}

/// Run a whole stream of `frames` solid frames through `session`.
pub fn encode_all<E: EncoderEngine>(
    session: &mut EncodeSession<E>,
    frames: u64,
) -> anyhow::Result<Vec<BitstreamUnit>> {
    let units = collect_units(session);
    solid_input(session, frames);
    session.run()?;
    Ok(snapshot(&units))
}

pub fn concat(units: &[BitstreamUnit]) -> Vec<u8> {
    units.iter().flat_map(|unit| unit.data.iter().copied()).collect()
}

pub fn kinds(units: &[BitstreamUnit]) -> Vec<UnitKind> {
    units.iter().map(|unit| unit.kind).collect()
}

/// Split an H.264 unit sequence into access units at each AUD.
pub fn access_units(units: &[BitstreamUnit]) -> Vec<Vec<UnitKind>> {
    let mut out: Vec<Vec<UnitKind>> = Vec::new();
    for unit in units {
        match unit.kind {
            UnitKind::EndOfStream => {}
            UnitKind::Aud => out.push(vec![UnitKind::Aud]),
            kind => match out.last_mut() {
                Some(access_unit) => access_unit.push(kind),
                None => out.push(vec![kind]),
            },
        }
    }
    out
}

/// First luma sample of every decoded frame, in delivery order.
pub fn collect_frames<E: DecoderEngine>(session: &mut DecodeSession<E>) -> Shared<u8> {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&frames);
    session.set_decoded_callback(move |frame| {
        sink.lock().unwrap().push(frame.luma[0]);
        Flow::Continue
    });
    frames
}
