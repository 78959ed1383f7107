//! Fake VPU loopback - encodes synthetic frames and decodes them again.
//!
//! Runs both sessions against the software engine, so it needs no VPU.
//! Every frame is a solid colour; the decoded frames are checked against
//! the colours that went in.
//!
//! Usage:
//!   fake-vpu-loopback [options]
//!
//! Options:
//!   --frames <n>         Frames to encode (default: 30)
//!   --width <px>         Frame width (default: 320)
//!   --height <px>        Frame height (default: 240)
//!   --format <name>      h264 or mpeg4 (default: h264)
//!   --slices <n>         Slices per H.264 picture (default: 1)
//!   --idr-interval <n>   Frames between IDR pictures (default: 30)

use anyhow::{bail, Result};
use std::sync::{Arc, Mutex};

use shcodecs::vpu::sim::{SimDecoder, SimEncoder};
use shcodecs::vpu::Vpu;
use shcodecs::{
    DecodeSession, DecoderConfig, EncodeSession, EncoderConfig, Flow, Format, UnitKind,
};

struct Args {
    frames: u32,
    width: u32,
    height: u32,
    format: Format,
    slices: u32,
    idr_interval: u32,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        frames: 30,
        width: 320,
        height: 240,
        format: Format::H264,
        slices: 1,
        idr_interval: 30,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" if i + 1 < args.len() => {
                result.frames = args[i + 1].parse()?;
                i += 2;
            }
            "--width" if i + 1 < args.len() => {
                result.width = args[i + 1].parse()?;
                i += 2;
            }
            "--height" if i + 1 < args.len() => {
                result.height = args[i + 1].parse()?;
                i += 2;
            }
            "--format" if i + 1 < args.len() => {
                result.format = match args[i + 1].as_str() {
                    "h264" => Format::H264,
                    "mpeg4" => Format::Mpeg4,
                    other => bail!("unknown format {:?}", other),
                };
                i += 2;
            }
            "--slices" if i + 1 < args.len() => {
                result.slices = args[i + 1].parse()?;
                i += 2;
            }
            "--idr-interval" if i + 1 < args.len() => {
                result.idr_interval = args[i + 1].parse()?;
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(result)
}

fn print_usage() {
    println!("Usage: fake-vpu-loopback [options]");
    println!();
    println!("Options:");
    println!("  --frames <n>         Frames to encode (default: 30)");
    println!("  --width <px>         Frame width (default: 320)");
    println!("  --height <px>        Frame height (default: 240)");
    println!("  --format <name>      h264 or mpeg4 (default: h264)");
    println!("  --slices <n>         Slices per H.264 picture (default: 1)");
    println!("  --idr-interval <n>   Frames between IDR pictures (default: 30)");
}

/// Luma value of the synthetic frame `index`.
fn frame_luma(index: u32) -> u8 {
    (16 + (index * 7) % 220) as u8
}

fn encode(args: &Args) -> Result<Vec<u8>> {
    let engine = SimEncoder::new().slices_per_frame(args.slices);
    let vpu = Arc::new(Vpu::new(engine));
    let config = EncoderConfig::new(args.width, args.height)
        .format(args.format)
        .idr_interval(args.idr_interval);
    let mut session = EncodeSession::new(vpu, config)?;

    let stream = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&stream);
    session.set_output_callback(move |unit| {
        if unit.kind == UnitKind::Sps {
            tracing::debug!("Parameter sets ({} bytes)", unit.len());
        }
        if let Ok(mut stream) = sink.lock() {
            stream.extend_from_slice(&unit.data);
        }
        Flow::Continue
    });

    let total = args.frames;
    let mut next = 0;
    session.set_input_callback(move |input| {
        if next >= total {
            return Flow::Pause;
        }
        let (luma, chroma) = input.planes_mut();
        luma.fill(frame_luma(next));
        chroma.fill(128);
        next += 1;
        Flow::Continue
    });
    session.run()?;
    tracing::info!(
        "Encoded {} frames ({} skipped)",
        session.frame_counter(),
        session.frame_skip_count()
    );
    drop(session);

    let data = stream
        .lock()
        .map_err(|_| anyhow::anyhow!("stream lock poisoned"))?
        .clone();
    Ok(data)
}

fn decode(args: &Args, stream: &[u8]) -> Result<Vec<u8>> {
    let vpu = Arc::new(Vpu::new(SimDecoder::new()));
    let config = DecoderConfig::new(args.width, args.height).format(args.format);
    let mut session = DecodeSession::new(vpu, config)?;

    let decoded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&decoded);
    session.set_decoded_callback(move |frame| {
        if let Ok(mut decoded) = sink.lock() {
            decoded.push(frame.luma.first().copied().unwrap_or(0));
        }
        Flow::Continue
    });

    let consumed = session.decode(stream)?;
    let finished = session.finalize(&stream[consumed..])?;
    tracing::info!(
        "Decoded {} frames from {} of {} bytes",
        session.frame_count(),
        consumed + finished,
        stream.len()
    );
    drop(session);

    let lumas = decoded
        .lock()
        .map_err(|_| anyhow::anyhow!("frame list lock poisoned"))?
        .clone();
    Ok(lumas)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shcodecs=info".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = parse_args()?;

    println!();
    println!("========================================");
    println!("Fake VPU Loopback");
    println!("========================================");
    println!("Format: {:?}", args.format);
    println!("Size:   {}x{}", args.width, args.height);
    println!("Frames: {}", args.frames);
    println!("========================================");
    println!();

    let stream = encode(&args)?;
    println!("Encoded stream: {} bytes", stream.len());

    let lumas = decode(&args, &stream)?;
    println!("Decoded frames: {}", lumas.len());

    let expected: Vec<u8> = (0..args.frames).map(frame_luma).collect();
    if lumas != expected {
        bail!(
            "decoded frames do not match: expected {} frames, got {}",
            expected.len(),
            lumas.len()
        );
    }
    println!("All frames match.");
    Ok(())
}
