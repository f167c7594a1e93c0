//! # hwdec Probe
//!
//! Runs a synthetic I/B/B/P stream through the reorder/convert layer on the
//! simulated decoder and prints JSON stats.
//!
//! ```text
//! hwdec-probe [--config <file>] [--frames <n>] [--threaded] [--copy]
//!             [--refs <n>] [--size <w>x<h>] [--invalidate-at <n>]
//! ```

use anyhow::{Context, Result};
use bytes::Bytes;
use hwdec_core::codec::{CodecControl, CodecStats, DecodeStatus, HwVideoCodec, Picture, StreamHints};
use hwdec_core::config::{CodecConfig, PictureDelivery};
use hwdec_core::session::HwCodec;
use hwdec_core::simulated::{self, Delivery, SimulatedBackend, SyntheticStream};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const FRAME_DURATION_US: i64 = 40_000;

// ============================================================================
// Options
// ============================================================================

struct ProbeOptions {
    config: Option<PathBuf>,
    frames: usize,
    delivery: Delivery,
    copy: bool,
    ref_frames: u32,
    width: u32,
    height: u32,
    invalidate_at: Option<usize>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            config: None,
            frames: 120,
            delivery: Delivery::Inline,
            copy: false,
            ref_frames: 2,
            width: 320,
            height: 240,
            invalidate_at: None,
        }
    }
}

fn parse_args(args: &[String]) -> Result<ProbeOptions> {
    let mut options = ProbeOptions::default();

    let mut i = 1;
    while i < args.len() {
        let value = || {
            args.get(i + 1)
                .ok_or_else(|| anyhow::anyhow!("Missing value for {}", args[i]))
        };
        match args[i].as_str() {
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--frames" | "-n" => {
                let v = value()?;
                options.frames = v.parse().with_context(|| format!("Invalid frame count {}", v))?;
                i += 2;
            }
            "--refs" => {
                let v = value()?;
                options.ref_frames = v.parse().with_context(|| format!("Invalid reference count {}", v))?;
                i += 2;
            }
            "--size" => {
                let v = value()?;
                let (w, h) = v
                    .split_once('x')
                    .ok_or_else(|| anyhow::anyhow!("Size must look like 320x240, got {}", v))?;
                options.width = w.parse().with_context(|| format!("Invalid width {}", w))?;
                options.height = h.parse().with_context(|| format!("Invalid height {}", h))?;
                i += 2;
            }
            "--invalidate-at" => {
                let v = value()?;
                options.invalidate_at = Some(v.parse().with_context(|| format!("Invalid unit index {}", v))?);
                i += 2;
            }
            "--threaded" => {
                options.delivery = Delivery::Threaded;
                i += 1;
            }
            "--copy" => {
                options.copy = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  hwdec-probe [--config <file>] [--frames <n>] [--threaded] [--copy]\n              [--refs <n>] [--size <w>x<h>] [--invalidate-at <n>]\n"
    );
}

// ============================================================================
// Probe Run
// ============================================================================

#[derive(Serialize)]
struct ProbeReport {
    frames_in: usize,
    pictures_out: usize,
    planar_pictures: usize,
    order_violations: usize,
    elapsed_ms: u128,
    config: CodecConfig,
    codec: CodecStats,
}

/// Tracks presentation order of everything handed to the consumer
#[derive(Default)]
struct OrderCheck {
    last_pts: Option<i64>,
    pictures: usize,
    planar: usize,
    violations: usize,
}

impl OrderCheck {
    fn observe(&mut self, codec: &mut HwVideoCodec, mut picture: Picture) {
        if let (Some(last), Some(pts)) = (self.last_pts, picture.pts_us) {
            if pts < last {
                self.violations += 1;
                tracing::warn!("Picture pts {} after {}", pts, last);
            }
        }
        if picture.pts_us.is_some() {
            self.last_pts = picture.pts_us;
        }
        if picture.planar().is_some() {
            self.planar += 1;
        }
        self.pictures += 1;
        codec.clear_picture(&mut picture);
    }
}

fn run(options: &ProbeOptions) -> Result<ProbeReport> {
    let mut config = match &options.config {
        Some(path) => CodecConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CodecConfig::default(),
    };
    if options.copy {
        config.delivery = PictureDelivery::CopyToPlanar;
    }

    let backend = Arc::new(SimulatedBackend::new(options.delivery));
    let mut codec = HwVideoCodec::new(backend.clone());
    let hints = StreamHints {
        codec: HwCodec::H264,
        width: 0,
        height: 0,
        extradata: simulated::avcc_extradata(options.width, options.height, options.ref_frames, false),
    };
    codec.open(hints, config.clone()).context("Failed to open codec")?;

    tracing::info!(
        "Probing {} with {} frames ({:?} delivery, reorder depth {})",
        codec.name(),
        options.frames,
        options.delivery,
        codec.queue().max_depth()
    );

    let start = Instant::now();
    let mut check = OrderCheck::default();
    let units = SyntheticStream::ibbp(options.frames, FRAME_DURATION_US)
        .with_idr_interval(30)
        .units();

    for (index, unit) in units.into_iter().enumerate() {
        if options.invalidate_at == Some(index) {
            tracing::info!("Invalidating session at unit {}", index);
            backend.control().invalidate_next_submit();
        }
        let status = codec.decode(unit.data, unit.dts_us, unit.pts_us)?;
        if status == DecodeStatus::BufferedAndPicture {
            if let Some(picture) = codec.get_picture()? {
                check.observe(&mut codec, picture);
            }
        }
    }

    // End of stream
    codec.set_codec_control(CodecControl::DRAIN);
    codec.decode(Bytes::new(), None, None)?;
    while let Some(picture) = codec.get_picture()? {
        check.observe(&mut codec, picture);
    }

    let stats = codec.stats();
    codec.dispose();

    let leaked = backend.control().outstanding_references();
    if leaked != 0 {
        anyhow::bail!("{} decoder surface references leaked", leaked);
    }

    Ok(ProbeReport {
        frames_in: options.frames,
        pictures_out: check.pictures,
        planar_pictures: check.planar,
        order_violations: check.violations,
        elapsed_ms: start.elapsed().as_millis(),
        config,
        codec: stats,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("hwdec probe v{}", hwdec_core::VERSION);

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;
    let report = run(&options)?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.order_violations > 0 {
        anyhow::bail!("{} pictures left presentation order", report.order_violations);
    }
    Ok(())
}
