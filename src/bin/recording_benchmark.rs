//! Mixcap Recording Benchmark
//!
//! Drives the full recording pipeline (scripted camera, scene compositing,
//! colour conversion, GStreamer H.264 encoding, MP4 muxing) without camera
//! hardware and reports throughput.
//!
//! Usage:
//!   cargo run --features gst,test-harness --bin recording_benchmark [-- [OPTIONS]]
//!
//! Options:
//!   --config <file>              Recorder config to start from (default: the user config)
//!   --quality <low|medium|high>  Output resolution preset (default: from config)
//!   --frames <n>                 Number of camera frames to emit (default: 300)
//!   --encoder <element>          Force a GStreamer encoder element, e.g. x264enc
//!   --crop-ratio <ratio>         Camera crop ratio (default: 1.0)
//!   --output <dir>               Keep the recording in <dir> instead of a temp dir
//!   --verbose                    Extra debug output

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::Local;

use mixcap_lib::encoding::gst::GstDeviceFactory;
use mixcap_lib::gstreamer_init;
use mixcap_lib::test_harness::{scratch_dir, FlatSceneRenderer, ScriptedFrameSource};
use mixcap_lib::config::default_config_path;
use mixcap_lib::{RecorderConfig, ResolutionQuality, VideoRecorder};

/// Camera frames are larger than any output preset so the crop path is exercised
const CAMERA_WIDTH: u32 = 2560;
const CAMERA_HEIGHT: u32 = 1440;
const CAMERA_FPS: f64 = 30.0;
const DEFAULT_FRAMES: u64 = 300;

struct Args {
    config: PathBuf,
    quality: Option<ResolutionQuality>,
    frames: u64,
    encoder: Option<String>,
    crop_ratio: Option<f32>,
    output: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let quality = match value_of("--quality").as_deref() {
        None => None,
        Some("low") => Some(ResolutionQuality::Low),
        Some("medium") => Some(ResolutionQuality::Medium),
        Some("high") => Some(ResolutionQuality::High),
        Some(other) => return Err(anyhow!("unknown quality '{}'", other)),
    };
    let frames = match value_of("--frames") {
        Some(s) => s.parse().with_context(|| format!("invalid frame count '{}'", s))?,
        None => DEFAULT_FRAMES,
    };
    let crop_ratio = match value_of("--crop-ratio") {
        Some(s) => Some(s.parse().with_context(|| format!("invalid crop ratio '{}'", s))?),
        None => None,
    };

    Ok(Args {
        config: value_of("--config").map(PathBuf::from).unwrap_or_else(default_config_path),
        quality,
        frames,
        encoder: value_of("--encoder"),
        crop_ratio,
        output: value_of("--output").map(PathBuf::from),
        verbose: args.iter().any(|a| a == "--verbose"),
    })
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    println!("\n=== Mixcap Recording Benchmark ===\n");

    let info = gstreamer_init::get_gstreamer_info();
    if !info.is_available {
        println!("  GStreamer is not available. Check the installation.");
        return Ok(());
    }
    println!("  GStreamer:  {}", info.version.as_deref().unwrap_or("unknown"));
    println!("  Encoders:   {}", info.h264_encoders.join(", "));

    let factory = match args.encoder.as_deref() {
        Some(name) => {
            let element = info
                .h264_encoders
                .iter()
                .copied()
                .find(|e| *e == name)
                .ok_or_else(|| anyhow!("encoder '{}' is not installed", name))?;
            GstDeviceFactory::with_encoder(element)?
        }
        None => GstDeviceFactory::new()?,
    };
    println!("  Selected:   {}", factory.encoder_element());

    // Keep the temp dir alive until the report has been printed
    let (scratch, output_dir) = match args.output {
        Some(dir) => (None, dir),
        None => {
            let tmp = scratch_dir().context("failed to create temp dir")?;
            let dir = tmp.path().to_path_buf();
            (Some(tmp), dir)
        }
    };

    let base = RecorderConfig::load_or_default(&args.config);
    let config = RecorderConfig {
        quality: args.quality.unwrap_or(base.quality),
        output_dir,
        crop_ratio: args.crop_ratio.unwrap_or(base.crop_ratio),
        low_latency_mode: true,
        ..base
    };
    let options = config.encoding_options(Local::now())?;
    let output_path = options.output_path();
    println!("  Config:     {}", args.config.display());
    println!(
        "  Output:     {} {}x{} @ {} fps, {} bps",
        config.quality.display_name(),
        options.resolution.width,
        options.resolution.height,
        options.resolution.frame_rate,
        options.bitrate()
    );
    println!("  Camera:     {}x{} @ {:.0} fps, {} frames\n", CAMERA_WIDTH, CAMERA_HEIGHT, CAMERA_FPS, args.frames);

    let source = ScriptedFrameSource::new(CAMERA_WIDTH, CAMERA_HEIGHT).with_frame_rate(CAMERA_FPS);
    let scene = FlatSceneRenderer::transparent();
    let recorder = VideoRecorder::new(source.clone(), scene, Arc::new(factory));
    recorder.set_crop_ratio(config.crop_ratio)?;

    recorder.start_recording(options)?;
    let started = Instant::now();
    let frame_interval = Duration::from_secs_f64(1.0 / CAMERA_FPS);

    for i in 0..args.frames {
        let deadline = started + frame_interval.mul_f64(i as f64);
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
        source.emit_frame();

        if args.verbose && (i + 1) % 100 == 0 {
            println!("    {} frames emitted, {} recorded", i + 1, recorder.state().frame_count);
        }
    }

    let state = recorder.state();
    let stats = recorder
        .stop_recording()?
        .ok_or_else(|| anyhow!("recorder was not encoding"))?;

    let file_size = std::fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
    let content_secs = args.frames as f64 / CAMERA_FPS;
    let bitrate_mbps = if content_secs > 0.0 {
        file_size as f64 * 8.0 / content_secs / 1_000_000.0
    } else {
        0.0
    };

    println!("  Frames recorded:  {}", state.frame_count);
    println!("  Frames submitted: {}", stats.frames_submitted);
    println!("  Frames dropped:   {}", stats.frames_dropped);
    println!("  Samples written:  {}", stats.samples_written);
    println!("  Encoding time:    {:.2}s", stats.encoding_duration.as_secs_f64());
    println!("  Average FPS:      {:.1}", stats.average_fps);
    println!("  File size:        {} ({:.1} Mbps)", format_size(file_size), bitrate_mbps);
    if scratch.is_none() {
        println!("  Written to:       {}", output_path.display());
    }
    println!();

    Ok(())
}

/// Format a file size in human-readable form
fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
