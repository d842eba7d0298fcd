//! stream_capture - sample frames from one stream and save them as PNG
//!
//! Runs the capture engine on its own: reconnects, quality fallback and
//! interval sampling behave exactly as in the daemon. Useful for checking a
//! camera URL before adding it to the monitor.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use site_safety_monitor::ingest::{FixedSpeedProbe, HttpSpeedProbe, SpeedProbe, StreamlinkResolver};
use site_safety_monitor::{CancelToken, CaptureConfig, StreamCapture, VideoSource};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stream URL (rtsp://, http(s)://, file://, or stub://name).
    #[arg(long, env = "SAFETY_MONITOR_VIDEO_URL")]
    url: String,
    /// Seconds between saved frames.
    #[arg(long, default_value_t = 5)]
    interval: u64,
    /// Stop after this many frames (0 = until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    frames: u64,
    /// Directory for captured PNG files.
    #[arg(long, default_value = "captures")]
    out: PathBuf,
    /// Resolve renditions through streamlink for quality fallback.
    #[arg(long)]
    streamlink: bool,
    /// URL timed for the download speed test (fixed 0 Mbps when absent).
    #[arg(long)]
    speed_test_url: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("create output directory {}", args.out.display()))?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        handler_token.cancel();
    })
    .expect("error setting Ctrl-C handler");

    let config = CaptureConfig {
        capture_interval: Duration::from_secs(args.interval),
        ..CaptureConfig::new(args.url.clone())
    };
    let probe: Box<dyn SpeedProbe> = match &args.speed_test_url {
        Some(url) => Box::new(HttpSpeedProbe::new(url.clone(), None)),
        None => Box::new(FixedSpeedProbe::mbps(0.0, 0.0)),
    };
    let mut engine = StreamCapture::new(config, VideoSource::new())
        .with_speed_probe(probe)
        .with_cancel(cancel.clone());
    if args.streamlink {
        engine = engine.with_renditions(StreamlinkResolver::default());
    }

    let mut saved = 0u64;
    for item in engine.execute_capture() {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("{}", e);
                continue;
            }
        };
        let path = args.out.join(format!("frame_{}.png", (frame.timestamp * 1000.0) as u64));
        std::fs::write(&path, frame.to_png()?)
            .with_context(|| format!("write {}", path.display()))?;
        saved += 1;
        log::info!(
            "saved {} ({}x{}, t={:.3})",
            path.display(),
            frame.width,
            frame.height,
            frame.timestamp
        );
        if args.frames > 0 && saved >= args.frames {
            cancel.cancel();
        }
    }
    log::info!("stream_capture stopped after {} frame(s)", saved);
    Ok(())
}
