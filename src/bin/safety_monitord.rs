//! safety_monitord - multi-stream site safety daemon
//!
//! For every configured stream this daemon:
//! 1. Captures frames with automatic reconnect and quality fallback
//! 2. Sends each sampled frame to the detector
//! 3. Reconciles duplicate compliant/non-compliant labels
//! 4. Derives safety warnings and dispatches them behind a global cooldown
//!
//! Each stream runs on its own thread. Ctrl-C stops every stream and waits
//! until each has released its video source.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::thread;

use site_safety_monitor::config::{describe_pairing, MonitorConfig, StreamConfig};
use site_safety_monitor::detect::StubBackend;
use site_safety_monitor::{
    CancelToken, DetectorBackend, StreamCapture, StreamPipeline, VideoSource, WarningAggregator,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "SAFETY_MONITOR_CONFIG")]
    config: Option<PathBuf>,
    /// Use the stub detector regardless of configuration.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = MonitorConfig::load_from(args.config.as_deref())?;
    log::info!(
        "safety_monitord {} starting {} stream(s)",
        env!("CARGO_PKG_VERSION"),
        cfg.streams.len()
    );
    log::info!(
        "reconcile pairings: {} (overlap > {})",
        cfg.reconcile
            .pairings
            .iter()
            .map(describe_pairing)
            .collect::<Vec<_>>()
            .join(", "),
        cfg.reconcile.overlap_threshold
    );

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        handler_token.cancel();
    })
    .expect("error setting Ctrl-C handler");

    let mut handles = Vec::with_capacity(cfg.streams.len());
    for stream in cfg.streams.clone() {
        let cfg = cfg.clone();
        let cancel = cancel.clone();
        let name = format!("stream-{}", stream.label);
        let dry_run = args.dry_run;
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_stream(&cfg, &stream, cancel, dry_run))
            .map_err(|e| anyhow!("failed to spawn stream thread: {}", e))?;
        handles.push(handle);
    }

    log::info!("safety_monitord running (Ctrl-C to stop)");
    let mut failed = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                log::error!("stream exited with error: {:#}", e);
            }
            Err(_) => {
                failed += 1;
                log::error!("stream thread panicked");
            }
        }
    }
    log::info!("safety_monitord stopped");
    if failed > 0 {
        return Err(anyhow!("{} stream(s) failed", failed));
    }
    Ok(())
}

fn run_stream(
    cfg: &MonitorConfig,
    stream: &StreamConfig,
    cancel: CancelToken,
    dry_run: bool,
) -> Result<()> {
    let detector: Box<dyn DetectorBackend> = if dry_run {
        Box::new(StubBackend::new())
    } else {
        cfg.detector_backend(cancel.clone())
    };
    let mut pipeline = StreamPipeline::new(cfg.stream_settings(stream), detector, cfg.notifier())
        .with_reconciler(cfg.reconciler()?)
        .with_aggregator(WarningAggregator::new(cfg.throttle()));

    let frames = StreamCapture::new(cfg.capture_config(stream), VideoSource::new())
        .with_speed_probe(cfg.speed_probe())
        .with_renditions(cfg.rendition_resolver(stream))
        .with_cancel(cancel)
        .execute_capture();

    let label = stream.label.clone();
    let stats = pipeline.run(frames, |tick| {
        log::info!(
            "{}: {} detection(s), {} warning(s){}",
            label,
            tick.detections.len(),
            tick.warnings.len(),
            if tick.dispatched { ", notified" } else { "" }
        );
    });
    log::info!(
        "{}: processed {} frame(s), sent {} notification(s), {} delivery failure(s)",
        stream.label,
        stats.frames_processed,
        stats.notifications_sent,
        stats.notification_failures
    );
    Ok(())
}
