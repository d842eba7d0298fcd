//! Site Safety Monitor
//!
//! Watches live construction-site video and raises rate-limited safety
//! warnings.
//!
//! # Architecture
//!
//! One pipeline per monitored stream, strictly sequential inside:
//!
//! 1. **Capture**: a self-healing engine samples frames from an unreliable
//!    network source, reconnecting and re-selecting stream quality as needed.
//! 2. **Detection**: an external detector maps each frame to labelled boxes.
//! 3. **Reconciliation**: duplicate compliant/non-compliant labels and nested
//!    sub-detections are removed.
//! 4. **Warnings**: danger rules turn the cleaned boxes into warnings, and a
//!    global cooldown decides whether a notification burst goes out.
//!
//! Streams share nothing; each owns its engine, reconciler, throttle state
//! and notifier.
//!
//! # Module Structure
//!
//! - `ingest`: video sources, quality selection, the capture engine
//! - `detect`: box geometry, label table, reconciler, detector backends
//! - `warning`: danger rules and the notification throttle
//! - `notify`: LINE Notify, broadcast and log-only transports
//! - `pipeline`: per-stream wiring
//! - `config`: file + environment configuration

use std::time::{SystemTime, UNIX_EPOCH};

pub mod cancel;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
mod multipart;
pub mod notify;
pub mod pipeline;
#[cfg(test)]
mod test_support;
pub mod warning;

pub use cancel::CancelToken;
pub use config::MonitorConfig;
pub use detect::{
    BoundingBox, Category, CategoryPairing, Detection, DetectionReconciler, DetectionSet,
    DetectorBackend,
};
pub use frame::{DecodedImage, Frame};
pub use ingest::{CaptureConfig, CaptureError, CaptureFrames, StreamCapture, VideoSource};
pub use notify::Notifier;
pub use pipeline::{StreamPipeline, StreamSettings, Tick};
pub use warning::{ThrottleState, Warning, WarningAggregator, WarningSet};

/// Current time as Unix epoch seconds.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
