//! Frame ingestion.
//!
//! - `source`: URL-dispatched video handles (synthetic `stub://`, GStreamer)
//! - `quality`: speed probes, rendition resolvers and quality selection
//! - `capture`: the self-healing capture engine and its sampled frame sequence
//!
//! Consumers see a lazy, unbounded sequence of frames spaced at least one
//! capture interval apart. Reconnects and quality fallback stay inside.

pub mod capture;
#[cfg(feature = "rtsp-gstreamer")]
mod gstreamer;
pub mod quality;
pub mod source;

pub use capture::{
    CaptureConfig, CaptureError, CaptureFrames, CaptureStats, StreamCapture,
    DEFAULT_CAPTURE_INTERVAL, DEFAULT_MAX_READ_FAILURES, DEFAULT_OPEN_BACKOFF,
    DEFAULT_POLL_INTERVAL,
};
pub use quality::{
    select_quality, FixedSpeedProbe, HttpSpeedProbe, InternetSpeed, QualitySelection,
    RenditionResolver, Renditions, SpeedProbe, StaticRenditions, StreamlinkResolver,
    DEFAULT_SPEED_TEST_DOWNLOAD_URL, DEFAULT_SPEED_TEST_UPLOAD_URL,
};
pub use source::{VideoBackend, VideoSource};
