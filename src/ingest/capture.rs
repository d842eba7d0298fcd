//! Resilient stream capture.
//!
//! `StreamCapture` owns one video source handle and keeps it producing frames
//! across network trouble:
//! - an open that fails is retried once after a fixed backoff
//! - every failed read releases and reopens the source
//! - after `max_read_failures` consecutive failed reads the engine waits one
//!   backoff, re-runs quality selection and reopens on the chosen rendition
//!   (or on the source URL when nothing suitable is on offer)
//!
//! `CaptureFrames` is the lazy, unbounded sequence of sampled frames. It reads
//! at device rate and yields at most one frame per capture interval; frames in
//! between are dropped. The sequence only ends when its `CancelToken` fires,
//! and it releases the source on the way out.

use std::time::{Duration, Instant};

use thiserror::Error;

use super::quality::{
    select_quality, FixedSpeedProbe, InternetSpeed, QualitySelection, RenditionResolver,
    SpeedProbe, StaticRenditions,
};
use super::source::VideoBackend;
use crate::cancel::CancelToken;
use crate::frame::Frame;

pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_READ_FAILURES: u32 = 5;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Capture failures visible to callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The source could not be opened, even after the backoff retry.
    #[error("stream unavailable: could not open {url}")]
    StreamUnavailable { url: String },
    /// Consecutive frame reads failed. Handled inside the engine.
    #[error("{consecutive} consecutive frame reads failed")]
    ReadFailure { consecutive: u32 },
    /// The stop signal fired while the engine was waiting.
    #[error("capture cancelled")]
    Cancelled,
}

/// Configuration for a capture engine.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Source URL (RTSP, HTTP(S), file, or `stub://`).
    pub stream_url: String,
    /// Minimum time between two yielded frames.
    pub capture_interval: Duration,
    /// Wait between a failed open and its retry, and before re-selecting quality.
    pub open_backoff: Duration,
    /// Consecutive read failures tolerated before quality is re-selected.
    pub max_read_failures: u32,
    /// Pause between device reads that are not yielded.
    pub poll_interval: Duration,
}

impl CaptureConfig {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            capture_interval: DEFAULT_CAPTURE_INTERVAL,
            open_backoff: DEFAULT_OPEN_BACKOFF,
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Counters for health logging.
#[derive(Clone, Debug, Default)]
pub struct CaptureStats {
    pub frames_read: u64,
    pub frames_yielded: u64,
    pub read_failures: u64,
    pub opens: u64,
    pub active_url: Option<String>,
}

/// Capture engine for one stream.
pub struct StreamCapture {
    config: CaptureConfig,
    source: Box<dyn VideoBackend>,
    speed_probe: Box<dyn SpeedProbe>,
    resolver: Box<dyn RenditionResolver>,
    cancel: CancelToken,
    handle_open: bool,
    active_url: Option<String>,
    successfully_captured: bool,
    stats: CaptureStats,
}

impl StreamCapture {
    /// Engine with no renditions on offer; quality fallback then reuses the source URL.
    pub fn new<V: VideoBackend + 'static>(config: CaptureConfig, source: V) -> Self {
        Self {
            config,
            source: Box::new(source),
            speed_probe: Box::new(FixedSpeedProbe::mbps(0.0, 0.0)),
            resolver: Box::new(StaticRenditions::default()),
            cancel: CancelToken::new(),
            handle_open: false,
            active_url: None,
            successfully_captured: false,
            stats: CaptureStats::default(),
        }
    }

    pub fn with_speed_probe<P: SpeedProbe + 'static>(mut self, probe: P) -> Self {
        self.speed_probe = Box::new(probe);
        self
    }

    pub fn with_renditions<R: RenditionResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn stream_url(&self) -> &str {
        &self.config.stream_url
    }

    pub fn capture_interval(&self) -> Duration {
        self.config.capture_interval
    }

    /// Change the sampling period; applies from the next sampling decision.
    pub fn update_capture_interval(&mut self, interval: Duration) {
        if interval != self.config.capture_interval {
            log::info!(
                "capture interval for {} updated to {:?}",
                self.config.stream_url,
                interval
            );
        }
        self.config.capture_interval = interval;
    }

    pub fn is_open(&self) -> bool {
        self.active_url.is_some()
    }

    /// True once any frame has been read successfully.
    pub fn has_captured(&self) -> bool {
        self.successfully_captured
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            active_url: self.active_url.clone(),
            ..self.stats.clone()
        }
    }

    /// Open `url`, retrying once after the backoff.
    ///
    /// Does not loop: a second failure is returned as `StreamUnavailable` and
    /// long-run retry is left to the caller.
    pub fn initialise_stream(&mut self, url: &str) -> Result<(), CaptureError> {
        self.active_url = None;
        if self.try_open(url) {
            return Ok(());
        }
        log::warn!(
            "failed to open {}; retrying in {:?}",
            url,
            self.config.open_backoff
        );
        if self.cancel.wait(self.config.open_backoff) {
            return Err(CaptureError::Cancelled);
        }
        if self.try_open(url) {
            return Ok(());
        }
        log::error!("stream unavailable: {}", url);
        Err(CaptureError::StreamUnavailable {
            url: url.to_string(),
        })
    }

    fn try_open(&mut self, url: &str) -> bool {
        self.handle_open = true;
        self.stats.opens += 1;
        match self.source.open(url) {
            Ok(()) if self.source.is_opened() => {
                log::info!("stream opened: {}", url);
                self.active_url = Some(url.to_string());
                true
            }
            Ok(()) => false,
            Err(e) => {
                log::warn!("open {} failed: {:#}", url, e);
                false
            }
        }
    }

    /// Measure link throughput in Mbps. Blocking; may take seconds.
    pub fn check_internet_speed(&mut self) -> anyhow::Result<InternetSpeed> {
        let (download_bps, upload_bps) = self.speed_probe.measure()?;
        let speed = InternetSpeed::from_bps(download_bps, upload_bps);
        log::info!(
            "internet speed: download {:.2} Mbps, upload {:.2} Mbps",
            speed.download_mbps,
            speed.upload_mbps
        );
        Ok(speed)
    }

    /// Pick a rendition of the source for the current link speed.
    ///
    /// `None` means "no decision": no renditions, a failed probe, or nothing
    /// within the speed tier. Callers fall back to the source URL.
    pub fn select_quality_based_on_speed(&mut self) -> Option<QualitySelection> {
        let renditions = match self.resolver.renditions(&self.config.stream_url) {
            Ok(renditions) => renditions,
            Err(e) => {
                log::warn!(
                    "could not list renditions for {}: {:#}",
                    self.config.stream_url,
                    e
                );
                return None;
            }
        };
        if renditions.is_empty() {
            log::info!("no renditions available for {}", self.config.stream_url);
            return None;
        }
        log::info!(
            "available qualities: {:?}",
            renditions.keys().collect::<Vec<_>>()
        );
        let speed = match self.check_internet_speed() {
            Ok(speed) => speed,
            Err(e) => {
                log::warn!("speed test failed: {:#}", e);
                return None;
            }
        };
        let selection = select_quality(&renditions, speed);
        match &selection {
            Some(selection) => log::info!("selected quality based on speed: {}", selection.name),
            None => log::warn!("no compatible stream quality is available"),
        }
        selection
    }

    /// Close the source handle. Safe to call any number of times.
    pub fn release_resources(&mut self) {
        if self.handle_open {
            self.source.release();
            self.handle_open = false;
            log::debug!("released video source for {}", self.config.stream_url);
        }
        self.active_url = None;
    }

    /// Frames from the source URL, escalating to quality selection on trouble.
    pub fn execute_capture(self) -> CaptureFrames {
        CaptureFrames::new(self, CaptureMode::Direct)
    }

    /// Frames from the rendition chosen for the measured link speed.
    pub fn capture_generic_frames(self) -> CaptureFrames {
        CaptureFrames::new(self, CaptureMode::Rendition)
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        self.release_resources();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CaptureMode {
    /// Read the configured source URL.
    Direct,
    /// Read a rendition picked by quality selection.
    Rendition,
}

/// Lazy, unbounded sequence of sampled frames.
///
/// Yields `Err(StreamUnavailable)` when an open fails after its retry; the
/// next call tries again. Returns `None` only after cancellation, and never
/// restarts afterwards.
pub struct CaptureFrames {
    engine: StreamCapture,
    mode: CaptureMode,
    rendition: Option<QualitySelection>,
    needs_selection: bool,
    fail_count: u32,
    last_yield: Option<Instant>,
    finished: bool,
}

impl CaptureFrames {
    fn new(engine: StreamCapture, mode: CaptureMode) -> Self {
        Self {
            engine,
            mode,
            rendition: None,
            needs_selection: mode == CaptureMode::Rendition,
            fail_count: 0,
            last_yield: None,
            finished: false,
        }
    }

    pub fn engine(&self) -> &StreamCapture {
        &self.engine
    }

    pub fn update_capture_interval(&mut self, interval: Duration) {
        self.engine.update_capture_interval(interval);
    }

    pub fn capture_interval(&self) -> Duration {
        self.engine.capture_interval()
    }

    fn target_url(&self) -> String {
        match (&self.mode, &self.rendition) {
            (CaptureMode::Rendition, Some(selection)) => selection.url.clone(),
            _ => self.engine.config.stream_url.clone(),
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.engine.release_resources();
            log::info!("capture stopped for {}", self.engine.config.stream_url);
        }
    }

    fn sample_due(&self, now: Instant) -> bool {
        self.last_yield
            .map_or(true, |last| now.duration_since(last) >= self.engine.config.capture_interval)
    }

    fn on_read_failure(&mut self, error: anyhow::Error) -> Result<(), CaptureError> {
        self.fail_count += 1;
        self.engine.stats.read_failures += 1;
        log::warn!(
            "failed to read frame from {}: {:#} (fail count {})",
            self.target_url(),
            error,
            self.fail_count
        );
        self.engine.release_resources();
        if self.fail_count < self.engine.config.max_read_failures {
            return Ok(());
        }
        let escalated = CaptureError::ReadFailure {
            consecutive: self.fail_count,
        };
        log::warn!("{}; re-selecting stream quality", escalated);
        if self.engine.cancel.wait(self.engine.config.open_backoff) {
            return Err(CaptureError::Cancelled);
        }
        self.mode = CaptureMode::Rendition;
        self.needs_selection = true;
        self.fail_count = 0;
        Ok(())
    }
}

impl Iterator for CaptureFrames {
    type Item = Result<Frame, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if self.engine.cancel.is_cancelled() {
                self.finish();
                return None;
            }

            if self.needs_selection {
                self.needs_selection = false;
                self.rendition = self.engine.select_quality_based_on_speed();
                if self.rendition.is_none() {
                    log::info!(
                        "falling back to source url {}",
                        self.engine.config.stream_url
                    );
                }
            }

            if !self.engine.is_open() {
                let url = self.target_url();
                match self.engine.initialise_stream(&url) {
                    Ok(()) => {}
                    Err(CaptureError::Cancelled) => {
                        self.finish();
                        return None;
                    }
                    Err(e) => {
                        self.engine.release_resources();
                        if self.mode == CaptureMode::Rendition {
                            self.needs_selection = true;
                        }
                        return Some(Err(e));
                    }
                }
            }

            match self.engine.source.read() {
                Ok(image) => {
                    self.fail_count = 0;
                    self.engine.successfully_captured = true;
                    self.engine.stats.frames_read += 1;
                    let now = Instant::now();
                    if self.sample_due(now) {
                        self.last_yield = Some(now);
                        self.engine.stats.frames_yielded += 1;
                        return Some(Ok(Frame::from_decoded(image, crate::unix_timestamp())));
                    }
                    if self.engine.cancel.wait(self.engine.config.poll_interval) {
                        self.finish();
                        return None;
                    }
                }
                Err(e) => {
                    if let Err(CaptureError::Cancelled) = self.on_read_failure(e) {
                        self.finish();
                        return None;
                    }
                }
            }
        }
    }
}

impl Drop for CaptureFrames {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DecodedImage;
    use crate::ingest::quality::Renditions;
    use anyhow::{anyhow, Result};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// What the scripted backend has been asked to do.
    #[derive(Default)]
    struct Calls {
        opens: Vec<String>,
        is_opened_checks: u32,
        releases: u32,
        reads: u32,
    }

    /// Video backend driven by scripts of open/read outcomes.
    ///
    /// Each `open` consumes one entry of the open script to decide what
    /// `is_opened` reports; each `read` consumes one entry of the read script.
    struct ScriptedBackend {
        calls: Arc<Mutex<Calls>>,
        opened: VecDeque<bool>,
        reads: VecDeque<bool>,
        default_opened: bool,
        current_open: bool,
    }

    impl ScriptedBackend {
        fn new(opened: &[bool], reads: &[bool]) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            (
                Self {
                    calls: Arc::clone(&calls),
                    opened: opened.iter().copied().collect(),
                    reads: reads.iter().copied().collect(),
                    default_opened: true,
                    current_open: false,
                },
                calls,
            )
        }

        fn never_opens(mut self) -> Self {
            self.default_opened = false;
            self
        }
    }

    impl VideoBackend for ScriptedBackend {
        fn open(&mut self, url: &str) -> Result<()> {
            self.calls.lock().unwrap().opens.push(url.to_string());
            self.current_open = self.opened.pop_front().unwrap_or(self.default_opened);
            Ok(())
        }

        fn is_opened(&self) -> bool {
            self.calls.lock().unwrap().is_opened_checks += 1;
            self.current_open
        }

        fn read(&mut self) -> Result<DecodedImage> {
            self.calls.lock().unwrap().reads += 1;
            if !self.current_open {
                return Err(anyhow!("not open"));
            }
            if self.reads.pop_front().unwrap_or(true) {
                DecodedImage::new(vec![0; 3], 1, 1)
            } else {
                Err(anyhow!("read timeout"))
            }
        }

        fn release(&mut self) {
            self.calls.lock().unwrap().releases += 1;
            self.current_open = false;
        }
    }

    fn fast_config(url: &str) -> CaptureConfig {
        CaptureConfig {
            stream_url: url.to_string(),
            capture_interval: Duration::ZERO,
            open_backoff: Duration::from_millis(30),
            max_read_failures: 5,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn renditions(pairs: &[(&str, &str)]) -> StaticRenditions {
        StaticRenditions::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Renditions>(),
        )
    }

    #[test]
    fn initialise_succeeds_after_exactly_one_backoff() {
        let (backend, calls) = ScriptedBackend::new(&[false, true], &[]);
        let mut engine = StreamCapture::new(fast_config("rtsp://cam"), backend);
        let start = Instant::now();
        assert_eq!(engine.initialise_stream("rtsp://cam"), Ok(()));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_secs(5));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.opens.len(), 2);
        assert_eq!(calls.is_opened_checks, 2);
        assert!(engine.is_open());
    }

    #[test]
    fn initialise_reports_unavailable_after_second_failure() {
        let (backend, calls) = ScriptedBackend::new(&[], &[]);
        let mut engine =
            StreamCapture::new(fast_config("rtsp://cam"), backend.never_opens());
        assert_eq!(
            engine.initialise_stream("rtsp://cam"),
            Err(CaptureError::StreamUnavailable {
                url: "rtsp://cam".to_string()
            })
        );
        assert_eq!(calls.lock().unwrap().opens.len(), 2);
        assert!(!engine.is_open());
    }

    #[test]
    fn release_is_idempotent_and_safe_before_open() {
        let (backend, calls) = ScriptedBackend::new(&[], &[]);
        let mut engine = StreamCapture::new(fast_config("rtsp://cam"), backend);
        engine.release_resources();
        assert_eq!(calls.lock().unwrap().releases, 0);
        engine.initialise_stream("rtsp://cam").unwrap();
        engine.release_resources();
        engine.release_resources();
        assert_eq!(calls.lock().unwrap().releases, 1);
        assert!(!engine.is_open());
    }

    #[test]
    fn frames_are_sampled_at_capture_interval() {
        let (backend, calls) = ScriptedBackend::new(&[], &[]);
        let mut config = fast_config("rtsp://cam");
        config.capture_interval = Duration::from_millis(50);
        let mut frames = StreamCapture::new(config, backend).execute_capture();

        let first = frames.next().unwrap().unwrap();
        let t0 = Instant::now();
        let second = frames.next().unwrap().unwrap();
        assert!(t0.elapsed() >= Duration::from_millis(40));
        assert!(second.timestamp >= first.timestamp);
        // Reads between samples are discarded.
        assert!(calls.lock().unwrap().reads > 2);
        assert_eq!(frames.engine().stats().frames_yielded, 2);
    }

    #[test]
    fn interval_update_applies_to_next_sample() {
        let (backend, _calls) = ScriptedBackend::new(&[], &[]);
        let mut config = fast_config("rtsp://cam");
        config.capture_interval = Duration::from_secs(3600);
        let mut frames = StreamCapture::new(config, backend).execute_capture();
        assert!(frames.next().unwrap().is_ok());
        frames.update_capture_interval(Duration::ZERO);
        assert_eq!(frames.capture_interval(), Duration::ZERO);
        assert!(frames.next().unwrap().is_ok());
    }

    #[test]
    fn transient_read_failures_are_hidden_from_consumer() {
        let (backend, calls) = ScriptedBackend::new(&[], &[false, false, true]);
        let mut frames = StreamCapture::new(fast_config("rtsp://cam"), backend).execute_capture();
        assert!(frames.next().unwrap().is_ok());
        let calls = calls.lock().unwrap();
        // Initial open plus one reopen per failed read.
        assert_eq!(calls.opens, vec!["rtsp://cam"; 3]);
        assert_eq!(calls.releases, 2);
    }

    #[test]
    fn repeated_read_failures_switch_to_selected_rendition() {
        let (backend, calls) =
            ScriptedBackend::new(&[], &[false, false, false, false, false, true]);
        let mut frames = StreamCapture::new(fast_config("https://site/live"), backend)
            .with_speed_probe(FixedSpeedProbe::mbps(7.0, 2.0))
            .with_renditions(renditions(&[
                ("best", "https://cdn/best"),
                ("720p", "https://cdn/720"),
                ("360p", "https://cdn/360"),
            ]))
            .execute_capture();
        assert!(frames.next().unwrap().is_ok());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.opens.len(), 6);
        assert!(calls.opens[..5].iter().all(|url| url == "https://site/live"));
        assert_eq!(calls.opens[5], "https://cdn/720");
        assert_eq!(
            frames.engine().stats().active_url.as_deref(),
            Some("https://cdn/720")
        );
    }

    #[test]
    fn empty_selection_falls_back_to_source_url() {
        let (backend, calls) = ScriptedBackend::new(&[], &[]);
        let mut frames = StreamCapture::new(fast_config("rtsp://cam"), backend)
            .capture_generic_frames();
        assert!(frames.next().unwrap().is_ok());
        assert_eq!(calls.lock().unwrap().opens, vec!["rtsp://cam"]);
    }

    #[test]
    fn generic_capture_opens_selected_rendition() {
        let (backend, calls) = ScriptedBackend::new(&[], &[]);
        let mut frames = StreamCapture::new(fast_config("https://site/live"), backend)
            .with_speed_probe(FixedSpeedProbe::mbps(3.0, 1.0))
            .with_renditions(renditions(&[
                ("480p", "https://cdn/480"),
                ("240p", "https://cdn/240"),
            ]))
            .capture_generic_frames();
        assert!(frames.next().unwrap().is_ok());
        assert_eq!(calls.lock().unwrap().opens, vec!["https://cdn/480"]);
    }

    #[test]
    fn open_failure_surfaces_and_next_call_retries() {
        let (backend, calls) = ScriptedBackend::new(&[false, false, true], &[]);
        let mut frames = StreamCapture::new(fast_config("rtsp://cam"), backend).execute_capture();
        match frames.next() {
            Some(Err(CaptureError::StreamUnavailable { url })) => assert_eq!(url, "rtsp://cam"),
            other => panic!("expected StreamUnavailable, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(frames.next().unwrap().is_ok());
        assert_eq!(calls.lock().unwrap().opens.len(), 3);
    }

    #[test]
    fn cancel_during_backoff_releases_exactly_once() {
        let (backend, calls) = ScriptedBackend::new(&[], &[]);
        let mut config = fast_config("rtsp://cam");
        config.open_backoff = Duration::from_secs(30);
        let cancel = CancelToken::new();
        let engine = StreamCapture::new(config, backend.never_opens()).with_cancel(cancel.clone());

        let remote = cancel.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let start = Instant::now();
        let mut frames = engine.execute_capture();
        assert!(frames.next().is_none());
        assert!(start.elapsed() < Duration::from_secs(10));
        stopper.join().unwrap();

        // Finished sequences stay finished.
        assert!(frames.next().is_none());
        drop(frames);
        assert_eq!(calls.lock().unwrap().releases, 1);
    }

    #[test]
    fn cancel_between_frames_ends_sequence() {
        let (backend, calls) = ScriptedBackend::new(&[], &[]);
        let cancel = CancelToken::new();
        let mut frames = StreamCapture::new(fast_config("rtsp://cam"), backend)
            .with_cancel(cancel.clone())
            .execute_capture();
        assert!(frames.next().unwrap().is_ok());
        cancel.cancel();
        assert!(frames.next().is_none());
        drop(frames);
        assert_eq!(calls.lock().unwrap().releases, 1);
    }
}
