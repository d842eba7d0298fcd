//! Per-stream pipeline: capture → detector → reconciler → aggregator → notifier.
//!
//! Each monitored stream owns one `StreamPipeline` with its own detector,
//! reconciler, throttle state and notifier. Nothing here is shared between
//! streams.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::detect::{DetectionReconciler, DetectionSet, DetectorBackend};
use crate::frame::Frame;
use crate::ingest::{CaptureFrames, DEFAULT_CAPTURE_INTERVAL};
use crate::notify::{compose_message, Notifier, STATUS_OK};
use crate::warning::{ThrottleState, WarningAggregator, WarningSet};

pub const DEFAULT_IMAGE_NAME: &str = "prediction_visual";

/// Identity and pacing of one monitored stream.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Site label used in logs.
    pub label: String,
    /// First line of every notification.
    pub image_name: String,
    /// Capture interval before processing time is added.
    pub base_interval: Duration,
}

impl StreamSettings {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            base_interval: DEFAULT_CAPTURE_INTERVAL,
        }
    }
}

/// What one sampling tick produced.
#[derive(Debug)]
pub struct Tick {
    pub detections: DetectionSet,
    pub frame: Frame,
    pub timestamp: f64,
    pub warnings: WarningSet,
    /// True when this tick opened the throttle and notifications were attempted.
    pub dispatched: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub detection_failures: u64,
    pub capture_errors: u64,
    pub notifications_sent: u64,
    pub notification_failures: u64,
}

pub struct StreamPipeline {
    settings: StreamSettings,
    detector: Box<dyn DetectorBackend>,
    reconciler: DetectionReconciler,
    aggregator: WarningAggregator,
    notifier: Box<dyn Notifier>,
    throttle_state: ThrottleState,
    stats: PipelineStats,
}

impl StreamPipeline {
    pub fn new<D, N>(settings: StreamSettings, detector: D, notifier: N) -> Self
    where
        D: DetectorBackend + 'static,
        N: Notifier + 'static,
    {
        Self {
            settings,
            detector: Box::new(detector),
            reconciler: DetectionReconciler::default(),
            aggregator: WarningAggregator::default(),
            notifier: Box::new(notifier),
            throttle_state: ThrottleState::default(),
            stats: PipelineStats::default(),
        }
    }

    pub fn with_reconciler(mut self, reconciler: DetectionReconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_aggregator(mut self, aggregator: WarningAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn throttle_state(&self) -> ThrottleState {
        self.throttle_state
    }

    /// Run one frame through detection, reconciliation and warning dispatch.
    pub fn process_frame(&mut self, frame: Frame) -> Result<Tick> {
        let timestamp = frame.timestamp;
        let raw = match self.detector.detect(&frame) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.detection_failures += 1;
                return Err(e);
            }
        };
        let raw_count = raw.len();
        let detections = self.reconciler.process(raw);
        log::debug!(
            "{}: {} detections ({} after reconciliation)",
            self.settings.label,
            raw_count,
            detections.len()
        );

        let (evaluation, next_state) =
            self.aggregator.evaluate(&detections, timestamp, self.throttle_state);
        self.throttle_state = next_state;
        self.stats.frames_processed += 1;

        if evaluation.dispatch {
            self.dispatch(&evaluation.warnings, &frame, timestamp);
        } else if !evaluation.warnings.is_empty() {
            log::info!(
                "{}: {} warning(s) held back by notification gate",
                self.settings.label,
                evaluation.warnings.len()
            );
        }

        Ok(Tick {
            detections,
            frame,
            timestamp,
            warnings: evaluation.warnings,
            dispatched: evaluation.dispatch,
        })
    }

    fn dispatch(&mut self, warnings: &WarningSet, frame: &Frame, timestamp: f64) {
        let png = match frame.to_png() {
            Ok(png) => Some(png),
            Err(e) => {
                log::warn!("{}: sending without image: {:#}", self.settings.label, e);
                None
            }
        };
        for warning in warnings {
            let message = compose_message(&self.settings.image_name, timestamp, warning);
            match self.notifier.send_notification(&message, png.as_deref()) {
                Ok(STATUS_OK) => {
                    self.stats.notifications_sent += 1;
                    log::warn!("Notification sent successfully: {}", message);
                }
                Ok(status) => {
                    self.stats.notification_failures += 1;
                    log::error!(
                        "Failed to send notification via {} (status {}): {}",
                        self.notifier.name(),
                        status,
                        message
                    );
                }
                Err(e) => {
                    self.stats.notification_failures += 1;
                    log::error!(
                        "Failed to send notification via {}: {:#}: {}",
                        self.notifier.name(),
                        e,
                        message
                    );
                }
            }
        }
    }

    /// Drive the pipeline until `frames` ends (on cancellation).
    ///
    /// `sink` sees every processed tick. Capture and detection failures are
    /// logged and the loop carries on. After each tick the capture interval
    /// becomes the base interval plus the whole seconds spent processing.
    pub fn run<F>(&mut self, mut frames: CaptureFrames, mut sink: F) -> PipelineStats
    where
        F: FnMut(&Tick),
    {
        log::info!(
            "{}: pipeline running with detector {}",
            self.settings.label,
            self.detector.name()
        );
        if let Err(e) = self.detector.warm_up() {
            log::warn!("{}: detector warm-up failed: {:#}", self.settings.label, e);
        }

        while let Some(item) = frames.next() {
            let frame = match item {
                Ok(frame) => frame,
                Err(e) => {
                    self.stats.capture_errors += 1;
                    log::error!("{}: {}", self.settings.label, e);
                    continue;
                }
            };

            let start = Instant::now();
            match self.process_frame(frame) {
                Ok(tick) => sink(&tick),
                Err(e) => log::error!("{}: detection failed: {:#}", self.settings.label, e),
            }
            let processing = start.elapsed();
            log::info!(
                "{}: processing time {:.2} seconds",
                self.settings.label,
                processing.as_secs_f64()
            );
            frames.update_capture_interval(
                Duration::from_secs(processing.as_secs()) + self.settings.base_interval,
            );
        }

        log::info!("{}: pipeline stopped: {:?}", self.settings.label, self.stats);
        self.stats.clone()
    }
}
