use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::detect::{
    Category, CategoryPairing, DetectionReconciler, DetectorBackend, RemoteBackend,
    RemoteDetectorConfig, StubBackend, DEFAULT_OVERLAP_THRESHOLD,
};
use crate::ingest::{
    CaptureConfig, FixedSpeedProbe, HttpSpeedProbe, RenditionResolver, Renditions, SpeedProbe,
    StaticRenditions, StreamlinkResolver, DEFAULT_CAPTURE_INTERVAL, DEFAULT_MAX_READ_FAILURES,
    DEFAULT_OPEN_BACKOFF, DEFAULT_POLL_INTERVAL, DEFAULT_SPEED_TEST_DOWNLOAD_URL,
    DEFAULT_SPEED_TEST_UPLOAD_URL,
};
use crate::notify::{BroadcastNotifier, FanOutNotifier, LineNotifier, LogNotifier, Notifier};
use crate::pipeline::{StreamSettings, DEFAULT_IMAGE_NAME};
use crate::warning::{ActiveHours, NotificationThrottle, DEFAULT_COOLDOWN_SECS};

pub const CONFIG_ENV: &str = "SAFETY_MONITOR_CONFIG";
const DEFAULT_API_URL: &str = "http://localhost:5000";
const DEFAULT_MODEL_KEY: &str = "yolov8x";
const DEFAULT_STREAM_LABEL: &str = "site";

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    detector: Option<DetectorConfigFile>,
    capture: Option<CaptureConfigFile>,
    reconcile: Option<ReconcileConfigFile>,
    notify: Option<NotifyConfigFile>,
    streams: Option<Vec<StreamConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    api_url: Option<String>,
    model_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    interval_secs: Option<u64>,
    open_backoff_secs: Option<u64>,
    max_read_failures: Option<u32>,
    poll_interval_ms: Option<u64>,
    speed_test: Option<SpeedTestConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SpeedTestConfigFile {
    download_url: Option<String>,
    upload_url: Option<String>,
    download_mbps: Option<f64>,
    upload_mbps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconcileConfigFile {
    overlap_threshold: Option<f64>,
    pairings: Option<Vec<[u8; 2]>>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    cooldown_secs: Option<f64>,
    active_hours: Option<Vec<u32>>,
    line_token: Option<String>,
    broadcast_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamConfigFile {
    video_url: String,
    label: Option<String>,
    image_name: Option<String>,
    renditions: Option<Renditions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Remote,
    Stub,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub remote: RemoteDetectorConfig,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interval: Duration,
    pub open_backoff: Duration,
    pub max_read_failures: u32,
    pub poll_interval: Duration,
    pub speed_test: SpeedTestSettings,
}

/// How link speed is measured before quality selection.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeedTestSettings {
    /// Time transfers against HTTP endpoints.
    Http {
        download_url: String,
        upload_url: Option<String>,
    },
    /// Report fixed numbers (Mbps).
    Fixed { download_mbps: f64, upload_mbps: f64 },
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub overlap_threshold: f64,
    pub pairings: Vec<CategoryPairing>,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub cooldown_secs: f64,
    pub active_hours: Option<ActiveHours>,
    pub line_token: Option<String>,
    pub broadcast_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub video_url: String,
    pub label: String,
    pub image_name: String,
    /// Fixed renditions; `None` resolves them through streamlink.
    pub renditions: Option<Renditions>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub detector: DetectorSettings,
    pub capture: CaptureSettings,
    pub reconcile: ReconcileSettings,
    pub notify: NotifySettings,
    pub streams: Vec<StreamConfig>,
}

impl MonitorConfig {
    /// Load from the file named by `SAFETY_MONITOR_CONFIG` (if any), then
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Result<Self> {
        let detector_file = file.detector.unwrap_or_default();
        let kind = match detector_file.backend.as_deref() {
            None | Some("remote") => DetectorKind::Remote,
            Some("stub") => DetectorKind::Stub,
            Some(other) => return Err(anyhow!("unknown detector backend '{}'", other)),
        };
        let detector = DetectorSettings {
            kind,
            remote: RemoteDetectorConfig {
                api_url: detector_file
                    .api_url
                    .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
                model_key: detector_file
                    .model_key
                    .unwrap_or_else(|| DEFAULT_MODEL_KEY.to_string()),
                username: detector_file.username,
                password: detector_file.password,
                ..RemoteDetectorConfig::default()
            },
        };

        let capture_file = file.capture.unwrap_or_default();
        let speed_file = capture_file.speed_test.unwrap_or_default();
        // Fixed numbers only when asked for; otherwise measure the link.
        let speed_test = match (speed_file.download_url, speed_file.download_mbps) {
            (None, Some(download_mbps)) => SpeedTestSettings::Fixed {
                download_mbps,
                upload_mbps: speed_file.upload_mbps.unwrap_or(0.0),
            },
            (download_url, _) => {
                let custom = download_url.is_some();
                SpeedTestSettings::Http {
                    download_url: download_url
                        .unwrap_or_else(|| DEFAULT_SPEED_TEST_DOWNLOAD_URL.to_string()),
                    upload_url: speed_file.upload_url.or_else(|| {
                        (!custom).then(|| DEFAULT_SPEED_TEST_UPLOAD_URL.to_string())
                    }),
                }
            }
        };
        let capture = CaptureSettings {
            interval: capture_file
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CAPTURE_INTERVAL),
            open_backoff: capture_file
                .open_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_OPEN_BACKOFF),
            max_read_failures: capture_file
                .max_read_failures
                .unwrap_or(DEFAULT_MAX_READ_FAILURES),
            poll_interval: capture_file
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            speed_test,
        };

        let reconcile_file = file.reconcile.unwrap_or_default();
        let pairings = match reconcile_file.pairings {
            Some(pairs) => pairs
                .into_iter()
                .map(|[positive, negative]| CategoryPairing { positive, negative })
                .collect(),
            None => vec![CategoryPairing::HARDHAT, CategoryPairing::VEST],
        };
        let reconcile = ReconcileSettings {
            overlap_threshold: reconcile_file
                .overlap_threshold
                .unwrap_or(DEFAULT_OVERLAP_THRESHOLD),
            pairings,
        };

        let notify_file = file.notify.unwrap_or_default();
        let active_hours = match notify_file.active_hours.as_deref() {
            None => Some(ActiveHours::default()),
            Some([]) => None,
            Some(&[start, end]) => Some(ActiveHours::new(start, end)),
            Some(other) => {
                return Err(anyhow!(
                    "notify.active_hours must be [start, end] or [], got {:?}",
                    other
                ))
            }
        };
        let notify = NotifySettings {
            cooldown_secs: notify_file.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
            active_hours,
            line_token: notify_file.line_token,
            broadcast_url: notify_file.broadcast_url,
        };

        let streams = file
            .streams
            .unwrap_or_default()
            .into_iter()
            .map(|stream| StreamConfig {
                video_url: stream.video_url,
                label: stream
                    .label
                    .unwrap_or_else(|| DEFAULT_STREAM_LABEL.to_string()),
                image_name: stream
                    .image_name
                    .unwrap_or_else(|| DEFAULT_IMAGE_NAME.to_string()),
                renditions: stream.renditions,
            })
            .collect();

        Ok(Self {
            detector,
            capture,
            reconcile,
            notify,
            streams,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SAFETY_MONITOR_API_URL") {
            if !url.trim().is_empty() {
                self.detector.remote.api_url = url;
            }
        }
        if let Ok(username) = std::env::var("API_USERNAME") {
            if !username.trim().is_empty() {
                self.detector.remote.username = Some(username);
            }
        }
        if let Ok(password) = std::env::var("API_PASSWORD") {
            if !password.is_empty() {
                self.detector.remote.password = Some(password);
            }
        }
        if let Ok(token) = std::env::var("LINE_NOTIFY_TOKEN") {
            if !token.trim().is_empty() {
                self.notify.line_token = Some(token);
            }
        }
        if let Ok(url) = std::env::var("SAFETY_MONITOR_VIDEO_URL") {
            if !url.trim().is_empty() {
                let template = self.streams.first();
                self.streams = vec![StreamConfig {
                    video_url: url,
                    label: template
                        .map(|s| s.label.clone())
                        .unwrap_or_else(|| DEFAULT_STREAM_LABEL.to_string()),
                    image_name: template
                        .map(|s| s.image_name.clone())
                        .unwrap_or_else(|| DEFAULT_IMAGE_NAME.to_string()),
                    renditions: None,
                }];
            }
        }
        if let Ok(interval) = std::env::var("SAFETY_MONITOR_CAPTURE_INTERVAL") {
            let seconds: u64 = interval.parse().map_err(|_| {
                anyhow!("SAFETY_MONITOR_CAPTURE_INTERVAL must be an integer number of seconds")
            })?;
            self.capture.interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        // Surfaces unknown categories, self-pairings and bad thresholds.
        self.reconciler()?;

        if self.capture.interval.is_zero() {
            return Err(anyhow!("capture interval must be greater than zero"));
        }
        if self.capture.open_backoff.is_zero() {
            return Err(anyhow!("capture.open_backoff_secs must be greater than zero"));
        }
        if self.capture.max_read_failures == 0 {
            return Err(anyhow!("capture.max_read_failures must be at least 1"));
        }
        if !self.notify.cooldown_secs.is_finite() || self.notify.cooldown_secs < 0.0 {
            return Err(anyhow!("notify.cooldown_secs must be a non-negative number"));
        }
        if let Some(hours) = self.notify.active_hours {
            if hours.start > 23 || hours.end > 24 || hours.start == hours.end {
                return Err(anyhow!(
                    "notify.active_hours [{}, {}] is not a valid window",
                    hours.start,
                    hours.end
                ));
            }
        }
        if self.streams.is_empty() {
            return Err(anyhow!(
                "no streams configured (set streams in the config file or SAFETY_MONITOR_VIDEO_URL)"
            ));
        }
        for stream in &self.streams {
            if stream.video_url.trim().is_empty() {
                return Err(anyhow!("stream '{}' has an empty video_url", stream.label));
            }
            if let Some(renditions) = &stream.renditions {
                if let Some((name, _)) = renditions.iter().find(|(_, url)| url.trim().is_empty()) {
                    return Err(anyhow!(
                        "stream '{}' rendition '{}' has an empty url",
                        stream.label,
                        name
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn reconciler(&self) -> Result<DetectionReconciler> {
        DetectionReconciler::new(
            self.reconcile.pairings.clone(),
            self.reconcile.overlap_threshold,
        )
    }

    pub fn throttle(&self) -> NotificationThrottle {
        NotificationThrottle::new(self.notify.cooldown_secs, self.notify.active_hours)
    }

    pub fn capture_config(&self, stream: &StreamConfig) -> CaptureConfig {
        CaptureConfig {
            stream_url: stream.video_url.clone(),
            capture_interval: self.capture.interval,
            open_backoff: self.capture.open_backoff,
            max_read_failures: self.capture.max_read_failures,
            poll_interval: self.capture.poll_interval,
        }
    }

    pub fn stream_settings(&self, stream: &StreamConfig) -> StreamSettings {
        StreamSettings {
            label: stream.label.clone(),
            image_name: stream.image_name.clone(),
            base_interval: self.capture.interval,
        }
    }

    pub fn speed_probe(&self) -> Box<dyn SpeedProbe> {
        match &self.capture.speed_test {
            SpeedTestSettings::Http {
                download_url,
                upload_url,
            } => Box::new(HttpSpeedProbe::new(download_url.clone(), upload_url.clone())),
            SpeedTestSettings::Fixed {
                download_mbps,
                upload_mbps,
            } => Box::new(FixedSpeedProbe::mbps(*download_mbps, *upload_mbps)),
        }
    }

    pub fn rendition_resolver(&self, stream: &StreamConfig) -> Box<dyn RenditionResolver> {
        match &stream.renditions {
            Some(renditions) => Box::new(StaticRenditions::new(renditions.clone())),
            None => Box::new(StreamlinkResolver::default()),
        }
    }

    /// Configured detector; `cancel` cuts short its retry waits.
    pub fn detector_backend(&self, cancel: CancelToken) -> Box<dyn DetectorBackend> {
        match self.detector.kind {
            DetectorKind::Remote => Box::new(
                RemoteBackend::new(self.detector.remote.clone()).with_cancel(cancel),
            ),
            DetectorKind::Stub => Box::new(StubBackend::new()),
        }
    }

    /// Configured transports; log-only when none is set.
    pub fn notifier(&self) -> Box<dyn Notifier> {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
        if let Some(token) = &self.notify.line_token {
            notifiers.push(Box::new(LineNotifier::new(token.clone())));
        }
        if let Some(url) = &self.notify.broadcast_url {
            notifiers.push(Box::new(BroadcastNotifier::new(url.clone())));
        }
        match notifiers.len() {
            0 => Box::new(LogNotifier),
            1 => notifiers.remove(0),
            _ => Box::new(FanOutNotifier::new(notifiers)),
        }
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// Label lookup used when logging pairings.
pub fn describe_pairing(pairing: &CategoryPairing) -> String {
    let name = |id: u8| Category::from_id(id).map_or("unknown", Category::name);
    format!("{}/{}", name(pairing.positive), name(pairing.negative))
}
