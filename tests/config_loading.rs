use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use site_safety_monitor::config::{DetectorKind, MonitorConfig, SpeedTestSettings};
use site_safety_monitor::ingest::{DEFAULT_SPEED_TEST_DOWNLOAD_URL, DEFAULT_SPEED_TEST_UPLOAD_URL};
use site_safety_monitor::warning::ActiveHours;
use site_safety_monitor::{CancelToken, CategoryPairing, DetectorBackend, Notifier};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SAFETY_MONITOR_CONFIG",
        "SAFETY_MONITOR_API_URL",
        "API_USERNAME",
        "API_PASSWORD",
        "LINE_NOTIFY_TOKEN",
        "SAFETY_MONITOR_VIDEO_URL",
        "SAFETY_MONITOR_CAPTURE_INTERVAL",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "detector": {
                "api_url": "http://detector:5000",
                "model_key": "yolov8n",
                "username": "file-user"
            },
            "capture": {
                "interval_secs": 8,
                "open_backoff_secs": 2,
                "speed_test": { "download_mbps": 12.0, "upload_mbps": 3.0 }
            },
            "reconcile": { "overlap_threshold": 0.75, "pairings": [[0, 2]] },
            "notify": { "cooldown_secs": 120, "active_hours": [6, 20] },
            "streams": [
                {
                    "video_url": "rtsp://camera-1/live",
                    "label": "north_site",
                    "image_name": "crane_view",
                    "renditions": { "720p": "https://cdn/720", "480p": "https://cdn/480" }
                },
                { "video_url": "stub://yard" }
            ]
        }"#,
    );

    std::env::set_var("SAFETY_MONITOR_CONFIG", file.path());
    std::env::set_var("API_PASSWORD", "env-secret");
    std::env::set_var("LINE_NOTIFY_TOKEN", "line-token");
    std::env::set_var("SAFETY_MONITOR_CAPTURE_INTERVAL", "10");

    let cfg = MonitorConfig::load().expect("load config");

    assert_eq!(cfg.detector.kind, DetectorKind::Remote);
    assert_eq!(cfg.detector.remote.api_url, "http://detector:5000");
    assert_eq!(cfg.detector.remote.model_key, "yolov8n");
    assert_eq!(cfg.detector.remote.username.as_deref(), Some("file-user"));
    assert_eq!(cfg.detector.remote.password.as_deref(), Some("env-secret"));
    assert_eq!(cfg.capture.interval, Duration::from_secs(10));
    assert_eq!(cfg.capture.open_backoff, Duration::from_secs(2));
    assert_eq!(cfg.capture.max_read_failures, 5);
    assert_eq!(
        cfg.capture.speed_test,
        SpeedTestSettings::Fixed {
            download_mbps: 12.0,
            upload_mbps: 3.0
        }
    );
    assert_eq!(cfg.reconcile.overlap_threshold, 0.75);
    assert_eq!(cfg.reconcile.pairings, vec![CategoryPairing::HARDHAT]);
    assert_eq!(cfg.notify.cooldown_secs, 120.0);
    assert_eq!(cfg.notify.active_hours, Some(ActiveHours::new(6, 20)));
    assert_eq!(cfg.notify.line_token.as_deref(), Some("line-token"));

    assert_eq!(cfg.streams.len(), 2);
    assert_eq!(cfg.streams[0].label, "north_site");
    assert_eq!(cfg.streams[0].image_name, "crane_view");
    assert_eq!(cfg.streams[0].renditions.as_ref().map(|r| r.len()), Some(2));
    assert_eq!(cfg.streams[1].label, "site");
    assert_eq!(cfg.streams[1].image_name, "prediction_visual");
    assert!(cfg.streams[1].renditions.is_none());

    let capture = cfg.capture_config(&cfg.streams[0]);
    assert_eq!(capture.stream_url, "rtsp://camera-1/live");
    assert_eq!(capture.capture_interval, Duration::from_secs(10));
    assert_eq!(cfg.stream_settings(&cfg.streams[0]).base_interval, Duration::from_secs(10));
    assert_eq!(cfg.notifier().name(), "line");

    clear_env();
}

#[test]
fn loads_toml_config_and_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
[detector]
backend = "stub"

[notify]
active_hours = []
broadcast_url = "http://speaker.local/broadcast"

[[streams]]
video_url = "https://example.com/live/site"
label = "gate"
"#,
    );

    let cfg = MonitorConfig::load_from(Some(file.path())).expect("load toml config");
    assert_eq!(cfg.detector.kind, DetectorKind::Stub);
    assert_eq!(cfg.detector.remote.api_url, "http://localhost:5000");
    assert_eq!(cfg.detector.remote.model_key, "yolov8x");
    assert_eq!(cfg.capture.interval, Duration::from_secs(5));
    assert_eq!(cfg.capture.poll_interval, Duration::from_millis(10));
    assert_eq!(
        cfg.reconcile.pairings,
        vec![CategoryPairing::HARDHAT, CategoryPairing::VEST]
    );
    assert_eq!(cfg.reconcile.overlap_threshold, 0.8);
    assert_eq!(cfg.notify.cooldown_secs, 300.0);
    assert_eq!(cfg.notify.active_hours, None);
    assert_eq!(cfg.streams[0].label, "gate");
    assert_eq!(cfg.detector_backend(CancelToken::new()).name(), "stub");
    assert_eq!(cfg.notifier().name(), "broadcast");

    clear_env();
}

#[test]
fn video_url_env_replaces_stream_list() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SAFETY_MONITOR_VIDEO_URL", "rtsp://override/live");
    let cfg = MonitorConfig::load().expect("env-only config");
    assert_eq!(cfg.streams.len(), 1);
    assert_eq!(cfg.streams[0].video_url, "rtsp://override/live");
    assert_eq!(cfg.notify.active_hours, Some(ActiveHours::new(7, 18)));
    assert_eq!(cfg.notifier().name(), "log");
    assert_eq!(
        cfg.capture.speed_test,
        SpeedTestSettings::Http {
            download_url: DEFAULT_SPEED_TEST_DOWNLOAD_URL.to_string(),
            upload_url: Some(DEFAULT_SPEED_TEST_UPLOAD_URL.to_string()),
        }
    );

    clear_env();
}

#[test]
fn configured_download_url_is_measured_without_default_upload() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
[capture.speed_test]
download_url = "http://mirror.local/10MB.bin"

[[streams]]
video_url = "stub://a"
"#,
    );
    let cfg = MonitorConfig::load_from(Some(file.path())).expect("load toml config");
    assert_eq!(
        cfg.capture.speed_test,
        SpeedTestSettings::Http {
            download_url: "http://mirror.local/10MB.bin".to_string(),
            upload_url: None,
        }
    );

    clear_env();
}

#[test]
fn rejects_invalid_configuration() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    // No streams at all.
    assert!(MonitorConfig::load().is_err());

    let unknown_category = write_config(
        ".json",
        r#"{ "reconcile": { "pairings": [[0, 42]] }, "streams": [{ "video_url": "stub://a" }] }"#,
    );
    assert!(MonitorConfig::load_from(Some(unknown_category.path())).is_err());

    let self_pairing = write_config(
        ".json",
        r#"{ "reconcile": { "pairings": [[2, 2]] }, "streams": [{ "video_url": "stub://a" }] }"#,
    );
    assert!(MonitorConfig::load_from(Some(self_pairing.path())).is_err());

    let bad_hours = write_config(
        ".json",
        r#"{ "notify": { "active_hours": [7] }, "streams": [{ "video_url": "stub://a" }] }"#,
    );
    assert!(MonitorConfig::load_from(Some(bad_hours.path())).is_err());

    let empty_rendition = write_config(
        ".json",
        r#"{ "streams": [{ "video_url": "stub://a", "renditions": { "720p": " " } }] }"#,
    );
    assert!(MonitorConfig::load_from(Some(empty_rendition.path())).is_err());

    let zero_interval = write_config(
        ".json",
        r#"{ "capture": { "interval_secs": 0 }, "streams": [{ "video_url": "stub://a" }] }"#,
    );
    assert!(MonitorConfig::load_from(Some(zero_interval.path())).is_err());

    let zero_backoff = write_config(
        ".json",
        r#"{ "capture": { "open_backoff_secs": 0 }, "streams": [{ "video_url": "stub://a" }] }"#,
    );
    let err = MonitorConfig::load_from(Some(zero_backoff.path())).unwrap_err();
    assert!(format!("{:#}", err).contains("open_backoff_secs"));

    std::env::set_var("SAFETY_MONITOR_VIDEO_URL", "stub://a");
    std::env::set_var("SAFETY_MONITOR_CAPTURE_INTERVAL", "five");
    assert!(MonitorConfig::load().is_err());

    clear_env();
}
