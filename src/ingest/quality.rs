//! Adaptive quality selection.
//!
//! The capture engine falls back to an explicitly chosen rendition when the
//! source URL keeps failing. The choice depends on measured link throughput:
//!
//! | download          | preference                                   |
//! |-------------------|----------------------------------------------|
//! | > 10 Mbps         | `best`, then the highest `NNNp`, then `worst` |
//! | > 5 and <= 10 Mbps | highest `NNNp` up to 720p, then `worst`      |
//! | <= 5 Mbps         | highest `NNNp` up to 480p, then `worst`      |
//!
//! No matching rendition is not an error: callers keep using the source URL.

use std::collections::BTreeMap;
use std::io::Read;
use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Download speed above which the `best` rendition is allowed.
pub const HIGH_SPEED_MBPS: f64 = 10.0;
/// Download speed above which renditions up to 720p are allowed.
pub const MID_SPEED_MBPS: f64 = 5.0;

/// Speed-test endpoints used when the configuration names none.
pub const DEFAULT_SPEED_TEST_DOWNLOAD_URL: &str = "https://speed.cloudflare.com/__down?bytes=25000000";
pub const DEFAULT_SPEED_TEST_UPLOAD_URL: &str = "https://speed.cloudflare.com/__up";

const MID_TIER_MAX_HEIGHT: u32 = 720;
const LOW_TIER_MAX_HEIGHT: u32 = 480;

/// Rendition name -> playable URL.
pub type Renditions = BTreeMap<String, String>;

/// Measured link throughput.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InternetSpeed {
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

impl InternetSpeed {
    pub fn from_bps(download_bps: f64, upload_bps: f64) -> Self {
        Self {
            download_mbps: download_bps / 1_000_000.0,
            upload_mbps: upload_bps / 1_000_000.0,
        }
    }
}

/// A rendition picked for the measured speed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualitySelection {
    pub name: String,
    pub url: String,
}

/// Pick the highest rendition the link can sustain.
pub fn select_quality(renditions: &Renditions, speed: InternetSpeed) -> Option<QualitySelection> {
    let download = speed.download_mbps;
    let (allow_best, max_height) = if download > HIGH_SPEED_MBPS {
        (true, None)
    } else if download > MID_SPEED_MBPS {
        (false, Some(MID_TIER_MAX_HEIGHT))
    } else {
        (false, Some(LOW_TIER_MAX_HEIGHT))
    };

    let pick = |name: &str| {
        renditions.get(name).map(|url| QualitySelection {
            name: name.to_string(),
            url: url.clone(),
        })
    };

    if allow_best {
        if let Some(best) = pick("best") {
            return Some(best);
        }
    }

    let numeric = renditions
        .iter()
        .filter_map(|(name, url)| rendition_height(name).map(|height| (height, name, url)))
        .filter(|(height, _, _)| max_height.map_or(true, |max| *height <= max))
        .max_by_key(|(height, _, _)| *height);
    if let Some((_, name, url)) = numeric {
        return Some(QualitySelection {
            name: name.clone(),
            url: url.clone(),
        });
    }

    pick("worst")
}

/// Vertical resolution encoded in a rendition name such as `720p` or `1080p60`.
pub fn rendition_height(name: &str) -> Option<u32> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^(\d+)p(\d+)?$").ok())
        .as_ref()?;
    pattern.captures(name)?.get(1)?.as_str().parse().ok()
}

// ----------------------------------------------------------------------------
// Speed probes
// ----------------------------------------------------------------------------

/// Speed-test capability. Returns `(download_bps, upload_bps)`.
///
/// A probe performs real network transfers and may block for seconds.
pub trait SpeedProbe: Send {
    fn measure(&mut self) -> Result<(f64, f64)>;
}

impl<P: SpeedProbe + ?Sized> SpeedProbe for Box<P> {
    fn measure(&mut self) -> Result<(f64, f64)> {
        (**self).measure()
    }
}

/// Probe that reports configured numbers. Used when the deployment knows its
/// link and in tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedSpeedProbe {
    pub download_bps: f64,
    pub upload_bps: f64,
}

impl FixedSpeedProbe {
    pub fn mbps(download: f64, upload: f64) -> Self {
        Self {
            download_bps: download * 1_000_000.0,
            upload_bps: upload * 1_000_000.0,
        }
    }
}

impl SpeedProbe for FixedSpeedProbe {
    fn measure(&mut self) -> Result<(f64, f64)> {
        Ok((self.download_bps, self.upload_bps))
    }
}

/// Probe that times an HTTP download and, optionally, an HTTP upload.
pub struct HttpSpeedProbe {
    download_url: String,
    upload_url: Option<String>,
    agent: ureq::Agent,
    max_download_bytes: u64,
    upload_bytes: usize,
}

impl HttpSpeedProbe {
    pub fn new(download_url: impl Into<String>, upload_url: Option<String>) -> Self {
        Self {
            download_url: download_url.into(),
            upload_url,
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
            max_download_bytes: 25 * 1024 * 1024,
            upload_bytes: 2 * 1024 * 1024,
        }
    }

    fn download_bps(&self) -> Result<f64> {
        let start = Instant::now();
        let response = self
            .agent
            .get(&self.download_url)
            .call()
            .context("speed test download request")?;
        let mut reader = response.into_reader().take(self.max_download_bytes);
        let bytes = std::io::copy(&mut reader, &mut std::io::sink())
            .context("speed test download body")?;
        Ok(bits_per_second(bytes, start.elapsed()))
    }

    fn upload_bps(&self, url: &str) -> Result<f64> {
        let payload = vec![0u8; self.upload_bytes];
        let start = Instant::now();
        self.agent
            .post(url)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(&payload)
            .context("speed test upload request")?;
        Ok(bits_per_second(payload.len() as u64, start.elapsed()))
    }
}

impl SpeedProbe for HttpSpeedProbe {
    fn measure(&mut self) -> Result<(f64, f64)> {
        let download = self.download_bps()?;
        let upload = match &self.upload_url {
            Some(url) => self.upload_bps(url)?,
            None => 0.0,
        };
        Ok((download, upload))
    }
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-6);
    (bytes as f64 * 8.0) / secs
}

// ----------------------------------------------------------------------------
// Rendition resolvers
// ----------------------------------------------------------------------------

/// Stream-rendition capability: the renditions on offer for a source URL.
pub trait RenditionResolver: Send {
    fn renditions(&self, source_url: &str) -> Result<Renditions>;
}

impl<R: RenditionResolver + ?Sized> RenditionResolver for Box<R> {
    fn renditions(&self, source_url: &str) -> Result<Renditions> {
        (**self).renditions(source_url)
    }
}

/// Renditions fixed in configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticRenditions {
    renditions: Renditions,
}

impl StaticRenditions {
    pub fn new(renditions: Renditions) -> Self {
        Self { renditions }
    }
}

impl RenditionResolver for StaticRenditions {
    fn renditions(&self, _source_url: &str) -> Result<Renditions> {
        Ok(self.renditions.clone())
    }
}

/// Resolves renditions through the `streamlink` CLI (`streamlink --json URL`).
#[derive(Clone, Debug)]
pub struct StreamlinkResolver {
    program: String,
}

impl Default for StreamlinkResolver {
    fn default() -> Self {
        Self {
            program: "streamlink".to_string(),
        }
    }
}

impl StreamlinkResolver {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamlinkOutput {
    #[serde(default)]
    streams: BTreeMap<String, StreamlinkStream>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamlinkStream {
    url: Option<String>,
}

impl RenditionResolver for StreamlinkResolver {
    fn renditions(&self, source_url: &str) -> Result<Renditions> {
        let output = Command::new(&self.program)
            .arg("--json")
            .arg(source_url)
            .output()
            .with_context(|| format!("run {}", self.program))?;
        parse_streamlink_json(&output.stdout)
    }
}

fn parse_streamlink_json(stdout: &[u8]) -> Result<Renditions> {
    let parsed: StreamlinkOutput =
        serde_json::from_slice(stdout).context("parse streamlink json output")?;
    if let Some(error) = parsed.error {
        return Err(anyhow!("streamlink: {}", error));
    }
    Ok(parsed
        .streams
        .into_iter()
        .filter_map(|(name, stream)| stream.url.map(|url| (name, url)))
        .collect())
}
