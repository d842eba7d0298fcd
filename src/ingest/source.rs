//! Video source handles.
//!
//! `VideoBackend` is the media-capture capability the capture engine drives:
//! open a URL, report whether it is open, read one decoded image, release.
//!
//! `VideoSource` picks the concrete backend per URL:
//! - `stub://...` URLs decode to synthetic frames (tests, dry runs)
//! - anything else goes through GStreamer (feature `rtsp-gstreamer`)

use anyhow::{anyhow, Result};
use url::Url;

use crate::frame::DecodedImage;

/// Media-capture capability.
///
/// A backend owns at most one open stream. `release` must be safe to call
/// when nothing is open.
pub trait VideoBackend: Send {
    /// Open `url`, replacing any stream that is already open.
    fn open(&mut self, url: &str) -> Result<()>;

    /// True when the last `open` produced a readable stream.
    fn is_opened(&self) -> bool;

    /// Read the next decoded image. Failures are expected on flaky links.
    fn read(&mut self) -> Result<DecodedImage>;

    /// Close the stream, if any.
    fn release(&mut self);
}

const DEFAULT_STUB_WIDTH: u32 = 640;
const DEFAULT_STUB_HEIGHT: u32 = 480;

/// URL-dispatched video source.
#[derive(Default)]
pub struct VideoSource {
    backend: Option<SourceBackend>,
}

enum SourceBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(super::gstreamer::GstreamerSource),
}

impl VideoSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoBackend for VideoSource {
    fn open(&mut self, url: &str) -> Result<()> {
        self.release();
        if url.starts_with("stub://") {
            let mut source = SyntheticSource::from_url(url)?;
            source.connect();
            self.backend = Some(SourceBackend::Synthetic(source));
            return Ok(());
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            let mut source = super::gstreamer::GstreamerSource::new(url)?;
            let connected = source.connect();
            self.backend = Some(SourceBackend::Gstreamer(source));
            connected
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(anyhow!(
                "opening {} requires the rtsp-gstreamer feature",
                url
            ))
        }
    }

    fn is_opened(&self) -> bool {
        match &self.backend {
            None => false,
            Some(SourceBackend::Synthetic(source)) => source.is_opened(),
            #[cfg(feature = "rtsp-gstreamer")]
            Some(SourceBackend::Gstreamer(source)) => source.is_opened(),
        }
    }

    fn read(&mut self) -> Result<DecodedImage> {
        match &mut self.backend {
            None => Err(anyhow!("video source not opened")),
            Some(SourceBackend::Synthetic(source)) => source.read(),
            #[cfg(feature = "rtsp-gstreamer")]
            Some(SourceBackend::Gstreamer(source)) => source.read(),
        }
    }

    fn release(&mut self) {
        match self.backend.take() {
            None | Some(SourceBackend::Synthetic(_)) => {}
            #[cfg(feature = "rtsp-gstreamer")]
            Some(SourceBackend::Gstreamer(mut source)) => source.release(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

/// Synthetic frames for `stub://` URLs.
///
/// `stub://name?width=W&height=H` sets the frame size (640x480 by default).
struct SyntheticSource {
    url: String,
    width: u32,
    height: u32,
    frame_count: u64,
    opened: bool,
}

impl SyntheticSource {
    fn from_url(raw: &str) -> Result<Self> {
        let parsed = Url::parse(raw).map_err(|e| anyhow!("invalid stub url {}: {}", raw, e))?;
        let mut width = DEFAULT_STUB_WIDTH;
        let mut height = DEFAULT_STUB_HEIGHT;
        for (key, value) in parsed.query_pairs() {
            let target = match key.as_ref() {
                "width" => &mut width,
                "height" => &mut height,
                _ => continue,
            };
            *target = value
                .parse()
                .map_err(|_| anyhow!("stub url {} has non-numeric {}", raw, key))?;
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("stub url {} has a zero dimension", raw));
        }
        Ok(Self {
            url: raw.to_string(),
            width,
            height,
            frame_count: 0,
            opened: false,
        })
    }

    fn connect(&mut self) {
        self.opened = true;
        log::info!("VideoSource: connected to {} (synthetic)", self.url);
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn read(&mut self) -> Result<DecodedImage> {
        self.frame_count += 1;
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        DecodedImage::new(pixels, self.width, self.height)
    }
}
