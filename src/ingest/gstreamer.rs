//! GStreamer-backed video source for RTSP, HTTP(S)/HLS and file URLs.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use crate::frame::DecodedImage;

/// Longest wait for one decoded sample before the read counts as failed.
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct GstreamerSource {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    playing: bool,
    last_error: Option<String>,
}

impl GstreamerSource {
    /// Build the decode pipeline: source ! decode ! videoconvert ! RGB appsink.
    ///
    /// RTSP URLs use `rtspsrc` with zero latency; everything else goes through
    /// `uridecodebin`. The appsink keeps a single buffer and drops the rest so
    /// a slow consumer always sees the newest frame.
    pub(crate) fn new(url: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let source = if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            format!("rtspsrc location={} latency=0 ! decodebin", url)
        } else {
            format!("uridecodebin uri={}", url)
        };
        let description = format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            source
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            playing: false,
            last_error: None,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;
        self.playing = true;
        self.last_error = None;
        log::info!("VideoSource: connected to {}", self.url);
        Ok(())
    }

    pub(crate) fn is_opened(&self) -> bool {
        self.playing && self.last_error.is_none()
    }

    pub(crate) fn read(&mut self) -> Result<DecodedImage> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                SAMPLE_TIMEOUT.as_millis() as u64,
            ))
            .ok_or_else(|| anyhow!("stream stalled: no sample within {:?}", SAMPLE_TIMEOUT))?;
        sample_to_image(&sample)
    }

    pub(crate) fn release(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop capture pipeline for {}: {}", self.url, e);
        }
        self.playing = false;
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if self.playing {
            self.release();
        }
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<DecodedImage> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("buffer shorter than frame")?;
        return DecodedImage::new(packed.to_vec(), width, height);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row is out of bounds")?);
    }
    DecodedImage::new(pixels, width, height)
}
