use anyhow::Result;

use super::result::DetectionSet;
use crate::frame::Frame;

/// Detector capability.
///
/// Maps one frame to the raw, unreconciled detections of the model behind it.
/// Implementations may be a remote inference API, a local model, or a stub;
/// the pipeline only relies on this contract.
///
/// Implementations must treat the frame as read-only and must not keep it
/// past the `detect` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionSet>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: DetectorBackend + ?Sized> DetectorBackend for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionSet> {
        (**self).detect(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
