use std::collections::VecDeque;

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionSet;
use crate::frame::Frame;

/// Stub backend for tests and dry runs.
///
/// Returns scripted detection sets in order, then keeps repeating the
/// fallback set once the script is exhausted.
#[derive(Default)]
pub struct StubBackend {
    script: VecDeque<DetectionSet>,
    fallback: DetectionSet,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always return `detections`.
    pub fn fixed(detections: DetectionSet) -> Self {
        Self {
            fallback: detections,
            ..Self::default()
        }
    }

    /// Return each set in `script` once, in order, then empty sets.
    pub fn scripted(script: Vec<DetectionSet>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    /// Number of frames this backend has seen.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionSet> {
        self.calls += 1;
        Ok(self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
