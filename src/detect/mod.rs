//! Detection boundary and reconciliation.
//!
//! - `geometry`: integer box math shared by every pass
//! - `result`: label table and per-frame detection sets
//! - `reconcile`: removal of duplicate compliant/non-compliant labels
//! - `backend`/`backends`: the detector capability and its implementations

mod backend;
mod backends;
pub mod geometry;
pub mod reconcile;
mod result;

pub use backend::DetectorBackend;
pub use backends::{RemoteBackend, RemoteDetectorConfig, StubBackend};
pub use geometry::{calculate_area, BoundingBox};
pub use reconcile::{CategoryPairing, DetectionReconciler, DEFAULT_OVERLAP_THRESHOLD};
pub use result::{Category, Detection, DetectionSet};
