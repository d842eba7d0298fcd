pub mod remote;
pub mod stub;

pub use remote::{RemoteBackend, RemoteDetectorConfig};
pub use stub::StubBackend;
