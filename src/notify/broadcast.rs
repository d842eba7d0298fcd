use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use super::{status_of, Notifier};

/// Posts `{"message": ...}` to a site broadcast system. Images are not forwarded.
pub struct BroadcastNotifier {
    url: String,
    agent: ureq::Agent,
}

impl BroadcastNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
        }
    }
}

impl Notifier for BroadcastNotifier {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn send_notification(&mut self, message: &str, _image: Option<&[u8]>) -> Result<u16> {
        let result = self
            .agent
            .post(&self.url)
            .send_json(json!({ "message": message }));
        status_of(result).context("post broadcast message")
    }
}
