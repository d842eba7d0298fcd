use std::time::Duration;

use anyhow::{Context, Result};

use super::{status_of, Notifier};
use crate::multipart::MultipartBody;

pub const LINE_NOTIFY_URL: &str = "https://notify-api.line.me/api/notify";

/// LINE Notify transport.
///
/// The message travels as the `message` query parameter; an image is sent as
/// the multipart field `imageFile`.
pub struct LineNotifier {
    token: String,
    endpoint: String,
    agent: ureq::Agent,
}

impl LineNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_endpoint(token, LINE_NOTIFY_URL)
    }

    pub fn with_endpoint(token: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            endpoint: endpoint.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
        }
    }
}

impl Notifier for LineNotifier {
    fn name(&self) -> &'static str {
        "line"
    }

    fn send_notification(&mut self, message: &str, image: Option<&[u8]>) -> Result<u16> {
        let request = self
            .agent
            .post(&self.endpoint)
            .query("message", message)
            .set("Authorization", &format!("Bearer {}", self.token));
        let result = match image {
            Some(png) => {
                let (content_type, body) = MultipartBody::new()
                    .file("imageFile", "image.png", "image/png", png)
                    .finish();
                request.set("Content-Type", &content_type).send_bytes(&body)
            }
            None => request.call(),
        };
        status_of(result).context("post LINE notification")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockHttpServer;

    #[test]
    fn sends_message_and_image() -> Result<()> {
        let server = MockHttpServer::start(vec![(200, r#"{"status": 200}"#.to_string())]);
        let mut notifier =
            LineNotifier::with_endpoint("line-token", format!("{}/api/notify", server.url));
        let status = notifier.send_notification("cam\nWarning: hi", Some(b"PNGDATA"))?;
        assert_eq!(status, 200);

        let requests = server.finish();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert!(request.path.starts_with("/api/notify?message=cam"));
        assert_eq!(request.header("Authorization"), Some("Bearer line-token"));
        let body = String::from_utf8_lossy(&request.body);
        assert!(body.contains("name=\"imageFile\"; filename=\"image.png\""));
        assert!(body.contains("PNGDATA"));
        Ok(())
    }

    #[test]
    fn reports_rejections_as_status() -> Result<()> {
        let server = MockHttpServer::start(vec![(401, r#"{"status": 401}"#.to_string())]);
        let mut notifier = LineNotifier::with_endpoint("bad", format!("{}/api/notify", server.url));
        assert_eq!(notifier.send_notification("text only", None)?, 401);
        assert!(server.finish()[0].body.is_empty());
        Ok(())
    }
}
