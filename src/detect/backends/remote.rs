use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::cancel::CancelToken;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionSet;
use crate::frame::Frame;
use crate::multipart::MultipartBody;

/// Access tokens are refreshed a little before the server-side 15 minute expiry.
const TOKEN_LIFETIME: Duration = Duration::from_secs(850);
const DETECT_ATTEMPTS: u32 = 2;

/// Configuration for the remote detection API.
#[derive(Clone, Debug)]
pub struct RemoteDetectorConfig {
    /// Base URL, e.g. "http://localhost:5000".
    pub api_url: String,
    /// Model selector passed as the `model` query parameter.
    pub model_key: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pause before retrying a failed detect call.
    pub retry_wait: Duration,
    pub timeout: Duration,
}

impl Default for RemoteDetectorConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000".to_string(),
            model_key: "yolov8x".to_string(),
            username: None,
            password: None,
            retry_wait: Duration::from_secs(3),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    msg: Option<String>,
}

/// Detector backed by the HTTP inference API.
///
/// Frames are uploaded as PNG; the response is the raw detection array.
pub struct RemoteBackend {
    config: RemoteDetectorConfig,
    agent: ureq::Agent,
    access_token: Option<String>,
    token_expiry: Option<Instant>,
    cancel: CancelToken,
}

impl RemoteBackend {
    pub fn new(config: RemoteDetectorConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            config,
            agent,
            access_token: None,
            token_expiry: None,
            cancel: CancelToken::new(),
        }
    }

    /// Abandon the retry wait when `cancel` fires. An in-flight request still
    /// runs to completion or to the request timeout.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn token_expired(&self) -> bool {
        self.token_expiry
            .map_or(true, |expiry| Instant::now() >= expiry)
    }

    fn ensure_authenticated(&mut self) -> Result<String> {
        if let Some(token) = &self.access_token {
            if !self.token_expired() {
                return Ok(token.clone());
            }
        }
        self.authenticate()
    }

    fn authenticate(&mut self) -> Result<String> {
        let response: TokenResponse = self
            .agent
            .post(&self.endpoint("token"))
            .send_json(json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .context("request detection api token")?
            .into_json()
            .context("parse detection api token response")?;
        if let Some(msg) = response.msg {
            return Err(anyhow!("detection api refused credentials: {}", msg));
        }
        let token = response
            .access_token
            .ok_or_else(|| anyhow!("token response contains neither 'msg' nor 'access_token'"))?;
        self.access_token = Some(token.clone());
        self.token_expiry = Some(Instant::now() + TOKEN_LIFETIME);
        log::debug!("detection api token refreshed");
        Ok(token)
    }

    fn detect_once(&mut self, png: &[u8], filename: &str) -> Result<DetectionSet> {
        let token = self.ensure_authenticated()?;
        let (content_type, body) = MultipartBody::new()
            .file("image", filename, "image/png", png)
            .finish();
        let result = self
            .agent
            .post(&self.endpoint("detect"))
            .query("model", &self.config.model_key)
            .set("Authorization", &format!("Bearer {}", token))
            .set("Content-Type", &content_type)
            .send_bytes(&body);
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(401, _)) => {
                // Force a fresh token on the next attempt.
                self.access_token = None;
                return Err(anyhow!("detection api rejected access token"));
            }
            Err(e) => return Err(anyhow::Error::new(e).context("post frame to detection api")),
        };
        let body: serde_json::Value = response
            .into_json()
            .context("read detection api response")?;
        if let Some(msg) = body.get("msg").and_then(|m| m.as_str()) {
            // Expired or revoked token; the next attempt logs in again.
            self.access_token = None;
            return Err(anyhow!("detection api error: {}", msg));
        }
        serde_json::from_value(body).context("parse detection api response")
    }
}

impl DetectorBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionSet> {
        let png = frame.to_png()?;
        let filename = format!("frame_{}.png", (frame.timestamp * 1_000_000.0) as u64);
        let mut attempt = 1;
        loop {
            match self.detect_once(&png, &filename) {
                Ok(detections) => return Ok(detections),
                Err(e) if attempt < DETECT_ATTEMPTS => {
                    log::warn!(
                        "detection attempt {} failed: {:#}; retrying in {:?}",
                        attempt,
                        e,
                        self.config.retry_wait
                    );
                    if self.cancel.wait(self.config.retry_wait) {
                        return Err(e.context("detection retry abandoned on shutdown"));
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn warm_up(&mut self) -> Result<()> {
        self.authenticate().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Category};
    use crate::test_support::MockHttpServer;

    fn config(url: &str) -> RemoteDetectorConfig {
        RemoteDetectorConfig {
            api_url: url.to_string(),
            model_key: "yolov8n".to_string(),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            retry_wait: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    fn frame() -> Frame {
        Frame::from_rgb(vec![10; 2 * 2 * 3], 2, 2, 1_700_000_000.0).unwrap()
    }

    #[test]
    fn remote_backend_authenticates_then_detects() -> Result<()> {
        let server = MockHttpServer::start(vec![
            (200, r#"{"access_token": "tok-1"}"#.to_string()),
            (200, "[[0, 0, 10, 10, 0.9, 0], [1, 1, 9, 9, 0.85, 2]]".to_string()),
            (200, "[]".to_string()),
        ]);
        let mut backend = RemoteBackend::new(config(&server.url));

        let detections = backend.detect(&frame())?;
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].bbox, BoundingBox::new(0, 0, 10, 10));
        assert!(detections[1].is(Category::NoHardhat));

        // Token is reused for the second frame.
        assert!(backend.detect(&frame())?.is_empty());

        let requests = server.finish();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].path, "/token");
        let creds: serde_json::Value = serde_json::from_slice(&requests[0].body)?;
        assert_eq!(creds["username"], "user");
        assert!(requests[1].path.starts_with("/detect?model=yolov8n"));
        assert_eq!(requests[1].header("Authorization"), Some("Bearer tok-1"));
        assert!(requests[1]
            .header("Content-Type")
            .is_some_and(|ct| ct.starts_with("multipart/form-data")));
        assert_eq!(requests[2].header("Authorization"), Some("Bearer tok-1"));
        Ok(())
    }

    #[test]
    fn remote_backend_retries_failed_detect_once() -> Result<()> {
        let server = MockHttpServer::start(vec![
            (200, r#"{"access_token": "tok"}"#.to_string()),
            (500, "{}".to_string()),
            (200, "[[5, 5, 6, 6, 0.5, 5]]".to_string()),
        ]);
        let mut backend = RemoteBackend::new(config(&server.url));
        let detections = backend.detect(&frame())?;
        assert_eq!(detections.len(), 1);
        assert_eq!(server.finish().len(), 3);
        Ok(())
    }

    #[test]
    fn remote_backend_relogs_in_after_token_error() -> Result<()> {
        let server = MockHttpServer::start(vec![
            (200, r#"{"access_token": "old"}"#.to_string()),
            (200, r#"{"msg": "Token has expired"}"#.to_string()),
            (200, r#"{"access_token": "new"}"#.to_string()),
            (200, "[]".to_string()),
        ]);
        let mut backend = RemoteBackend::new(config(&server.url));
        assert!(backend.detect(&frame())?.is_empty());
        let requests = server.finish();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[2].path, "/token");
        assert_eq!(requests[3].header("Authorization"), Some("Bearer new"));
        Ok(())
    }

    #[test]
    fn cancelled_backend_skips_the_retry() {
        let server = MockHttpServer::start(vec![
            (200, r#"{"access_token": "tok"}"#.to_string()),
            (500, "{}".to_string()),
        ]);
        let cancel = CancelToken::new();
        let mut cfg = config(&server.url);
        cfg.retry_wait = Duration::from_secs(60);
        let mut backend = RemoteBackend::new(cfg).with_cancel(cancel.clone());
        cancel.cancel();

        let start = Instant::now();
        let err = backend.detect(&frame()).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(format!("{:#}", err).contains("abandoned"));
        assert_eq!(server.finish().len(), 2);
    }

    #[test]
    fn remote_backend_surfaces_credential_errors() {
        let server = MockHttpServer::start(vec![
            (200, r#"{"msg": "bad credentials"}"#.to_string()),
            (200, r#"{"msg": "bad credentials"}"#.to_string()),
        ]);
        let mut backend = RemoteBackend::new(config(&server.url));
        let err = backend.detect(&frame()).unwrap_err();
        assert!(format!("{:#}", err).contains("bad credentials"));
        server.finish();
    }
}
