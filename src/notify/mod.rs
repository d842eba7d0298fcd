//! Notification boundary.
//!
//! A `Notifier` delivers one text message, optionally with a PNG attachment,
//! and reports the HTTP status it got back. Anything other than 200 is a
//! delivery failure; callers log it and move on.

mod broadcast;
mod line;

use anyhow::Result;
use chrono::{Local, TimeZone};

pub use broadcast::BroadcastNotifier;
pub use line::{LineNotifier, LINE_NOTIFY_URL};

use crate::warning::Warning;

/// Status a notifier returns for a delivered message.
pub const STATUS_OK: u16 = 200;

/// Notification capability.
pub trait Notifier: Send {
    fn name(&self) -> &'static str;

    /// Send `message`, attaching `image` (PNG bytes) when the transport supports it.
    ///
    /// `Ok` carries the HTTP status, including non-2xx answers. `Err` means the
    /// request never completed.
    fn send_notification(&mut self, message: &str, image: Option<&[u8]>) -> Result<u16>;
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn send_notification(&mut self, message: &str, image: Option<&[u8]>) -> Result<u16> {
        (**self).send_notification(message, image)
    }
}

/// Sends every message through each inner notifier.
///
/// Reports 200 only when every transport delivered; otherwise the first
/// failing status. Fails with `Err` only when no transport got a response.
pub struct FanOutNotifier {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl FanOutNotifier {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl Notifier for FanOutNotifier {
    fn name(&self) -> &'static str {
        "fan-out"
    }

    fn send_notification(&mut self, message: &str, image: Option<&[u8]>) -> Result<u16> {
        let mut first_failure: Option<u16> = None;
        let mut last_error = None;
        let mut answered = false;
        for notifier in &mut self.notifiers {
            match notifier.send_notification(message, image) {
                Ok(status) => {
                    answered = true;
                    if status != STATUS_OK && first_failure.is_none() {
                        first_failure = Some(status);
                    }
                }
                Err(e) => {
                    log::error!("{} notifier failed: {:#}", notifier.name(), e);
                    last_error = Some(e);
                }
            }
        }
        match (answered, last_error) {
            (false, Some(e)) => Err(e),
            (_, Some(_)) => Ok(first_failure.unwrap_or(0)),
            (_, None) => Ok(first_failure.unwrap_or(STATUS_OK)),
        }
    }
}

/// Notifier that only logs. Used for dry runs and when no transport is configured.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send_notification(&mut self, message: &str, image: Option<&[u8]>) -> Result<u16> {
        log::info!(
            "notification (log only, image: {}): {}",
            image.map_or(0, <[u8]>::len),
            message.replace('\n', " | ")
        );
        Ok(STATUS_OK)
    }
}

/// Local `YYYY-mm-dd HH:MM:SS` rendering of a Unix timestamp.
pub fn format_timestamp(timestamp: f64) -> String {
    Local
        .timestamp_opt(timestamp.floor() as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{:.0}", timestamp))
}

/// Message body for one warning: `"{image_name}\n[{time}]\n{warning}"`.
pub fn compose_message(image_name: &str, timestamp: f64, warning: &Warning) -> String {
    format!("{}\n[{}]\n{}", image_name, format_timestamp(timestamp), warning)
}

/// Collapse a `ureq` outcome into a status code.
fn status_of(result: Result<ureq::Response, ureq::Error>) -> Result<u16> {
    match result {
        Ok(response) => Ok(response.status()),
        Err(ureq::Error::Status(code, _)) => Ok(code),
        Err(e) => Err(anyhow::Error::new(e)),
    }
}
