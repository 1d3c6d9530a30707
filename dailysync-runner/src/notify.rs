//! Summary delivery: notifiers, screenshotters and the fallback chain.
//!
//! Delivery never fails a run. The chain is text + image, then text only,
//! then the log.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{NotifierKind, NotifyConfig, ScreenshotKind};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notify i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook rejected message with status {0}")]
    Rejected(u16),

    #[error("{0}")]
    Unsupported(String),

    #[error("notifier misconfigured: {0}")]
    Config(String),
}

pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, text: &str, image: Option<&Path>) -> Result<(), NotifyError>;
}

/// Produces an image to attach to the summary, if one is available.
pub trait Screenshotter: Send + Sync {
    fn capture(&self, run_date: NaiveDate) -> Result<Option<PathBuf>, NotifyError>;
}

// ── Notifiers ────────────────────────────────────────────────────────

/// Writes the summary to the log. Always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, text: &str, image: Option<&Path>) -> Result<(), NotifyError> {
        for line in text.lines() {
            info!(target: "dailysync::summary", "{line}");
        }
        if let Some(image) = image {
            info!(target: "dailysync::summary", image = %image.display(), "attachment");
        }
        Ok(())
    }
}

/// Drops each message into its own timestamped directory under `dir`,
/// for pickup by an external sender.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    dir: PathBuf,
}

impl OutboxNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn next_slot(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let mut slot = self.dir.join(&stamp);
        let mut n = 1;
        while slot.exists() {
            slot = self.dir.join(format!("{stamp}-{n}"));
            n += 1;
        }
        slot
    }
}

impl Notifier for OutboxNotifier {
    fn name(&self) -> &str {
        "outbox"
    }

    fn send(&self, text: &str, image: Option<&Path>) -> Result<(), NotifyError> {
        let slot = self.next_slot();
        fs::create_dir_all(&slot)?;
        if let Some(image) = image {
            let file_name = image
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("attachment"));
            if let Err(e) = fs::copy(image, slot.join(file_name)) {
                // Leave no half-written message behind.
                let _ = fs::remove_dir_all(&slot);
                return Err(e.into());
            }
        }
        fs::write(slot.join("message.txt"), text)?;
        info!(slot = %slot.display(), "summary written to outbox");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookText<'a> {
    msg_type: &'static str,
    content: WebhookContent<'a>,
}

#[derive(Serialize)]
struct WebhookContent<'a> {
    text: &'a str,
}

/// Posts the summary as JSON to a chat webhook. Images are not supported.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, text: &str, image: Option<&Path>) -> Result<(), NotifyError> {
        if image.is_some() {
            return Err(NotifyError::Unsupported(
                "webhook notifier cannot attach images".into(),
            ));
        }
        let body = WebhookText {
            msg_type: "text",
            content: WebhookContent { text },
        };
        let response = self.client.post(&self.url).json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

// ── Screenshotters ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct NoScreenshot;

impl Screenshotter for NoScreenshot {
    fn capture(&self, _run_date: NaiveDate) -> Result<Option<PathBuf>, NotifyError> {
        Ok(None)
    }
}

/// Attaches a pre-rendered image produced by an earlier step.
#[derive(Debug, Clone)]
pub struct FileScreenshot {
    path: PathBuf,
}

impl FileScreenshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Screenshotter for FileScreenshot {
    fn capture(&self, _run_date: NaiveDate) -> Result<Option<PathBuf>, NotifyError> {
        if self.path.is_file() {
            Ok(Some(self.path.clone()))
        } else {
            Err(NotifyError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("screenshot not found at {}", self.path.display()),
            )))
        }
    }
}

// ── Selection & delivery ─────────────────────────────────────────────

pub fn build_notifier(config: &NotifyConfig) -> Result<Box<dyn Notifier>, NotifyError> {
    match config.kind {
        NotifierKind::Log => Ok(Box::new(LogNotifier)),
        NotifierKind::Outbox => {
            let dir = config
                .outbox_dir
                .clone()
                .ok_or_else(|| NotifyError::Config("outbox_dir is not set".into()))?;
            Ok(Box::new(OutboxNotifier::new(dir)))
        }
        NotifierKind::Webhook => {
            let url = config
                .webhook_url
                .clone()
                .ok_or_else(|| NotifyError::Config("webhook_url is not set".into()))?;
            Ok(Box::new(WebhookNotifier::new(url)?))
        }
    }
}

pub fn build_screenshotter(config: &NotifyConfig) -> Box<dyn Screenshotter> {
    match (config.screenshot, &config.screenshot_path) {
        (ScreenshotKind::File, Some(path)) => Box::new(FileScreenshot::new(path.clone())),
        _ => Box::new(NoScreenshot),
    }
}

/// How far down the fallback chain delivery got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    TextAndImage,
    TextOnly,
    LogOnly,
}

/// Deliver `text` through `notifier`, falling back as attachments or the
/// notifier itself fail.
pub fn deliver_summary(
    notifier: &dyn Notifier,
    screenshotter: &dyn Screenshotter,
    run_date: NaiveDate,
    text: &str,
) -> Delivery {
    let image = match screenshotter.capture(run_date) {
        Ok(image) => image,
        Err(e) => {
            warn!(error = %e, "screenshot unavailable, sending text only");
            None
        }
    };

    if let Some(image) = image {
        match notifier.send(text, Some(&image)) {
            Ok(()) => return Delivery::TextAndImage,
            Err(e) => warn!(notifier = notifier.name(), error = %e, "image delivery failed"),
        }
    }

    match notifier.send(text, None) {
        Ok(()) => Delivery::TextOnly,
        Err(e) => {
            warn!(notifier = notifier.name(), error = %e, "delivery failed, logging summary");
            let _ = LogNotifier.send(text, None);
            Delivery::LogOnly
        }
    }
}
