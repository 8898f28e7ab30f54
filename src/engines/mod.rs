//! OCR engine interface.

use std::{error, fmt, time::Duration};

use reqwest::StatusCode;
use schemars::JsonSchema;

use crate::{messages::MessageCause, preprocess::PreparedImage, prelude::*};

pub mod azure;
#[cfg(test)]
pub mod scripted;
pub mod tesseract;

/// Which role does an engine play?
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// The cloud engine we try first.
    Primary,
    /// The local engine we use when the primary can't give us good text.
    Fallback,
}

/// The output of a single successful engine call.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineResult {
    /// The recognized text.
    pub text: String,

    /// How much we trust `text`, from 0.0 to 1.0.
    pub confidence: f64,

    /// Engine-specific details, for diagnostics.
    pub raw_metadata: Value,
}

impl EngineResult {
    /// Does this result contain any text worth returning?
    pub fn has_usable_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// How did an engine call fail?
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    /// The engine did not answer in time.
    Timeout,
    /// Credentials were rejected or missing.
    Auth,
    /// The engine asked us to slow down, or is overloaded.
    RateLimit,
    /// The engine answered with something we could not parse.
    MalformedResponse,
    /// Anything else.
    Unknown,
}

impl EngineErrorKind {
    /// Classify an HTTP error status.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => EngineErrorKind::Auth,
            429 | 503 => EngineErrorKind::RateLimit,
            408 | 504 => EngineErrorKind::Timeout,
            _ => EngineErrorKind::Unknown,
        }
    }

    /// The user-facing message for this kind of failure.
    pub fn message_cause(self) -> MessageCause {
        match self {
            EngineErrorKind::Timeout => MessageCause::EngineTimeout,
            EngineErrorKind::Auth => MessageCause::EngineAuth,
            EngineErrorKind::RateLimit => MessageCause::EngineRateLimited,
            EngineErrorKind::MalformedResponse => MessageCause::EngineMalformedResponse,
            EngineErrorKind::Unknown => MessageCause::EngineUnknown,
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineErrorKind::Timeout => "timeout",
            EngineErrorKind::Auth => "auth",
            EngineErrorKind::RateLimit => "rate_limit",
            EngineErrorKind::MalformedResponse => "malformed_response",
            EngineErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// An error from an OCR engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineError {
    /// What kind of error was this?
    pub kind: EngineErrorKind,

    /// Technical details. Never shown to end users.
    pub message: String,
}

impl EngineError {
    /// Create a new engine error.
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an error from an unexpected HTTP status, including whatever
    /// the server had to say.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        Self::new(
            EngineErrorKind::from_status(status),
            format!("HTTP {status}: {}", truncate(body, 500)),
        )
    }

    /// Create an error from a [`reqwest::Error`].
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(EngineErrorKind::Timeout, format!("request timed out: {err}"))
        } else if let Some(status) = err.status() {
            Self::new(EngineErrorKind::from_status(status), err.to_string())
        } else if err.is_decode() {
            Self::new(EngineErrorKind::MalformedResponse, err.to_string())
        } else {
            Self::new(EngineErrorKind::Unknown, err.to_string())
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl error::Error for EngineError {}

/// Interface shared by all OCR engines.
///
/// Implementations must be cancel-safe: if the returned future is dropped, any
/// request or child process it started should be abandoned.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// A short name for logs and metadata.
    fn name(&self) -> &'static str;

    /// Recognize the text in a single page image.
    async fn analyze(
        &self,
        image: &PreparedImage,
        timeout: Duration,
    ) -> Result<EngineResult, EngineError>;
}

/// Shorten `s` to at most `max_chars` characters.
fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
