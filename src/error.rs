//! Error taxonomy shared by every layer of the pipeline.
//!
//! Leaf services return `anyhow::Result` internally; a `DropcrateError` is
//! only constructed at the boundary that turns a failure into an
//! `item-error` event or an HTTP response.

use serde::{Deserialize, Serialize};

/// Stable, wire-serializable error taxonomy surfaced to subscribers and API
/// callers.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind")]
pub enum DropcrateError {
    #[error("required external tool is unavailable: {tool}")]
    ToolUnavailable { tool: String },

    #[error("invalid input: {message}")]
    InputInvalid { message: String },

    #[error("extractor error ({kind:?}): {message}")]
    ExtractorError {
        kind: ExtractorErrorKind,
        message: String,
        hint: Option<String>,
    },

    #[error("fingerprint lookup unavailable: {message}")]
    FingerprintUnavailable { message: String },

    #[error("processing error during {step:?}: {message}")]
    ProcessingError {
        step: ProcessingStep,
        message: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DropcrateError {
    /// Short user-facing message, independent of any `hint`.
    pub fn message(&self) -> String {
        match self {
            DropcrateError::ToolUnavailable { tool } => {
                format!("required tool unavailable: {tool}")
            }
            DropcrateError::InputInvalid { message } => message.clone(),
            DropcrateError::ExtractorError { message, .. } => message.clone(),
            DropcrateError::FingerprintUnavailable { message } => message.clone(),
            DropcrateError::ProcessingError { message, .. } => message.clone(),
            DropcrateError::Cancelled => "cancelled".to_string(),
            DropcrateError::Internal { message } => message.clone(),
        }
    }

    /// Optional hint surfaced alongside the message.
    pub fn hint(&self) -> Option<String> {
        match self {
            DropcrateError::ExtractorError { hint, .. } => hint.clone(),
            _ => None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DropcrateError::Internal {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for DropcrateError {
    fn from(err: anyhow::Error) -> Self {
        DropcrateError::Internal {
            message: err.to_string(),
        }
    }
}

/// Extractor stderr classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtractorErrorKind {
    RateLimited,
    GeoBlocked,
    AgeRestricted,
    Private,
    Unavailable,
    LoginRequired,
    Copyright,
    NetworkError,
    Unsupported,
    Cancelled,
    Unknown,
}

impl ExtractorErrorKind {
    /// Whether the scheduler should retry an error of this kind.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ExtractorErrorKind::RateLimited | ExtractorErrorKind::NetworkError
        )
    }

    /// A short user-facing hint, per kind.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            ExtractorErrorKind::RateLimited => {
                Some("The source is rate-limiting requests; it will be retried automatically.")
            }
            ExtractorErrorKind::GeoBlocked => {
                Some("This content is not available from the server's region.")
            }
            ExtractorErrorKind::AgeRestricted => {
                Some("Set cookies-from-browser to use your login for age-gated content.")
            }
            ExtractorErrorKind::Private => {
                Some("This video is private and cannot be downloaded.")
            }
            ExtractorErrorKind::Unavailable => Some("The source video is no longer available."),
            ExtractorErrorKind::LoginRequired => {
                Some("Set cookies-from-browser to use your login.")
            }
            ExtractorErrorKind::Copyright => Some("The source removed this video for copyright."),
            ExtractorErrorKind::NetworkError => {
                Some("A network error occurred; it will be retried automatically.")
            }
            ExtractorErrorKind::Unsupported => Some("This URL is not supported by the extractor."),
            ExtractorErrorKind::Cancelled | ExtractorErrorKind::Unknown => None,
        }
    }

    /// Classify combined stderr output from the extractor process.
    pub fn classify(stderr: &str) -> Self {
        let haystack = stderr.to_lowercase();
        let has = |needle: &str| haystack.contains(needle);

        if has("429") || has("too many requests") || has("rate limit") {
            return ExtractorErrorKind::RateLimited;
        }
        if has("not available in your country") || has("geo") || has("blocked") {
            return ExtractorErrorKind::GeoBlocked;
        }
        if has("age") && (has("restricted") || has("gate")) {
            return ExtractorErrorKind::AgeRestricted;
        }
        if has("private video") {
            return ExtractorErrorKind::Private;
        }
        if has("video unavailable") || has("removed") || has("deleted") {
            return ExtractorErrorKind::Unavailable;
        }
        if has("sign in") || has("login") || has("members only") {
            return ExtractorErrorKind::LoginRequired;
        }
        if has("copyright") || has("claimed") || has("takedown") {
            return ExtractorErrorKind::Copyright;
        }
        if has("network") || has("connection") || has("timeout") || has("timed out") {
            return ExtractorErrorKind::NetworkError;
        }
        if has("unsupported url") || has("unable to extract") {
            return ExtractorErrorKind::Unsupported;
        }
        ExtractorErrorKind::Unknown
    }
}

/// Processing stage identifiers for `ProcessingError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessingStep {
    Normalize,
    Transcode,
    Tag,
    Finalize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limited() {
        assert_eq!(
            ExtractorErrorKind::classify("HTTP Error 429: Too Many Requests"),
            ExtractorErrorKind::RateLimited
        );
        assert!(ExtractorErrorKind::RateLimited.retryable());
    }

    #[test]
    fn classifies_private_video_as_non_retryable() {
        let kind = ExtractorErrorKind::classify("ERROR: Private video. Sign in if you've been invited");
        // "sign in" also appears, but private-video check runs first.
        assert_eq!(kind, ExtractorErrorKind::Private);
        assert!(!kind.retryable());
    }

    #[test]
    fn classifies_age_restricted_requires_both_tokens() {
        assert_eq!(
            ExtractorErrorKind::classify("Sign in to confirm your age"),
            ExtractorErrorKind::LoginRequired
        );
        assert_eq!(
            ExtractorErrorKind::classify("This video is age restricted"),
            ExtractorErrorKind::AgeRestricted
        );
    }

    #[test]
    fn unknown_otherwise() {
        assert_eq!(
            ExtractorErrorKind::classify("some unrelated failure"),
            ExtractorErrorKind::Unknown
        );
    }
}
