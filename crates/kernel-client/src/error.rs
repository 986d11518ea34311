//! Error types shared by every part of the client.

use std::fmt;

use kernel_wire::{Channel, CodecError};
use serde::Deserialize;

/// An HTTP response from the Jupyter server with an unexpected status.
///
/// The server reports failures as `{"message": ..., "traceback": ...}`; when
/// the body is not in that shape the raw text (or the status line) is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub status: u16,
    pub message: String,
    pub traceback: String,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
}

impl ResponseError {
    /// Build an error from a status, its reason phrase and the response body.
    pub fn from_parts(status: u16, status_text: &str, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message
            .filter(|m| !m.is_empty())
            .or_else(|| {
                let text = body.trim();
                (!text.is_empty() && serde_json::from_str::<serde_json::Value>(text).is_err())
                    .then(|| text.to_string())
            })
            .unwrap_or_else(|| format!("Invalid response: {status} {status_text}"));
        Self {
            status,
            message,
            traceback: parsed.traceback.unwrap_or_default(),
        }
    }

    /// Consume a response and turn it into an error.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let reason = status.canonical_reason().unwrap_or("");
        let body = response.text().await.unwrap_or_default();
        Self::from_parts(status.as_u16(), reason, &body)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for ResponseError {}

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error("Invalid {kind} model: {reason}")]
    Validation { kind: &'static str, reason: String },

    #[error("Can only be used for notebook server requests: {url}")]
    UrlOutsideBase { url: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Kernel is unavailable: {0}")]
    KernelUnavailable(String),

    #[error("Disposed before completion")]
    Disposed,

    #[error("Kernel is dead")]
    KernelDead,

    #[error("Kernel is restarting")]
    KernelRestarting,

    #[error("Comm {comm_id} is disposed")]
    CommDisposed { comm_id: String },

    #[error("Message for the {channel} channel sent through {expected}")]
    InvalidChannel { channel: Channel, expected: Channel },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub(crate) fn validation(kind: &'static str, reason: impl Into<String>) -> Self {
        ClientError::Validation {
            kind,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Transport(_) => true,
            ClientError::Response(e) => e.status >= 500 || e.status == 424 || e.status == 429,
            _ => false,
        }
    }

    /// Whether the server itself could not be reached.
    ///
    /// Managers report these as connection failures rather than as errors of
    /// the request that hit them.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Response(e) => e.status == 503 || e.status == 424,
            _ => false,
        }
    }

    /// The HTTP status, when this error came from a server response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Response(e) => Some(e.status),
            ClientError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_body_supplies_message_and_traceback() {
        let err = ResponseError::from_parts(
            500,
            "Internal Server Error",
            r#"{"message": "Kernel does not exist", "traceback": "Traceback..."}"#,
        );
        assert_eq!(err.message, "Kernel does not exist");
        assert_eq!(err.traceback, "Traceback...");
    }

    #[test]
    fn empty_body_falls_back_to_status_line() {
        let err = ResponseError::from_parts(404, "Not Found", "");
        assert_eq!(err.message, "Invalid response: 404 Not Found");
        assert!(err.traceback.is_empty());
    }

    #[test]
    fn plain_text_body_is_kept() {
        let err = ResponseError::from_parts(502, "Bad Gateway", "upstream went away");
        assert_eq!(err.message, "upstream went away");
    }

    #[test]
    fn transient_statuses() {
        let response = |status| ClientError::Response(ResponseError::from_parts(status, "", ""));
        assert!(response(503).is_transient());
        assert!(response(424).is_transient());
        assert!(response(429).is_transient());
        assert!(!response(404).is_transient());
        assert!(!ClientError::validation("session", "missing id").is_transient());
    }

    #[test]
    fn connection_failures_are_503_and_424() {
        let response = |status| ClientError::Response(ResponseError::from_parts(status, "", ""));
        assert!(response(503).is_connection_failure());
        assert!(response(424).is_connection_failure());
        assert!(!response(500).is_connection_failure());
        assert_eq!(response(500).status(), Some(500));
    }
}
