//! Error taxonomy for the sync client.
//!
//! None of these are fatal to a session: the session logs them, records the
//! last one for display, and lets the next event (push notification, local
//! edit, reconnect) drive recovery.

use thiserror::Error;

/// Errors raised by the sync client and its transports.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Any network or HTTP failure on a fallback call.
    #[error("transport error{}: {}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default(), .message)]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The server refused an outgoing relay: edit permission was revoked.
    #[error("edit permission revoked by server")]
    Authorization,

    /// The push channel dropped or could not be opened.
    #[error("push channel error: {0}")]
    Stream(String),

    /// A payload could not be decoded (base64, JSON, bincode or yrs update).
    #[error("decode error: {0}")]
    Decode(String),

    /// The replicated document rejected an operation.
    #[error("document error: {0}")]
    Document(String),

    /// The session configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl SyncError {
    /// Shorthand for a transport failure without an HTTP status.
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// Whether this error signals revoked edit permission.
    pub fn is_authorization(&self) -> bool {
        matches!(self, SyncError::Authorization)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(403) {
            return SyncError::Authorization;
        }
        SyncError::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl From<base64::DecodeError> for SyncError {
    fn from(e: base64::DecodeError) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
