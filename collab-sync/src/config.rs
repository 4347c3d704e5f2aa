//! Session configuration.
//!
//! Every field has a default so a host can load a partial JSON document:
//!
//! ```json
//! { "document_name": "doc-42", "url": "wss://docs.example.org/ws/?room=doc-42", "can_edit": true }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SyncError;

/// Trusted co-located relay the primary transport connects to.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:6666";

/// Primary-transport reconnection policy.
///
/// This is the socket's own retry loop; the failure detector never
/// reconnects on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for the exponential backoff, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay before reconnection attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration for a [`CollaborationSession`](crate::session::CollaborationSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identity of the replicated document (room name).
    pub document_name: String,
    /// Externally supplied collaboration URL. Only used to derive the
    /// fallback poll endpoints.
    pub url: String,
    /// Local relay endpoint for the primary transport.
    pub relay_url: String,
    /// Whether the local user may edit the document.
    pub can_edit: bool,
    /// Display name announced in presence messages.
    pub user_name: String,
    /// Primary close events tolerated before switching to fallback.
    pub failure_threshold: u32,
    /// Consecutive fingerprint mismatches tolerated before a forced sync.
    pub staleness_threshold: u32,
    /// Fixed delay before reopening a failed push channel, in milliseconds.
    pub push_reconnect_delay_ms: u64,
    /// Timeout applied to each fallback request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Silence after which a remote peer is dropped from presence, in milliseconds.
    pub presence_idle_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            document_name: String::new(),
            url: String::new(),
            relay_url: DEFAULT_RELAY_URL.to_string(),
            can_edit: false,
            user_name: "Anonymous".to_string(),
            failure_threshold: 2,
            staleness_threshold: 5,
            push_reconnect_delay_ms: 5_000,
            request_timeout_ms: 10_000,
            presence_idle_timeout_ms: 30_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a configuration with default thresholds.
    pub fn new(document_name: impl Into<String>, url: impl Into<String>, can_edit: bool) -> Self {
        Self {
            document_name: document_name.into(),
            url: url.into(),
            can_edit,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations a session cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.document_name.trim().is_empty() {
            return Err(SyncError::Config("document_name is empty".into()));
        }
        url::Url::parse(&self.url)?;
        url::Url::parse(&self.relay_url)?;
        if self.presence_idle_timeout_ms == 0 {
            return Err(SyncError::Config("presence_idle_timeout_ms must be positive".into()));
        }
        if self.staleness_threshold == 0 {
            return Err(SyncError::Config("staleness_threshold must be at least 1".into()));
        }
        Ok(())
    }

    pub fn push_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.push_reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn presence_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_idle_timeout_ms)
    }

    /// Endpoint the primary transport dials: the relay, scoped to the document.
    ///
    /// The document name becomes one percent-encoded path segment.
    pub fn relay_endpoint(&self) -> Result<String, SyncError> {
        let mut url = url::Url::parse(&self.relay_url)?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("relay_url {} cannot take a path", self.relay_url)))?
            .pop_if_empty()
            .push(&self.document_name);
        Ok(url.to_string())
    }
}
