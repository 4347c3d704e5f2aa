//! Wire formats.
//!
//! Two families of messages live here:
//!
//! - **Primary frames**: bincode-encoded [`SyncMessage`]s exchanged with the
//!   relay over the WebSocket.
//!
//!   ```text
//!   ┌──────────┬──────────────┬──────────┐
//!   │ msg_type │ document     │ payload  │
//!   │ 1 byte   │ len + utf-8  │ variable │
//!   └──────────┴──────────────┴──────────┘
//!   ```
//!
//! - **Fallback bodies**: JSON objects exchanged with the poll endpoints.
//!   Byte fields are base64 (standard alphabet, padded).

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Message types for the primary sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector; the receiver answers with the missing updates
    SyncStep1 = 1,
    /// Updates the sender of a SyncStep1 is missing
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Presence (awareness) payload
    Awareness = 4,
    Ping = 7,
    Pong = 8,
}

/// A primary-transport frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Name of the document the frame belongs to
    pub document: String,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, document: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            document: document.to_string(),
            payload,
        }
    }

    pub fn sync_step1(document: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, document, state_vector)
    }

    pub fn sync_step2(document: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, document, diff)
    }

    pub fn update(document: &str, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, document, update)
    }

    pub fn awareness(document: &str, presence: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, document, presence)
    }

    pub fn pong(document: &str) -> Self {
        Self::new(MessageType::Pong, document, Vec::new())
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Decode(format!("encode frame: {e}")))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Decode(format!("decode frame: {e}")))?;
        Ok(msg)
    }
}

// ───────────────────────────────────────────────────────────────────
// Fallback bodies
// ───────────────────────────────────────────────────────────────────

/// Body of `POST …/poll/message/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessageRequest {
    pub message64: String,
}

/// Response of `POST …/poll/message/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessageResponse {
    /// `false` when the server could not apply the update without a sync
    pub updated: bool,
}

/// Body of `POST …/poll/sync/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(rename = "localDoc64")]
    pub local_doc64: String,
}

/// Response of `POST …/poll/sync/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(rename = "syncDoc64", default, skip_serializing_if = "Option::is_none")]
    pub sync_doc64: Option<String>,
}

/// Raw event data pushed on `GET …/poll/message/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "updatedDoc64", default, skip_serializing_if = "Option::is_none")]
    pub updated_doc64: Option<String>,
    #[serde(rename = "stateFingerprint", default, skip_serializing_if = "Option::is_none")]
    pub state_fingerprint: Option<String>,
    #[serde(rename = "awareness64", default, skip_serializing_if = "Option::is_none")]
    pub awareness64: Option<String>,
}

/// Decoded server push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushNotification {
    pub update: Option<Vec<u8>>,
    pub fingerprint: Option<String>,
    pub presence: Option<Vec<u8>>,
}

impl PushNotification {
    /// Parse the JSON data of one server-sent event.
    pub fn from_event_data(data: &str) -> Result<Self, SyncError> {
        let payload: PushPayload = serde_json::from_str(data)?;
        payload.try_into()
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_none() && self.fingerprint.is_none() && self.presence.is_none()
    }
}

impl TryFrom<PushPayload> for PushNotification {
    type Error = SyncError;

    fn try_from(payload: PushPayload) -> Result<Self, SyncError> {
        Ok(Self {
            update: decode_optional(payload.updated_doc64.as_deref())?,
            fingerprint: payload.state_fingerprint.filter(|f| !f.is_empty()),
            presence: decode_optional(payload.awareness64.as_deref())?,
        })
    }
}

/// Base64-encode bytes for a fallback body.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode an optional base64 field; empty strings count as absent.
pub fn decode_optional(field: Option<&str>) -> Result<Option<Vec<u8>>, SyncError> {
    match field {
        Some(s) if !s.is_empty() => Ok(Some(STANDARD.decode(s)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let msg = SyncMessage::update("doc-1", vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.msg_type, MessageType::Update);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_push_payload_full() {
        let data = format!(
            r#"{{"updatedDoc64":"{}","stateFingerprint":"abc=","awareness64":"{}"}}"#,
            encode_base64(&[1, 2]),
            encode_base64(&[9])
        );
        let n = PushNotification::from_event_data(&data).unwrap();
        assert_eq!(n.update, Some(vec![1, 2]));
        assert_eq!(n.fingerprint.as_deref(), Some("abc="));
        assert_eq!(n.presence, Some(vec![9]));
    }

    #[test]
    fn test_push_payload_awareness_only() {
        let data = format!(r#"{{"awareness64":"{}"}}"#, encode_base64(b"hi"));
        let n = PushNotification::from_event_data(&data).unwrap();
        assert!(n.update.is_none());
        assert!(n.fingerprint.is_none());
        assert_eq!(n.presence.as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn test_push_payload_empty_and_invalid() {
        assert!(PushNotification::from_event_data("{}").unwrap().is_empty());
        assert!(PushNotification::from_event_data(r#"{"updatedDoc64":""}"#)
            .unwrap()
            .is_empty());
        assert!(PushNotification::from_event_data("not json").is_err());
        assert!(matches!(
            PushNotification::from_event_data(r#"{"updatedDoc64":"%%%"}"#),
            Err(SyncError::Decode(_))
        ));
    }

    #[test]
    fn test_sync_response_field_names() {
        let resp: SyncResponse = serde_json::from_str(r#"{"syncDoc64":"AQI="}"#).unwrap();
        assert_eq!(resp.sync_doc64.as_deref(), Some("AQI="));
        let empty: SyncResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.sync_doc64.is_none());

        let body = serde_json::to_string(&SyncRequest {
            local_doc64: "AA==".into(),
        })
        .unwrap();
        assert_eq!(body, r#"{"localDoc64":"AA=="}"#);
    }
}
