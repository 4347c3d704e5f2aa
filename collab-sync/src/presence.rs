//! Presence (awareness) state: who is in the document and where their
//! cursor is.
//!
//! Presence is ephemeral. It travels next to document updates (inside
//! `Awareness` frames on the primary transport, or in the `awareness64`
//! field of a push event) but never touches the replicated document, so
//! applying presence never changes the document's state vector.
//!
//! ```text
//!  remote AwarenessMessage bytes
//!        │
//!        ▼
//!  PresenceRoom::apply_encoded()
//!        │
//!        ▼
//!  RemotePeer { name, color, anchor, head }   ──► host UI
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::SyncError;

/// RGBA color used to render a peer's caret and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a peer id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Awareness messages, bincode-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Peer entered the document.
    Join {
        user_id: Uuid,
        user_name: String,
        user_color: CursorColor,
    },

    /// Peer left the document.
    Leave { user_id: Uuid },

    /// Caret moved. `anchor == head` means no selection.
    Cursor {
        user_id: Uuid,
        anchor: u32,
        head: u32,
        /// Sender-side monotonic counter; older cursors are ignored.
        timestamp: u64,
    },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Decode(format!("encode awareness: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Decode(format!("decode awareness: {e}")))?;
        Ok(msg)
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { user_id, .. } => *user_id,
            AwarenessMessage::Leave { user_id } => *user_id,
            AwarenessMessage::Cursor { user_id, .. } => *user_id,
        }
    }
}

/// A remote peer as seen locally.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub user_id: Uuid,
    pub user_name: String,
    pub color: CursorColor,
    pub anchor: u32,
    pub head: u32,
    last_timestamp: u64,
    last_update: Instant,
}

impl RemotePeer {
    fn new(user_id: Uuid, user_name: String, color: CursorColor) -> Self {
        Self {
            user_id,
            user_name,
            color,
            anchor: 0,
            head: 0,
            last_timestamp: 0,
            last_update: Instant::now(),
        }
    }

    /// Whether the peer has an active (non-collapsed) selection.
    pub fn has_selection(&self) -> bool {
        self.anchor != self.head
    }
}

/// Presence state for every remote peer of one document.
pub struct PresenceRoom {
    local_user_id: Uuid,
    peers: HashMap<Uuid, RemotePeer>,
    timestamp_counter: u64,
    idle_timeout: Duration,
}

/// Silence after which a peer that never sent `Leave` is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

impl PresenceRoom {
    pub fn new(local_user_id: Uuid) -> Self {
        Self::with_idle_timeout(local_user_id, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(local_user_id: Uuid, idle_timeout: Duration) -> Self {
        Self {
            local_user_id,
            peers: HashMap::new(),
            timestamp_counter: 0,
            idle_timeout,
        }
    }

    /// Decode and apply an awareness payload.
    ///
    /// Returns whether any remote peer changed.
    pub fn apply_encoded(&mut self, bytes: &[u8]) -> Result<bool, SyncError> {
        let msg = AwarenessMessage::decode(bytes)?;
        Ok(self.handle_message(&msg))
    }

    /// Apply a decoded awareness message. Our own echoes are ignored.
    ///
    /// Idle peers are pruned first, so a peer that vanished without a
    /// `Leave` does not outlive the idle timeout.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        let pruned = self.prune_idle() > 0;
        if msg.user_id() == self.local_user_id {
            return pruned;
        }

        match msg {
            AwarenessMessage::Join {
                user_id,
                user_name,
                user_color,
            } => {
                self.peers
                    .insert(*user_id, RemotePeer::new(*user_id, user_name.clone(), *user_color));
                true
            }

            AwarenessMessage::Leave { user_id } => self.peers.remove(user_id).is_some(),

            AwarenessMessage::Cursor {
                user_id,
                anchor,
                head,
                timestamp,
            } => {
                // Cursor from a peer whose join we missed: track it with a placeholder name.
                let peer = self.peers.entry(*user_id).or_insert_with(|| {
                    RemotePeer::new(
                        *user_id,
                        format!("Peer-{}", &user_id.to_string()[..8]),
                        CursorColor::from_uuid(*user_id),
                    )
                });
                if *timestamp < peer.last_timestamp {
                    return false;
                }
                peer.anchor = *anchor;
                peer.head = *head;
                peer.last_timestamp = *timestamp;
                peer.last_update = Instant::now();
                true
            }
        }
    }

    /// Join message announcing the local user.
    pub fn create_join_message(&self, user_name: impl Into<String>) -> AwarenessMessage {
        AwarenessMessage::Join {
            user_id: self.local_user_id,
            user_name: user_name.into(),
            user_color: CursorColor::from_uuid(self.local_user_id),
        }
    }

    pub fn create_leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            user_id: self.local_user_id,
        }
    }

    /// Cursor message for the local user's caret.
    pub fn update_local_cursor(&mut self, anchor: u32, head: u32) -> AwarenessMessage {
        self.timestamp_counter += 1;
        AwarenessMessage::Cursor {
            user_id: self.local_user_id,
            anchor,
            head,
            timestamp: self.timestamp_counter,
        }
    }

    /// Remote peers, ordered by name.
    pub fn peers(&self) -> Vec<RemotePeer> {
        let mut peers: Vec<RemotePeer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        peers
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&RemotePeer> {
        self.peers.get(user_id)
    }

    /// Drop peers that have been silent longer than the idle timeout.
    pub fn prune_idle(&mut self) -> usize {
        let timeout = self.idle_timeout;
        let before = self.peers.len();
        self.peers.retain(|_, p| p.last_update.elapsed() <= timeout);
        before - self.peers.len()
    }
}
