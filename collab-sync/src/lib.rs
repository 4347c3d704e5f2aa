//! # collab-sync — Dual-transport CRDT synchronization client
//!
//! Keeps a local yrs document consistent with a server-held copy. Traffic
//! normally flows over a persistent WebSocket to a co-located relay; when
//! that transport keeps failing the session switches to HTTP polling plus a
//! server-sent-events push channel and reconciles by fingerprint.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────────────────────┐
//!                       │ CollaborationSession │
//!                       └──────────┬───────────┘
//!            ┌─────────────────────┼─────────────────────┐
//!            ▼                     ▼                     ▼
//!   ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐
//!   │ WebSocketPrimary│   │ FailureDetector │   │   Reconciler    │
//!   │ (relay, binary) │   │ PRIMARY⇄FALLBACK│   │ staleness, sync │
//!   └────────┬────────┘   └─────────────────┘   └────────┬────────┘
//!            │                                           │
//!            ▼                                           ▼
//!   ┌─────────────────┐                         ┌─────────────────┐
//!   │  ReplicatedDoc  │ ◄────────────────────── │  HttpFallback   │
//!   │   (yrs Doc)     │                         │  POST + SSE     │
//!   └─────────────────┘                         └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`fingerprint`] — SHA-256 state-vector fingerprints
//! - [`document`] — Shared handle over the yrs document
//! - [`protocol`] — Binary frames and fallback JSON bodies
//! - [`presence`] — Awareness state of remote peers
//! - [`primary`] — WebSocket transport with reconnect backoff
//! - [`fallback`] — HTTP/SSE fallback transport
//! - [`detector`] — Transport failure state machine
//! - [`reconcile`] — Fallback reconciliation engine
//! - [`session`] — Composition root

pub mod config;
pub mod detector;
pub mod document;
pub mod error;
pub mod fallback;
pub mod fingerprint;
pub mod presence;
pub mod primary;
pub mod protocol;
pub mod reconcile;
pub mod session;

// Re-exports for convenience
pub use config::{ReconnectConfig, SyncConfig, DEFAULT_RELAY_URL};
pub use detector::{
    transition, DetectorEffect, DetectorState, FailureDetector, TransportEvent, TransportMode,
};
pub use document::ReplicatedDoc;
pub use error::SyncError;
pub use fallback::{
    poll_url, FallbackTransport, HttpFallback, PushChannel, PushItem, ReconcileResponse,
    RelayResponse,
};
pub use fingerprint::{fingerprint, fingerprint_state_vector};
pub use presence::{AwarenessMessage, CursorColor, PresenceRoom, RemotePeer};
pub use primary::{ConnectionStatus, PrimaryEvent, PrimaryTransport, WebSocketPrimary};
pub use protocol::{MessageType, PushNotification, SyncMessage};
pub use reconcile::{PushVerdict, ReconcileOutcome, Reconciler, RelayOutcome};
pub use session::{CollaborationSession, SessionEvent, SessionEventHandler, SyncHealth};
