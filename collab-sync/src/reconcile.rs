//! Fallback-mode reconciliation.
//!
//! While the session runs on the fallback transport, the server announces
//! its state fingerprint with every push. Each mismatch bumps a staleness
//! counter; once the counter reaches its threshold (or on an explicit force)
//! the client sends its state vector and applies whatever the server returns.
//!
//! ```text
//!   push ──► apply presence/update ──► fingerprint equal? ──yes──► staleness := 0
//!                                            │ no
//!                                            ▼
//!                                     staleness += 1 ──► ≥ threshold? ──► reconcile(force)
//! ```
//!
//! At most one reconciliation is in flight; concurrent triggers are dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::document::ReplicatedDoc;
use crate::error::SyncError;
use crate::fallback::FallbackTransport;
use crate::fingerprint::fingerprint;
use crate::presence::{PresenceRoom, RemotePeer};
use crate::protocol::PushNotification;

/// How a push notification's fingerprint compared to the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushVerdict {
    /// Fingerprints match; staleness was reset.
    InSync,
    /// Fingerprints differ. `escalate` is set once staleness reached the threshold.
    Diverged { escalate: bool },
    /// The push carried no fingerprint.
    Unverified,
}

/// Result of one [`Reconciler::reconcile`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Not in fallback mode, or the session is gone.
    Skipped,
    /// Another reconciliation is already running.
    InFlight,
    /// Below the staleness threshold; no request sent.
    Deferred,
    Applied { server_update: bool },
    Failed(String),
    /// The response arrived after teardown and was discarded.
    Abandoned,
}

/// Result of relaying one local update over the fallback transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Not in fallback mode, or the session is gone.
    Skipped,
    /// Edit permission is not held; nothing was sent.
    ReadOnly,
    Accepted,
    /// The server refused the update and one forced reconciliation ran.
    Reconciled(ReconcileOutcome),
    PermissionRevoked,
    Failed(String),
}

/// Clears the in-flight flag however the reconciliation ends, including
/// when its future is dropped mid-request.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Staleness tracking and fallback-mode document exchange.
pub struct Reconciler {
    doc: ReplicatedDoc,
    transport: Arc<dyn FallbackTransport>,
    presence: Arc<Mutex<PresenceRoom>>,
    staleness_threshold: u32,

    staleness: AtomicU32,
    syncing: AtomicBool,
    fallback_active: AtomicBool,
    can_edit: AtomicBool,
    destroyed: AtomicBool,
    reconciliations: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Reconciler {
    pub fn new(
        doc: ReplicatedDoc,
        transport: Arc<dyn FallbackTransport>,
        presence: Arc<Mutex<PresenceRoom>>,
        staleness_threshold: u32,
        can_edit: bool,
    ) -> Self {
        Self {
            doc,
            transport,
            presence,
            staleness_threshold,
            staleness: AtomicU32::new(0),
            syncing: AtomicBool::new(false),
            fallback_active: AtomicBool::new(false),
            can_edit: AtomicBool::new(can_edit),
            destroyed: AtomicBool::new(false),
            reconciliations: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Apply one push notification and compare fingerprints.
    ///
    /// Presence is applied first and never touches the document. The
    /// fingerprint is compared after the pushed update (if any) was merged.
    pub fn apply_push(&self, notification: &PushNotification) -> PushVerdict {
        if let Some(presence) = &notification.presence {
            let applied = self
                .presence
                .lock()
                .map_err(|_| SyncError::Document("presence state poisoned".into()))
                .and_then(|mut room| room.apply_encoded(presence));
            if let Err(e) = applied {
                log::warn!("Ignoring pushed presence: {e}");
                self.record_error(&e);
            }
        }

        if let Some(update) = &notification.update {
            if let Err(e) = self.doc.apply_update(update) {
                log::warn!("Failed to apply pushed update: {e}");
                self.record_error(&e);
            }
        }

        let Some(remote) = notification.fingerprint.as_deref() else {
            return PushVerdict::Unverified;
        };

        if remote == fingerprint(&self.doc) {
            self.staleness.store(0, Ordering::Release);
            PushVerdict::InSync
        } else {
            let count = self.staleness.fetch_add(1, Ordering::AcqRel) + 1;
            log::debug!("Fingerprint mismatch ({count}/{})", self.staleness_threshold);
            PushVerdict::Diverged {
                escalate: count >= self.staleness_threshold,
            }
        }
    }

    /// [`apply_push`](Self::apply_push), then a forced reconciliation when
    /// the staleness threshold was reached.
    pub async fn on_push_notification(
        &self,
        notification: &PushNotification,
    ) -> (PushVerdict, Option<ReconcileOutcome>) {
        let verdict = self.apply_push(notification);
        match verdict {
            PushVerdict::Diverged { escalate: true } => (verdict, Some(self.reconcile(true).await)),
            _ => (verdict, None),
        }
    }

    /// Request a full-state sync from the server.
    ///
    /// Every call counts as one staleness observation. Unless `force` is
    /// set, no request is sent while the counter is below the threshold.
    pub async fn reconcile(&self, force: bool) -> ReconcileOutcome {
        if self.is_destroyed() || !self.is_fallback_active() {
            return ReconcileOutcome::Skipped;
        }
        if self.is_reconciling() {
            log::debug!("Reconciliation already in flight; trigger dropped");
            return ReconcileOutcome::InFlight;
        }

        let count = self.staleness.fetch_add(1, Ordering::AcqRel) + 1;
        if !force && count < self.staleness_threshold {
            return ReconcileOutcome::Deferred;
        }

        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ReconcileOutcome::InFlight;
        }
        let _guard = InFlightGuard(&self.syncing);

        log::info!("Reconciling with server (staleness {count}, force {force})");
        let state_vector = self.doc.encode_state_vector();
        let result = self.transport.request_reconciliation(state_vector).await;

        if self.is_destroyed() {
            log::debug!("Discarding reconciliation result after teardown");
            return ReconcileOutcome::Abandoned;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Reconciliation failed: {e}");
                self.record_error(&e);
                return ReconcileOutcome::Failed(e.to_string());
            }
        };

        let server_update = response.server_update.is_some();
        if let Some(update) = response.server_update {
            if let Err(e) = self.doc.apply_update(&update) {
                log::warn!("Reconciliation returned an unusable update: {e}");
                self.record_error(&e);
                return ReconcileOutcome::Failed(e.to_string());
            }
        }

        self.staleness.store(0, Ordering::Release);
        self.reconciliations.fetch_add(1, Ordering::AcqRel);
        ReconcileOutcome::Applied { server_update }
    }

    /// Relay one local update through the fallback transport.
    pub async fn relay_local_update(&self, update: Vec<u8>) -> RelayOutcome {
        if self.is_destroyed() || !self.is_fallback_active() {
            return RelayOutcome::Skipped;
        }
        if !self.can_edit() {
            return RelayOutcome::ReadOnly;
        }

        match self.transport.send_outgoing_update(update).await {
            Ok(resp) if resp.accepted => RelayOutcome::Accepted,
            Ok(_) => {
                log::info!("Server did not apply relayed update; forcing reconciliation");
                RelayOutcome::Reconciled(self.reconcile(true).await)
            }
            Err(SyncError::Authorization) => {
                log::warn!("Edit permission revoked by server");
                self.can_edit.store(false, Ordering::Release);
                self.record_error(&SyncError::Authorization);
                RelayOutcome::PermissionRevoked
            }
            Err(e) => {
                log::warn!("Failed to relay local update: {e}");
                self.record_error(&e);
                RelayOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn enter_fallback(&self) {
        self.fallback_active.store(true, Ordering::Release);
    }

    pub fn restore_primary(&self) {
        self.fallback_active.store(false, Ordering::Release);
    }

    pub fn reset_staleness(&self) {
        self.staleness.store(0, Ordering::Release);
    }

    /// Stop all further network activity. Results of requests already in
    /// flight are discarded.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.fallback_active.store(false, Ordering::Release);
    }

    pub fn staleness(&self) -> u32 {
        self.staleness.load(Ordering::Acquire)
    }

    pub fn is_reconciling(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn is_fallback_active(&self) -> bool {
        self.fallback_active.load(Ordering::Acquire)
    }

    pub fn can_edit(&self) -> bool {
        self.can_edit.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Number of reconciliations that completed successfully.
    pub fn reconciliations(&self) -> u64 {
        self.reconciliations.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn presence_peers(&self) -> Vec<RemotePeer> {
        self.presence.lock().map(|room| room.peers()).unwrap_or_default()
    }

    /// Remember `error` as the session's most recent failure.
    pub fn record_error(&self, error: &SyncError) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }
}
