//! Collaboration session: wires the document, both transports, the failure
//! detector and the reconciler together.
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!  PrimaryEvent ───► │                session loop                  │
//!  local update ───► │  detector ─► effects ─► reconciler / push    │ ──► SessionEvent
//!  push          ──► │  frames   ─► ReplicatedDoc / PresenceRoom    │
//!                    └──────────────────────────────────────────────┘
//! ```
//!
//! The loop owns the detector and the push channel. Network calls on the
//! fallback path run as child tasks of the loop, so aborting the loop on
//! teardown cancels them too.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;
use yrs::Subscription;

use crate::config::SyncConfig;
use crate::detector::{DetectorEffect, DetectorState, FailureDetector, TransportEvent, TransportMode};
use crate::document::ReplicatedDoc;
use crate::error::SyncError;
use crate::fallback::{FallbackTransport, HttpFallback, PushChannel, PushItem};
use crate::presence::{PresenceRoom, RemotePeer};
use crate::primary::{PrimaryEvent, PrimaryTransport, WebSocketPrimary};
use crate::protocol::{MessageType, PushNotification, SyncMessage};
use crate::reconcile::{PushVerdict, ReconcileOutcome, Reconciler, RelayOutcome};

const PRIMARY_EVENT_BUFFER: usize = 256;
const MIN_PRESENCE_SWEEP: Duration = Duration::from_millis(10);

/// Notifications delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The active transport changed.
    ModeChanged(TransportMode),
    /// A fallback reconciliation completed.
    Reconciled,
    /// The server revoked edit permission; local edits are no longer relayed.
    PermissionRevoked,
    /// A non-fatal transport or decode failure.
    TransportError(String),
}

/// Host callback for [`SessionEvent`]s.
pub trait SessionEventHandler: Send + Sync + 'static {
    fn on_event(&self, event: SessionEvent);
}

impl<F> SessionEventHandler for F
where
    F: Fn(SessionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: SessionEvent) {
        self(event)
    }
}

/// Read-only snapshot of a session's synchronization state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHealth {
    pub mode: TransportMode,
    pub failure_count: u32,
    pub staleness: u32,
    pub reconciling: bool,
    pub push_channel_open: bool,
    pub can_edit: bool,
    /// Completed fallback reconciliations.
    pub reconciliations: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LoopStatus {
    detector: DetectorState,
    push_open: bool,
}

/// A live collaboration session for one document.
///
/// Must be created inside a tokio runtime. Dropping the session tears it
/// down.
pub struct CollaborationSession {
    config: SyncConfig,
    doc: ReplicatedDoc,
    primary: Arc<dyn PrimaryTransport>,
    reconciler: Arc<Reconciler>,
    presence: Arc<Mutex<PresenceRoom>>,
    status: Arc<Mutex<LoopStatus>>,
    destroyed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl CollaborationSession {
    /// Start a session with the default transports: a WebSocket to the
    /// local relay and HTTP polling derived from `config.url`.
    pub fn start(
        config: SyncConfig,
        handler: impl SessionEventHandler,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let primary = WebSocketPrimary::new(config.relay_endpoint()?, config.reconnect.clone());
        let fallback = HttpFallback::new(&config)?;
        Self::with_transports(config, Arc::new(primary), Arc::new(fallback), handler)
    }

    /// Start a session over caller-supplied transports.
    pub fn with_transports(
        config: SyncConfig,
        primary: Arc<dyn PrimaryTransport>,
        fallback: Arc<dyn FallbackTransport>,
        handler: impl SessionEventHandler,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let doc = ReplicatedDoc::new();
        let presence = Arc::new(Mutex::new(PresenceRoom::with_idle_timeout(
            Uuid::new_v4(),
            config.presence_idle_timeout(),
        )));
        let reconciler = Arc::new(Reconciler::new(
            doc.clone(),
            fallback.clone(),
            presence.clone(),
            config.staleness_threshold,
            config.can_edit,
        ));
        let status = Arc::new(Mutex::new(LoopStatus::default()));

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let subscription = doc.observe_local_updates(local_tx)?;

        let (event_tx, event_rx) = mpsc::channel(PRIMARY_EVENT_BUFFER);

        let session_loop = SessionLoop {
            document_name: config.document_name.clone(),
            user_name: config.user_name.clone(),
            doc: doc.clone(),
            primary: primary.clone(),
            fallback,
            reconciler: reconciler.clone(),
            presence: presence.clone(),
            status: status.clone(),
            handler: Arc::new(handler),
            detector: FailureDetector::new(config.failure_threshold),
            push: None,
            tasks: JoinSet::new(),
            presence_sweep: presence_sweep(config.presence_idle_timeout()),
            undelivered: false,
        };
        let task = tokio::spawn(session_loop.run(event_rx, local_rx));
        primary.start(event_tx);

        log::info!(
            "Collaboration session started for '{}' (relay {})",
            config.document_name,
            config.relay_url
        );

        Ok(Self {
            config,
            doc,
            primary,
            reconciler,
            presence,
            status,
            destroyed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// The shared replicated document. Local edits made through it are
    /// propagated automatically.
    pub fn document(&self) -> &ReplicatedDoc {
        &self.doc
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn mode(&self) -> TransportMode {
        self.loop_status().detector.mode
    }

    pub fn health(&self) -> SyncHealth {
        let status = self.loop_status();
        SyncHealth {
            mode: status.detector.mode,
            failure_count: status.detector.failure_count,
            staleness: self.reconciler.staleness(),
            reconciling: self.reconciler.is_reconciling(),
            push_channel_open: status.push_open,
            can_edit: self.reconciler.can_edit(),
            reconciliations: self.reconciler.reconciliations(),
            last_error: self.reconciler.last_error(),
        }
    }

    /// Remote peers currently present in the document.
    pub fn presence_peers(&self) -> Vec<RemotePeer> {
        self.reconciler.presence_peers()
    }

    pub fn can_edit(&self) -> bool {
        self.reconciler.can_edit()
    }

    /// Announce the local caret over the primary transport.
    ///
    /// The fallback transport has no presence channel, so this is a no-op
    /// returning `Ok(())` in FALLBACK mode and after teardown.
    pub fn set_local_cursor(&self, anchor: u32, head: u32) -> Result<(), SyncError> {
        if self.is_destroyed() || self.mode() != TransportMode::Primary {
            return Ok(());
        }
        let message = self
            .presence
            .lock()
            .map_err(|_| SyncError::Document("presence state poisoned".into()))?
            .update_local_cursor(anchor, head);
        self.primary.send(SyncMessage::awareness(
            &self.config.document_name,
            message.encode()?,
        ))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Tear the session down. Idempotent; awaits nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Destroying collaboration session for '{}'", self.config.document_name);

        self.reconciler.destroy();

        let leave = self
            .presence
            .lock()
            .ok()
            .and_then(|room| room.create_leave_message().encode().ok());
        if let Some(leave) = leave {
            let _ = self
                .primary
                .send(SyncMessage::awareness(&self.config.document_name, leave));
        }
        self.primary.shutdown();

        // Aborting the loop drops the push channel and every child task.
        if let Some(task) = self.task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        if let Ok(mut subscription) = self.subscription.lock() {
            subscription.take();
        }
        if let Ok(mut status) = self.status.lock() {
            status.push_open = false;
        }
    }

    fn loop_status(&self) -> LoopStatus {
        self.status.lock().map(|s| *s).unwrap_or_default()
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

enum Step {
    Primary(PrimaryEvent),
    Local(Vec<u8>),
    Push(Option<PushItem>),
    SweepPresence,
    TaskDone,
}

struct SessionLoop {
    document_name: String,
    user_name: String,
    doc: ReplicatedDoc,
    primary: Arc<dyn PrimaryTransport>,
    fallback: Arc<dyn FallbackTransport>,
    reconciler: Arc<Reconciler>,
    presence: Arc<Mutex<PresenceRoom>>,
    status: Arc<Mutex<LoopStatus>>,
    handler: Arc<dyn SessionEventHandler>,
    detector: FailureDetector,
    push: Option<PushChannel>,
    tasks: JoinSet<()>,
    presence_sweep: Interval,
    /// A local edit failed to reach the relay since the last handshake.
    undelivered: bool,
}

/// Sweep twice per idle timeout so a silent peer lingers at most 1.5x it.
fn presence_sweep(idle_timeout: Duration) -> Interval {
    let period = (idle_timeout / 2).max(MIN_PRESENCE_SWEEP);
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep
}

async fn next_push(push: &mut Option<PushChannel>) -> Option<PushItem> {
    match push {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionLoop {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<PrimaryEvent>,
        mut local: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        loop {
            let step = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => Step::Primary(event),
                    None => break,
                },
                update = local.recv() => match update {
                    Some(update) => Step::Local(update),
                    None => break,
                },
                item = next_push(&mut self.push) => Step::Push(item),
                _ = self.presence_sweep.tick() => Step::SweepPresence,
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => Step::TaskDone,
            };

            match step {
                Step::Primary(event) => self.on_primary_event(event),
                Step::Local(update) => self.on_local_update(update),
                Step::Push(Some(Ok(notification))) => self.on_push(notification),
                Step::Push(Some(Err(e))) => {
                    self.reconciler.record_error(&e);
                    self.report(e);
                }
                Step::Push(None) => {
                    log::warn!("Push channel ended");
                    self.push = None;
                    self.publish_status();
                }
                Step::SweepPresence => self.sweep_presence(),
                Step::TaskDone => {}
            }
        }
        log::debug!("Session loop for '{}' stopped", self.document_name);
    }

    fn on_primary_event(&mut self, event: PrimaryEvent) {
        let lifecycle = match event {
            PrimaryEvent::Connect => TransportEvent::Connect,
            PrimaryEvent::Disconnect => TransportEvent::Disconnect,
            PrimaryEvent::Close { reason } => {
                log::debug!("Primary close: {reason}");
                TransportEvent::Close
            }
            PrimaryEvent::Status(status) => TransportEvent::Status(status),
            PrimaryEvent::Message(frame) => {
                self.on_frame(frame);
                return;
            }
        };

        let effects = self.detector.handle(lifecycle);
        self.apply_effects(effects);
        self.publish_status();

        if lifecycle == TransportEvent::Connect {
            self.greet_relay();
        }
    }

    /// Open the primary sync handshake and announce ourselves.
    fn greet_relay(&mut self) {
        let step1 = SyncMessage::sync_step1(&self.document_name, self.doc.encode_state_vector());
        if let Err(e) = self.primary.send(step1) {
            self.report(e);
            return;
        }
        // The relay answers SyncStep1 with our missing state and asks for its own.
        self.undelivered = false;

        let join = self
            .presence
            .lock()
            .map_err(|_| SyncError::Document("presence state poisoned".into()))
            .and_then(|room| room.create_join_message(self.user_name.clone()).encode());
        match join {
            Ok(join) => {
                if let Err(e) = self
                    .primary
                    .send(SyncMessage::awareness(&self.document_name, join))
                {
                    log::debug!("Could not announce presence: {e}");
                }
            }
            Err(e) => self.report(e),
        }
    }

    fn on_frame(&mut self, frame: SyncMessage) {
        if frame.document != self.document_name {
            log::debug!("Ignoring frame for document '{}'", frame.document);
            return;
        }

        let result = match frame.msg_type {
            MessageType::SyncStep1 => self
                .doc
                .encode_diff(&frame.payload)
                .and_then(|diff| self.primary.send(SyncMessage::sync_step2(&self.document_name, diff))),
            MessageType::SyncStep2 | MessageType::Update => self.doc.apply_update(&frame.payload),
            MessageType::Awareness => self
                .presence
                .lock()
                .map_err(|_| SyncError::Document("presence state poisoned".into()))
                .and_then(|mut room| room.apply_encoded(&frame.payload))
                .map(|_| ()),
            MessageType::Ping => self.primary.send(SyncMessage::pong(&self.document_name)),
            MessageType::Pong => Ok(()),
        };

        if let Err(e) = result {
            self.report(e);
        }
    }

    fn on_local_update(&mut self, update: Vec<u8>) {
        match self.detector.mode() {
            TransportMode::Primary => {
                let frame = SyncMessage::update(&self.document_name, update);
                if let Err(e) = self.primary.send(frame) {
                    // Delivered by the next handshake, or relayed on fallback entry.
                    log::debug!("Local update not sent on primary: {e}");
                    self.undelivered = true;
                }
            }
            TransportMode::Fallback => {
                if !self.reconciler.can_edit() {
                    return;
                }
                let reconciler = self.reconciler.clone();
                let handler = self.handler.clone();
                self.tasks.spawn(async move {
                    let outcome = reconciler.relay_local_update(update).await;
                    report_relay(handler.as_ref(), outcome);
                });
            }
        }
    }

    fn on_push(&mut self, notification: PushNotification) {
        if let PushVerdict::Diverged { escalate: true } = self.reconciler.apply_push(&notification) {
            self.spawn_reconcile();
        }
        self.publish_status();
    }

    fn apply_effects(&mut self, effects: Vec<DetectorEffect>) {
        for effect in effects {
            match effect {
                DetectorEffect::EnterFallback => {
                    self.reconciler.enter_fallback();
                    emit(self.handler.as_ref(), SessionEvent::ModeChanged(TransportMode::Fallback));
                    self.relay_undelivered();
                }
                DetectorEffect::ForceReconcile => self.spawn_reconcile(),
                DetectorEffect::OpenPushChannel => {
                    if self.push.is_none() {
                        self.push = Some(self.fallback.open_push_channel());
                    }
                }
                DetectorEffect::RestorePrimary => {
                    self.reconciler.restore_primary();
                    emit(self.handler.as_ref(), SessionEvent::ModeChanged(TransportMode::Primary));
                }
                DetectorEffect::ClosePushChannel => {
                    if let Some(mut channel) = self.push.take() {
                        channel.close();
                    }
                }
                DetectorEffect::ResetStaleness => self.reconciler.reset_staleness(),
            }
        }
    }

    /// Relay the whole local state once when edits made while the socket was
    /// down never reached the relay.
    fn relay_undelivered(&mut self) {
        if !std::mem::take(&mut self.undelivered) {
            return;
        }
        if !self.reconciler.can_edit() {
            log::debug!("Dropping undelivered local edits: session is read-only");
            return;
        }
        log::info!("Relaying local edits made while the primary transport was down");
        let update = self.doc.encode_state_as_update();
        let reconciler = self.reconciler.clone();
        let handler = self.handler.clone();
        self.tasks.spawn(async move {
            let outcome = reconciler.relay_local_update(update).await;
            report_relay(handler.as_ref(), outcome);
        });
    }

    fn sweep_presence(&mut self) {
        let pruned = self
            .presence
            .lock()
            .map(|mut room| room.prune_idle())
            .unwrap_or_default();
        if pruned > 0 {
            log::debug!("Pruned {pruned} idle peer(s) from '{}'", self.document_name);
        }
    }

    fn spawn_reconcile(&mut self) {
        let reconciler = self.reconciler.clone();
        let handler = self.handler.clone();
        self.tasks.spawn(async move {
            let outcome = reconciler.reconcile(true).await;
            report_reconcile(handler.as_ref(), outcome);
        });
    }

    fn publish_status(&self) {
        if let Ok(mut status) = self.status.lock() {
            status.detector = self.detector.state();
            status.push_open = self.push.is_some();
        }
    }

    fn report(&self, error: SyncError) {
        log::warn!("{error}");
        emit(self.handler.as_ref(), SessionEvent::TransportError(error.to_string()));
    }
}

fn report_reconcile(handler: &dyn SessionEventHandler, outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Applied { .. } => emit(handler, SessionEvent::Reconciled),
        ReconcileOutcome::Failed(message) => emit(handler, SessionEvent::TransportError(message)),
        _ => {}
    }
}

fn report_relay(handler: &dyn SessionEventHandler, outcome: RelayOutcome) {
    match outcome {
        RelayOutcome::PermissionRevoked => emit(handler, SessionEvent::PermissionRevoked),
        RelayOutcome::Reconciled(outcome) => report_reconcile(handler, outcome),
        RelayOutcome::Failed(message) => emit(handler, SessionEvent::TransportError(message)),
        _ => {}
    }
}

fn emit(handler: &dyn SessionEventHandler, event: SessionEvent) {
    if catch_unwind(AssertUnwindSafe(|| handler.on_event(event))).is_err() {
        log::error!("Session event handler panicked");
    }
}
