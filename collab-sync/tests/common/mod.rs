//! Shared test doubles: a scripted primary transport and an in-memory
//! fallback transport that counts every network call.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use collab_sync::fallback::{
    FallbackTransport, PushChannel, PushItem, ReconcileResponse, RelayResponse,
};
use collab_sync::primary::{PrimaryEvent, PrimaryTransport};
use collab_sync::protocol::{MessageType, PushNotification, SyncMessage};
use collab_sync::{ReplicatedDoc, SyncError};
use tokio::sync::mpsc;
use yrs::{GetString, Text, Transact};

/// How the fallback answers an outgoing relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayBehavior {
    Accept,
    Reject,
    Forbidden,
    Fail,
}

pub struct MockFallback {
    relays: AtomicUsize,
    syncs: AtomicUsize,
    push_opens: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    relay_behavior: Mutex<RelayBehavior>,
    sync_update: Mutex<Option<Vec<u8>>>,
    sync_delay: Mutex<Duration>,
    sync_fails: AtomicBool,
    push_tx: Mutex<Option<mpsc::Sender<PushItem>>>,
    last_state_vector: Mutex<Option<Vec<u8>>>,
    last_relayed: Mutex<Option<Vec<u8>>>,
}

impl MockFallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            relays: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            push_opens: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            relay_behavior: Mutex::new(RelayBehavior::Accept),
            sync_update: Mutex::new(None),
            sync_delay: Mutex::new(Duration::ZERO),
            sync_fails: AtomicBool::new(false),
            push_tx: Mutex::new(None),
            last_state_vector: Mutex::new(None),
            last_relayed: Mutex::new(None),
        })
    }

    pub fn set_relay_behavior(&self, behavior: RelayBehavior) {
        *self.relay_behavior.lock().unwrap() = behavior;
    }

    pub fn set_sync_update(&self, update: Option<Vec<u8>>) {
        *self.sync_update.lock().unwrap() = update;
    }

    pub fn set_sync_delay(&self, delay: Duration) {
        *self.sync_delay.lock().unwrap() = delay;
    }

    pub fn set_sync_fails(&self, fails: bool) {
        self.sync_fails.store(fails, Ordering::SeqCst);
    }

    pub fn relays(&self) -> usize {
        self.relays.load(Ordering::SeqCst)
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn push_opens(&self) -> usize {
        self.push_opens.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_state_vector(&self) -> Option<Vec<u8>> {
        self.last_state_vector.lock().unwrap().clone()
    }

    pub fn last_relayed(&self) -> Option<Vec<u8>> {
        self.last_relayed.lock().unwrap().clone()
    }

    /// Whether the most recently opened push channel was closed by its owner.
    pub fn push_channel_closed(&self) -> bool {
        self.push_tx
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.is_closed())
            .unwrap_or(true)
    }

    /// Deliver a notification on the open push channel.
    pub async fn push(&self, notification: PushNotification) -> bool {
        self.push_item(Ok(notification)).await
    }

    /// Report a stream failure on the open push channel.
    pub async fn push_error(&self, message: &str) -> bool {
        self.push_item(Err(SyncError::Stream(message.to_string())))
            .await
    }

    async fn push_item(&self, item: PushItem) -> bool {
        let tx = self.push_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(item).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl FallbackTransport for MockFallback {
    async fn send_outgoing_update(&self, update: Vec<u8>) -> Result<RelayResponse, SyncError> {
        self.relays.fetch_add(1, Ordering::SeqCst);
        *self.last_relayed.lock().unwrap() = Some(update);
        let behavior = *self.relay_behavior.lock().unwrap();
        match behavior {
            RelayBehavior::Accept => Ok(RelayResponse { accepted: true }),
            RelayBehavior::Reject => Ok(RelayResponse { accepted: false }),
            RelayBehavior::Forbidden => Err(SyncError::Authorization),
            RelayBehavior::Fail => Err(SyncError::transport("relay unreachable")),
        }
    }

    async fn request_reconciliation(
        &self,
        state_vector: Vec<u8>,
    ) -> Result<ReconcileResponse, SyncError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        *self.last_state_vector.lock().unwrap() = Some(state_vector);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.sync_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.sync_fails.load(Ordering::SeqCst) {
            return Err(SyncError::Transport {
                status: Some(502),
                message: "bad gateway".into(),
            });
        }
        Ok(ReconcileResponse {
            server_update: self.sync_update.lock().unwrap().clone(),
        })
    }

    fn open_push_channel(&self) -> PushChannel {
        self.push_opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        *self.push_tx.lock().unwrap() = Some(tx);
        PushChannel::from_receiver(rx)
    }
}

/// Primary transport driven by the test.
pub struct ScriptedPrimary {
    events: Mutex<Option<mpsc::Sender<PrimaryEvent>>>,
    connected: AtomicBool,
    sent: Mutex<Vec<SyncMessage>>,
    shutdowns: AtomicUsize,
}

impl ScriptedPrimary {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(None),
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub async fn emit(&self, event: PrimaryEvent) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub async fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(PrimaryEvent::Connect).await;
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(PrimaryEvent::Close {
            reason: "test close".into(),
        })
        .await;
    }

    pub fn sent_of(&self, msg_type: MessageType) -> Vec<SyncMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.msg_type == msg_type)
            .cloned()
            .collect()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl PrimaryTransport for ScriptedPrimary {
    fn start(&self, events: mpsc::Sender<PrimaryEvent>) {
        *self.events.lock().unwrap() = Some(events);
    }

    fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport("not connected"));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

/// Append `text` to the "body" text of `doc` in one local transaction.
pub fn local_edit(doc: &ReplicatedDoc, text: &str) {
    let body = doc.doc().get_or_insert_text("body");
    let mut txn = doc.doc().transact_mut();
    let len = body.len(&txn);
    body.insert(&mut txn, len, text);
}

pub fn body_text(doc: &ReplicatedDoc) -> String {
    let body = doc.doc().get_or_insert_text("body");
    let txn = doc.doc().transact();
    body.get_string(&txn)
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
