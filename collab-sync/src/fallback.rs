//! Fallback transport: HTTP request/response plus a server-sent-events push
//! channel, used while the primary WebSocket is unavailable.
//!
//! All three operations address endpoints derived from the externally
//! supplied collaboration URL (see [`poll_url`]):
//!
//! ```text
//!   POST <poll-url("message")>   {"message64": ...}   -> {"updated": bool}
//!   POST <poll-url("sync")>      {"localDoc64": ...}  -> {"syncDoc64"?: ...}
//!   GET  <poll-url("message")>   text/event-stream    -> PushPayload*
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::protocol::{
    decode_optional, encode_base64, OutgoingMessageRequest, OutgoingMessageResponse,
    PushNotification, SyncRequest, SyncResponse,
};

/// Endpoint relaying outgoing updates and carrying the push stream.
pub const MESSAGE_ENDPOINT: &str = "message";
/// Endpoint answering full-state reconciliation requests.
pub const SYNC_ENDPOINT: &str = "sync";

const PUSH_BUFFER: usize = 64;

/// One item of a push subscription: a notification, or a stream failure
/// the subscription is about to recover from.
pub type PushItem = Result<PushNotification, SyncError>;

/// Result of relaying one local update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayResponse {
    /// `false` when the server could not apply the update and wants a sync.
    pub accepted: bool,
}

/// Result of a reconciliation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResponse {
    /// Update bringing the local copy up to date, if the server had one.
    pub server_update: Option<Vec<u8>>,
}

/// Request/response + push transport used in FALLBACK mode.
#[async_trait]
pub trait FallbackTransport: Send + Sync + 'static {
    /// Relay one locally produced update.
    async fn send_outgoing_update(&self, update: Vec<u8>) -> Result<RelayResponse, SyncError>;

    /// Send the local state vector and receive whatever the server holds
    /// that the local copy lacks.
    async fn request_reconciliation(
        &self,
        state_vector: Vec<u8>,
    ) -> Result<ReconcileResponse, SyncError>;

    /// Subscribe to server pushes. The subscription reconnects on its own
    /// until the returned channel is closed or dropped.
    fn open_push_channel(&self) -> PushChannel;
}

/// Receiving end of a push subscription.
///
/// Dropping the channel cancels the background subscription, including any
/// pending reconnect timer.
pub struct PushChannel {
    rx: mpsc::Receiver<PushItem>,
    task: Option<JoinHandle<()>>,
}

impl PushChannel {
    pub fn new(rx: mpsc::Receiver<PushItem>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Channel fed directly by the caller, with no background task.
    pub fn from_receiver(rx: mpsc::Receiver<PushItem>) -> Self {
        Self { rx, task: None }
    }

    /// Next push item; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<PushItem> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Derive a fallback endpoint URL from the collaboration URL.
///
/// `ws` becomes `http` and `wss` becomes `https`. The first `/ws/` path
/// segment becomes `/ws/poll/<endpoint>/`; without one, `/poll/<endpoint>/`
/// is appended. `epoch_ms` is appended to the query as a bare key.
pub fn poll_url(base: &Url, endpoint: &str, epoch_ms: u128) -> Result<Url, SyncError> {
    let raw = base.as_str();
    let rebased = if let Some(rest) = raw.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = raw.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        raw.to_string()
    };
    let mut url = Url::parse(&rebased)?;

    let path = url.path().to_string();
    let poll_segment = format!("/ws/poll/{endpoint}/");
    let new_path = if path.contains("/ws/") {
        path.replacen("/ws/", &poll_segment, 1)
    } else {
        format!("{}/poll/{endpoint}/", path.trim_end_matches('/'))
    };
    url.set_path(&new_path);

    let query = match url.query() {
        Some(q) if !q.is_empty() => format!("{q}&{epoch_ms}"),
        _ => epoch_ms.to_string(),
    };
    url.set_query(Some(&query));
    url.set_fragment(None);
    Ok(url)
}

fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// [`FallbackTransport`] over HTTP (reqwest) and SSE (reqwest-eventsource).
#[derive(Clone)]
pub struct HttpFallback {
    client: Client,
    base: Url,
    request_timeout: Duration,
    push_reconnect_delay: Duration,
}

impl HttpFallback {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let base = Url::parse(&config.url)?;
        // No client-wide timeout: it would also cut the long-lived push stream.
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base,
            request_timeout: config.request_timeout(),
            push_reconnect_delay: config.push_reconnect_delay(),
        })
    }

    /// Current URL for `endpoint`, with a fresh cache-busting query key.
    pub fn endpoint_url(&self, endpoint: &str) -> Result<Url, SyncError> {
        poll_url(&self.base, endpoint, epoch_ms())
    }

    async fn post_json<B, R>(&self, endpoint: &str, body: &B) -> Result<R, SyncError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint_url(endpoint)?;
        log::debug!("POST {url}");

        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Transport {
                status: Some(status.as_u16()),
                message: format!("{endpoint} endpoint returned {status}"),
            });
        }
        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl FallbackTransport for HttpFallback {
    async fn send_outgoing_update(&self, update: Vec<u8>) -> Result<RelayResponse, SyncError> {
        let body = OutgoingMessageRequest {
            message64: encode_base64(&update),
        };
        match self
            .post_json::<_, OutgoingMessageResponse>(MESSAGE_ENDPOINT, &body)
            .await
        {
            Ok(resp) => Ok(RelayResponse {
                accepted: resp.updated,
            }),
            Err(SyncError::Transport {
                status: Some(403), ..
            }) => Err(SyncError::Authorization),
            Err(e) => Err(e),
        }
    }

    async fn request_reconciliation(
        &self,
        state_vector: Vec<u8>,
    ) -> Result<ReconcileResponse, SyncError> {
        let body = SyncRequest {
            local_doc64: encode_base64(&state_vector),
        };
        let resp: SyncResponse = self.post_json(SYNC_ENDPOINT, &body).await?;
        Ok(ReconcileResponse {
            server_update: decode_optional(resp.sync_doc64.as_deref())?,
        })
    }

    fn open_push_channel(&self) -> PushChannel {
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let task = tokio::spawn(push_task(
            self.client.clone(),
            self.base.clone(),
            self.push_reconnect_delay,
            tx,
        ));
        PushChannel::new(rx, task)
    }
}

/// Keep one SSE subscription alive, reopening it `delay` after every failure.
async fn push_task(
    client: Client,
    base: Url,
    delay: Duration,
    tx: mpsc::Sender<PushItem>,
) {
    loop {
        let url = match poll_url(&base, MESSAGE_ENDPOINT, epoch_ms()) {
            Ok(url) => url,
            Err(e) => {
                log::error!("Cannot derive push channel URL: {e}");
                return;
            }
        };
        log::info!("Opening push channel: {url}");

        let mut es = match EventSource::new(client.get(url)) {
            Ok(es) => es,
            Err(e) => {
                log::error!("Failed to create push channel: {e}");
                if tx.send(Err(SyncError::Stream(e.to_string()))).await.is_err() {
                    return;
                }
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        while let Some(event) = es.next().await {
            match event {
                Ok(SseEvent::Open) => log::debug!("Push channel open"),
                Ok(SseEvent::Message(msg)) => match PushNotification::from_event_data(&msg.data) {
                    Ok(notification) if notification.is_empty() => {}
                    Ok(notification) => {
                        if tx.send(Ok(notification)).await.is_err() {
                            es.close();
                            return;
                        }
                    }
                    Err(e) => log::warn!("Skipping malformed push event: {e}"),
                },
                Err(e) => {
                    log::warn!("Push channel error: {e}");
                    if tx.send(Err(SyncError::Stream(e.to_string()))).await.is_err() {
                        es.close();
                        return;
                    }
                    break;
                }
            }
        }
        es.close();

        if tx.is_closed() {
            return;
        }
        log::warn!("Push channel closed, reopening in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}
