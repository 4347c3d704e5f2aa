//! HTTP fallback transport against an in-process axum stub server.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use collab_sync::fallback::{FallbackTransport, HttpFallback};
use collab_sync::protocol::encode_base64;
use collab_sync::{SyncConfig, SyncError};
use futures_util::Stream;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;

#[derive(Default)]
struct StubState {
    relay_status: Option<StatusCode>,
    relay_body: Option<String>,
    updated: bool,
    sync_doc64: Option<String>,
    relayed: Vec<String>,
    sync_requests: Vec<String>,
    queries: Vec<String>,
    push_connections: usize,
    push_status: Option<StatusCode>,
}

#[derive(Clone, Default)]
struct Stub(Arc<Mutex<StubState>>);

impl Stub {
    fn with<R>(&self, f: impl FnOnce(&mut StubState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }
}

async fn relay(State(stub): State<Stub>, uri: Uri, Json(body): Json<Value>) -> Response {
    stub.with(|s| {
        s.queries.push(uri.query().unwrap_or_default().to_string());
        if let Some(status) = s.relay_status {
            return status.into_response();
        }
        if let Some(raw) = &s.relay_body {
            return raw.clone().into_response();
        }
        s.relayed
            .push(body["message64"].as_str().unwrap_or_default().to_string());
        Json(json!({ "updated": s.updated })).into_response()
    })
}

async fn sync(State(stub): State<Stub>, Json(body): Json<Value>) -> Json<Value> {
    stub.with(|s| {
        s.sync_requests
            .push(body["localDoc64"].as_str().unwrap_or_default().to_string());
        match &s.sync_doc64 {
            Some(doc) => Json(json!({ "syncDoc64": doc })),
            None => Json(json!({})),
        }
    })
}

async fn push(State(stub): State<Stub>) -> Response {
    let (n, status) = stub.with(|s| {
        s.push_connections += 1;
        (s.push_connections, s.push_status)
    });
    if let Some(status) = status {
        return status.into_response();
    }
    one_event(json!({ "stateFingerprint": format!("fp-{n}") }).to_string()).into_response()
}

/// One event, then the stream ends and the client has to reconnect.
fn one_event(data: String) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(futures_util::stream::iter(vec![Ok(
        Event::default().data(data)
    )]))
}

/// Start the stub on a free port and return a client for it.
async fn start_stub(stub: Stub) -> HttpFallback {
    let app = Router::new()
        .route("/ws/poll/message/", post(relay).get(push))
        .route("/ws/poll/sync/", post(sync))
        .with_state(stub);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = SyncConfig::new("doc-1", format!("ws://{addr}/ws/?room=doc-1"), true);
    config.push_reconnect_delay_ms = 50;
    config.request_timeout_ms = 2_000;
    HttpFallback::new(&config).unwrap()
}

#[tokio::test]
async fn test_relay_posts_base64_update() {
    let stub = Stub::default();
    stub.with(|s| s.updated = true);
    let client = start_stub(stub.clone()).await;

    let response = client.send_outgoing_update(vec![1, 2, 3]).await.unwrap();
    assert!(response.accepted);

    stub.with(|s| {
        assert_eq!(s.relayed, vec![encode_base64(&[1, 2, 3])]);
        let (room, stamp) = s.queries[0].split_once('&').unwrap();
        assert_eq!(room, "room=doc-1");
        assert!(!stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()));
    });
}

#[tokio::test]
async fn test_relay_not_applied() {
    let stub = Stub::default();
    let client = start_stub(stub.clone()).await;

    let response = client.send_outgoing_update(vec![9]).await.unwrap();
    assert!(!response.accepted);
}

#[tokio::test]
async fn test_relay_forbidden_maps_to_authorization() {
    let stub = Stub::default();
    stub.with(|s| s.relay_status = Some(StatusCode::FORBIDDEN));
    let client = start_stub(stub).await;

    let err = client.send_outgoing_update(vec![1]).await.unwrap_err();
    assert!(err.is_authorization());
}

#[tokio::test]
async fn test_relay_server_error_maps_to_transport() {
    let stub = Stub::default();
    stub.with(|s| s.relay_status = Some(StatusCode::INTERNAL_SERVER_ERROR));
    let client = start_stub(stub).await;

    let err = client.send_outgoing_update(vec![1]).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Transport {
            status: Some(500),
            ..
        }
    ));
}

#[tokio::test]
async fn test_relay_malformed_body_is_transport_error() {
    let stub = Stub::default();
    stub.with(|s| s.relay_body = Some("definitely not json".into()));
    let client = start_stub(stub).await;

    let err = client.send_outgoing_update(vec![1]).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport { .. }));
}

#[tokio::test]
async fn test_reconciliation_round_trip() {
    let stub = Stub::default();
    stub.with(|s| s.sync_doc64 = Some(encode_base64(&[7, 7, 7])));
    let client = start_stub(stub.clone()).await;

    let response = client.request_reconciliation(vec![0, 1]).await.unwrap();
    assert_eq!(response.server_update, Some(vec![7, 7, 7]));
    stub.with(|s| assert_eq!(s.sync_requests, vec![encode_base64(&[0, 1])]));
}

#[tokio::test]
async fn test_reconciliation_without_server_update() {
    let client = start_stub(Stub::default()).await;
    let response = client.request_reconciliation(vec![0]).await.unwrap();
    assert!(response.server_update.is_none());
}

#[tokio::test]
async fn test_unreachable_server_is_transport_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = SyncConfig::new("doc-1", format!("ws://127.0.0.1:{port}/ws/"), true);
    let client = HttpFallback::new(&config).unwrap();

    let err = client.request_reconciliation(vec![0]).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport { status: None, .. }));
}

#[tokio::test]
async fn test_push_channel_reconnects_after_stream_ends() {
    let stub = Stub::default();
    let client = start_stub(stub.clone()).await;
    let mut channel = client.open_push_channel();

    let mut fingerprints = Vec::new();
    let mut stream_errors = 0;
    while fingerprints.len() < 2 {
        let item = timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap();
        match item {
            Ok(notification) => fingerprints.push(notification.fingerprint.unwrap()),
            Err(SyncError::Stream(_)) => stream_errors += 1,
            Err(other) => panic!("unexpected push error: {other}"),
        }
    }
    assert_eq!(fingerprints, vec!["fp-1".to_string(), "fp-2".to_string()]);
    // The end of the first stream is reported before the reconnect.
    assert!(stream_errors >= 1);
    assert!(stub.with(|s| s.push_connections) >= 2);

    // Closing stops the reconnect loop.
    channel.close();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after_close = stub.with(|s| s.push_connections);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(stub.with(|s| s.push_connections), after_close);
}

#[tokio::test]
async fn test_push_channel_reports_rejected_subscription() {
    let stub = Stub::default();
    stub.with(|s| s.push_status = Some(StatusCode::SERVICE_UNAVAILABLE));
    let client = start_stub(stub.clone()).await;
    let mut channel = client.open_push_channel();

    let item = timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
        .unwrap();
    match item {
        Err(SyncError::Stream(message)) => assert!(message.contains("503"), "{message}"),
        other => panic!("expected a stream error, got {other:?}"),
    }

    // The subscription keeps retrying after reporting.
    stub.with(|s| s.push_status = None);
    let recovered = loop {
        let item = timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap();
        if let Ok(notification) = item {
            break notification;
        }
    };
    assert!(recovered.fingerprint.is_some());
}
