use super::*;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use shared::domain::ProfileId;
use tokio::{net::TcpListener, sync::Mutex, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

fn settings_for(base_url: String) -> SyncSettings {
    SyncSettings {
        server_base_url: base_url,
        ..SyncSettings::default()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(received): State<mpsc::UnboundedSender<String>>,
) -> Response {
    ws.on_upgrade(move |socket| ws_session(socket, received))
}

async fn ws_session(mut socket: WebSocket, received: mpsc::UnboundedSender<String>) {
    if let Some(Ok(AxumWsMessage::Text(text))) = socket.recv().await {
        let _ = received.send(text);
    }
    let frame = json!({
        "event": "receiveMessage",
        "data": { "senderId": "peer", "message": "hi", "_id": "m1" }
    });
    let _ = socket.send(AxumWsMessage::Text(frame.to_string())).await;
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_ws_server() -> (String, mpsc::UnboundedReceiver<String>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route("/ws", get(ws_handler)).with_state(tx);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api"), rx)
}

#[derive(Clone, Default)]
struct PollState {
    pending: Arc<Mutex<Vec<Value>>>,
    emitted: Arc<Mutex<Vec<(String, Value)>>>,
}

#[derive(Deserialize)]
struct SessionQuery {
    session: String,
}

async fn open_session() -> Json<Value> {
    Json(json!({ "sessionId": "s-1" }))
}

async fn poll(State(state): State<PollState>, Query(_query): Query<SessionQuery>) -> Json<Value> {
    let frames = std::mem::take(&mut *state.pending.lock().await);
    Json(Value::Array(frames))
}

async fn emit(
    State(state): State<PollState>,
    Query(query): Query<SessionQuery>,
    Json(frame): Json<Value>,
) {
    state.emitted.lock().await.push((query.session, frame));
}

async fn spawn_polling_server() -> (String, PollState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = PollState::default();
    let app = Router::new()
        .route("/api/push/session", post(open_session))
        .route("/api/push/poll", get(poll))
        .route("/api/push/emit", post(emit))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api"), state)
}

#[test]
fn websocket_degrades_to_polling_once() {
    assert_eq!(TransportKind::WebSocket.degraded(), Some(TransportKind::Polling));
    assert_eq!(TransportKind::Polling.degraded(), None);
}

#[tokio::test]
async fn websocket_link_carries_frames_both_ways() {
    let (base_url, mut received) = spawn_ws_server().await;
    let connector = HttpPushConnector::new(&settings_for(base_url)).expect("connector");

    let mut link = connector
        .connect(TransportKind::WebSocket)
        .await
        .expect("connect");
    assert_eq!(link.kind, TransportKind::WebSocket);

    link.outbound
        .send(PushFrame::RegisterUser(ProfileId::new("viewer")))
        .await
        .expect("queue register");
    let written = timeout(WAIT, received.recv())
        .await
        .expect("server saw frame")
        .expect("frame");
    assert_eq!(written, r#"{"event":"registerUser","data":"viewer"}"#);

    let frame = timeout(WAIT, link.inbound.recv())
        .await
        .expect("frame in time")
        .expect("link open");
    match frame {
        PushFrame::ReceiveMessage(message) => {
            assert_eq!(message.sender_id.as_deref(), Some("peer"));
            assert_eq!(message.message_id.as_deref(), Some("m1"));
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn polling_link_emits_and_receives() {
    let (base_url, state) = spawn_polling_server().await;
    state.pending.lock().await.push(json!({
        "event": "messageSeen",
        "data": { "messageId": "m7", "receiverId": "peer" }
    }));
    let connector = HttpPushConnector::new(&settings_for(base_url)).expect("connector");

    let mut link = connector
        .connect(TransportKind::Polling)
        .await
        .expect("connect");
    link.outbound
        .send(PushFrame::RegisterUser(ProfileId::new("viewer")))
        .await
        .expect("queue register");

    let frame = timeout(WAIT, link.inbound.recv())
        .await
        .expect("frame in time")
        .expect("link open");
    let PushFrame::MessageSeen(ack) = frame else {
        panic!("expected messageSeen frame");
    };
    assert_eq!(ack.message_id, "m7");
    assert_eq!(ack.viewer_id.as_deref(), Some("peer"));

    timeout(WAIT, async {
        loop {
            if !state.emitted.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("emit reached server");
    let emitted = state.emitted.lock().await;
    assert_eq!(emitted[0].0, "s-1");
    assert_eq!(emitted[0].1["event"], "registerUser");
    assert_eq!(emitted[0].1["data"], "viewer");
}

#[tokio::test]
async fn unreachable_websocket_reports_negotiation_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let connector =
        HttpPushConnector::new(&settings_for(format!("http://{addr}/api"))).expect("connector");

    let err = connector
        .connect(TransportKind::WebSocket)
        .await
        .expect_err("nothing is listening");
    assert!(matches!(
        err,
        TransportError::Negotiation {
            transport: "websocket",
            ..
        }
    ));
}
