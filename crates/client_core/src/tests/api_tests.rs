use super::*;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct Recorded {
    history: Arc<Mutex<Vec<(String, HistoryQuery, Value)>>>,
    sends: Arc<Mutex<Vec<(String, Value)>>>,
    seen: Arc<Mutex<Vec<(String, Value)>>>,
}

async fn handle_history(
    State(state): State<Recorded>,
    Path(peer): Path<String>,
    Query(query): Query<HistoryQuery>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.history.lock().await.push((peer.clone(), query, body));
    Json(json!({
        "messages": [
            { "_id": "m1", "senderId": peer, "message": "older", "createdAt": "2024-05-01T10:00:00Z", "seen": true },
            { "_id": "m2", "senderId": "viewer", "image": "https://cdn.example.com/x.png", "createdAt": "2024-05-01T10:01:00Z" }
        ],
        "pagination": { "totalPages": 4 }
    }))
}

async fn handle_send(
    State(state): State<Recorded>,
    Path(peer): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.sends.lock().await.push((peer, body.clone()));
    if body["message"] == "explode" {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "success": false, "message": "request entity too large" })),
        );
    }
    if body["message"] == "silent" {
        return (StatusCode::OK, Json(json!({ "success": true })));
    }
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "newMessage": {
                "_id": "srv-1",
                "senderId": body["senderId"],
                "message": body["message"],
                "createdAt": "2024-05-01T10:02:00Z",
                "seen": false
            }
        })),
    )
}

async fn handle_seen(
    State(state): State<Recorded>,
    Path(message_id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.seen.lock().await.push((message_id, body));
    StatusCode::OK
}

async fn spawn_chat_server() -> (String, Recorded) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Recorded::default();
    let app = Router::new()
        .route("/api/user/all/:peer", post(handle_history))
        .route("/api/user/send/:peer", post(handle_send))
        .route("/api/user/message/:message_id/seen", put(handle_seen))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api"), state)
}

fn api_for(base_url: String) -> HttpChatApi {
    HttpChatApi::new(&SyncSettings {
        server_base_url: base_url,
        ..SyncSettings::default()
    })
    .expect("http client")
}

#[tokio::test]
async fn fetch_history_posts_viewer_and_page_query() {
    let (base_url, recorded) = spawn_chat_server().await;
    let api = api_for(base_url);

    let page = api
        .fetch_history(HistoryRequest {
            peer: ProfileId::new("peer"),
            viewer: ProfileId::new("viewer"),
            query: HistoryQuery { page: 2, limit: 10 },
        })
        .await
        .expect("history");

    assert_eq!(page.total_pages, 4);
    assert_eq!(page.messages.len(), 2);
    assert!(page.messages.iter().all(|m| m.conversation_id == ProfileId::new("peer")));
    assert!(page.messages.iter().all(|m| m.origin == MessageOrigin::Fetched));
    assert!(page.messages[0].seen);
    assert_eq!(
        page.messages[1].attachment.as_ref().map(|a| a.mime_type.as_str()),
        Some("image/png")
    );

    let history = recorded.history.lock().await;
    let (peer, query, body) = &history[0];
    assert_eq!(peer, "peer");
    assert_eq!(*query, HistoryQuery { page: 2, limit: 10 });
    assert_eq!(body["senderId"], "viewer");
}

#[tokio::test]
async fn send_message_returns_confirmed_record() {
    let (base_url, recorded) = spawn_chat_server().await;
    let api = api_for(base_url);

    let confirmed = api
        .send_message(SendRequest {
            peer: ProfileId::new("peer"),
            sender: ProfileId::new("viewer"),
            body: "hello".into(),
            attachment: Some(EncodedAttachment {
                data_url: "data:application/pdf;base64,JVBERg==".into(),
                mime_type: "application/pdf".into(),
                file_name: "lab.pdf".into(),
                size_bytes: 5,
            }),
        })
        .await
        .expect("send");

    assert_eq!(confirmed.id, MessageId::new("srv-1"));
    assert_eq!(confirmed.sender_id, ProfileId::new("viewer"));
    assert_eq!(confirmed.conversation_id, ProfileId::new("peer"));
    assert!(!confirmed.seen);

    let sends = recorded.sends.lock().await;
    let (peer, body) = &sends[0];
    assert_eq!(peer, "peer");
    assert_eq!(body["fileName"], "lab.pdf");
    assert_eq!(body["fileType"], "application/pdf");
    assert_eq!(body["fileSize"], 5);
}

#[tokio::test]
async fn send_failure_carries_server_message() {
    let (base_url, _recorded) = spawn_chat_server().await;
    let api = api_for(base_url);

    let err = api
        .send_message(SendRequest {
            peer: ProfileId::new("peer"),
            sender: ProfileId::new("viewer"),
            body: "explode".into(),
            attachment: None,
        })
        .await
        .expect_err("must fail");

    match err {
        SyncError::Api(api_err) => {
            assert_eq!(api_err.code, shared::error::ErrorCode::PayloadTooLarge);
            assert_eq!(api_err.message, "request entity too large");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn send_without_record_is_reported() {
    let (base_url, _recorded) = spawn_chat_server().await;
    let api = api_for(base_url);

    let err = api
        .send_message(SendRequest {
            peer: ProfileId::new("peer"),
            sender: ProfileId::new("viewer"),
            body: "silent".into(),
            attachment: None,
        })
        .await
        .expect_err("must fail");
    assert!(matches!(err, SyncError::MissingConfirmation));
    assert!(err.is_transient());
}

#[tokio::test]
async fn mark_seen_puts_viewer() {
    let (base_url, recorded) = spawn_chat_server().await;
    let api = api_for(base_url);

    api.mark_seen(SeenRequest {
        message_id: MessageId::new("m1"),
        viewer: ProfileId::new("viewer"),
    })
    .await
    .expect("seen");

    let seen = recorded.seen.lock().await;
    assert_eq!(seen[0].0, "m1");
    assert_eq!(seen[0].1["viewerId"], "viewer");
}
