//! A small Jupyter server stand-in: sessions, kernelspecs and a kernel
//! WebSocket that answers `kernel_info_request` and `execute_request`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use kernel_client::{ServerConnection, SettingsOptions};
use kernel_wire::{decode, encode, Channel, KernelMessage, MessageType, WireFrame};
use serde_json::{json, Value};

pub const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct MockState {
    pub sessions: Mutex<Value>,
    pub specs: Mutex<Value>,
    /// Status and body returned by `POST api/sessions`.
    pub create: Mutex<Option<(StatusCode, Value)>>,
    pub session_requests: AtomicUsize,
    pub spec_requests: AtomicUsize,
    pub ws_connections: AtomicUsize,
    /// Drop the socket right after reporting busy for the next execute.
    pub close_on_execute: AtomicBool,
    pub ws_query: Mutex<Option<String>>,
    pub ws_authorization: Mutex<Option<String>>,
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        let _ = env_logger::builder().is_test(true).try_init();
        let state = Arc::new(MockState::default());
        *state.sessions.lock().unwrap() = json!([]);
        *state.specs.lock().unwrap() = specs_payload();

        let app = Router::new()
            .route("/api/sessions", get(list_sessions).post(create_session))
            .route("/api/kernelspecs", get(list_specs))
            .route("/api/kernels/:id/channels", get(channels))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockServer {
            base_url: format!("http://{addr}/"),
            state,
        }
    }

    pub fn options(&self) -> SettingsOptions {
        SettingsOptions {
            base_url: Some(self.base_url.clone()),
            ..Default::default()
        }
    }

    pub fn connection(&self) -> Arc<ServerConnection> {
        Arc::new(ServerConnection::from_options(self.options()).unwrap())
    }
}

pub fn session_payload(id: &str, path: &str) -> Value {
    json!({
        "id": id,
        "name": path,
        "path": path,
        "type": "notebook",
        "kernel": {
            "id": format!("kernel-{id}"),
            "name": "python3",
            "last_activity": "2024-03-01T12:00:00.000000Z",
            "execution_state": "idle",
            "connections": 0
        }
    })
}

pub fn specs_payload() -> Value {
    json!({
        "default": "python3",
        "kernelspecs": {
            "python3": {
                "name": "python3",
                "resources": {"logo-64x64": "/kernelspecs/python3/logo-64x64.png"},
                "spec": {
                    "language": "python",
                    "display_name": "Python 3 (ipykernel)",
                    "argv": ["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
                    "metadata": {"debugger": true}
                }
            }
        }
    })
}

async fn list_sessions(State(state): State<Arc<MockState>>) -> Json<Value> {
    state.session_requests.fetch_add(1, Ordering::SeqCst);
    Json(state.sessions.lock().unwrap().clone())
}

async fn create_session(
    State(state): State<Arc<MockState>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let body: Value = serde_json::from_slice(&body).unwrap_or_default();
    if let Some((status, reply)) = state.create.lock().unwrap().clone() {
        return (status, Json(reply));
    }
    let path = body["path"].as_str().unwrap_or("untitled.ipynb").to_string();
    let session = session_payload("s-new", &path);
    let mut sessions = state.sessions.lock().unwrap();
    if let Value::Array(items) = &mut *sessions {
        items.push(session.clone());
    }
    (StatusCode::CREATED, Json(session))
}

async fn list_specs(State(state): State<Arc<MockState>>) -> Json<Value> {
    state.spec_requests.fetch_add(1, Ordering::SeqCst);
    Json(state.specs.lock().unwrap().clone())
}

async fn channels(
    ws: WebSocketUpgrade,
    Path(_kernel_id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    State(state): State<Arc<MockState>>,
) -> impl IntoResponse {
    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    *state.ws_query.lock().unwrap() = query;
    *state.ws_authorization.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| kernel(socket, state))
}

fn child(
    parent: &KernelMessage,
    kind: MessageType,
    channel: Channel,
    content: Value,
) -> KernelMessage {
    KernelMessage::new(kind, channel, "mock-kernel", "kernel", content).with_parent(&parent.header)
}

fn status(parent: &KernelMessage, state: &str) -> KernelMessage {
    child(parent, MessageType::Status, Channel::IOPub, json!({"execution_state": state}))
}

async fn send(socket: &mut WebSocket, msg: &KernelMessage) -> bool {
    let text = match encode(msg).unwrap() {
        WireFrame::Text(text) => text,
        WireFrame::Binary(_) => unreachable!("mock kernel sends no buffers"),
    };
    socket.send(Message::Text(text)).await.is_ok()
}

async fn kernel(mut socket: WebSocket, state: Arc<MockState>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(request) = decode(&WireFrame::Text(text)) else {
            continue;
        };
        let replies = match request.msg_type() {
            MessageType::KernelInfoRequest => vec![
                child(
                    &request,
                    MessageType::KernelInfoReply,
                    Channel::Shell,
                    json!({"status": "ok", "implementation": "mock", "protocol_version": "5.3"}),
                ),
                status(&request, "idle"),
            ],
            MessageType::ExecuteRequest => {
                if state.close_on_execute.swap(false, Ordering::SeqCst) {
                    send(&mut socket, &status(&request, "busy")).await;
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                let code = request.content["code"].as_str().unwrap_or_default().to_string();
                let stream = |text: &str| {
                    child(
                        &request,
                        MessageType::Stream,
                        Channel::IOPub,
                        json!({"name": "stdout", "text": text}),
                    )
                };
                vec![
                    status(&request, "busy"),
                    stream("first\n"),
                    stream(&code),
                    child(
                        &request,
                        MessageType::ExecuteReply,
                        Channel::Shell,
                        json!({"status": "ok", "execution_count": 1}),
                    ),
                    status(&request, "idle"),
                ]
            }
            _ => vec![],
        };
        for reply in &replies {
            if !send(&mut socket, reply).await {
                return;
            }
        }
    }
}
