#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use session_link::{ConnectionState, UserSummary};
use tokio::{net::TcpListener, sync::mpsc, sync::watch};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response as HandshakeResponse},
        Message,
    },
};

pub const VALID_TOKEN: &str = "valid";
pub const EXPIRED_TOKEN: &str = "expired";
pub const REFRESHED_TOKEN: &str = "fresh";
pub const PASSWORD: &str = "hunter2";
pub const VERIFY_CODE: &str = "123456";

pub fn user() -> UserSummary {
    UserSummary {
        id: "7".to_string(),
        email: "ada@example.com".to_string(),
        display_name: Some("Ada".to_string()),
    }
}

/// Shared knobs and counters of the HTTP mock.
pub struct ApiState {
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub item_calls: AtomicUsize,
    pub refresh_status: Mutex<StatusCode>,
    pub refresh_delay: Mutex<Duration>,
    pub valid_token: Mutex<String>,
    pub require_verification: AtomicBool,
}

impl ApiState {
    pub fn set_refresh_status(&self, status: StatusCode) {
        *self.refresh_status.lock().unwrap() = status;
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct MockApi {
    pub base_url: String,
    pub state: Arc<ApiState>,
}

impl MockApi {
    pub async fn start() -> Self {
        let state = Arc::new(ApiState {
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            item_calls: AtomicUsize::new(0),
            refresh_status: Mutex::new(StatusCode::OK),
            refresh_delay: Mutex::new(Duration::from_millis(100)),
            valid_token: Mutex::new(VALID_TOKEN.to_string()),
            require_verification: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/api/auth/refresh", post(refresh))
            .route("/api/auth/login", post(login))
            .route("/api/auth/login/verify", post(verify))
            .route("/api/auth/logout", post(logout))
            .route("/api/items", get(items))
            .route("/api/flaky", get(flaky))
            .route("/api/locked", get(locked))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/api"),
            state,
        }
    }
}

async fn refresh(State(state): State<Arc<ApiState>>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *state.refresh_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    let status = *state.refresh_status.lock().unwrap();
    if status != StatusCode::OK {
        return (status, "refresh refused").into_response();
    }
    *state.valid_token.lock().unwrap() = REFRESHED_TOKEN.to_string();
    Json(json!({ "access": REFRESHED_TOKEN })).into_response()
}

async fn login(State(state): State<Arc<ApiState>>, Json(body): Json<Value>) -> Response {
    if body["password"] != PASSWORD {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "bad credentials" })))
            .into_response();
    }
    if state.require_verification.load(Ordering::SeqCst) {
        return Json(json!({ "verification_required": true, "challenge_id": "ch-1" }))
            .into_response();
    }
    let access = state.valid_token.lock().unwrap().clone();
    Json(json!({ "access": access, "user": { "id": 7, "email": "ada@example.com", "name": "Ada" } }))
        .into_response()
}

async fn verify(State(state): State<Arc<ApiState>>, Json(body): Json<Value>) -> Response {
    if body["challenge_id"] != "ch-1" || body["code"] != VERIFY_CODE {
        return (StatusCode::BAD_REQUEST, "invalid code").into_response();
    }
    let access = state.valid_token.lock().unwrap().clone();
    Json(json!({
        "access": access,
        "refresh": "r-1",
        "user": { "id": "7", "email": "ada@example.com" }
    }))
    .into_response()
}

async fn logout(State(state): State<Arc<ApiState>>) -> StatusCode {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn items(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    state.item_calls.fetch_add(1, Ordering::SeqCst);
    let expected = format!("Bearer {}", state.valid_token.lock().unwrap());
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented != expected {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "items": [1, 2, 3] })).into_response()
}

async fn flaky() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

/// Rejects every credential, refreshed or not.
async fn locked(State(state): State<Arc<ApiState>>) -> StatusCode {
    state.item_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::UNAUTHORIZED
}

/// One accepted socket, driven by the test.
pub struct ServerConn {
    pub token: String,
    outgoing: mpsc::UnboundedSender<Option<String>>,
    incoming: mpsc::UnboundedReceiver<String>,
}

impl ServerConn {
    pub fn send(&self, payload: Value) {
        let _ = self.outgoing.send(Some(payload.to_string()));
    }

    pub fn close(&self) {
        let _ = self.outgoing.send(None);
    }

    /// Next client frame, or `None` when nothing arrives within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Value> {
        let text = tokio::time::timeout(wait, self.incoming.recv())
            .await
            .ok()
            .flatten()?;
        serde_json::from_str(&text).ok()
    }

    /// Whether the client closed this socket within `wait`.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let drained = async { while self.incoming.recv().await.is_some() {} };
        tokio::time::timeout(wait, drained).await.is_ok()
    }

    pub async fn recv(&mut self) -> Value {
        self.recv_within(Duration::from_secs(5))
            .await
            .expect("client frame")
    }
}

/// WebSocket endpoint that records handshake tokens and hands every accepted
/// connection to the test.
pub struct MockChannel {
    pub url: String,
    pub tokens: Arc<Mutex<Vec<String>>>,
    pub accepted: Arc<AtomicUsize>,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockChannel {
    pub async fn start(rejected_tokens: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let rejected: Arc<Vec<String>> =
            Arc::new(rejected_tokens.iter().map(|t| t.to_string()).collect());
        let (conn_tx, connections) = mpsc::unbounded_channel();

        let server_tokens = Arc::clone(&tokens);
        let server_accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tokens = Arc::clone(&server_tokens);
                let accepted = Arc::clone(&server_accepted);
                let rejected = Arc::clone(&rejected);
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let mut token = String::new();
                    let callback = |request: &Request, response: HandshakeResponse| {
                        token = request
                            .uri()
                            .query()
                            .and_then(|query| {
                                query.split('&').find_map(|pair| pair.strip_prefix("token="))
                            })
                            .unwrap_or_default()
                            .to_string();
                        tokens.lock().unwrap().push(token.clone());
                        if rejected.contains(&token) {
                            let mut denied = ErrorResponse::new(Some("unauthorized".to_string()));
                            *denied.status_mut() = StatusCode::UNAUTHORIZED;
                            return Err(denied);
                        }
                        Ok(response)
                    };
                    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
                        return;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);

                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Option<String>>();
                    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
                    let _ = conn_tx.send(ServerConn {
                        token,
                        outgoing: out_tx,
                        incoming: in_rx,
                    });

                    loop {
                        tokio::select! {
                            command = out_rx.recv() => match command {
                                Some(Some(text)) => {
                                    if ws.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(None) | None => {
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            },
                            frame = ws.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = in_tx.send(text.as_str().to_owned());
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}/ws/notifications/"),
            tokens,
            accepted,
            connections,
        }
    }

    pub async fn next_connection(&mut self) -> ServerConn {
        tokio::time::timeout(Duration::from_secs(5), self.connections.recv())
            .await
            .expect("channel connection in time")
            .expect("mock channel running")
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| *state == target))
        .await
        .unwrap_or_else(|_| panic!("state {target} not reached"))
        .unwrap();
}
