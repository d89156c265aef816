use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const TEST_SID: &str = "lv_VI97HAXpY6yYWAAAC";

/// Frame that makes the server close the WebSocket.
pub const CLOSE_REQUEST: &str = "4bye";

#[derive(Debug, Clone)]
pub struct ServerTiming {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

struct ServerState {
    timing: ServerTiming,
    mute_pongs: AtomicBool,
    received: Mutex<Vec<String>>,
}

/// In-process server speaking the polling handshake and the WebSocket ping/pong subset.
/// Non-liveness frames are echoed back.
pub struct TestServer {
    state: Arc<ServerState>,
    base_url: String,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn new(timing: ServerTiming) -> Self {
        let state = Arc::new(ServerState {
            timing,
            mute_pongs: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/socket.io/", get(engine_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            state,
            base_url: format!("http://{addr}"),
            handle,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stops answering pings without closing the connection.
    pub fn mute_pongs(&self) {
        self.state.mute_pongs.store(true, Ordering::SeqCst);
    }

    /// Text frames received over WebSocket so far.
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    pub fn received_pings(&self) -> usize {
        self.received().iter().filter(|frame| *frame == "2").count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn engine_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    if params.get("EIO").map(String::as_str) != Some("3") {
        return StatusCode::BAD_REQUEST.into_response();
    }

    match (params.get("transport").map(String::as_str), ws) {
        (Some("polling"), _) => {
            let json = format!(
                r#"{{"sid":"{TEST_SID}","upgrades":["websocket"],"pingInterval":{},"pingTimeout":{}}}"#,
                state.timing.ping_interval.as_millis(),
                state.timing.ping_timeout.as_millis(),
            );
            // length-prefixed open packet followed by a trailing connect packet
            format!("{}:0{json}2:40", json.len() + 1).into_response()
        }
        (Some("websocket"), Ok(ws)) if params.get("sid").map(String::as_str) == Some(TEST_SID) => {
            ws.on_upgrade(move |socket| handle_socket(socket, state))
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        state.received.lock().push(text.clone());

        let reply = match text.as_str() {
            "2" if state.mute_pongs.load(Ordering::SeqCst) => continue,
            "2" => Message::Text("3".into()),
            CLOSE_REQUEST => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ => Message::Text(text.into()),
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}
