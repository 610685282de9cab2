use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::{future, SinkExt, StreamExt};
use pagelink_core::PageKey;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::Bridge;
use crate::connection::Connection;

#[derive(Debug, Deserialize)]
struct WsParams {
    page: Option<String>,
}

/// Build the axum router with all routes.
pub fn build_router(bridge: Bridge) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/functions", get(functions_handler))
        .with_state(bridge)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve. Returns a handle that stops the server and its
/// background tasks.
pub async fn start(bridge: Bridge) -> Result<ServerHandle, std::io::Error> {
    let config = bridge.config().clone();
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    let cancel = bridge.cancel_token();

    let router = build_router(bridge.clone());
    let serve_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(serve_cancel.cancelled_owned())
            .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "Server stopped with error");
        }
    });

    let sweeper = match config.unread_result_ttl() {
        Some(ttl) => Some(start_sweep_task(
            bridge.clone(),
            ttl,
            Duration::from_secs(config.sweep_interval_secs),
        )),
        None => None,
    };

    tracing::info!(%addr, "Pagelink server started");

    Ok(ServerHandle {
        addr,
        bridge,
        _server: server,
        _sweeper: sweeper,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    bridge: Bridge,
    _server: JoinHandle<()>,
    _sweeper: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.bridge.cancel_token()
    }

    /// Stop accepting, close every connection, release pending calls.
    pub fn shutdown(&self) {
        self.bridge.shutdown();
    }
}

/// Periodically drop unread results older than `ttl`.
fn start_sweep_task(bridge: Bridge, ttl: Duration, interval: Duration) -> JoinHandle<()> {
    let cancel = bridge.cancel_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = bridge.correlator().sweep_expired(ttl);
                    if removed > 0 {
                        tracing::info!(removed, "Expired unread results");
                    }
                }
            }
        }
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(bridge): State<Bridge>,
) -> impl IntoResponse {
    let page = params
        .page
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| bridge.config().default_page.clone());
    ws.on_upgrade(move |socket| handle_socket(socket, bridge, PageKey::from(page)))
}

async fn handle_socket(socket: WebSocket, bridge: Bridge, page: PageKey) {
    let (conn, rx) = bridge.open_connection(page);
    let (ws_tx, ws_rx) = socket.split();

    let heartbeat = Duration::from_secs(bridge.config().heartbeat_interval_secs);
    let writer = tokio::spawn(write_frames(ws_tx, rx, Arc::clone(&conn), heartbeat));

    let frames = ws_rx
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, WsMessage::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(text.to_string()),
                _ => None,
            })
        })
        .take_until(bridge.cancel_token().cancelled_owned());

    bridge.serve_connection(Arc::clone(&conn), frames).await;
    writer.abort();
}

/// Forward queued frames to the socket, with periodic pings.
async fn write_frames<S>(
    mut ws_tx: S,
    mut rx: mpsc::Receiver<String>,
    conn: Arc<Connection>,
    heartbeat: Duration,
) where
    S: futures::Sink<WsMessage> + Unpin,
{
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.tick().await;

    let closed = conn.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            _ = &mut closed => break,
            msg = rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
                tracing::trace!(connection_id = %conn.id, "Sent ping");
            }
        }
    }
    let _ = ws_tx.send(WsMessage::Close(None)).await;
}

async fn health_handler(State(bridge): State<Bridge>) -> impl IntoResponse {
    let manager = bridge.manager();
    let correlator = bridge.correlator();
    let pages: Vec<String> = manager.pages().iter().map(|p| p.to_string()).collect();
    Json(serde_json::json!({
        "status": "healthy",
        "connections": manager.count(),
        "pages": pages,
        "pending_calls": correlator.pending_count(),
        "unread_results": correlator.unread_count(),
        "buffered_calls": manager.buffer().len(),
        "exposed_functions": bridge.registry().count(),
    }))
}

/// Exposed host functions, for the peer to build its local stubs from.
async fn functions_handler(State(bridge): State<Bridge>) -> impl IntoResponse {
    Json(serde_json::json!({
        "functions": bridge.exposed_names(),
        "remote": bridge.remote_names(),
    }))
}
