//! HTTP server exposing the WebSocket endpoint.

use crate::config::SpeechConfig;
use crate::error::Result;
use crate::transport::ServerMessage;
use crate::transport::session::{Session, SessionEngines};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by every connection.
pub struct AppState {
    pub config: SpeechConfig,
    pub engines: SessionEngines,
    active_sessions: AtomicUsize,
}

impl AppState {
    pub fn new(config: SpeechConfig, engines: SessionEngines) -> Self {
        Self {
            config,
            engines,
            active_sessions: AtomicUsize::new(0),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("listening on ws://{}/ws", listener.local_addr()?);
    axum::serve(listener, router(Arc::new(state)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("server stopped");
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.active_sessions(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerMessage>(state.config.server.outbound_capacity.max(1));

    let session = match Session::start(state.config.clone(), &state.engines, outbound_tx).await {
        Ok(session) => session,
        Err(e) => {
            warn!("failed to start session: {e}");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = session.id().to_owned();
    state.active_sessions.fetch_add(1, Ordering::SeqCst);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to encode server message: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(raw)) => {
                if let Err(e) = session.handle_audio(raw) {
                    debug!(session = %session_id, "dropping audio frame: {e}");
                }
            }
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session_id, "websocket read failed: {e}");
                break;
            }
        }
    }

    // Closing the session drops the last outbound sender, which ends the writer.
    session.close().await;
    if let Err(e) = writer.await {
        warn!(session = %session_id, "websocket writer failed: {e}");
    }
    state.active_sessions.fetch_sub(1, Ordering::SeqCst);
    info!(session = %session_id, "client disconnected");
}
