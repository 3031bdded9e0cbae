//! HTTP and WebSocket handlers
//!
//! REST endpoints for session lifecycle and the two WebSocket surfaces:
//! `/ws/cli/:id` speaks newline-delimited JSON with the upstream CLI, and
//! `/ws/browser/:id` speaks JSON frames with browser clients. Each socket
//! gets an unbounded mpsc write pump; the bridge holds only the sender.

use crate::bridge::hub::Hub;
use crate::bridge::types::{parse_upstream_line, BackendKind, BrowserCommand, LineAssembler};
use crate::launcher::CliLauncher;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub launcher: Arc<CliLauncher>,
}

/// Build the server router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route(
            "/api/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/:id/relaunch", post(relaunch_session))
        .route("/ws/cli/:id", get(ws_cli_upgrade))
        .route("/ws/browser/:id", get(ws_browser_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// REST handlers
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    model: Option<String>,
    permission_mode: Option<String>,
    cwd: Option<String>,
    backend_kind: Option<BackendKind>,
}

/// Create a session. Primary sessions also get a CLI process spawned;
/// adapter-typed sessions wait for their adapter to attach.
async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let session_id = uuid::Uuid::new_v4().to_string();
    state
        .hub
        .ensure_session(&session_id, request.backend_kind)
        .await;

    if request.backend_kind == Some(BackendKind::SubprocessAdapter) {
        let snapshot = state.hub.snapshot(&session_id).await;
        return (
            StatusCode::CREATED,
            Json(serde_json::to_value(snapshot).unwrap_or_default()),
        );
    }

    match state
        .launcher
        .spawn(
            &session_id,
            request.model,
            request.permission_mode,
            request.cwd,
        )
        .await
    {
        Ok(record) => (
            StatusCode::CREATED,
            Json(serde_json::to_value(record).unwrap_or_default()),
        ),
        Err(e) => {
            state.hub.remove_session(&session_id).await;
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.snapshots().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.hub.snapshot(&id).await {
        Some(snapshot) => (
            StatusCode::OK,
            Json(serde_json::to_value(snapshot).unwrap_or_default()),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Session not found" })),
        ),
    }
}

/// Delete a session: kill the process and remove all state.
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.hub.get(&id).await.is_none() {
        return StatusCode::NOT_FOUND;
    }
    let _ = state.launcher.kill(&id).await;
    state.launcher.remove(&id).await;
    state.hub.close_session(&id).await;
    StatusCode::NO_CONTENT
}

async fn relaunch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.launcher.relaunch(&id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

// =============================================================================
// WebSocket handlers
// =============================================================================

async fn ws_cli_upgrade(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_cli_ws(socket, session_id, state))
}

/// Upstream socket: newline-delimited JSON, one message per line. Chunks are
/// reassembled, each complete line parsed, each parsed message routed.
async fn handle_cli_ws(socket: WebSocket, session_id: String, state: AppState) {
    tracing::info!(session_id = %session_id, "CLI WebSocket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state.hub.handle_cli_open(&session_id, tx).await;
    state.launcher.mark_connected(&session_id).await;

    let send_session_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if ws_sender.send(Message::Text(line)).await.is_err() {
                tracing::debug!(session_id = %send_session_id, "CLI WebSocket send failed");
                break;
            }
        }
    });

    let recv_hub = state.hub.clone();
    let recv_session_id = session_id.clone();
    let recv_task = tokio::spawn(async move {
        let mut assembler = LineAssembler::new();
        while let Some(Ok(message)) = ws_receiver.next().await {
            let chunk = match message {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => break,
                _ => continue,
            };

            for line in assembler.push(&chunk) {
                if let Some(parsed) = parse_upstream_line(&line) {
                    recv_hub.handle_cli_message(&recv_session_id, parsed).await;
                }
            }
        }

        // A half-delivered final line is still worth a parse attempt
        if let Some(rest) = assembler.finish() {
            if let Some(parsed) = parse_upstream_line(&rest) {
                recv_hub.handle_cli_message(&recv_session_id, parsed).await;
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.hub.handle_cli_close(&session_id).await;
    tracing::info!(session_id = %session_id, "CLI WebSocket disconnected");
}

async fn ws_browser_upgrade(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_browser_ws(socket, session_id, state))
}

/// Browser socket: JSON commands in, sequenced JSON frames out. Connecting
/// replays the snapshot, history and pending permissions.
async fn handle_browser_ws(socket: WebSocket, session_id: String, state: AppState) {
    let browser_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        session_id = %session_id,
        browser_id = %browser_id,
        "Browser WebSocket connected"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state
        .hub
        .handle_browser_open(&session_id, &browser_id, tx)
        .await;

    let send_session_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                tracing::debug!(session_id = %send_session_id, "Browser WebSocket send failed");
                break;
            }
        }
    });

    let recv_hub = state.hub.clone();
    let recv_session_id = session_id.clone();
    let recv_browser_id = browser_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<BrowserCommand>(&text) {
                    Ok(command) => {
                        recv_hub
                            .route_browser_message(&recv_session_id, &recv_browser_id, command)
                            .await;
                    }
                    Err(e) => {
                        let preview = &text[..text.len().min(200)];
                        tracing::warn!(
                            session_id = %recv_session_id,
                            "Invalid browser message: {} (raw: {})",
                            e,
                            preview
                        );
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state
        .hub
        .handle_browser_close(&session_id, &browser_id)
        .await;
    tracing::info!(
        session_id = %session_id,
        browser_id = %browser_id,
        "Browser WebSocket disconnected"
    );
}
