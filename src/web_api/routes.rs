//! API Routes

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use crate::command_router::{Command, CommandKind, CommandOrigin, InboundCommand};
use crate::device_state::locations;
use crate::error::{Error, Result};
use crate::models::{ApiResponse, CommandResult};
use crate::realtime_hub::{HubMessage, OutboundFrame};
use crate::state::AppState;

/// Session cookie shared with the bundled UI
const SESSION_COOKIE: &str = "berrycamSession";

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & sessions
        .route("/healthz", get(super::health_check))
        .route("/login", post(login))
        .route("/logout", post(logout))
        // Status
        .route("/api/status", get(get_status))
        // Streaming
        .route("/api/stream/start", post(start_stream))
        .route("/api/stream/stop", post(stop_stream))
        // On-device AI
        .route("/api/ai/enable", post(ai_enable))
        .route("/api/ai/disable", post(ai_disable))
        .route("/api/ai/run", post(ai_run))
        .route("/api/ai/status", get(ai_status))
        // Locations
        .route("/api/locations", get(list_locations))
        .route("/api/location", post(change_location))
        // Settings
        .route("/api/settings", get(get_settings))
        .route("/api/settings", post(update_settings))
        // Photo capture
        .route("/api/photo", post(take_photo))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Session plumbing
// ========================================

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pull the session token off a request: bearer header first, then the
/// session cookie, then an explicit query parameter.
fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for part in cookies.split(';') {
            if let Some(rest) = part.trim().strip_prefix(SESSION_COOKIE) {
                if let Some(token) = rest.strip_prefix('=') {
                    return Some(token.to_string());
                }
            }
        }
    }

    query_token.map(|t| t.to_string())
}

/// Reject the request unless it carries a live session
async fn authorize(state: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> Result<()> {
    let token = extract_token(headers, query_token)
        .ok_or_else(|| Error::Unauthorized("session token required".to_string()))?;

    if !state.sessions.verify(&token).await {
        return Err(Error::Unauthorized(
            "invalid or expired session".to_string(),
        ));
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    password: String,
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Result<Response> {
    let Some(token) = state.sessions.login(&req.password).await else {
        return Err(Error::Unauthorized("invalid password".to_string()));
    };

    let cookie = format!("{}={}; HttpOnly; Path=/", SESSION_COOKIE, token);
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "token": token })),
    )
        .into_response())
}

/// Drop the presented session, valid or not, and expire the cookie
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = extract_token(&headers, None) {
        state.sessions.logout(&token).await;
    }

    let cookie = format!("{}=; HttpOnly; Path=/; Max-Age=0", SESSION_COOKIE);
    ([(header::SET_COOKIE, cookie)], Json(json!({ "ok": true }))).into_response()
}

// ========================================
// Command dispatch
// ========================================

/// Queue a command onto the control loop and wait for its outcome
async fn dispatch_local(state: &AppState, command: Command) -> Result<Response> {
    let (tx, rx) = oneshot::channel();
    let inbound = InboundCommand::with_reply(command, CommandOrigin::Local, tx);

    state
        .command_tx
        .send(inbound)
        .await
        .map_err(|_| Error::Internal("command queue closed".to_string()))?;

    let result = rx
        .await
        .map_err(|_| Error::Internal("command reply dropped".to_string()))?;

    Ok(render_result(result))
}

/// A busy camera maps to 409, other failures to 400
fn render_result(result: CommandResult) -> Response {
    if result.is_failed() {
        let message = result
            .payload
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("command failed")
            .to_string();
        let status = if message == "camera_busy" {
            StatusCode::CONFLICT
        } else {
            StatusCode::BAD_REQUEST
        };
        return (status, Json(ApiResponse::<serde_json::Value>::error(message))).into_response();
    }

    Json(ApiResponse::success(result.payload)).into_response()
}

// ========================================
// Status Handlers
// ========================================

async fn get_status(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    let snapshot = state.router.status_snapshot().await;
    Ok(Json(ApiResponse::success(snapshot)).into_response())
}

// ========================================
// Streaming Handlers
// ========================================

async fn start_stream(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    dispatch_local(
        &state,
        Command::new(CommandKind::StartStream, serde_json::Value::Null),
    )
    .await
}

async fn stop_stream(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    dispatch_local(
        &state,
        Command::new(CommandKind::StopStream, serde_json::Value::Null),
    )
    .await
}

// ========================================
// AI Handlers
// ========================================

async fn ai_enable(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    let params = body.map(|Json(v)| v).unwrap_or(serde_json::Value::Null);
    dispatch_local(&state, Command::new(CommandKind::AiEnable, params)).await
}

async fn ai_disable(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    dispatch_local(
        &state,
        Command::new(CommandKind::AiDisable, serde_json::Value::Null),
    )
    .await
}

async fn ai_run(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    dispatch_local(
        &state,
        Command::new(CommandKind::AiRun, serde_json::Value::Null),
    )
    .await
}

async fn ai_status(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    let snapshot = state.router.status_snapshot().await;
    Ok(Json(ApiResponse::success(snapshot.ai)).into_response())
}

// ========================================
// Location Handlers
// ========================================

async fn list_locations(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    Ok(Json(ApiResponse::success(locations::catalog())).into_response())
}

async fn change_location(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<serde_json::Value>,
) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    dispatch_local(&state, Command::new(CommandKind::ChangeLocation, params)).await
}

// ========================================
// Settings Handlers
// ========================================

async fn get_settings(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    Ok(Json(ApiResponse::success(state.vault.view().await)).into_response())
}

async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<serde_json::Value>,
) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    dispatch_local(&state, Command::new(CommandKind::UpdateSettings, params)).await
}

// ========================================
// Photo Handler
// ========================================

async fn take_photo(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    authorize(&state, &headers, None).await?;
    dispatch_local(
        &state,
        Command::new(CommandKind::TakePhoto, serde_json::Value::Null),
    )
    .await
}

// ========================================
// WebSocket
// ========================================

/// WebSocket upgrade handler. The handshake cannot carry a JSON body,
/// so the token may ride in the query string.
async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    authorize(&state, &headers, query.token.as_deref()).await?;
    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, state)))
}

/// Handle one socket connection: register with the hub, drain its
/// outbound channel, and feed inbound text onto the command queue.
async fn handle_websocket(mut socket: WebSocket, state: AppState) {
    let (client_id, mut rx) = match state.hub.register().await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "Socket client rejected");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "Too many clients".into(),
                })))
                .await;
            return;
        }
    };

    tracing::info!(client_id = %client_id, "Socket client connected");

    // Fresh clients render immediately instead of waiting for the next
    // periodic broadcast.
    let snapshot = state.router.status_snapshot().await;
    state
        .hub
        .send_to(&client_id, HubMessage::Status(snapshot))
        .await;

    let (mut sender, mut receiver) = socket.split();

    // Forward hub traffic to the socket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text),
                OutboundFrame::Binary(bytes) => Message::Binary(bytes),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // Feed inbound text onto the command queue
    let command_tx = state.command_tx.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    let inbound = InboundCommand::new(
                        Command::decode(&text),
                        CommandOrigin::Socket(client_id),
                    );
                    if command_tx.send(inbound).await.is_err() {
                        tracing::error!("Command queue closed");
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    tracing::info!(client_id = %client_id, "Socket client disconnected");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "Socket error");
                    break;
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.hub.unregister(&client_id).await;
    tracing::debug!(client_id = %client_id, "Socket client unregistered");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_prefers_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer aaa".parse().unwrap());
        headers.insert(
            header::COOKIE,
            "berrycamSession=bbb".parse().unwrap(),
        );

        assert_eq!(extract_token(&headers, Some("ccc")).as_deref(), Some("aaa"));
    }

    #[test]
    fn test_extract_token_reads_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "theme=dark; berrycamSession=tok123; lang=en".parse().unwrap(),
        );

        assert_eq!(extract_token(&headers, None).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_extract_token_falls_back_to_query() {
        let headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, Some("qtok")).as_deref(), Some("qtok"));
        assert!(extract_token(&headers, None).is_none());
    }

    #[test]
    fn test_render_result_maps_busy_to_conflict() {
        let busy = render_result(CommandResult::failed("camera_busy"));
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        let other = render_result(CommandResult::failed("unknown_command: blink"));
        assert_eq!(other.status(), StatusCode::BAD_REQUEST);

        let ok = render_result(CommandResult::completed(json!({"streaming": true})));
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
