//! HTTP and WebSocket surface.
//!
//! Identity comes from the `x-ttyhub-user` header, which an authenticating
//! proxy in front of the broker is expected to set.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::models::{
    AttachQuery, ClientFrame, CreateSessionRequest, CreateSessionResponse, Geometry, InputRequest,
    MintTokenRequest, MintTokenResponse, ResizeRequest, ServerFrame,
};
use crate::registry::SessionRegistry;
use crate::session::{Connection, Outbound};
use crate::token::AttachTokenRecord;

pub const OWNER_HEADER: &str = "x-ttyhub-user";

/// Caller identity.
#[derive(Debug, Clone)]
pub struct Owner(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = BrokerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Owner(value.to_string()))
            .ok_or(BrokerError::Unauthorized)
    }
}

pub fn build_router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/resize", post(resize_session))
        .route("/sessions/:id/input", post(send_input))
        .route("/sessions/:id/tokens", post(mint_token))
        .route("/sessions/:id/capture", get(capture_session))
        .route("/resume/:key", get(resume_session))
        .route("/attach", get(attach_websocket))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health(State(registry): State<Arc<SessionRegistry>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": registry.len(),
    }))
}

async fn list_sessions(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "sessions": registry.list(&owner),
    }))
}

async fn create_session(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
    Json(request): Json<CreateSessionRequest>,
) -> BrokerResult<impl IntoResponse> {
    info!(
        "[http] POST /sessions - owner={}, mode={}, cwd={:?}",
        owner, request.mode, request.cwd
    );
    // Fork/exec runs off the async workers
    let (session, resumed) =
        tokio::task::spawn_blocking(move || registry.create(&owner, request))
            .await
            .map_err(|e| BrokerError::Internal(format!("create task failed: {e}")))??;
    let status = if resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(CreateSessionResponse {
            session: session.info(),
            resumed,
        }),
    ))
}

async fn get_session(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> BrokerResult<impl IntoResponse> {
    Ok(Json(registry.get(&owner, &id)?.info()))
}

async fn delete_session(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> BrokerResult<impl IntoResponse> {
    info!("[http] DELETE /sessions/{} - owner={}", id, owner);
    registry.close(&owner, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resize_session(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> BrokerResult<impl IntoResponse> {
    registry.resize(&owner, &id, request.cols, request.rows)?;
    Ok(Json(registry.get(&owner, &id)?.info()))
}

async fn send_input(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
    Json(request): Json<InputRequest>,
) -> BrokerResult<impl IntoResponse> {
    registry.get(&owner, &id)?;
    registry.write(&id, request.data.as_bytes())?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mint_token(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
    request: Option<Json<MintTokenRequest>>,
) -> BrokerResult<impl IntoResponse> {
    let geometry = request.and_then(|Json(req)| match (req.cols, req.rows) {
        (Some(cols), Some(rows)) => Some(Geometry::new(cols, rows)),
        _ => None,
    });
    let token = registry.mint_attach_token(&owner, &id, geometry)?;
    Ok(Json(MintTokenResponse {
        ws_url: format!("/attach?token={}", token),
        token,
        expires_in_ms: registry.token_ttl().as_millis() as u64,
    }))
}

async fn capture_session(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> BrokerResult<impl IntoResponse> {
    let session = registry.get(&owner, &id)?;
    Ok(Json(session.capture().await?))
}

async fn resume_session(
    State(registry): State<Arc<SessionRegistry>>,
    Owner(owner): Owner,
    Path(key): Path<String>,
) -> BrokerResult<impl IntoResponse> {
    registry
        .find_by_resume_key(&owner, &key)
        .map(|session| Json(session.info()))
        .ok_or(BrokerError::NotFound(key))
}

// =============================================================================
// Attach WebSocket
// =============================================================================

/// The token is redeemed before the upgrade so a bad token never gets a socket.
async fn attach_websocket(
    State(registry): State<Arc<SessionRegistry>>,
    Query(query): Query<AttachQuery>,
    ws: WebSocketUpgrade,
) -> BrokerResult<impl IntoResponse> {
    let record = registry.consume_attach_token(&query.token)?;
    Ok(ws.on_upgrade(move |socket| handle_attach_socket(socket, registry, record)))
}

fn encode(message: Outbound) -> (Message, bool) {
    match message {
        Outbound::Snapshot(data) => (
            Message::Text(serde_json::to_string(&ServerFrame::Snapshot { data }).unwrap_or_default()),
            false,
        ),
        Outbound::Output(data) => (Message::Binary(data.to_vec()), false),
        Outbound::Exit(exit) => (
            Message::Text(
                serde_json::to_string(&ServerFrame::Exit {
                    code: exit.code,
                    signal: exit.signal,
                })
                .unwrap_or_default(),
            ),
            true,
        ),
    }
}

async fn handle_attach_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    record: AttachTokenRecord,
) {
    let (mut sender, mut receiver) = socket.split();
    let session_id = record.session_id.clone();
    let owner = record.user_id.clone();
    let (conn, mut outbound) = Connection::new();
    let conn_id = conn.id();

    info!("[attach:{}] Viewer {} connected", session_id, conn_id);

    let label = session_id.clone();
    let forward = tokio::spawn(async move {
        let mut sent_bytes = 0usize;
        while let Some(message) = outbound.recv().await {
            let (frame, last) = encode(message);
            if let Message::Binary(data) = &frame {
                sent_bytes += data.len();
            }
            if sender.send(frame).await.is_err() {
                debug!("[attach:{}] Viewer {} send failed", label, conn_id);
                break;
            }
            if last {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
        debug!(
            "[attach:{}] Forwarder for viewer {} finished after {} bytes",
            label, conn_id, sent_bytes
        );
    });

    // Viewer geometry from the token acts as the first resize
    if let Some(geometry) = record.geometry {
        if let Err(e) = registry.resize(&owner, &session_id, geometry.cols, geometry.rows) {
            warn!("[attach:{}] Initial resize failed: {}", session_id, e);
        }
    }

    match registry.attach(&session_id, conn).await {
        Ok(true) => {}
        Ok(false) => {
            forward.abort();
            return;
        }
        Err(e) => {
            warn!("[attach:{}] Attach failed: {}", session_id, e);
            forward.abort();
            return;
        }
    }

    let write = |data: &[u8]| {
        if let Err(e) = registry.write(&session_id, data) {
            debug!("[attach:{}] Input dropped: {}", session_id, e);
        }
    };

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Binary(data)) => write(&data),
            Ok(Message::Text(text)) => {
                if text.starts_with('{') {
                    if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                        match frame {
                            ClientFrame::Resize { cols, rows } => {
                                if let Err(e) = registry.resize(&owner, &session_id, cols, rows) {
                                    debug!("[attach:{}] Resize dropped: {}", session_id, e);
                                }
                            }
                            ClientFrame::Input { data } => write(data.as_bytes()),
                        }
                        continue;
                    }
                }
                write(text.as_bytes());
            }
            Ok(Message::Close(reason)) => {
                debug!("[attach:{}] Client sent close frame: {:?}", session_id, reason);
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(e) => {
                warn!("[attach:{}] WebSocket receive error: {}", session_id, e);
                break;
            }
        }
    }

    forward.abort();
    registry.detach(&session_id, conn_id);
    info!("[attach:{}] Viewer {} disconnected", session_id, conn_id);
}
