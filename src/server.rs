//! HTTP and WebSocket entry points over [`World`].

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::store::{AgentState, MemoryMatch, MemoryRecord};
use crate::world::{ResetError, ResetReport, World, WorldError, OBSERVE_MATCH_LIMIT};

const DEFAULT_MEMORY_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

pub type AppState = Arc<World>;

pub fn router(world: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/agents", get(list_agents))
        .route("/agents/:agent_id/state", get(get_state).put(put_state))
        .route("/agents/:agent_id/memories", get(get_memories))
        .route("/agents/:agent_id/observe", post(observe))
        .route("/reset", post(reset))
        .route("/ws", get(stream))
        .with_state(world)
}

pub async fn serve(world: AppState, bind: &str) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind = %bind, "api listening");
    axum::serve(listener, router(world)).await
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<WorldError> for ApiError {
    fn from(err: WorldError) -> Self {
        let status = match &err {
            WorldError::UnknownAgent(_) => StatusCode::NOT_FOUND,
            WorldError::UnknownZone(_) => StatusCode::BAD_REQUEST,
            WorldError::Store(_) | WorldError::Generative(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ResetError> for ApiError {
    fn from(err: ResetError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ObserveRequest {
    text: String,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ObserveResponse {
    agent_id: String,
    matches: Vec<MemoryMatch>,
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    zone: String,
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "Welcome to NPC Learn API" }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(world): State<AppState>) -> Json<serde_json::Value> {
    let metrics = world.metrics().await.clone();
    let subscribers = world.broadcaster().subscriber_count().await;
    Json(json!({
        "metrics": metrics,
        "success_rate": metrics.success_rate(),
        "subscribers": subscribers,
    }))
}

async fn list_agents(State(world): State<AppState>) -> Result<Json<Vec<AgentState>>, ApiError> {
    Ok(Json(world.agent_states().await?))
}

async fn get_state(
    State(world): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentState>, ApiError> {
    Ok(Json(world.agent_state(&agent_id).await?))
}

async fn put_state(
    State(world): State<AppState>,
    Path(agent_id): Path<String>,
    Json(body): Json<MoveRequest>,
) -> Result<Json<AgentState>, ApiError> {
    Ok(Json(world.move_agent(&agent_id, &body.zone).await?))
}

async fn get_memories(
    State(world): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<MemoryRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_MEMORY_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(world.recent_memories(&agent_id, limit).await?))
}

async fn observe(
    State(world): State<AppState>,
    Path(agent_id): Path<String>,
    Json(body): Json<ObserveRequest>,
) -> Result<Json<ObserveResponse>, ApiError> {
    if body.text.trim().is_empty() {
        return Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "text must not be empty".to_string(),
        });
    }
    let limit = body.limit.unwrap_or(OBSERVE_MATCH_LIMIT).clamp(1, MAX_LIMIT);
    let matches = world.observe(&agent_id, &body.text, limit).await?;
    Ok(Json(ObserveResponse { agent_id, matches }))
}

async fn reset(State(world): State<AppState>) -> Result<Json<ResetReport>, ApiError> {
    Ok(Json(world.reset().await?))
}

async fn stream(ws: WebSocketUpgrade, State(world): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_socket(socket, world))
}

/// The two halves of a viewer connection the stream loop needs
#[async_trait]
trait ViewerSocket: Send {
    /// `false` once the viewer can no longer be written to
    async fn send_text(&mut self, text: String) -> bool;

    /// Next frame from the viewer; `None` on close or error
    async fn next_frame(&mut self) -> Option<Message>;
}

#[async_trait]
impl ViewerSocket for WebSocket {
    async fn send_text(&mut self, text: String) -> bool {
        self.send(Message::Text(text)).await.is_ok()
    }

    async fn next_frame(&mut self) -> Option<Message> {
        match self.recv().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => None,
            Some(Ok(message)) => Some(message),
        }
    }
}

async fn stream_socket<S: ViewerSocket>(mut socket: S, world: AppState) {
    let (id, mut rx) = world.broadcaster().subscribe().await;
    info!(subscriber = id, "viewer connected");

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(message) = outgoing else {
                    // Pruned by the broadcaster
                    break;
                };
                let payload = match serde_json::to_string(&message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to encode stream message");
                        continue;
                    }
                };
                if !socket.send_text(payload).await {
                    break;
                }
            }
            incoming = socket.next_frame() => {
                match incoming {
                    None => break,
                    Some(other) => debug!(subscriber = id, message = ?other, "ignoring viewer message"),
                }
            }
        }
    }

    world.broadcaster().unsubscribe(id).await;
    info!(subscriber = id, "viewer disconnected");
}
