use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use corazon_protocol::{encode_chunk, parse_start_index, RUN_ID_HEADER};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::agent::{AgentEngine, RuntimeThreads};
use crate::config::ServerConfig;
use crate::corazon_config::CorazonConfig;
use crate::paths::{is_path_component, ThreadPaths};
use crate::relay::{ChunkStream, RunRegistry};
use crate::storage::{ThreadCursor, ThreadStore};
use crate::turn::{TurnOrchestrator, TurnRequest};

const DEFAULT_THREAD_PAGE: usize = 50;
const MAX_THREAD_PAGE: usize = 200;

/// Shared state accessible by handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub store: Arc<dyn ThreadStore>,
    pub runs: Arc<RunRegistry>,
    pub threads: Arc<RuntimeThreads>,
    pub paths: ThreadPaths,
    pub turns: TurnOrchestrator,
}

/// Build the axum router for the chat API.
///
/// Spawns the background sweep that evicts finished, unattached runs, so it
/// must be called from within a tokio runtime.
pub fn build_router(
    config: ServerConfig,
    store: Arc<dyn ThreadStore>,
    engine: Arc<dyn AgentEngine>,
    corazon_config: Arc<CorazonConfig>,
    paths: ThreadPaths,
) -> Router {
    let runs = Arc::new(RunRegistry::new(
        store.clone(),
        config.reconnect_idle_timeout,
    ));
    let threads = Arc::new(RuntimeThreads::new());
    let turns = TurnOrchestrator::new(
        engine,
        store.clone(),
        runs.clone(),
        threads.clone(),
        paths.clone(),
        corazon_config,
    );

    let sweeper = runs.clone();
    let retention = config.run_retention;
    let period = config.run_sweep_interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            sweeper.sweep(retention);
        }
    });

    let state = AppState {
        store,
        runs,
        threads,
        paths,
        turns,
    };

    Router::new()
        .route("/api/chat", post(start_turn))
        .route("/api/chat/{run_id}/stream", get(reconnect))
        .route("/api/chat/{run_id}/stop", post(stop_turn))
        .route("/api/chat/history/{thread_id}", get(history))
        .route("/api/chat/threads", get(list_threads))
        .route("/api/chat/threads/{thread_id}", delete(delete_thread))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body: `{"error": "..."}`.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Render a chunk stream as SSE `data:` events closed by `data: [DONE]`.
fn sse_response(run_id: &str, chunks: ChunkStream) -> Response {
    let events = chunks
        .filter_map(|chunk| async move {
            match encode_chunk(&chunk) {
                Ok(json) => Some(Ok::<_, Infallible>(Event::default().data(json))),
                Err(e) => {
                    tracing::warn!(kind = chunk.type_name(), "chunk encode failed: {e}");
                    None
                }
            }
        })
        .chain(stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        }));
    ([(RUN_ID_HEADER, run_id.to_string())], Sse::new(events)).into_response()
}

async fn start_turn(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<Response, ApiError> {
    if let Some(thread_id) = request
        .thread_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
    {
        check_id(thread_id)?;
    }
    if let Some(upload_id) = request
        .attachment_upload_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
    {
        if !is_path_component(upload_id) {
            return Err(ApiError::bad_request("Invalid attachmentUploadId."));
        }
    }
    let turn = state.turns.create_turn_stream(request).map_err(|e| ApiError {
        status: StatusCode::CONFLICT,
        message: e,
    })?;
    Ok(sse_response(&turn.run_id, turn.chunks))
}

async fn reconnect(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    if run_id.trim().is_empty() {
        return Err(ApiError::bad_request("Missing run id."));
    }
    let start_index = parse_start_index(query.get("startIndex").map(String::as_str))
        .map_err(|_| ApiError::bad_request("Invalid startIndex."))?;
    tracing::debug!(%run_id, ?start_index, "stream reconnect");
    let chunks = state.runs.get_readable(&run_id, start_index);
    Ok(sse_response(&run_id, chunks))
}

async fn stop_turn(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Json<serde_json::Value> {
    let stopped = state.runs.cancel(&run_id);
    Json(json!({ "stopped": stopped }))
}

async fn history(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_id(&thread_id)?;
    let messages = state
        .store
        .load_messages(&thread_id)
        .map_err(ApiError::internal)?
        .unwrap_or_default();
    let active_run_id = state
        .store
        .get_active_run(&thread_id)
        .map_err(ApiError::internal)?;
    Ok(Json(json!({
        "messages": messages,
        "activeRunId": active_run_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadsQuery {
    limit: Option<usize>,
    cursor_updated_at: Option<i64>,
    cursor_id: Option<String>,
}

async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ThreadsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_THREAD_PAGE)
        .clamp(1, MAX_THREAD_PAGE);
    let cursor = match (query.cursor_updated_at, query.cursor_id) {
        (Some(updated_at), Some(id)) => Some(ThreadCursor { updated_at, id }),
        (None, None) => None,
        _ => return Err(ApiError::bad_request("Incomplete cursor.")),
    };
    let threads = state
        .store
        .list_threads(limit, cursor.as_ref())
        .map_err(ApiError::internal)?;
    let next_cursor = threads
        .last()
        .filter(|_| threads.len() == limit)
        .map(|last| json!({ "updatedAt": last.updated_at, "id": last.id }));
    Ok(Json(json!({
        "threads": threads,
        "nextCursor": next_cursor,
    })))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_id(&thread_id)?;
    if let Some(run_id) = state.runs.attach_run(&thread_id) {
        state.runs.cancel(&run_id);
    }
    state
        .store
        .delete_thread(&thread_id)
        .map_err(ApiError::internal)?;
    if let Err(e) = state.paths.remove_thread_dir(&thread_id) {
        tracing::warn!(%thread_id, "thread dir removal failed: {e}");
    }
    state.threads.remove(&thread_id);
    tracing::info!(%thread_id, "thread deleted");
    Ok(Json(json!({ "deleted": true })))
}

/// Thread ids double as directory names.
fn check_id(id: &str) -> Result<(), ApiError> {
    let valid = is_path_component(id) && !id.starts_with('_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request("Invalid thread id."))
    }
}
