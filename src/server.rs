//! HTTP surface.
//!
//! A thin JSON layer over the [`Ingestor`](crate::ingest::Ingestor) and
//! the [`ConversationGraph`](crate::conversation::ConversationGraph).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Register an uploaded document (optionally attach it) |
//! | `GET`  | `/documents/{id}` | Document and ingestion status |
//! | `POST` | `/documents/{id}/ingest` | Extract, chunk and index |
//! | `DELETE` | `/documents/{id}/index` | Remove index records, reset to pending |
//! | `POST` | `/threads/{id}/documents/{doc}` | Attach a document to a thread |
//! | `POST` | `/threads/{id}/ingest` | Ingest the thread's pending documents |
//! | `GET`  | `/threads/{id}` | Thread history |
//! | `POST` | `/threads/{id}/messages` | Start a turn; streams SSE |
//! | `DELETE` | `/threads/{id}/turn` | Cancel the in-flight turn |
//! | `GET`  | `/health` | Health check |
//!
//! # Stream format
//!
//! Each SSE `data` payload is a JSON object
//! `{"type": "sources" | "text" | "end" | "error", "content": ...}`.
//! Closing the connection cancels the turn.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document 42 not found" } }
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use docchat_core::models::{Document, IngestStatus, Thread};
use docchat_core::RagError;

use crate::app::App;
use crate::conversation::TurnEvent;

/// Cancellation tokens of in-flight turns, keyed by thread id. The turn
/// id distinguishes a finished turn's entry from its successor's.
#[derive(Default)]
struct InFlight(Mutex<HashMap<String, (String, CancellationToken)>>);

/// Removes a turn's registry entry when its stream is dropped.
struct InFlightEntry {
    registry: Arc<InFlight>,
    thread_id: String,
    turn_id: String,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let mut map = self.registry.0.lock().unwrap();
        if map
            .get(&self.thread_id)
            .is_some_and(|(turn_id, _)| *turn_id == self.turn_id)
        {
            map.remove(&self.thread_id);
        }
    }
}

#[derive(Clone)]
struct AppState {
    app: Arc<App>,
    in_flight: Arc<InFlight>,
}

pub fn router(app: Arc<App>) -> Router {
    let state = AppState {
        app,
        in_flight: Arc::new(InFlight::default()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents", post(handle_register))
        .route("/documents/{id}", get(handle_get_document))
        .route("/documents/{id}/ingest", post(handle_ingest))
        .route("/documents/{id}/index", delete(handle_unindex))
        .route("/threads/{id}", get(handle_get_thread))
        .route("/threads/{id}/documents/{doc}", post(handle_attach))
        .route("/threads/{id}/ingest", post(handle_ingest_thread))
        .route("/threads/{id}/messages", post(handle_message))
        .route("/threads/{id}/turn", delete(handle_cancel_turn))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Bind to `[server].bind` and serve until the process exits.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "server listening");
    println!("docchat listening on http://{}", bind_addr);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<RagError> for AppError {
    fn from(e: RagError) -> Self {
        let status = match &e {
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RagError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::TurnInProgress(_)
            | RagError::IngestInProgress(_)
            | RagError::AttachLimit { .. } => StatusCode::CONFLICT,
            RagError::Index(_) | RagError::Retrieval(_) | RagError::Generation(_) => {
                StatusCode::BAD_GATEWAY
            }
            RagError::Cancelled | RagError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ Documents ============

#[derive(Deserialize)]
struct RegisterRequest {
    filename: String,
    storage_key: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    thread_id: Option<String>,
}

async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    if req.filename.trim().is_empty() || req.storage_key.trim().is_empty() {
        return Err(bad_request("filename and storage_key must not be empty"));
    }
    let ingestor = &state.app.ingestor;
    let doc = ingestor
        .register(&req.filename, &req.storage_key, &req.content_type)
        .await?;
    if let Some(thread_id) = &req.thread_id {
        ingestor.attach(thread_id, &doc.id).await?;
    }
    let doc = ingestor.document(&doc.id).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Document>> {
    Ok(Json(state.app.ingestor.document(&id).await?))
}

#[derive(Serialize)]
struct StatusResponse {
    document_id: String,
    status: IngestStatus,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let status = state.app.ingestor.ingest(&id).await?;
    Ok(Json(StatusResponse {
        document_id: id,
        status,
    }))
}

#[derive(Serialize)]
struct UnindexResponse {
    document_id: String,
    removed: usize,
}

async fn handle_unindex(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<UnindexResponse>> {
    let removed = state.app.ingestor.unindex(&id).await?;
    Ok(Json(UnindexResponse {
        document_id: id,
        removed,
    }))
}

// ============ Threads ============

async fn handle_get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Thread>> {
    use docchat_core::repo::ThreadRepo;

    let thread = state
        .app
        .store
        .get_thread(&id)
        .await
        .map_err(RagError::from)?
        .ok_or_else(|| RagError::NotFound(format!("thread {}", id)))?;
    Ok(Json(thread))
}

async fn handle_attach(
    State(state): State<AppState>,
    Path((id, doc)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.app.ingestor.attach(&id, &doc).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct ThreadIngestItem {
    document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<IngestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetail>,
}

async fn handle_ingest_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ThreadIngestItem>>> {
    let results = state.app.ingestor.ingest_thread(&id).await?;
    let items = results
        .into_iter()
        .map(|(document_id, result)| match result {
            Ok(status) => ThreadIngestItem {
                document_id,
                status: Some(status),
                error: None,
            },
            Err(e) => ThreadIngestItem {
                document_id,
                status: None,
                error: Some(ErrorDetail {
                    code: e.code().to_string(),
                    message: e.to_string(),
                }),
            },
        })
        .collect();
    Ok(Json(items))
}

#[derive(Deserialize)]
struct MessageRequest {
    content: String,
}

async fn handle_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>> {
    if req.content.trim().is_empty() {
        return Err(bad_request("content must not be empty"));
    }
    let turn = state.app.graph.converse(&id, &req.content).await?;

    let turn_id = turn.user_message().id.clone();
    state
        .in_flight
        .0
        .lock()
        .unwrap()
        .insert(id.clone(), (turn_id.clone(), turn.cancel_token()));
    let entry = InFlightEntry {
        registry: state.in_flight.clone(),
        thread_id: id,
        turn_id,
    };

    let events = turn.map(move |event: TurnEvent| {
        let _registered = &entry;
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn handle_cancel_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let token = state
        .in_flight
        .0
        .lock()
        .unwrap()
        .get(&id)
        .map(|(_, token)| token.clone());
    match token {
        Some(token) => {
            token.cancel();
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(RagError::NotFound(format!("turn in flight on thread {}", id)).into()),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
