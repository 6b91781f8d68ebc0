//! HTTP query API.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/embedding-dual-retrieval` | Access-gated dual-column dense retrieval |
//! | `POST` | `/query` | Dense / sparse / fused hybrid search |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Identity arrives from the authenticating proxy in the `x-user-id` header
//! (JWT validation is outside this service); the raw `Authorization` value
//! is forwarded to the external group-membership check.
//!
//! # Error Contract
//!
//! All error responses use one envelope:
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "embeddings not ready ..." } }
//! ```
//!
//! Codes: `bad_request` (400), `not_ready` (503, retryable),
//! `embedding_error` (502), `internal` (500). Access-denied ids are not
//! errors: they come back in the response body so callers can see exactly
//! what was filtered.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::access::{AccessClassifier, GroupMembership};
use crate::config::Config;
use crate::embedding::EmbeddingService;
use crate::models::RetrievedChunk;
use crate::retrieval::{HybridParams, RetrievalEngine, RetrievalError, SearchMode};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub engine: RetrievalEngine,
    pub classifier: AccessClassifier,
    pub embedding: Arc<dyn EmbeddingService>,
    pub membership: Arc<dyn GroupMembership>,
}

/// Build the router; separated from [`run_server`] so tests can drive the
/// handlers without binding a socket.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/embedding-dual-retrieval", post(handle_dual_retrieval))
        .route("/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured bind address.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();
    let app = router(state);

    tracing::info!(bind = %bind_addr, "query API listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
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

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn retrieval_error(err: RetrievalError) -> AppError {
    match err {
        RetrievalError::NotReady { .. } => AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "not_ready".to_string(),
            message: err.to_string(),
        },
        RetrievalError::Embedding(_) => AppError {
            status: StatusCode::BAD_GATEWAY,
            code: "embedding_error".to_string(),
            message: err.to_string(),
        },
        RetrievalError::Store(_) => internal(err.to_string()),
    }
}

fn caller_identity(headers: &HeaderMap) -> Result<(String, String), AppError> {
    let user = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("x-user-id header required"))?;
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    Ok((user, token))
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

// ============ POST /embedding-dual-retrieval ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DualRetrievalRequest {
    user_input: String,
    #[serde(default)]
    data_sources: Vec<String>,
    #[serde(default)]
    group_data_sources: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DualRetrievalResponse {
    result: Vec<RetrievedChunk>,
    access_denied: Vec<String>,
}

async fn handle_dual_retrieval(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DualRetrievalRequest>,
) -> Result<Json<DualRetrievalResponse>, AppError> {
    if req.user_input.trim().is_empty() {
        return Err(bad_request("userInput must not be empty"));
    }
    let (user, token) = caller_identity(&headers)?;

    let classification = state
        .classifier
        .classify(
            &req.data_sources,
            &req.group_data_sources,
            &user,
            &token,
            state.membership.as_ref(),
        )
        .await
        .map_err(|e| internal(e.to_string()))?;

    // Denied ids are reported, never silently queried.
    if classification.accessible.is_empty() {
        return Ok(Json(DualRetrievalResponse {
            result: Vec::new(),
            access_denied: classification.denied,
        }));
    }

    let limit = req.limit.unwrap_or(state.config.retrieval.default_limit);
    let result = state
        .engine
        .dual_retrieve(
            state.embedding.as_ref(),
            &req.user_input,
            &classification.accessible,
            limit,
        )
        .await
        .map_err(retrieval_error)?;

    Ok(Json(DualRetrievalResponse {
        result,
        access_denied: classification.denied,
    }))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    document_ids: Vec<String>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    search_mode: Option<String>,
    #[serde(default)]
    dense_weight: Option<f64>,
    #[serde(default)]
    sparse_weight: Option<f64>,
    #[serde(default)]
    use_rrf: Option<bool>,
}

#[derive(Serialize)]
struct QueryResponse {
    results: Vec<RetrievedChunk>,
    total_results: usize,
    search_mode: &'static str,
    processing_time_ms: u128,
    access_denied: Vec<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let mode = match req.search_mode.as_deref() {
        None => SearchMode::Hybrid,
        Some(s) => SearchMode::parse(s)
            .ok_or_else(|| bad_request(format!("unknown search_mode: {}", s)))?,
    };
    let (user, _token) = caller_identity(&headers)?;

    let started = std::time::Instant::now();

    let classification = state
        .classifier
        .classify_individual(&req.document_ids, &user)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let params = HybridParams {
        top_k: req.top_k.unwrap_or(state.config.retrieval.default_limit),
        mode,
        dense_weight: req
            .dense_weight
            .unwrap_or(state.config.retrieval.dense_weight),
        sparse_weight: req
            .sparse_weight
            .unwrap_or(state.config.retrieval.sparse_weight),
        use_rrf: req.use_rrf.unwrap_or(false),
    };

    let results = state
        .engine
        .hybrid_search(
            state.embedding.as_ref(),
            &req.query,
            &classification.accessible,
            &params,
        )
        .await
        .map_err(retrieval_error)?;

    Ok(Json(QueryResponse {
        total_results: results.len(),
        results,
        search_mode: mode.as_str(),
        processing_time_ms: started.elapsed().as_millis(),
        access_denied: classification.denied,
    }))
}
