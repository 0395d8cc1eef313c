//! Crate-wide error taxonomy
//!
//! Each pipeline stage gets its own error enum via `thiserror` so callers can
//! match on cause; `RagError` composes them for the HTTP boundary, the way
//! `oriongraph::server` maps a single `anyhow::Error` to a status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedder unavailable: {0}")]
    Embedder(String),
    #[error("vector store query failed: {0}")]
    VectorStore(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("llm provider '{0}' is not configured")]
    ProviderNotConfigured(String),
    #[error("llm call failed: {0}")]
    Upstream(String),
    #[error("generation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("job queue is closed")]
    QueueClosed,
    #[error("message {0} not found")]
    MessageNotFound(String),
    #[error("job exceeded max attempts ({0})")]
    RetriesExhausted(u32),
}

/// Top-level error surfaced at the HTTP boundary.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payload too large: {0}")]
    TooLarge(String),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RagError {
    fn status(&self) -> StatusCode {
        match self {
            RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::Conflict(_) => StatusCode::CONFLICT,
            RagError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RagError::Fabric(FabricError::MessageNotFound(_)) => StatusCode::NOT_FOUND,
            RagError::Retrieval(_) | RagError::Generation(_) | RagError::Fabric(_) => {
                StatusCode::BAD_GATEWAY
            }
            RagError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RagError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type RagResult<T> = Result<T, RagError>;
