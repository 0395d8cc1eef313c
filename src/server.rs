//! HTTP + WebSocket surface for the retrieval-generation-verification
//! engine. Grounded on `docify`'s `api/conversations.py` (accept/status/
//! regenerate/generate endpoints) and `api/websocket.py` (`ConnectionManager`,
//! the 500ms-poll/10-minute-cap streaming loop, `token`/`complete`/`error`/
//! `close` frame shapes), implemented the way `oriongraph::server` builds its
//! `axum::Router` with `with_state` and maps errors to `(StatusCode, Json<..>)`.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::RagConfig;
use crate::embedder::Embedder;
use crate::error::{RagError, RagResult};
use crate::fabric::Fabric;
use crate::llm::Llm;
use crate::orchestrator::Orchestrator;
use crate::store::Store;
use crate::types::{GenerationParams, LlmProvider, MessageStatus, MessageStatusSnapshot, PromptType};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RagConfig>,
    pub store: Arc<dyn Store>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn Llm>,
    pub fabric: Arc<Fabric>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "ragcore".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `POST /api/conversations/{id}/messages` request body.
#[derive(Debug, Deserialize)]
pub struct AcceptMessageRequest {
    pub query: String,
    #[serde(default)]
    pub provider: Option<LlmProvider>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub llm_max_tokens: Option<usize>,
    #[serde(default)]
    pub max_context_tokens: Option<usize>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub prompt_type: Option<PromptType>,
    #[serde(default)]
    pub verify_citations: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct AcceptMessageResponse {
    pub message_id: Uuid,
    pub content: String,
    pub sources: Vec<Uuid>,
    pub citations: serde_json::Value,
    pub status: MessageStatus,
    pub warnings: Vec<String>,
}

/// Upper bound on a raw query's character length, protecting the pipeline
/// from a single request consuming the whole context budget on its own.
const MAX_QUERY_CHARS: usize = 4000;

fn build_params(
    config: &RagConfig,
    query: String,
    workspace_id: Uuid,
    conversation_id: Option<Uuid>,
    req: &AcceptMessageRequest,
) -> GenerationParams {
    let defaults = GenerationParams::default();
    GenerationParams {
        query,
        workspace_id,
        conversation_id,
        prompt_type: req.prompt_type.unwrap_or(defaults.prompt_type),
        max_context_tokens: req
            .max_context_tokens
            .unwrap_or(config.default_max_context_tokens),
        top_k: req.top_k.unwrap_or(defaults.top_k),
        llm_max_tokens: req.llm_max_tokens.unwrap_or(defaults.llm_max_tokens),
        temperature: req.temperature.unwrap_or(defaults.temperature),
        provider: req.provider.unwrap_or(defaults.provider),
        model: req.model.clone(),
        verify_citations: req.verify_citations.unwrap_or(defaults.verify_citations),
        save_message: true,
        strict_verification: false,
    }
}

/// `POST /api/conversations/{id}/messages`: enqueue a job and return 202.
async fn accept_message_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<AcceptMessageRequest>,
) -> RagResult<impl IntoResponse> {
    if body.query.trim().is_empty() {
        return Err(RagError::InvalidInput("query must not be empty".into()));
    }
    if body.query.len() > MAX_QUERY_CHARS {
        return Err(RagError::TooLarge(format!(
            "query exceeds the {MAX_QUERY_CHARS}-character limit"
        )));
    }

    let conversation = state
        .store
        .get_conversation(conversation_id)
        .await
        .map_err(RagError::Internal)?
        .ok_or_else(|| RagError::NotFound(format!("conversation {conversation_id}")))?;

    let message_id = Uuid::new_v4();
    let params = build_params(&state.config, body.query.clone(), conversation.workspace_id, Some(conversation_id), &body);

    state
        .fabric
        .enqueue_generation(message_id, params)
        .await
        .map_err(RagError::Internal)?;

    info!(%message_id, %conversation_id, "accepted generation request");

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(AcceptMessageResponse {
            message_id,
            content: String::new(),
            sources: Vec::new(),
            citations: serde_json::json!({}),
            status: MessageStatus::Pending,
            warnings: Vec::new(),
        }),
    ))
}

/// `GET /api/conversations/{cid}/messages/{mid}/status`: current snapshot,
/// status store first (fresh), falling back to the persisted message once
/// the status store's one-hour TTL has lapsed.
async fn status_handler(
    State(state): State<AppState>,
    Path((_conversation_id, message_id)): Path<(Uuid, Uuid)>,
) -> RagResult<Json<MessageStatusSnapshot>> {
    if let Some(snapshot) = state.fabric.status.get_status(message_id).await {
        return Ok(Json(snapshot));
    }

    let message = state
        .store
        .get_message(message_id)
        .await
        .map_err(RagError::Internal)?
        .ok_or_else(|| RagError::NotFound(format!("message {message_id}")))?;

    Ok(Json(MessageStatusSnapshot {
        message_id: message.id,
        status: message.status,
        content: message.content,
        sources: message.sources,
        citations: message.citations,
        tokens_used: message.tokens_used,
        generation_time_ms: message.generation_time_ms,
        model_used: message.model_used,
        error_message: message.error_message,
    }))
}

/// `POST /api/conversations/messages/{id}/regenerate`: synchronous, full
/// generated message in the response body.
async fn regenerate_handler(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Json(body): Json<AcceptMessageRequest>,
) -> RagResult<Json<crate::types::GeneratedMessage>> {
    let existing = state
        .store
        .get_message(message_id)
        .await
        .map_err(RagError::Internal)?
        .ok_or_else(|| RagError::NotFound(format!("message {message_id}")))?;

    if matches!(existing.status, MessageStatus::Pending | MessageStatus::Streaming) {
        return Err(RagError::Conflict(format!(
            "message {message_id} is already being generated"
        )));
    }

    let conversation = state
        .store
        .get_conversation(existing.conversation_id)
        .await
        .map_err(RagError::Internal)?
        .ok_or_else(|| RagError::NotFound(format!("conversation {}", existing.conversation_id)))?;

    let params = build_params(&state.config, String::new(), conversation.workspace_id, Some(conversation.id), &body);

    let orchestrator = Orchestrator::new(&state.config, state.embedder.as_ref(), state.llm.as_ref(), state.store.as_ref());
    let generated = orchestrator
        .regenerate(message_id, params)
        .await
        .map_err(RagError::Internal)?;

    Ok(Json(generated))
}

/// `POST /api/conversations/generate`: one-shot, synchronous, no persistence
/// unless `conversation_id` is supplied.
#[derive(Debug, Deserialize)]
pub struct OneShotGenerateRequest {
    pub query: String,
    pub workspace_id: Uuid,
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub provider: Option<LlmProvider>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub llm_max_tokens: Option<usize>,
    #[serde(default)]
    pub max_context_tokens: Option<usize>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub prompt_type: Option<PromptType>,
    #[serde(default)]
    pub verify_citations: Option<bool>,
}

async fn one_shot_generate_handler(
    State(state): State<AppState>,
    Json(body): Json<OneShotGenerateRequest>,
) -> RagResult<Json<crate::types::GeneratedMessage>> {
    if body.query.trim().is_empty() {
        return Err(RagError::InvalidInput("query must not be empty".into()));
    }
    if body.query.len() > MAX_QUERY_CHARS {
        return Err(RagError::TooLarge(format!(
            "query exceeds the {MAX_QUERY_CHARS}-character limit"
        )));
    }

    state
        .store
        .get_workspace(body.workspace_id)
        .await
        .map_err(RagError::Internal)?
        .ok_or_else(|| RagError::NotFound(format!("workspace {}", body.workspace_id)))?;

    let defaults = GenerationParams::default();
    let params = GenerationParams {
        query: body.query,
        workspace_id: body.workspace_id,
        conversation_id: body.conversation_id,
        prompt_type: body.prompt_type.unwrap_or(defaults.prompt_type),
        max_context_tokens: body.max_context_tokens.unwrap_or(state.config.default_max_context_tokens),
        top_k: body.top_k.unwrap_or(defaults.top_k),
        llm_max_tokens: body.llm_max_tokens.unwrap_or(defaults.llm_max_tokens),
        temperature: body.temperature.unwrap_or(defaults.temperature),
        provider: body.provider.unwrap_or(defaults.provider),
        model: body.model,
        verify_citations: body.verify_citations.unwrap_or(defaults.verify_citations),
        save_message: body.conversation_id.is_some(),
        strict_verification: false,
    };

    let orchestrator = Orchestrator::new(&state.config, state.embedder.as_ref(), state.llm.as_ref(), state.store.as_ref());
    let generated = orchestrator.generate(&params).await.map_err(RagError::Internal)?;

    if let Some(conversation_id) = params.conversation_id {
        if params.save_message {
            let message_id = Uuid::new_v4();
            orchestrator
                .persist(conversation_id, Uuid::new_v4(), message_id, &params, &generated, None)
                .await
                .map_err(RagError::Internal)?;
        }
    }

    Ok(Json(generated))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    #[allow(dead_code)]
    pub conversation_id: Option<String>,
}

/// `GET /ws/messages/{message_id}/stream?conversation_id=...`
async fn stream_handler(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Query(_query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state, message_id))
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
enum StreamFrame {
    Status {
        status: MessageStatus,
        content: String,
    },
    Token {
        token: String,
        token_count: usize,
    },
    Complete {
        content: String,
        sources: Vec<Uuid>,
        citations: serde_json::Value,
        tokens_used: Option<u64>,
        generation_time: Option<u64>,
        model_used: Option<String>,
    },
    Error {
        error: String,
    },
    Close,
}

/// On connect: verify the message exists, push a status snapshot, then poll
/// for new tokens and terminal state at the configured cadence up to the
/// configured wall-clock cap. Always ends with a close frame. A client
/// disconnect mid-poll does not cancel the underlying job: the worker keeps
/// running independently of this loop.
async fn handle_stream_socket(mut socket: WebSocket, state: AppState, message_id: Uuid) {
    let Some(mut snapshot) = state.fabric.status.get_status(message_id).await else {
        let _ = socket
            .send(WsMessage::Text(
                serde_json::to_string(&StreamFrame::Error {
                    error: "message not found".into(),
                })
                .unwrap(),
            ))
            .await;
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    };

    if send_frame(
        &mut socket,
        &StreamFrame::Status {
            status: snapshot.status,
            content: snapshot.content.clone(),
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let mut sent_tokens = 0usize;
    let poll_interval = state.config.stream_poll_interval;
    let max_wait = state.config.stream_max_wait;
    let deadline = tokio::time::Instant::now() + max_wait;

    loop {
        let tokens = state.fabric.tokens.get_tokens(message_id, sent_tokens).await;
        for token in tokens {
            sent_tokens += 1;
            if send_frame(
                &mut socket,
                &StreamFrame::Token {
                    token,
                    token_count: sent_tokens,
                },
            )
            .await
            .is_err()
            {
                return;
            }
        }

        if let Some(s) = state.fabric.status.get_status(message_id).await {
            snapshot = s;
        }

        match snapshot.status {
            MessageStatus::Complete => {
                let _ = send_frame(
                    &mut socket,
                    &StreamFrame::Complete {
                        content: snapshot.content.clone(),
                        sources: snapshot.sources.clone(),
                        citations: serde_json::to_value(&snapshot.citations).unwrap_or(serde_json::json!({})),
                        tokens_used: snapshot.tokens_used,
                        generation_time: snapshot.generation_time_ms,
                        model_used: snapshot.model_used.clone(),
                    },
                )
                .await;
                break;
            }
            MessageStatus::Error => {
                let _ = send_frame(
                    &mut socket,
                    &StreamFrame::Error {
                        error: snapshot.error_message.clone().unwrap_or_else(|| "unknown error".into()),
                    },
                )
                .await;
                break;
            }
            _ => {}
        }

        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(poll_interval).await;
    }

    let _ = send_frame(&mut socket, &StreamFrame::Close).await;
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    socket.send(WsMessage::Text(text)).await
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/conversations/:id/messages", post(accept_message_handler))
        .route(
            "/api/conversations/:cid/messages/:mid/status",
            get(status_handler),
        )
        .route(
            "/api/conversations/messages/:id/regenerate",
            post(regenerate_handler),
        )
        .route("/api/conversations/generate", post(one_shot_generate_handler))
        .route("/ws/messages/:message_id/stream", get(stream_handler))
        .with_state(state)
}

pub async fn run_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("starting ragcore server on {addr}");

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app).await?;
    Ok(())
}

/// Spawns the single-permit worker loop in the background, mirroring the
/// Celery worker process started alongside the API process in the upstream
/// deployment: front door and worker are separate tiers.
pub fn spawn_worker(state: &AppState) {
    let worker = crate::worker::Worker::new(
        state.config.clone(),
        state.embedder.clone(),
        state.llm.clone(),
        state.store.clone(),
        state.fabric.clone(),
    );
    tokio::spawn(async move {
        worker.run().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::MockEmbedder;
    use crate::llm::MockLlm;
    use crate::store::InMemoryStore;
    use crate::types::{Conversation, Workspace};

    fn test_state() -> (AppState, Uuid) {
        let config = Arc::new(RagConfig::default());
        let store = InMemoryStore::new();
        let ws = Workspace {
            id: Uuid::new_v4(),
            name: "ws".into(),
            workspace_type: "default".into(),
            created_at: chrono::Utc::now(),
            settings: serde_json::json!({}),
        };
        store.insert_workspace(ws.clone());
        let conversation_id = Uuid::new_v4();
        store.insert_conversation(Conversation {
            id: conversation_id,
            workspace_id: ws.id,
            title: "t".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            topic: None,
            entities: vec![],
            message_count: 0,
            token_usage: 0,
        });

        let state = AppState {
            fabric: Arc::new(Fabric::new(&config)),
            config,
            store,
            embedder: Arc::new(MockEmbedder),
            llm: Arc::new(MockLlm),
        };
        (state, conversation_id)
    }

    #[tokio::test]
    async fn accept_message_enqueues_and_returns_pending() {
        let (state, conversation_id) = test_state();
        let body = AcceptMessageRequest {
            query: "What is quantum computing?".into(),
            provider: None,
            model: None,
            temperature: None,
            llm_max_tokens: None,
            max_context_tokens: None,
            top_k: None,
            prompt_type: None,
            verify_citations: None,
        };

        let response = accept_message_handler(State(state.clone()), Path(conversation_id), Json(body))
            .await
            .expect("accept should succeed")
            .into_response();
        assert_eq!(response.status(), axum::http::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn accept_message_rejects_empty_query() {
        let (state, conversation_id) = test_state();
        let body = AcceptMessageRequest {
            query: "   ".into(),
            provider: None,
            model: None,
            temperature: None,
            llm_max_tokens: None,
            max_context_tokens: None,
            top_k: None,
            prompt_type: None,
            verify_citations: None,
        };

        let err = accept_message_handler(State(state), Path(conversation_id), Json(body)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn status_handler_reports_pending_then_falls_back_to_store() {
        let (state, conversation_id) = test_state();
        let message_id = Uuid::new_v4();
        state
            .fabric
            .enqueue_generation(message_id, GenerationParams::default())
            .await
            .unwrap();

        let response = status_handler(State(state), Path((conversation_id, message_id)))
            .await
            .unwrap();
        assert_eq!(response.0.status, MessageStatus::Pending);
    }
}
