//! Core domain types for the retrieval-generation-verification pipeline.
//!
//! Field names follow the upstream schema (`Workspace`/`Resource`/`Chunk`/
//! `Conversation`/`Message`) so a caller backing these with a real
//! Postgres/pgvector store can map columns one-to-one. `SearchResult`,
//! `EvidencePacket`, `VerifiedCitation` and `VerificationResult` are
//! transient: built and consumed within one request, never persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Dense embedding dimension. A `Chunk.embedding` either carries exactly
/// this many components or is absent.
pub const EMBEDDING_DIM: usize = 384;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub workspace_type: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub content_hash: String,
    pub resource_type: String,
    pub title: String,
    pub source_url: Option<String>,
    pub source_path: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub is_duplicate_of: Option<Uuid>,
    /// Arbitrary metadata; may contain a `"citations"` array of titles this
    /// resource cites, which seeds the document-citation graph in C3.
    pub resource_metadata: serde_json::Value,
    pub embedding_status: String,
    pub tags: Vec<String>,
    pub query_count: u64,
    pub citation_count: u64,
}

impl Resource {
    pub fn cited_titles(&self) -> Vec<String> {
        self.resource_metadata
            .get("citations")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub sequence: u32,
    pub content: String,
    pub token_count: Option<u32>,
    pub section_title: Option<String>,
    pub section_level: Option<u32>,
    pub page_number: Option<u32>,
    /// Dense embedding of length `EMBEDDING_DIM`, when present.
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn estimated_tokens(&self, chars_per_token: usize) -> usize {
        estimate_tokens(&self.content, chars_per_token)
    }
}

/// `len(text) / chars_per_token`, floored at 1 for any non-empty text.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() / chars_per_token.max(1)).max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub title: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub topic: Option<String>,
    pub entities: Vec<String>,
    pub message_count: u64,
    pub token_usage: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Error,
}

impl MessageStatus {
    /// Status transitions are monotonic: pending -> streaming -> terminal.
    /// No transition may move backward.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Streaming)
                | (Pending, Complete)
                | (Pending, Error)
                | (Streaming, Complete)
                | (Streaming, Error)
                | (Streaming, Streaming)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub sources: Vec<Uuid>,
    pub citations: Option<VerificationResult>,
    pub tokens_used: Option<u64>,
    pub generation_time_ms: Option<u64>,
    pub model_used: Option<String>,
    pub status: MessageStatus,
    pub generation_task_id: Option<String>,
    pub error_message: Option<String>,
    pub generation_params: Option<serde_json::Value>,
}

/// Per-source component scores from the hybrid retriever.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchComponents {
    pub semantic: f32,
    pub lexical: f32,
    pub graph: f32,
}

/// Reranker sub-scores, one per weighted factor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankScores {
    pub base: f32,
    pub citation: f32,
    pub recency: f32,
    pub specificity: f32,
    pub quality: f32,
}

/// One scored chunk for one query. Created by C3, mutated in place by C4,
/// consumed by C5. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub resource: Resource,
    /// Fused RRF score in [0,1]-ish range (unbounded above in practice, but
    /// RRF weights sum to 1.0 so it stays close to that range).
    pub base_score: f32,
    pub components: SearchComponents,
    pub rerank_scores: RerankScores,
    pub final_score: f32,
    pub conflicts: Vec<Uuid>,
    pub conflict_count: u32,
}

impl SearchResult {
    pub fn new(chunk: Chunk, resource: Resource, base_score: f32, components: SearchComponents) -> Self {
        Self {
            chunk,
            resource,
            base_score,
            components,
            rerank_scores: RerankScores::default(),
            final_score: base_score,
            conflicts: Vec::new(),
            conflict_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadataEntry {
    pub resource_id: Uuid,
    pub title: String,
    pub resource_type: String,
    pub chunks_used: u32,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedDocument {
    pub resource_id: Uuid,
    pub title: String,
    pub reason: String,
}

/// A chunk placed into the evidence packet, carrying its 1-based stable
/// source index (position in primary ‖ supporting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketEntry {
    pub source_index: usize,
    pub result: SearchResult,
    pub content: String,
    pub truncated: bool,
}

/// Stratified, token-budgeted bundle of chunks presented to the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidencePacket {
    pub primary: Vec<PacketEntry>,
    pub supporting: Vec<PacketEntry>,
    pub document_metadata: Vec<DocumentMetadataEntry>,
    pub related_documents: Vec<RelatedDocument>,
    pub total_tokens: usize,
    pub source_count: usize,
    pub has_conflicts: bool,
    pub conflict_summary: Option<String>,
}

impl EvidencePacket {
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.supporting.is_empty()
    }

    /// Iterate packet entries in source-index order (primary first, then
    /// supporting), matching the order C6 emitted blocks in.
    pub fn entries(&self) -> impl Iterator<Item = &PacketEntry> {
        self.primary.iter().chain(self.supporting.iter())
    }

    pub fn entry_for_index(&self, index: usize) -> Option<&PacketEntry> {
        self.entries().find(|e| e.source_index == index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedCitation {
    pub citation_id: usize,
    pub claim_text: String,
    pub source_index: usize,
    pub source_title: Option<String>,
    pub chunk_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub is_quote: bool,
    pub verified: bool,
    pub overlap_score: f32,
    pub matching_text: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified_citations: Vec<VerifiedCitation>,
    pub uncited_claims: Vec<String>,
    pub invalid_references: Vec<usize>,
    pub total_claims: usize,
    pub verification_score: f32,
    pub has_hallucinations: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptType {
    Qa,
    Summary,
    Compare,
    Extract,
    Explain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    Openai,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub query: String,
    pub workspace_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub prompt_type: PromptType,
    pub max_context_tokens: usize,
    pub top_k: usize,
    pub llm_max_tokens: usize,
    pub temperature: f32,
    pub provider: LlmProvider,
    pub model: Option<String>,
    pub verify_citations: bool,
    pub save_message: bool,
    pub strict_verification: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            workspace_id: Uuid::nil(),
            conversation_id: None,
            prompt_type: PromptType::Qa,
            max_context_tokens: 2000,
            top_k: 20,
            llm_max_tokens: 1500,
            temperature: 0.3,
            provider: LlmProvider::Ollama,
            model: None,
            verify_citations: true,
            save_message: true,
            strict_verification: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub search_time_ms: u64,
    pub rerank_time_ms: u64,
    pub context_time_ms: u64,
    pub prompt_time_ms: u64,
    pub llm_time_ms: u64,
    pub verification_time_ms: u64,
    pub total_time_ms: u64,
    pub tokens_used: u64,
    pub sources_used: usize,
    pub model_used: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedMessage {
    pub content: String,
    pub sources: Vec<Uuid>,
    pub citations: Option<VerificationResult>,
    pub metrics: GenerationMetrics,
    pub context_summary: ContextSummary,
    pub warnings: Vec<String>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSummary {
    pub source_count: usize,
    pub has_conflicts: bool,
}

/// Durable job record owned by C9. Executed at-least-once, with idempotent
/// message updates on each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: Uuid,
    pub message_id: Uuid,
    pub params: GenerationParams,
    pub attempt: u32,
    pub terminal: bool,
}

impl GenerationJob {
    pub fn new(message_id: Uuid, params: GenerationParams) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            message_id,
            params,
            attempt: 0,
            terminal: false,
        }
    }

    /// `2^attempt` seconds, per the durable queue's retry contract.
    pub fn backoff(&self) -> std::time::Duration {
        std::time::Duration::from_secs(2u64.saturating_pow(self.attempt))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusSnapshot {
    pub message_id: Uuid,
    pub status: MessageStatus,
    pub content: String,
    pub sources: Vec<Uuid>,
    pub citations: Option<VerificationResult>,
    pub tokens_used: Option<u64>,
    pub generation_time_ms: Option<u64>,
    pub model_used: Option<String>,
    pub error_message: Option<String>,
}

/// Count occurrences of each distinct id in `ids`, e.g. how many packet
/// entries or candidate results cite each resource.
pub fn distinct_resource_count<I: IntoIterator<Item = Uuid>>(ids: I) -> HashMap<Uuid, usize> {
    let mut counts = HashMap::new();
    for id in ids {
        *counts.entry(id).or_insert(0) += 1;
    }
    counts
}
