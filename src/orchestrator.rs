//! Orchestrator.
//!
//! Chains C3 -> C4 -> C5 -> C6 -> C2 -> C7, recording per-step timing and
//! persisting the outcome. Grounded on `docify`'s `message_generation.py`
//! (`MessageGenerationService.generate_response`, `GenerationMetrics`,
//! `GeneratedMessage`, the no-context short-circuit and the regeneration
//! path), wired the way `oriongraph`'s `ContextEngine::compile_workingset`
//! chains its own steps with `Instant`-based timing and `tracing::info!`
//! stage summaries.

use crate::citation_verifier::CitationVerifier;
use crate::config::RagConfig;
use crate::context_assembly::ContextAssembler;
use crate::embedder::Embedder;
use crate::llm::Llm;
use crate::prompt_builder::PromptBuilder;
use crate::reranker::Reranker;
use crate::retriever::HybridRetriever;
use crate::store::Store;
use crate::types::{
    estimate_tokens, ContextSummary, GenerationMetrics, GenerationParams, GeneratedMessage,
    Message, MessageRole, MessageStatus,
};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Orchestrator<'a> {
    pub config: &'a RagConfig,
    pub embedder: &'a dyn Embedder,
    pub llm: &'a dyn Llm,
    pub store: &'a dyn Store,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a RagConfig, embedder: &'a dyn Embedder, llm: &'a dyn Llm, store: &'a dyn Store) -> Self {
        Self {
            config,
            embedder,
            llm,
            store,
        }
    }

    /// `generate(query, workspace, conversation?, params) -> GeneratedMessage`.
    pub async fn generate(&self, params: &GenerationParams) -> anyhow::Result<GeneratedMessage> {
        let total_start = Instant::now();
        let mut metrics = GenerationMetrics::default();
        let mut warnings = Vec::new();

        info!(
            query = %params.query,
            workspace = %params.workspace_id,
            "starting generation pipeline"
        );

        // C3: retrieve.
        let search_start = Instant::now();
        let retriever = HybridRetriever::new(self.config, self.embedder, self.llm, self.store);
        let results = retriever
            .search(&params.query, params.workspace_id, params.top_k, true)
            .await?;
        metrics.search_time_ms = search_start.elapsed().as_millis() as u64;

        if results.is_empty() {
            warnings.push("No relevant documents found for this query".to_string());
            metrics.total_time_ms = total_start.elapsed().as_millis() as u64;
            info!("empty retrieval, returning no-context reply without invoking the LLM");
            return Ok(GeneratedMessage {
                content: PromptBuilder::no_context_response(&params.query),
                sources: Vec::new(),
                citations: None,
                metrics,
                context_summary: ContextSummary::default(),
                warnings,
                status: MessageStatus::Complete,
                error_message: None,
            });
        }

        // C4: rerank.
        let rerank_start = Instant::now();
        let reranker = Reranker::new(self.llm);
        let results = reranker.rerank(results, &params.query, true).await;
        metrics.rerank_time_ms = rerank_start.elapsed().as_millis() as u64;

        // C5: assemble evidence packet.
        let context_start = Instant::now();
        let assembler = ContextAssembler::new(self.config, self.store);
        let packet = assembler
            .assemble(results, params.workspace_id, params.max_context_tokens, true, true)
            .await?;
        metrics.context_time_ms = context_start.elapsed().as_millis() as u64;
        metrics.sources_used = packet.source_count;

        // C6: build prompt.
        let prompt_start = Instant::now();
        let built = PromptBuilder::build(&params.query, &packet, params.prompt_type, None, None);
        metrics.prompt_time_ms = prompt_start.elapsed().as_millis() as u64;

        // C2: generate.
        let llm_start = Instant::now();
        let response_text = match self
            .llm
            .generate(
                params.provider,
                params.model.as_deref(),
                &built.system,
                &built.user,
                params.llm_max_tokens,
                params.temperature,
            )
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!("LLM generation failed, terminating pipeline: {e}");
                metrics.llm_time_ms = llm_start.elapsed().as_millis() as u64;
                metrics.total_time_ms = total_start.elapsed().as_millis() as u64;
                return Ok(GeneratedMessage {
                    content: String::new(),
                    sources: Vec::new(),
                    citations: None,
                    metrics,
                    context_summary: ContextSummary {
                        source_count: packet.source_count,
                        has_conflicts: packet.has_conflicts,
                    },
                    warnings,
                    status: MessageStatus::Error,
                    error_message: Some(e.to_string()),
                });
            }
        };
        metrics.llm_time_ms = llm_start.elapsed().as_millis() as u64;
        metrics.tokens_used = (estimate_tokens(&built.user, self.config.chars_per_token)
            + estimate_tokens(&response_text, self.config.chars_per_token)) as u64;
        metrics.model_used = params.model.clone().or_else(|| Some(self.config.default_model.clone()));

        // C7: verify citations.
        let verification_start = Instant::now();
        let citations = if params.verify_citations {
            let result = CitationVerifier::verify(
                &response_text,
                &packet,
                params.strict_verification,
                self.config,
            );
            if result.has_hallucinations {
                warnings.push("Response contains unverified or invalid citations".to_string());
            }
            warnings.extend(result.warnings.clone());
            Some(result)
        } else {
            None
        };
        metrics.verification_time_ms = verification_start.elapsed().as_millis() as u64;
        metrics.total_time_ms = total_start.elapsed().as_millis() as u64;

        let sources: Vec<Uuid> = packet
            .entries()
            .map(|e| e.result.resource.id)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        info!(
            total_ms = metrics.total_time_ms,
            sources = sources.len(),
            "generation pipeline complete"
        );

        Ok(GeneratedMessage {
            content: response_text,
            sources,
            citations,
            metrics,
            context_summary: ContextSummary {
                source_count: packet.source_count,
                has_conflicts: packet.has_conflicts,
            },
            warnings,
            status: MessageStatus::Complete,
            error_message: None,
        })
    }

    /// Persist the user/assistant message pair for a completed generation,
    /// bumping the conversation's message count/token usage and each
    /// distinct cited resource's citation count exactly once.
    pub async fn persist(
        &self,
        conversation_id: Uuid,
        user_message_id: Uuid,
        assistant_message_id: Uuid,
        params: &GenerationParams,
        generated: &GeneratedMessage,
        task_id: Option<String>,
    ) -> anyhow::Result<()> {
        let now = chrono::Utc::now();

        let user_message = Message {
            id: user_message_id,
            conversation_id,
            role: MessageRole::User,
            content: params.query.clone(),
            timestamp: now,
            sources: Vec::new(),
            citations: None,
            tokens_used: None,
            generation_time_ms: None,
            model_used: None,
            status: MessageStatus::Complete,
            generation_task_id: None,
            error_message: None,
            generation_params: None,
        };
        self.store.put_message(user_message).await?;

        let assistant_message = Message {
            id: assistant_message_id,
            conversation_id,
            role: MessageRole::Assistant,
            content: generated.content.clone(),
            timestamp: now,
            sources: generated.sources.clone(),
            citations: generated.citations.clone(),
            tokens_used: Some(generated.metrics.tokens_used),
            generation_time_ms: Some(generated.metrics.total_time_ms),
            model_used: generated.metrics.model_used.clone(),
            status: generated.status,
            generation_task_id: task_id,
            error_message: generated.error_message.clone(),
            generation_params: serde_json::to_value(params).ok(),
        };
        self.store.put_message(assistant_message).await?;

        self.store
            .touch_conversation(conversation_id, generated.metrics.tokens_used)
            .await?;

        for resource_id in &generated.sources {
            self.store.bump_citation_count(*resource_id).await?;
        }

        Ok(())
    }

    /// Locate the assistant message's conversation and immediately preceding
    /// user message, then re-run the pipeline and update the assistant
    /// message in place. Per spec.md §9, the nearest earlier user message by
    /// timestamp may misattribute after edits; this crate accepts that
    /// open question's behavior rather than inventing message-id threading
    /// the upstream system does not have.
    pub async fn regenerate(
        &self,
        assistant_message_id: Uuid,
        mut params: GenerationParams,
    ) -> anyhow::Result<GeneratedMessage> {
        let assistant_message = self
            .store
            .get_message(assistant_message_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("message {assistant_message_id} not found"))?;

        let user_message = self
            .store
            .preceding_user_message(assistant_message.conversation_id, assistant_message_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no preceding user message for {assistant_message_id}"))?;

        params.query = user_message.content;
        params.conversation_id = Some(assistant_message.conversation_id);

        let generated = self.generate(&params).await?;

        let updated = Message {
            id: assistant_message.id,
            conversation_id: assistant_message.conversation_id,
            role: MessageRole::Assistant,
            content: generated.content.clone(),
            timestamp: chrono::Utc::now(),
            sources: generated.sources.clone(),
            citations: generated.citations.clone(),
            tokens_used: Some(generated.metrics.tokens_used),
            generation_time_ms: Some(generated.metrics.total_time_ms),
            model_used: generated.metrics.model_used.clone(),
            status: generated.status,
            generation_task_id: assistant_message.generation_task_id.clone(),
            error_message: generated.error_message.clone(),
            generation_params: serde_json::to_value(&params).ok(),
        };
        self.store.put_message(updated).await?;

        for resource_id in &generated.sources {
            self.store.bump_citation_count(*resource_id).await?;
        }

        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::MockEmbedder;
    use crate::llm::MockLlm;
    use crate::store::InMemoryStore;
    use crate::types::{Chunk, PromptType, Resource, Workspace};

    fn workspace() -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            name: "ws".into(),
            workspace_type: "default".into(),
            created_at: chrono::Utc::now(),
            settings: serde_json::json!({}),
        }
    }

    fn resource(workspace_id: Uuid, title: &str) -> Resource {
        Resource {
            id: Uuid::new_v4(),
            workspace_id,
            content_hash: title.to_string(),
            resource_type: "pdf".into(),
            title: title.to_string(),
            source_url: None,
            source_path: None,
            created_at: chrono::Utc::now(),
            is_duplicate_of: None,
            resource_metadata: serde_json::json!({}),
            embedding_status: "complete".into(),
            tags: vec![],
            query_count: 0,
            citation_count: 0,
        }
    }

    #[tokio::test]
    async fn empty_retrieval_short_circuits_without_calling_llm() {
        let config = RagConfig::default();
        let embedder = MockEmbedder;
        let llm = MockLlm;
        let store = InMemoryStore::new();
        let ws = workspace();
        store.insert_workspace(ws.clone());

        let orchestrator = Orchestrator::new(&config, &embedder, &llm, store.as_ref());
        let params = GenerationParams {
            query: "foo bar baz".into(),
            workspace_id: ws.id,
            prompt_type: PromptType::Qa,
            ..Default::default()
        };

        let generated = orchestrator.generate(&params).await.unwrap();
        assert_eq!(generated.status, MessageStatus::Complete);
        assert!(generated.sources.is_empty());
        assert!(generated.warnings.iter().any(|w| w.contains("No relevant documents")));
    }

    #[tokio::test]
    async fn successful_generation_verifies_citations() {
        let config = RagConfig::default();
        let embedder = MockEmbedder;
        let llm = MockLlm;
        let store = InMemoryStore::new();
        let ws = workspace();
        store.insert_workspace(ws.clone());

        let r = resource(ws.id, "Intro QC");
        store.insert_resource(r.clone());
        store.insert_chunks(
            r.id,
            vec![Chunk {
                id: Uuid::new_v4(),
                resource_id: r.id,
                sequence: 0,
                content: "Quantum computing uses qubits to represent information.".into(),
                token_count: None,
                section_title: None,
                section_level: None,
                page_number: None,
                embedding: Some(vec![0.1; crate::types::EMBEDDING_DIM]),
            }],
        );

        let orchestrator = Orchestrator::new(&config, &embedder, &llm, store.as_ref());
        let params = GenerationParams {
            query: "What is quantum computing?".into(),
            workspace_id: ws.id,
            prompt_type: PromptType::Qa,
            ..Default::default()
        };

        let generated = orchestrator.generate(&params).await.unwrap();
        assert_eq!(generated.status, MessageStatus::Complete);
        assert!(!generated.sources.is_empty());
        assert!(generated.citations.is_some());
    }
}
