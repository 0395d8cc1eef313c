//! Process configuration, pulled from the environment the way
//! `oriongraph-server` reads `SESSION_API_URL`/`MEMORY_API_URL`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub ollama_base_url: String,
    pub default_model: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub has_gpu: bool,

    pub embedder_url: Option<String>,
    pub embedding_dim: usize,

    pub rrf_k: f32,
    pub semantic_weight: f32,
    pub lexical_weight: f32,
    pub graph_weight: f32,

    pub default_max_context_tokens: usize,
    pub primary_budget_ratio: f32,
    pub supporting_budget_ratio: f32,
    pub metadata_budget_ratio: f32,
    pub chars_per_token: usize,

    pub min_overlap: f32,
    pub high_confidence: f32,

    pub status_ttl: Duration,
    pub max_retries: u32,
    pub task_time_limit: Duration,
    pub task_soft_time_limit: Duration,
    pub stream_poll_interval: Duration,
    pub stream_max_wait: Duration,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: env_or("OLLAMA_BASE_URL", "http://localhost:11434"),
            default_model: env_or("DEFAULT_MODEL", "llama3"),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            has_gpu: std::env::var("RAGCORE_HAS_GPU")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),

            embedder_url: std::env::var("EMBEDDER_URL").ok(),
            embedding_dim: 384,

            rrf_k: 60.0,
            semantic_weight: 0.5,
            lexical_weight: 0.3,
            graph_weight: 0.2,

            default_max_context_tokens: 2000,
            primary_budget_ratio: 0.6,
            supporting_budget_ratio: 0.3,
            metadata_budget_ratio: 0.1,
            chars_per_token: 4,

            min_overlap: 0.3,
            high_confidence: 0.7,

            status_ttl: Duration::from_secs(3600),
            max_retries: 3,
            task_time_limit: Duration::from_secs(600),
            task_soft_time_limit: Duration::from_secs(540),
            stream_poll_interval: Duration::from_millis(500),
            stream_max_wait: Duration::from_secs(600),
        }
    }
}

impl RagConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Per-attempt LLM HTTP timeout: 300s with a GPU, 600s without (CPU needs
    /// more headroom), mirroring the original hardware-aware service.
    pub fn llm_call_timeout(&self) -> Duration {
        if self.has_gpu {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(600)
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
