//! Embedder client.
//!
//! Produces a fixed-dimension vector for a text. Grounded on
//! `http_generator.rs`'s `HttpSemanticGen` (a `reqwest`-backed client hitting
//! an external service, with a timeout and a descriptive error on non-200).

use crate::config::RagConfig;
use crate::error::RetrievalError;
use crate::types::EMBEDDING_DIM;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// `embed(text) -> float[384] | null`. Returns `None` rather than an
    /// error when the collaborator is reachable but declines to embed (e.g.
    /// empty input); returns `Err` when the collaborator itself failed, so
    /// callers can drop just the semantic branch without failing the query.
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, RetrievalError>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Option<Vec<f32>>,
}

pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    expected_dim: usize,
}

impl HttpEmbedder {
    pub fn new(base_url: String, expected_dim: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self { client, base_url, expected_dim }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, RetrievalError> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        debug!("requesting embedding for {} chars", text.len());

        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { text })
            .send()
            .await
            .map_err(|e| RetrievalError::Embedder(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RetrievalError::Embedder(format!(
                "embedder returned {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Embedder(e.to_string()))?;

        match parsed.embedding {
            Some(v) if v.len() == self.expected_dim => Ok(Some(v)),
            Some(v) => {
                warn!("embedder returned {} dims, expected {}", v.len(), self.expected_dim);
                Err(RetrievalError::Embedder("dimension mismatch".into()))
            }
            None => Ok(None),
        }
    }
}

/// Deterministic, dependency-free embedder used by tests and the sample
/// binary in place of a real model: hashes whitespace tokens into a fixed
/// number of buckets so that textually similar strings land close together
/// under cosine similarity.
pub struct MockEmbedder;

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, RetrievalError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let mut v = vec![0f32; EMBEDDING_DIM];
        for token in text.to_lowercase().split_whitespace() {
            let bucket = token
                .bytes()
                .fold(0usize, |acc, b| acc.wrapping_mul(131).wrapping_add(b as usize))
                % EMBEDDING_DIM;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        Ok(Some(v))
    }
}

pub fn build_embedder(config: &RagConfig) -> Box<dyn Embedder> {
    match &config.embedder_url {
        Some(url) => Box::new(HttpEmbedder::new(url.clone(), config.embedding_dim)),
        None => Box::new(MockEmbedder),
    }
}

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}
