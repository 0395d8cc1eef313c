//! C3: Hybrid Retriever.
//!
//! Fuses dense vector search, lexical matching and a document-citation graph
//! into one ranked list via Reciprocal Rank Fusion. Grounded on `docify`'s
//! `search.py` (`semantic_search`/`keyword_search`/`document_graph_search`/
//! `_combine_results_rrf`/`hybrid_search`) for the exact branch algorithms
//! and weights, and on `oriongraph`'s `generate_candidates` (parallel
//! fan-out via `futures::future::join_all`, per-branch failure isolation)
//! for the concurrency shape.

use crate::config::RagConfig;
use crate::embedder::{l2_distance, Embedder};
use crate::llm::Llm;
use crate::query_expansion::expand_query;
use crate::store::Store;
use crate::types::{Chunk, Resource, SearchComponents, SearchResult};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct HybridRetriever<'a> {
    pub config: &'a RagConfig,
    pub embedder: &'a dyn Embedder,
    pub llm: &'a dyn Llm,
    pub store: &'a dyn Store,
}

impl<'a> HybridRetriever<'a> {
    pub fn new(
        config: &'a RagConfig,
        embedder: &'a dyn Embedder,
        llm: &'a dyn Llm,
        store: &'a dyn Store,
    ) -> Self {
        Self {
            config,
            embedder,
            llm,
            store,
        }
    }

    /// `search(query, workspace, topK) -> ordered list of SearchResult`,
    /// distinct by chunk id, fused score descending.
    pub async fn search(
        &self,
        query: &str,
        workspace_id: Uuid,
        top_k: usize,
        expand: bool,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let variants = if expand {
            expand_query(self.llm, query, 3).await
        } else {
            vec![query.to_string()]
        };

        let mut all_semantic: HashMap<Uuid, (Chunk, Resource, f32)> = HashMap::new();
        let mut all_lexical: HashMap<Uuid, (Chunk, Resource, f32)> = HashMap::new();
        let mut all_graph: HashMap<Uuid, (Chunk, Resource, f32)> = HashMap::new();

        for variant in &variants {
            let (semantic, lexical, graph) = self.search_variant(variant, workspace_id, top_k).await?;
            for (id, entry) in semantic {
                all_semantic.entry(id).or_insert(entry);
            }
            for (id, entry) in lexical {
                all_lexical.entry(id).or_insert(entry);
            }
            for (id, entry) in graph {
                all_graph.entry(id).or_insert(entry);
            }
        }

        Ok(self.combine_results_rrf(all_semantic, all_lexical, all_graph, top_k))
    }

    async fn search_variant(
        &self,
        variant: &str,
        workspace_id: Uuid,
        top_k: usize,
    ) -> anyhow::Result<(
        HashMap<Uuid, (Chunk, Resource, f32)>,
        HashMap<Uuid, (Chunk, Resource, f32)>,
        HashMap<Uuid, (Chunk, Resource, f32)>,
    )> {
        let (semantic_res, lexical_res) = tokio::join!(
            self.semantic_search(variant, workspace_id, top_k),
            self.keyword_search(variant, workspace_id, top_k),
        );

        let semantic = match semantic_res {
            Ok(r) => r,
            Err(e) => {
                warn!("semantic branch failed for variant '{variant}': {e}");
                HashMap::new()
            }
        };
        let lexical = lexical_res?;
        let graph = self.document_graph_search(&semantic, workspace_id).await?;

        Ok((semantic, lexical, graph))
    }

    async fn semantic_search(
        &self,
        query: &str,
        workspace_id: Uuid,
        top_k: usize,
    ) -> anyhow::Result<HashMap<Uuid, (Chunk, Resource, f32)>> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        let Some(query_vec) = embedding else {
            return Ok(HashMap::new());
        };

        let candidates = self.store.chunks_with_embeddings(workspace_id).await?;

        let mut scored: Vec<(Chunk, Resource, f32)> = candidates
            .into_iter()
            .filter_map(|(chunk, resource)| {
                chunk.embedding.as_ref().map(|emb| {
                    let distance = l2_distance(&query_vec, emb);
                    let similarity = 1.0 / (1.0 + distance);
                    (chunk, resource, similarity)
                })
            })
            .collect();

        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap());
        scored.truncate(top_k);

        Ok(scored.into_iter().map(|(c, r, s)| (c.id, (c, r, s))).collect())
    }

    async fn keyword_search(
        &self,
        query: &str,
        workspace_id: Uuid,
        top_k: usize,
    ) -> anyhow::Result<HashMap<Uuid, (Chunk, Resource, f32)>> {
        let terms: Vec<String> = query.split_whitespace().map(|t| t.to_lowercase()).collect();
        if terms.is_empty() {
            return Ok(HashMap::new());
        }

        let all = self.store.all_chunks(workspace_id).await?;
        let mut scored = Vec::new();

        for (chunk, resource) in all {
            let content_lower = chunk.content.to_lowercase();
            let mut score = 0.0f32;
            for term in &terms {
                let count = content_lower.matches(term.as_str()).count() as f32;
                score += count;
                if content_lower.starts_with(term.as_str()) {
                    score += 2.0;
                }
            }
            if score > 0.0 {
                scored.push((chunk, resource, score));
            }
        }

        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap());
        scored.truncate(top_k);

        Ok(scored.into_iter().map(|(c, r, s)| (c.id, (c, r, s))).collect())
    }

    /// From the union of resources surfaced by the semantic branch, collect
    /// related resources via both citation-graph edges, depth 1 only, and
    /// take the first 3 chunks of each.
    async fn document_graph_search(
        &self,
        semantic: &HashMap<Uuid, (Chunk, Resource, f32)>,
        workspace_id: Uuid,
    ) -> anyhow::Result<HashMap<Uuid, (Chunk, Resource, f32)>> {
        let mut seed_resources: HashMap<Uuid, Resource> = HashMap::new();
        for (_, resource, _) in semantic.values() {
            seed_resources.entry(resource.id).or_insert_with(|| resource.clone());
        }

        if seed_resources.is_empty() {
            return Ok(HashMap::new());
        }

        let mut related: HashMap<Uuid, Resource> = HashMap::new();

        for seed in seed_resources.values() {
            // Resources this seed cites (titles listed in its own metadata).
            let cited_titles = seed.cited_titles();
            if !cited_titles.is_empty() {
                for r in self.store.resources_by_title(workspace_id, &cited_titles).await? {
                    if !seed_resources.contains_key(&r.id) {
                        related.entry(r.id).or_insert(r);
                    }
                }
            }
        }

        // Resources that cite this seed (reverse edge): scan the workspace
        // for any resource whose cited-titles list contains a seed's title.
        let all_resources = self.store.resources_in_workspace(workspace_id).await?;
        for candidate in all_resources {
            if seed_resources.contains_key(&candidate.id) || related.contains_key(&candidate.id) {
                continue;
            }
            let cites = candidate.cited_titles();
            if seed_resources
                .values()
                .any(|seed| cites.iter().any(|t| t.eq_ignore_ascii_case(&seed.title)))
            {
                related.insert(candidate.id, candidate);
            }
        }

        let mut out = HashMap::new();
        for resource in related.into_values() {
            let chunks = self.store.chunks_for_resource(resource.id).await?;
            for chunk in chunks.into_iter().take(3) {
                out.insert(chunk.id, (chunk, resource.clone(), 1.0));
            }
        }

        Ok(out)
    }

    /// Reciprocal Rank Fusion, k=60, weights semantic=0.5/lexical=0.3/graph=0.2.
    fn combine_results_rrf(
        &self,
        semantic: HashMap<Uuid, (Chunk, Resource, f32)>,
        lexical: HashMap<Uuid, (Chunk, Resource, f32)>,
        graph: HashMap<Uuid, (Chunk, Resource, f32)>,
        top_k: usize,
    ) -> Vec<SearchResult> {
        let k = self.config.rrf_k;

        let mut ranked_semantic: Vec<_> = semantic.iter().collect();
        ranked_semantic.sort_by(|a, b| b.1 .2.partial_cmp(&a.1 .2).unwrap());

        let mut ranked_lexical: Vec<_> = lexical.iter().collect();
        ranked_lexical.sort_by(|a, b| b.1 .2.partial_cmp(&a.1 .2).unwrap());

        let mut ranked_graph: Vec<_> = graph.iter().collect();
        ranked_graph.sort_by(|a, b| b.1 .2.partial_cmp(&a.1 .2).unwrap());

        let mut combined: HashMap<Uuid, (Chunk, Resource, SearchComponents)> = HashMap::new();

        for (rank, (id, (chunk, resource, _))) in ranked_semantic.iter().enumerate() {
            let entry = combined
                .entry(**id)
                .or_insert_with(|| ((*chunk).clone(), (*resource).clone(), SearchComponents::default()));
            entry.2.semantic = self.config.semantic_weight / (k + (rank as f32 + 1.0));
        }
        for (rank, (id, (chunk, resource, _))) in ranked_lexical.iter().enumerate() {
            let entry = combined
                .entry(**id)
                .or_insert_with(|| ((*chunk).clone(), (*resource).clone(), SearchComponents::default()));
            entry.2.lexical = self.config.lexical_weight / (k + (rank as f32 + 1.0));
        }
        for (rank, (id, (chunk, resource, _))) in ranked_graph.iter().enumerate() {
            let entry = combined
                .entry(**id)
                .or_insert_with(|| ((*chunk).clone(), (*resource).clone(), SearchComponents::default()));
            entry.2.graph = self.config.graph_weight / (k + (rank as f32 + 1.0));
        }

        let mut results: Vec<SearchResult> = combined
            .into_iter()
            .map(|(_, (chunk, resource, components))| {
                let fused = components.semantic + components.lexical + components.graph;
                SearchResult::new(chunk, resource, fused, components)
            })
            .collect();

        results.sort_by(|a, b| b.base_score.partial_cmp(&a.base_score).unwrap());
        results.truncate(top_k);

        debug!("RRF fused {} results (top_k={})", results.len(), top_k);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(title: &str) -> Resource {
        Resource {
            id: Uuid::new_v4(),
            workspace_id: Uuid::nil(),
            content_hash: title.to_string(),
            resource_type: "pdf".to_string(),
            title: title.to_string(),
            source_url: None,
            source_path: None,
            created_at: chrono::Utc::now(),
            is_duplicate_of: None,
            resource_metadata: serde_json::json!({}),
            embedding_status: "complete".to_string(),
            tags: vec![],
            query_count: 0,
            citation_count: 0,
        }
    }

    fn chunk(resource_id: Uuid, content: &str) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            resource_id,
            sequence: 0,
            content: content.to_string(),
            token_count: None,
            section_title: None,
            section_level: None,
            page_number: None,
            embedding: None,
        }
    }

    #[test]
    fn rrf_monotonicity_first_in_all_branches_outranks_single_branch() {
        let config = RagConfig::default();
        let r = resource("Intro QC");
        let top_chunk = chunk(r.id, "qubits");
        let lone_chunk = chunk(r.id, "other");

        let mut semantic = HashMap::new();
        semantic.insert(top_chunk.id, (top_chunk.clone(), r.clone(), 0.9));
        semantic.insert(lone_chunk.id, (lone_chunk.clone(), r.clone(), 0.1));

        let mut lexical = HashMap::new();
        lexical.insert(top_chunk.id, (top_chunk.clone(), r.clone(), 5.0));

        let mut graph = HashMap::new();
        graph.insert(top_chunk.id, (top_chunk.clone(), r.clone(), 1.0));

        let embedder = crate::embedder::MockEmbedder;
        let llm = crate::llm::MockLlm;
        let store = crate::store::InMemoryStore::new();
        let retriever = HybridRetriever::new(&config, &embedder, &llm, store.as_ref());

        let results = retriever.combine_results_rrf(semantic, lexical, graph, 10);
        let top = results.iter().find(|r| r.chunk.id == top_chunk.id).unwrap();
        let lone = results.iter().find(|r| r.chunk.id == lone_chunk.id).unwrap();
        assert!(top.base_score > lone.base_score);
    }

    #[test]
    fn rrf_results_are_distinct_and_bounded() {
        let config = RagConfig::default();
        let r = resource("Doc");
        let mut semantic = HashMap::new();
        for i in 0..5 {
            let c = chunk(r.id, &format!("chunk {i}"));
            semantic.insert(c.id, (c, r.clone(), 1.0 - i as f32 * 0.1));
        }

        let embedder = crate::embedder::MockEmbedder;
        let llm = crate::llm::MockLlm;
        let store = crate::store::InMemoryStore::new();
        let retriever = HybridRetriever::new(&config, &embedder, &llm, store.as_ref());

        let results = retriever.combine_results_rrf(semantic, HashMap::new(), HashMap::new(), 3);
        assert_eq!(results.len(), 3);
        let mut ids: Vec<_> = results.iter().map(|r| r.chunk.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }
}
