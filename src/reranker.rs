//! C4: Reranker.
//!
//! Five-factor scoring plus cross-source conflict detection. Grounded on
//! `docify`'s `reranking.py` (`ReRankingService.rerank`, `_score_citation_frequency`,
//! `_score_recency`, `_score_specificity`, `_score_source_quality`,
//! `_detect_conflicts`), restructured as free functions over `&SearchResult`
//! composed by `rerank()`, the way `oriongraph::scoring` structures its
//! channel scorers.

use crate::llm::Llm;
use crate::types::{distinct_resource_count, LlmProvider, SearchResult};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

pub const WEIGHT_BASE: f32 = 0.40;
pub const WEIGHT_CITATION: f32 = 0.15;
pub const WEIGHT_RECENCY: f32 = 0.15;
pub const WEIGHT_SPECIFICITY: f32 = 0.15;
pub const WEIGHT_QUALITY: f32 = 0.15;

pub struct Reranker<'a> {
    pub llm: &'a dyn Llm,
}

impl<'a> Reranker<'a> {
    pub fn new(llm: &'a dyn Llm) -> Self {
        Self { llm }
    }

    /// `rerank(results, query, detectConflicts) -> results` sorted by
    /// `final_score` descending.
    pub async fn rerank(
        &self,
        mut results: Vec<SearchResult>,
        query: &str,
        detect_conflicts: bool,
    ) -> Vec<SearchResult> {
        if results.is_empty() {
            return results;
        }

        let resource_counts = distinct_resource_count(results.iter().map(|r| r.resource.id));

        for r in results.iter_mut() {
            r.rerank_scores.base = r.base_score;
            r.rerank_scores.citation = score_citation_frequency(r, &resource_counts);
            r.rerank_scores.recency = score_recency(r);
            r.rerank_scores.specificity = score_specificity(r, query);
            r.rerank_scores.quality = score_source_quality(r);

            r.final_score = WEIGHT_BASE * r.rerank_scores.base
                + WEIGHT_CITATION * r.rerank_scores.citation
                + WEIGHT_RECENCY * r.rerank_scores.recency
                + WEIGHT_SPECIFICITY * r.rerank_scores.specificity
                + WEIGHT_QUALITY * r.rerank_scores.quality;
        }

        if detect_conflicts && results.len() > 1 {
            self.detect_conflicts(&mut results, query).await;
        }

        results.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap());
        results
    }

    /// Examine all unordered pairs among the top 5 results with distinct
    /// resource ids; ask C2 a yes/no fact-consistency question per pair.
    async fn detect_conflicts(&self, results: &mut [SearchResult], query: &str) {
        let n = results.len().min(5);
        let mut conflicts: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

        for i in 0..n {
            for j in (i + 1)..n {
                if results[i].resource.id == results[j].resource.id {
                    continue;
                }

                let excerpt_a = excerpt(&results[i].chunk.content, 300);
                let excerpt_b = excerpt(&results[j].chunk.content, 300);

                let prompt = format!(
                    "Query: {query}\n\n\
                     Source A: {excerpt_a}\n\n\
                     Source B: {excerpt_b}\n\n\
                     Do these two sources present conflicting, inconsistent information \
                     relevant to the query? Answer YES or NO only.",
                );

                let conflict = match self
                    .llm
                    .generate(LlmProvider::Ollama, None, "", &prompt, 10, 0.0)
                    .await
                {
                    Ok(answer) => answer.to_uppercase().contains("YES"),
                    Err(e) => {
                        warn!("conflict check failed, defaulting to no conflict: {e}");
                        false
                    }
                };

                if conflict {
                    let chunk_a = results[i].chunk.id;
                    let chunk_b = results[j].chunk.id;
                    conflicts.entry(chunk_a).or_default().push(chunk_b);
                    conflicts.entry(chunk_b).or_default().push(chunk_a);
                }
            }
        }

        for result in results.iter_mut() {
            if let Some(partners) = conflicts.get(&result.chunk.id) {
                result.conflicts = partners.clone();
                result.conflict_count = partners.len() as u32;
                result.final_score *= 1.0 - 0.05 * result.conflict_count as f32;
            }
        }

        debug!("conflict detection found {} flagged chunks", conflicts.len());
    }
}

fn excerpt(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        content.to_string()
    } else {
        content.chars().take(max_chars).collect()
    }
}

/// Normalizes `r.resource.citation_count` by the number of *other* distinct
/// resources present in the candidate set (not by a max citation count —
/// see `docify`'s `_score_citation_frequency`, where `max_citations` counts
/// distinct `resource_id`s among the other results, never the resources'
/// own citation counts). A single-resource candidate set is neutral (0.5).
fn score_citation_frequency(r: &SearchResult, resource_counts: &HashMap<Uuid, usize>) -> f32 {
    let max_citations = resource_counts.len().saturating_sub(if resource_counts.contains_key(&r.resource.id) { 1 } else { 0 });
    if max_citations == 0 {
        return 0.5;
    }
    (r.resource.citation_count as f32 / max_citations as f32).min(1.0)
}

fn score_recency(r: &SearchResult) -> f32 {
    let age = chrono::Utc::now() - r.resource.created_at;
    let days = age.num_days();
    if days < 0 {
        return 0.5;
    }
    if days < 30 {
        1.0
    } else if days < 90 {
        0.9
    } else if days < 180 {
        0.8
    } else if days < 365 {
        0.6
    } else if days < 730 {
        0.4
    } else {
        0.2
    }
}

fn score_specificity(r: &SearchResult, query: &str) -> f32 {
    let content_lower = r.chunk.content.to_lowercase();
    let query_lower = query.to_lowercase();

    if content_lower.contains(&query_lower) {
        return 1.0;
    }

    let query_terms: std::collections::HashSet<&str> = query_lower.split_whitespace().collect();
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms: std::collections::HashSet<&str> = content_lower.split_whitespace().collect();
    let overlap = query_terms.intersection(&content_terms).count();
    overlap as f32 / query_terms.len() as f32
}

fn score_source_quality(r: &SearchResult) -> f32 {
    let base = match r.resource.resource_type.to_lowercase().as_str() {
        "pdf" | "research" | "academic" => 1.0,
        "docx" | "md" => 0.8,
        "url" | "web" => 0.7,
        "xlsx" | "csv" => 0.6,
        "txt" => 0.5,
        _ => 0.5,
    };

    let mut bonus = 0.0f32;
    let meta = &r.resource.resource_metadata;
    if meta.get("title").is_some() {
        bonus += 0.05;
    }
    if meta.get("author").is_some() {
        bonus += 0.05;
    }
    if meta.get("page").is_some() || r.chunk.page_number.is_some() {
        bonus += 0.05;
    }

    (base + bonus).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, Resource, SearchComponents};

    fn make_result(resource_type: &str, citation_count: u64, days_old: i64) -> SearchResult {
        let resource = Resource {
            id: Uuid::new_v4(),
            workspace_id: Uuid::nil(),
            content_hash: "h".into(),
            resource_type: resource_type.into(),
            title: "Doc".into(),
            source_url: None,
            source_path: None,
            created_at: chrono::Utc::now() - chrono::Duration::days(days_old),
            is_duplicate_of: None,
            resource_metadata: serde_json::json!({}),
            embedding_status: "complete".into(),
            tags: vec![],
            query_count: 0,
            citation_count,
        };
        let chunk = Chunk {
            id: Uuid::new_v4(),
            resource_id: resource.id,
            sequence: 0,
            content: "quantum computing uses qubits".into(),
            token_count: None,
            section_title: None,
            section_level: None,
            page_number: None,
            embedding: None,
        };
        SearchResult::new(chunk, resource, 0.8, SearchComponents::default())
    }

    #[tokio::test]
    async fn single_result_gets_default_citation_factor() {
        let llm = crate::llm::MockLlm;
        let reranker = Reranker::new(&llm);
        let results = reranker
            .rerank(vec![make_result("pdf", 0, 10)], "quantum computing", true)
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rerank_scores.citation, 0.5);
        assert_eq!(results[0].conflict_count, 0);
    }

    #[tokio::test]
    async fn recency_step_function_matches_buckets() {
        let r = make_result("pdf", 1, 10);
        assert_eq!(score_recency(&r), 1.0);
        let r = make_result("pdf", 1, 100);
        assert_eq!(score_recency(&r), 0.8);
        let r = make_result("pdf", 1, 1000);
        assert_eq!(score_recency(&r), 0.2);
    }

    #[test]
    fn specificity_matches_exact_query_substring() {
        let r = make_result("pdf", 1, 10);
        assert_eq!(score_specificity(&r, "quantum computing uses qubits"), 1.0);
    }
}
