//! Context assembler.
//!
//! Deduplicates, stratifies, fits results to a token budget, and emits an
//! `EvidencePacket`. Grounded on `docify`'s `context_assembly.py`
//! (`ContextWindow`, `AssembledContext`, budget ratios, document graph) and
//! on `oriongraph`'s greedy token-budget fill in `selection.rs`, generalized
//! from "drop what doesn't fit" to "truncate with an ellipsis marker when
//! enough tokens remain".

use crate::config::RagConfig;
use crate::store::Store;
use crate::types::{
    estimate_tokens, DocumentMetadataEntry, EvidencePacket, PacketEntry, RelatedDocument,
    SearchResult,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use tracing::debug;
use uuid::Uuid;

pub struct ContextAssembler<'a> {
    pub config: &'a RagConfig,
    pub store: &'a dyn Store,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(config: &'a RagConfig, store: &'a dyn Store) -> Self {
        Self { config, store }
    }

    pub async fn assemble(
        &self,
        results: Vec<SearchResult>,
        workspace_id: Uuid,
        max_tokens: usize,
        include_related: bool,
        deduplicate: bool,
    ) -> anyhow::Result<EvidencePacket> {
        let results = if deduplicate {
            dedup_by_signature(results)
        } else {
            results
        };

        if results.is_empty() {
            return Ok(EvidencePacket::default());
        }

        let (primary_raw, supporting_raw) = stratify(results);

        let primary_budget = (max_tokens as f32 * self.config.primary_budget_ratio) as usize;
        let supporting_budget = (max_tokens as f32 * self.config.supporting_budget_ratio) as usize;

        let mut next_index = 1usize;
        let (primary, next_index_after) =
            fill_budget(primary_raw, primary_budget, self.config.chars_per_token, next_index);
        next_index = next_index_after;
        let (supporting, _) =
            fill_budget(supporting_raw, supporting_budget, self.config.chars_per_token, next_index);

        let document_metadata = build_document_metadata(&primary, &supporting);
        let related_documents = if include_related {
            self.find_related_documents(workspace_id, &primary, &supporting).await?
        } else {
            Vec::new()
        };

        let metadata_budget = (max_tokens as f32 * self.config.metadata_budget_ratio) as usize;
        let (document_metadata, related_documents) =
            fit_metadata_budget(document_metadata, related_documents, metadata_budget, self.config.chars_per_token);

        let (has_conflicts, conflict_summary) = summarize_conflicts(&primary, &supporting);

        let total_tokens: usize = primary
            .iter()
            .chain(supporting.iter())
            .map(|e| estimate_tokens(&e.content, self.config.chars_per_token))
            .sum();

        let source_count = document_metadata.len();

        debug!(
            "assembled packet: {} primary, {} supporting, {} tokens",
            primary.len(),
            supporting.len(),
            total_tokens
        );

        Ok(EvidencePacket {
            primary,
            supporting,
            document_metadata,
            related_documents,
            total_tokens,
            source_count,
            has_conflicts,
            conflict_summary,
        })
    }

    async fn find_related_documents(
        &self,
        workspace_id: Uuid,
        primary: &[PacketEntry],
        supporting: &[PacketEntry],
    ) -> anyhow::Result<Vec<RelatedDocument>> {
        let in_results: HashSet<Uuid> = primary
            .iter()
            .chain(supporting.iter())
            .map(|e| e.result.resource.id)
            .collect();

        let all_tags: HashSet<String> = primary
            .iter()
            .chain(supporting.iter())
            .flat_map(|e| e.result.resource.tags.iter().cloned())
            .collect();

        if all_tags.is_empty() {
            return Ok(Vec::new());
        }

        let mut related = Vec::new();
        for resource in self.store.resources_in_workspace(workspace_id).await? {
            if in_results.contains(&resource.id) {
                continue;
            }
            if resource.tags.iter().any(|t| all_tags.contains(t)) {
                related.push(RelatedDocument {
                    resource_id: resource.id,
                    title: resource.title.clone(),
                    reason: "shares a tag with retrieved sources".to_string(),
                });
            }
            if related.len() >= 10 {
                break;
            }
        }

        Ok(related)
    }
}

fn dedup_by_signature(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|r| {
            let sig = content_signature(&r.chunk.content);
            seen.insert(sig)
        })
        .collect()
}

fn content_signature(content: &str) -> u64 {
    let normalized: String = content.chars().take(200).collect::<String>().trim().to_lowercase();
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    hasher.finish()
}

/// Sort by `final_score` descending (fall back to `base_score`). Primary set
/// is the top `max(1, floor(n/3))` results plus any result scoring ≥0.7;
/// remainder is supporting.
fn stratify(mut results: Vec<SearchResult>) -> (Vec<SearchResult>, Vec<SearchResult>) {
    results.sort_by(|a, b| {
        let sa = if a.final_score > 0.0 { a.final_score } else { a.base_score };
        let sb = if b.final_score > 0.0 { b.final_score } else { b.base_score };
        sb.partial_cmp(&sa).unwrap()
    });

    let n = results.len();
    let top_count = (n / 3).max(1);

    let mut primary = Vec::new();
    let mut supporting = Vec::new();

    for (idx, r) in results.into_iter().enumerate() {
        let score = if r.final_score > 0.0 { r.final_score } else { r.base_score };
        if idx < top_count || score >= 0.7 {
            primary.push(r);
        } else {
            supporting.push(r);
        }
    }

    (primary, supporting)
}

/// Greedily fill a budget in rank order; truncate-with-ellipsis when a chunk
/// doesn't fit but ≥100 tokens remain, then stop filling.
fn fill_budget(
    results: Vec<SearchResult>,
    budget_tokens: usize,
    chars_per_token: usize,
    start_index: usize,
) -> (Vec<PacketEntry>, usize) {
    let mut entries = Vec::new();
    let mut used = 0usize;
    let mut index = start_index;

    for result in results {
        let remaining = budget_tokens.saturating_sub(used);
        if remaining == 0 {
            break;
        }

        let tokens = estimate_tokens(&result.chunk.content, chars_per_token);

        if tokens <= remaining {
            used += tokens;
            let content = result.chunk.content.clone();
            entries.push(PacketEntry {
                source_index: index,
                result,
                content,
                truncated: false,
            });
            index += 1;
        } else if remaining >= 100 {
            let char_budget = remaining * chars_per_token;
            let truncated_content: String = result
                .chunk
                .content
                .chars()
                .take(char_budget.saturating_sub(1))
                .collect();
            let content = format!("{}…", truncated_content);
            used += remaining;
            entries.push(PacketEntry {
                source_index: index,
                result,
                content,
                truncated: true,
            });
            index += 1;
            break;
        } else {
            break;
        }
    }

    (entries, index)
}

/// Greedily keep document-metadata entries (highest relevance first) and
/// related-document entries within `budget_tokens`, each entry costing one
/// token per `chars_per_token` chars of its title plus a fixed overhead for
/// its other fields.
fn fit_metadata_budget(
    mut document_metadata: Vec<DocumentMetadataEntry>,
    related_documents: Vec<RelatedDocument>,
    budget_tokens: usize,
    chars_per_token: usize,
) -> (Vec<DocumentMetadataEntry>, Vec<RelatedDocument>) {
    const ENTRY_OVERHEAD_TOKENS: usize = 4;

    document_metadata.sort_by(|a, b| b.relevance_score.partial_cmp(&a.relevance_score).unwrap());

    let mut used = 0usize;
    let mut kept_metadata = Vec::new();
    for entry in document_metadata {
        let cost = estimate_tokens(&entry.title, chars_per_token) + ENTRY_OVERHEAD_TOKENS;
        if used + cost > budget_tokens {
            break;
        }
        used += cost;
        kept_metadata.push(entry);
    }

    let mut kept_related = Vec::new();
    for entry in related_documents {
        let cost = estimate_tokens(&entry.title, chars_per_token) + ENTRY_OVERHEAD_TOKENS;
        if used + cost > budget_tokens {
            break;
        }
        used += cost;
        kept_related.push(entry);
    }

    (kept_metadata, kept_related)
}

fn build_document_metadata(primary: &[PacketEntry], supporting: &[PacketEntry]) -> Vec<DocumentMetadataEntry> {
    let mut by_resource: HashMap<Uuid, DocumentMetadataEntry> = HashMap::new();

    for entry in primary.iter().chain(supporting.iter()) {
        let r = &entry.result;
        let score = if r.final_score > 0.0 { r.final_score } else { r.base_score };
        by_resource
            .entry(r.resource.id)
            .and_modify(|m| {
                m.chunks_used += 1;
                m.relevance_score = m.relevance_score.max(score);
            })
            .or_insert(DocumentMetadataEntry {
                resource_id: r.resource.id,
                title: r.resource.title.clone(),
                resource_type: r.resource.resource_type.clone(),
                chunks_used: 1,
                relevance_score: score,
            });
    }

    by_resource.into_values().collect()
}

fn summarize_conflicts(primary: &[PacketEntry], supporting: &[PacketEntry]) -> (bool, Option<String>) {
    let conflicting: Vec<&PacketEntry> = primary
        .iter()
        .chain(supporting.iter())
        .filter(|e| !e.result.conflicts.is_empty())
        .collect();

    if conflicting.is_empty() {
        return (false, None);
    }

    let mut pairs = Vec::new();
    let all: Vec<&PacketEntry> = primary.iter().chain(supporting.iter()).collect();
    for entry in &conflicting {
        for partner_chunk_id in &entry.result.conflicts {
            if let Some(partner) = all.iter().find(|e| e.result.chunk.id == *partner_chunk_id) {
                let pair = (entry.result.resource.title.clone(), partner.result.resource.title.clone());
                if !pairs.contains(&pair) && !pairs.contains(&(pair.1.clone(), pair.0.clone())) {
                    pairs.push(pair);
                }
            }
        }
        if pairs.len() >= 3 {
            break;
        }
    }

    let summary = format!(
        "Conflicting information detected between: {}",
        pairs
            .iter()
            .map(|(a, b)| format!("\"{a}\" vs \"{b}\""))
            .collect::<Vec<_>>()
            .join(", ")
    );

    (true, Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, Resource, SearchComponents};

    fn make_result(content: &str, score: f32) -> SearchResult {
        let resource = Resource {
            id: Uuid::new_v4(),
            workspace_id: Uuid::nil(),
            content_hash: content.to_string(),
            resource_type: "pdf".into(),
            title: "Doc".into(),
            source_url: None,
            source_path: None,
            created_at: chrono::Utc::now(),
            is_duplicate_of: None,
            resource_metadata: serde_json::json!({}),
            embedding_status: "complete".into(),
            tags: vec![],
            query_count: 0,
            citation_count: 0,
        };
        let chunk = Chunk {
            id: Uuid::new_v4(),
            resource_id: resource.id,
            sequence: 0,
            content: content.to_string(),
            token_count: None,
            section_title: None,
            section_level: None,
            page_number: None,
            embedding: None,
        };
        let mut r = SearchResult::new(chunk, resource, score, SearchComponents::default());
        r.final_score = score;
        r
    }

    #[test]
    fn fill_budget_truncates_when_enough_tokens_remain() {
        let long_content = "x".repeat(2000);
        let results = vec![make_result(&long_content, 0.9)];
        let (entries, _) = fill_budget(results, 120, 4, 1);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].truncated);
        assert!(entries[0].content.ends_with('…'));
    }

    #[test]
    fn fill_budget_excludes_when_too_little_remains() {
        let results = vec![make_result(&"x".repeat(2000), 0.9), make_result("short", 0.5)];
        let (entries, _) = fill_budget(results, 10, 4, 1);
        assert_eq!(entries.len(), 0);
    }

    #[test]
    fn source_indices_are_contiguous() {
        let results: Vec<SearchResult> = (0..6)
            .map(|i| make_result(&format!("content {i}"), 1.0 - i as f32 * 0.1))
            .collect();
        let (primary, supporting) = stratify(results);
        let (primary_entries, next) = fill_budget(primary, 10_000, 4, 1);
        let (supporting_entries, _) = fill_budget(supporting, 10_000, 4, next);
        let indices: Vec<usize> = primary_entries
            .iter()
            .chain(supporting_entries.iter())
            .map(|e| e.source_index)
            .collect();
        let expected: Vec<usize> = (1..=indices.len()).collect();
        assert_eq!(indices, expected);
    }
}
