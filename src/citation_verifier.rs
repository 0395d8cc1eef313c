//! Citation verifier.
//!
//! Extracts, validates and scores citations in LLM output against the
//! evidence packet that produced it. Grounded on `docify`'s
//! `citation_verification.py` (`ExtractedCitation`/`VerifiedCitation`/
//! `VerificationResult`, the quote/claim regexes, the overlap-scoring
//! algorithm and the hallucination signal list).

use crate::config::RagConfig;
use crate::types::{EvidencePacket, VerificationResult, VerifiedCitation};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static QUOTE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"([^"]+)"\s*\[Source\s*(\d+)\]"#).unwrap());

static CLAIM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([^.!?]+[.!?])\s*\[Source\s*(\d+)(?:,\s*Source\s*(\d+))?\]").unwrap());

static CITATION_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[Source\s*(\d+)\]").unwrap());

static FACTUAL_INDICATORS: &[&str] = &[
    "according to",
    "research shows",
    "studies indicate",
    "the study found",
    "experiments show",
    "data suggests",
    "evidence shows",
];

static PERCENT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\s*(%|percent)").unwrap());

static NO_INFO_PATTERNS: &[&str] = &[
    "couldn't find",
    "could not find",
    "no relevant information",
    "don't have enough information",
    "do not have enough information",
    "cannot find",
];

static STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "to", "of",
    "in", "on", "at", "for", "with", "as", "by", "this", "that", "it", "its",
];

struct ExtractedCitation {
    claim_text: String,
    source_index: usize,
    is_quote: bool,
    position: usize,
}

pub struct CitationVerifier;

impl CitationVerifier {
    /// `verify(responseText, packet, strict) -> VerificationResult`, scored
    /// against the thresholds configured on `RagConfig` (`min_overlap` for
    /// the verified/unverified cutoff, `high_confidence` for the
    /// high/partial-match distinction).
    pub fn verify(
        response_text: &str,
        packet: &EvidencePacket,
        strict: bool,
        config: &RagConfig,
    ) -> VerificationResult {
        let extracted = extract_citations(response_text);

        let mut verified_citations = Vec::new();
        let mut invalid_references = Vec::new();

        for (id, citation) in extracted.iter().enumerate() {
            if packet.entry_for_index(citation.source_index).is_none() {
                invalid_references.push(citation.source_index);
            }
            verified_citations.push(verify_citation(id, citation, packet, config));
        }

        let mut warnings = Vec::new();
        let mut uncited_claims = Vec::new();

        if strict {
            uncited_claims = find_uncited_claims(response_text);
            invalid_references.extend(find_invalid_references(response_text, packet));
            invalid_references.sort_unstable();
            invalid_references.dedup();
        }

        let total_claims = verified_citations.len();
        let verified_count = verified_citations.iter().filter(|c| c.verified).count();

        let verification_score = if total_claims > 0 {
            verified_count as f32 / total_claims as f32
        } else if response_text.len() > 100 && !looks_like_no_info_disclaimer(response_text) {
            warnings.push("Response makes claims but contains no citations".to_string());
            0.0
        } else {
            1.0
        };

        let low_confidence_count = verified_citations
            .iter()
            .filter(|c| c.verified && c.overlap_score < config.high_confidence)
            .count();
        if low_confidence_count > 0 {
            warnings.push(format!(
                "{low_confidence_count} citation(s) only weakly supported by their source"
            ));
        }

        let has_hallucinations =
            strict && (!uncited_claims.is_empty() || !invalid_references.is_empty());

        VerificationResult {
            verified_citations,
            uncited_claims,
            invalid_references,
            total_claims,
            verification_score,
            has_hallucinations,
            warnings,
        }
    }
}

/// Quote pattern first (marking seen positions), then claim pattern (skipping
/// already-seen positions); a claim citing two sources yields two entries
/// sharing the same claim text. Deduped by starting position, sorted by
/// position.
fn extract_citations(response: &str) -> Vec<ExtractedCitation> {
    let mut citations = Vec::new();
    let mut seen_positions = HashSet::new();

    for cap in QUOTE_PATTERN.captures_iter(response) {
        let whole = cap.get(0).unwrap();
        seen_positions.insert(whole.start());
        let claim_text = cap.get(1).unwrap().as_str().to_string();
        if let Ok(idx) = cap.get(2).unwrap().as_str().parse::<usize>() {
            citations.push(ExtractedCitation {
                claim_text,
                source_index: idx,
                is_quote: true,
                position: whole.start(),
            });
        }
    }

    for cap in CLAIM_PATTERN.captures_iter(response) {
        let whole = cap.get(0).unwrap();
        if seen_positions.contains(&whole.start()) {
            continue;
        }
        let claim_text = cap.get(1).unwrap().as_str().trim().to_string();

        if let Some(m) = cap.get(2) {
            if let Ok(idx) = m.as_str().parse::<usize>() {
                citations.push(ExtractedCitation {
                    claim_text: claim_text.clone(),
                    source_index: idx,
                    is_quote: false,
                    position: whole.start(),
                });
            }
        }
        if let Some(m) = cap.get(3) {
            if let Ok(idx) = m.as_str().parse::<usize>() {
                citations.push(ExtractedCitation {
                    claim_text: claim_text.clone(),
                    source_index: idx,
                    is_quote: false,
                    position: whole.start(),
                });
            }
        }
    }

    citations.sort_by_key(|c| c.position);
    citations
}

fn verify_citation(
    id: usize,
    citation: &ExtractedCitation,
    packet: &EvidencePacket,
    config: &RagConfig,
) -> VerifiedCitation {
    let Some(entry) = packet.entry_for_index(citation.source_index) else {
        return VerifiedCitation {
            citation_id: id,
            claim_text: citation.claim_text.clone(),
            source_index: citation.source_index,
            source_title: None,
            chunk_id: None,
            resource_id: None,
            is_quote: citation.is_quote,
            verified: false,
            overlap_score: 0.0,
            matching_text: None,
            notes: "Referenced source was not provided in context".to_string(),
        };
    };

    let overlap_score = calculate_overlap(&citation.claim_text, &entry.content, citation.is_quote);
    let matching_text = find_matching_text(&citation.claim_text, &entry.content);
    let verified = overlap_score >= config.min_overlap;

    let notes = if overlap_score >= config.high_confidence {
        "High confidence match".to_string()
    } else if verified {
        "Partial match - may be paraphrased".to_string()
    } else {
        "Could not verify claim against source content".to_string()
    };

    VerifiedCitation {
        citation_id: id,
        claim_text: citation.claim_text.clone(),
        source_index: citation.source_index,
        source_title: Some(entry.result.resource.title.clone()),
        chunk_id: Some(entry.result.chunk.id),
        resource_id: Some(entry.result.resource.id),
        is_quote: citation.is_quote,
        verified,
        overlap_score,
        matching_text,
        notes,
    }
}

fn calculate_overlap(claim: &str, source: &str, is_quote: bool) -> f32 {
    let claim_norm = claim.trim().to_lowercase();
    let source_norm = source.trim().to_lowercase();

    if is_quote {
        if source_norm.contains(&claim_norm) {
            return 1.0;
        }
        let longest = longest_common_substring_len(&claim_norm, &source_norm);
        if claim_norm.len() > 0 && longest as f32 >= claim_norm.len() as f32 * 0.8 {
            return 0.9;
        }
    }

    let claim_tokens = tokenize(&claim_norm);
    let source_tokens: HashSet<String> = tokenize(&source_norm).into_iter().collect();

    if claim_tokens.is_empty() {
        return 0.0;
    }

    let claim_set: HashSet<&String> = claim_tokens.iter().collect();
    let overlap = claim_set.iter().filter(|t| source_tokens.contains(t.as_str())).count();
    let claim_coverage = overlap as f32 / claim_set.len() as f32;

    let phrases = ngrams(&claim_tokens, 2)
        .into_iter()
        .chain(ngrams(&claim_tokens, 3))
        .collect::<Vec<_>>();
    let phrase_score = if phrases.is_empty() {
        claim_coverage
    } else {
        let matches = phrases.iter().filter(|p| source_norm.contains(p.as_str())).count();
        matches as f32 / phrases.len() as f32
    };

    0.6 * claim_coverage + 0.4 * phrase_score
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn ngrams(tokens: &[String], n: usize) -> Vec<String> {
    if tokens.len() < n {
        return Vec::new();
    }
    tokens.windows(n).map(|w| w.join(" ")).collect()
}

fn longest_common_substring_len(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut best = 0;
    let mut dp = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        let mut prev = 0;
        for j in 1..=b.len() {
            let temp = dp[j];
            if a[i - 1] == b[j - 1] {
                dp[j] = prev + 1;
                best = best.max(dp[j]);
            } else {
                dp[j] = 0;
            }
            prev = temp;
        }
    }

    best
}

fn find_matching_text(claim: &str, source: &str) -> Option<String> {
    let claim_norm = claim.trim().to_lowercase();
    let source_norm = source.to_lowercase();
    if source_norm.contains(&claim_norm) {
        return Some(claim.trim().to_string());
    }
    None
}

fn find_uncited_claims(response: &str) -> Vec<String> {
    split_sentences(response)
        .into_iter()
        .filter(|s| {
            let lower = s.to_lowercase();
            let has_citation = CITATION_PATTERN.is_match(s);
            let factual = FACTUAL_INDICATORS.iter().any(|ind| lower.contains(ind))
                || PERCENT_PATTERN.is_match(&lower);
            factual && !has_citation
        })
        .collect()
}

fn find_invalid_references(response: &str, packet: &EvidencePacket) -> Vec<usize> {
    CITATION_PATTERN
        .captures_iter(response)
        .filter_map(|cap| cap.get(1).and_then(|m| m.as_str().parse::<usize>().ok()))
        .filter(|idx| packet.entry_for_index(*idx).is_none())
        .collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(|c| c == '.' || c == '!' || c == '?')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn looks_like_no_info_disclaimer(response: &str) -> bool {
    let lower = response.to_lowercase();
    NO_INFO_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, PacketEntry, Resource, SearchComponents, SearchResult};
    use uuid::Uuid;

    fn packet_with_sources(contents: &[&str]) -> EvidencePacket {
        let mut primary = Vec::new();
        for (i, content) in contents.iter().enumerate() {
            let resource = Resource {
                id: Uuid::new_v4(),
                workspace_id: Uuid::nil(),
                content_hash: content.to_string(),
                resource_type: "pdf".into(),
                title: format!("Doc {i}"),
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
            let result = SearchResult::new(chunk, resource, 0.9, SearchComponents::default());
            primary.push(PacketEntry {
                source_index: i + 1,
                content: content.to_string(),
                result,
                truncated: false,
            });
        }
        EvidencePacket {
            primary,
            supporting: vec![],
            document_metadata: vec![],
            related_documents: vec![],
            total_tokens: 100,
            source_count: contents.len(),
            has_conflicts: false,
            conflict_summary: None,
        }
    }

    #[test]
    fn verified_claim_scores_high_confidence() {
        let config = RagConfig::default();
        let packet = packet_with_sources(&["Quantum computing uses qubits to store information."]);
        let result = CitationVerifier::verify(
            "Quantum computing uses qubits. [Source 1]",
            &packet,
            false,
            &config,
        );
        assert_eq!(result.total_claims, 1);
        assert_eq!(result.verified_citations[0].source_index, 1);
        assert!(result.verified_citations[0].overlap_score >= config.min_overlap);
        assert!((result.verification_score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn invalid_reference_against_three_source_packet() {
        let config = RagConfig::default();
        let packet = packet_with_sources(&["a", "b", "c"]);
        let result = CitationVerifier::verify(
            "This is a claim. [Source 99]",
            &packet,
            true,
            &config,
        );
        assert!(result.has_hallucinations);
        assert_eq!(result.invalid_references, vec![99]);
    }

    #[test]
    fn uncited_factual_claim_flagged_in_strict_mode() {
        let config = RagConfig::default();
        let packet = packet_with_sources(&["some source content"]);
        let result = CitationVerifier::verify(
            "According to the study, X is true.",
            &packet,
            true,
            &config,
        );
        assert_eq!(result.uncited_claims.len(), 1);
        assert!(result.has_hallucinations);
    }

    #[test]
    fn citation_round_trip_covers_every_source() {
        let config = RagConfig::default();
        let packet = packet_with_sources(&["alpha content here", "beta content here", "gamma content here"]);
        let response = "Alpha claim. [Source 1] Beta claim. [Source 2] Gamma claim. [Source 3]";
        let result = CitationVerifier::verify(response, &packet, false, &config);
        assert_eq!(result.total_claims, 3);
        assert!(result.invalid_references.is_empty());
    }
}
