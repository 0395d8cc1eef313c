//! Query expansion used by C3's per-variant fan-out.
//!
//! Grounded on `docify`'s `query_expansion.py`: an LLM-backed expander with a
//! rule-based fallback for short queries or LLM failure, both case-
//! insensitively deduplicated with the original query always variant #0.

use crate::llm::Llm;
use crate::types::LlmProvider;

const INTERROGATIVE_PREFIXES: &[&str] = &["what is ", "how do ", "how can ", "why "];

/// Expand `query` into up to `max_variants` paraphrases, original first.
pub async fn expand_query(llm: &dyn Llm, query: &str, max_variants: usize) -> Vec<String> {
    let trimmed = query.trim();
    if trimmed.len() < 3 || trimmed.split_whitespace().count() < 3 {
        return vec![query.to_string()];
    }

    let prompt = format!(
        "Given the question: \"{query}\"\n\
         Provide {n} alternative phrasings of this question, one per line.\n\
         Each alternative must be a complete question ending in '?'. Do not number them.",
        query = query,
        n = max_variants.saturating_sub(1),
    );

    match llm
        .generate(LlmProvider::Ollama, None, "", &prompt, 300, 0.5)
        .await
    {
        Ok(text) => {
            let mut variants = vec![query.to_string()];
            variants.extend(
                text.lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| l.contains('?')),
            );
            dedup_case_insensitive(variants, max_variants)
        }
        Err(_) => expand_query_simple(query, max_variants),
    }
}

/// Rule-based expansion requiring no LLM round-trip.
pub fn expand_query_simple(query: &str, max_variants: usize) -> Vec<String> {
    let mut variants = vec![query.to_string()];
    let lower = query.to_lowercase();

    for prefix in INTERROGATIVE_PREFIXES {
        if lower.starts_with(prefix) {
            let rest = &query[prefix.len()..];
            if !rest.trim().is_empty() {
                variants.push(rest.to_string());
            }
            break;
        }
    }

    if !lower.starts_with("explain") {
        let stripped = query.trim_end_matches('?').to_lowercase();
        variants.push(format!("Explain {}", stripped));
    }

    dedup_case_insensitive(variants, max_variants)
}

fn dedup_case_insensitive(variants: Vec<String>, max_variants: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for v in variants {
        let key = v.trim().trim_end_matches('?').to_lowercase();
        if seen.insert(key) {
            out.push(v);
        }
        if out.len() >= max_variants {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_expansion_strips_interrogative_prefix() {
        let variants = expand_query_simple("What is quantum computing?", 5);
        assert_eq!(variants[0], "What is quantum computing?");
        assert!(variants.iter().any(|v| v == "quantum computing?"));
    }

    #[test]
    fn simple_expansion_dedupes_case_insensitively() {
        let variants = expand_query_simple("why does it rain", 5);
        let lowered: Vec<String> = variants.iter().map(|v| v.to_lowercase()).collect();
        let unique: std::collections::HashSet<_> = lowered.iter().collect();
        assert_eq!(unique.len(), lowered.len());
    }

    #[test]
    fn simple_expansion_adds_explain_variant() {
        let variants = expand_query_simple("rainbows", 5);
        assert!(variants.iter().any(|v| v == "Explain rainbows"));
    }
}
