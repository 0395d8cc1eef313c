//! C6: Prompt Builder.
//!
//! Builds a grounded system/user prompt per task type, enforcing citation
//! discipline. Grounded on `docify`'s `prompt_engineering.py`
//! (`PromptTemplate`, `PromptType`, per-type system/user templates,
//! conflict-notice and history-splicing behavior). `explain` reuses the `qa`
//! template, the way the original has no distinct `explain` entry either.

use crate::types::{EvidencePacket, PacketEntry, PromptType};

pub struct BuiltPrompt {
    pub system: String,
    pub user: String,
    pub prompt_type: PromptType,
    pub source_count: usize,
}

const CITATION_RULES: &str = "\
CRITICAL RULES:
1. Answer only using the information in the provided sources. Do not use outside knowledge.
2. Cite every factual claim with the token [Source N], where N matches the source's index below.
3. If the sources do not contain enough information to answer, say so explicitly instead of guessing.
4. When sources disagree, present both sides of the disagreement along with their respective citations.";

fn system_prompt(prompt_type: PromptType) -> String {
    let role = match prompt_type {
        PromptType::Qa | PromptType::Explain => {
            "You are a careful research assistant answering questions strictly from the provided sources."
        }
        PromptType::Summary => {
            "You are a careful research assistant summarizing the provided sources."
        }
        PromptType::Compare => {
            "You are a careful research assistant comparing and contrasting the provided sources."
        }
        PromptType::Extract => {
            "You are a careful research assistant extracting specific facts from the provided sources."
        }
    };
    format!("{role}\n\n{CITATION_RULES}")
}

fn user_template(prompt_type: PromptType, context: &str, query: &str) -> String {
    let instruction = match prompt_type {
        PromptType::Qa | PromptType::Explain => "Answer the question below using only the sources above.",
        PromptType::Summary => "Summarize the sources above as they relate to the request below.",
        PromptType::Compare => "Compare and contrast the sources above with respect to the request below.",
        PromptType::Extract => "Extract the specific information requested below from the sources above.",
    };
    format!(
        "SOURCES:\n{context}\n\n---\n\n{instruction}\n\nQuery: {query}\n\n\
         Remember to cite every claim with [Source N]."
    )
}

pub struct PromptBuilder;

impl PromptBuilder {
    /// `build(query, packet, type, history?, extra?) -> {system, user, metadata}`.
    pub fn build(
        query: &str,
        packet: &EvidencePacket,
        prompt_type: PromptType,
        history: Option<&[(String, String)]>,
        extra: Option<&str>,
    ) -> BuiltPrompt {
        let context = format_packet(packet);

        let mut system = system_prompt(prompt_type);

        if packet.has_conflicts {
            system.push_str(
                "\n\nNote: the provided sources contain conflicting information. \
                 Present both perspectives with their citations rather than picking one.",
            );
        }

        if let Some(extra) = extra {
            if !extra.trim().is_empty() {
                system.push_str(&format!("\n\nAdditional instructions:\n{extra}"));
            }
        }

        if let Some(history) = history {
            if !history.is_empty() {
                system.push_str("\n\nRecent conversation history:\n");
                system.push_str(&format_history(history, 5));
            }
        }

        let user = user_template(prompt_type, &context, query);

        BuiltPrompt {
            system,
            user,
            prompt_type,
            source_count: packet.source_count,
        }
    }

    /// Canned apology returned when the packet is empty; the orchestrator
    /// short-circuits LLM invocation for this path.
    pub fn no_context_response(query: &str) -> String {
        format!(
            "I couldn't find any relevant information in the workspace to answer \"{query}\". \
             Please try rephrasing your question or upload documents related to this topic."
        )
    }
}

/// Emit each chunk as a block: `[Source N]`, title, type, optional section
/// and page, a relevance score, a blank line, the content, then
/// `[End Source N]`. Blocks joined by blank lines, matching the source
/// formatting the original context-assembly service emits.
fn format_packet(packet: &EvidencePacket) -> String {
    packet
        .entries()
        .map(format_entry)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_entry(entry: &PacketEntry) -> String {
    let r = &entry.result;
    let score = if r.final_score > 0.0 { r.final_score } else { r.base_score };

    let mut header = format!(
        "[Source {}]\n{} ({})",
        entry.source_index, r.resource.title, r.resource.resource_type
    );
    if let Some(section) = &r.chunk.section_title {
        header.push_str(&format!(", section: {section}"));
    }
    if let Some(page) = r.chunk.page_number {
        header.push_str(&format!(", page {page}"));
    }
    header.push_str(&format!("\nRelevance: {score:.2}"));

    format!(
        "{header}\n\n{}\n\n[End Source {}]",
        entry.content, entry.source_index
    )
}

fn format_history(history: &[(String, String)], max_turns: usize) -> String {
    let start = history.len().saturating_sub(max_turns * 2);
    history[start..]
        .iter()
        .map(|(role, content)| {
            let truncated: String = content.chars().take(500).collect();
            format!("{role}: {truncated}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, Resource, SearchComponents, SearchResult};
    use uuid::Uuid;

    fn make_packet() -> EvidencePacket {
        let resource = Resource {
            id: Uuid::new_v4(),
            workspace_id: Uuid::nil(),
            content_hash: "h".into(),
            resource_type: "pdf".into(),
            title: "Intro QC".into(),
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
            content: "Quantum computing uses qubits.".into(),
            token_count: None,
            section_title: None,
            section_level: None,
            page_number: None,
            embedding: None,
        };
        let mut result = SearchResult::new(chunk, resource, 0.9, SearchComponents::default());
        result.final_score = 0.9;
        EvidencePacket {
            primary: vec![PacketEntry {
                source_index: 1,
                content: result.chunk.content.clone(),
                result,
                truncated: false,
            }],
            supporting: vec![],
            document_metadata: vec![],
            related_documents: vec![],
            total_tokens: 10,
            source_count: 1,
            has_conflicts: false,
            conflict_summary: None,
        }
    }

    #[test]
    fn packet_format_is_bit_exact() {
        let packet = make_packet();
        let formatted = format_packet(&packet);
        assert!(formatted.contains("[Source 1]"));
        assert!(formatted.contains("[End Source 1]"));
        assert!(formatted.starts_with("[Source 1]"));
    }

    #[test]
    fn explain_reuses_qa_template() {
        let packet = make_packet();
        let qa = PromptBuilder::build("q", &packet, PromptType::Qa, None, None);
        let explain = PromptBuilder::build("q", &packet, PromptType::Explain, None, None);
        assert_eq!(qa.system, explain.system);
    }

    #[test]
    fn conflict_notice_appended_when_packet_has_conflicts() {
        let mut packet = make_packet();
        packet.has_conflicts = true;
        let built = PromptBuilder::build("q", &packet, PromptType::Qa, None, None);
        assert!(built.system.to_lowercase().contains("conflicting"));
    }
}
