//! Token-budgeted context assembly.
//!
//! The budget is spent in priority order: the query line, then ranked
//! results against per-source shares derived from the weights, then the
//! most recent conversation turns with whatever is left. An item that does
//! not fit is left out whole. Token cost is the whitespace-separated word
//! count of the rendered line, so the reported count is exactly the word
//! count of the formatted text.

use std::time::Duration;

use mnemo_knowledge::KnowledgeResult;
use serde::{Deserialize, Serialize};

use crate::memory::{Message, PersonalResult};
use crate::options::ContextOptions;
use crate::ranker::{RankedItem, RankedResult};

const QUERY_HEADER: &str = "Query:";
const PERSONAL_HEADER: &str = "Personal Memory:";
const KNOWLEDGE_HEADER: &str = "Knowledge Base:";
const HISTORY_HEADER: &str = "Recent Conversation:";

/// Context assembled for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagContext {
    pub query: String,
    pub personal: Vec<PersonalResult>,
    pub knowledge: Vec<KnowledgeResult>,
    pub history: Vec<Message>,

    /// Formatted text handed to the caller.
    pub text: String,

    /// Sources of the included knowledge results, first-seen order.
    pub sources: Vec<String>,

    pub token_count: usize,

    #[serde(with = "duration_millis")]
    pub build_time: Duration,
}

/// Approximate token count: whitespace-separated words.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[derive(Default)]
struct Section {
    lines: Vec<String>,
    cost: usize,
}

impl Section {
    /// Cost of adding `line`, including the header when the section is
    /// still empty.
    fn cost_of(&self, header: &str, line: &str) -> usize {
        let header_cost = if self.lines.is_empty() { count_tokens(header) } else { 0 };
        header_cost + count_tokens(line)
    }

    fn push(&mut self, cost: usize, line: String) {
        self.cost += cost;
        self.lines.push(line);
    }

    fn render(&self, header: &str, out: &mut String) {
        if self.lines.is_empty() {
            return;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(header);
        out.push('\n');
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
    }
}

/// Builds [`RagContext`]s. Pure and deterministic for fixed inputs.
pub struct ContextAssembler;

impl ContextAssembler {
    /// `ranked` must already be ordered best first; `history` holds the
    /// candidate turns oldest first.
    pub fn assemble(
        query: &str,
        ranked: &[RankedResult],
        history: &[Message],
        options: &ContextOptions,
    ) -> RagContext {
        let budget = options.max_tokens;

        let query_line = format!("{QUERY_HEADER} {query}");
        let query_cost = count_tokens(&query_line);
        let include_query = query_cost <= budget;
        let mut used = if include_query { query_cost } else { 0 };

        // Shares of what is left after the query, proportional to the weights.
        let remaining = budget - used;
        let total_weight = options.knowledge_weight + options.personal_weight;
        let knowledge_share = if total_weight > 0.0 {
            ((remaining as f64) * f64::from(options.knowledge_weight) / f64::from(total_weight))
                .floor() as usize
        } else {
            0
        };
        let personal_share = remaining - knowledge_share.min(remaining);

        let mut personal_section = Section::default();
        let mut knowledge_section = Section::default();
        let mut personal = Vec::new();
        let mut knowledge = Vec::new();
        let mut sources: Vec<String> = Vec::new();

        for result in ranked {
            match &result.item {
                RankedItem::Knowledge(hit) => {
                    // Chunks without a source are listed without attribution.
                    let source = Some(hit.source.as_str())
                        .filter(|source| options.include_sources && !source.is_empty());
                    let line = match source {
                        Some(source) => format!(
                            "{}. {} (Source: {source})",
                            knowledge.len() + 1,
                            hit.content
                        ),
                        None => format!("{}. {}", knowledge.len() + 1, hit.content),
                    };
                    let cost = knowledge_section.cost_of(KNOWLEDGE_HEADER, &line);
                    if knowledge_section.cost + cost > knowledge_share {
                        continue;
                    }
                    knowledge_section.push(cost, line);
                    if let Some(source) = source
                        && !sources.iter().any(|s| s == source)
                    {
                        sources.push(source.to_string());
                    }
                    knowledge.push(hit.clone());
                }
                RankedItem::Personal(hit) => {
                    let line = format!("{}. {}", personal.len() + 1, hit.entry.content);
                    let cost = personal_section.cost_of(PERSONAL_HEADER, &line);
                    if personal_section.cost + cost > personal_share {
                        continue;
                    }
                    personal_section.push(cost, line);
                    personal.push(hit.clone());
                }
            }
        }
        used += personal_section.cost + knowledge_section.cost;

        // Newest turns first; stop at the first that does not fit.
        let mut history_section = Section::default();
        let mut turns = Vec::new();
        for message in history.iter().rev().take(options.history_limit) {
            let line = format!("{}: {}", message.role, message.content);
            let cost = history_section.cost_of(HISTORY_HEADER, &line);
            if used + history_section.cost + cost > budget {
                break;
            }
            history_section.push(cost, line);
            turns.push(message.clone());
        }
        history_section.lines.reverse();
        turns.reverse();

        let mut text = String::new();
        if include_query {
            text.push_str(&query_line);
            text.push('\n');
        }
        personal_section.render(PERSONAL_HEADER, &mut text);
        knowledge_section.render(KNOWLEDGE_HEADER, &mut text);
        history_section.render(HISTORY_HEADER, &mut text);

        RagContext {
            query: query.to_string(),
            personal,
            knowledge,
            history: turns,
            token_count: count_tokens(&text),
            text,
            sources,
            build_time: Duration::ZERO,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
