//! Merging knowledge and personal results into one ranking.

use std::collections::{BTreeSet, HashMap};

use mnemo_knowledge::KnowledgeResult;
use serde::{Deserialize, Serialize};

use crate::config::validate_weights;
use crate::error::Result;
use crate::memory::PersonalResult;

/// Where a ranked result came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RankedItem {
    Knowledge(KnowledgeResult),
    Personal(PersonalResult),
}

/// A result with its cross-source score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    /// Chunk id (`doc#index`) or memory entry id.
    pub id: String,

    /// Weighted score used for ordering.
    pub score: f32,

    /// Score reported by the originating search.
    pub raw_score: f32,

    pub item: RankedItem,
}

impl RankedResult {
    pub fn content(&self) -> &str {
        match &self.item {
            RankedItem::Knowledge(result) => &result.content,
            RankedItem::Personal(result) => &result.entry.content,
        }
    }

    pub fn is_knowledge(&self) -> bool {
        matches!(self.item, RankedItem::Knowledge(_))
    }
}

/// Weighted merge with deduplication and optional diversity filtering.
#[derive(Debug, Clone, Default)]
pub struct HybridRanker {
    diversity_threshold: Option<f32>,
}

impl HybridRanker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop candidates whose word overlap with an already selected result
    /// exceeds `threshold`.
    pub fn with_diversity(mut self, threshold: Option<f32>) -> Self {
        self.diversity_threshold = threshold;
        self
    }

    /// Each raw score is multiplied by its source weight and divided by the
    /// sum of both weights. Results sharing an id keep the higher score.
    /// Output is ordered by score descending, then id.
    pub fn merge(
        &self,
        knowledge: Vec<KnowledgeResult>,
        personal: Vec<PersonalResult>,
        knowledge_weight: f32,
        personal_weight: f32,
    ) -> Result<Vec<RankedResult>> {
        validate_weights(personal_weight, knowledge_weight)?;
        let total = knowledge_weight + personal_weight;

        let candidates = knowledge
            .into_iter()
            .map(|result| RankedResult {
                id: result.id(),
                score: result.score * knowledge_weight / total,
                raw_score: result.score,
                item: RankedItem::Knowledge(result),
            })
            .chain(personal.into_iter().map(|result| RankedResult {
                id: result.entry.id.clone(),
                score: result.score * personal_weight / total,
                raw_score: result.score,
                item: RankedItem::Personal(result),
            }));

        let mut best: HashMap<String, RankedResult> = HashMap::new();
        for candidate in candidates {
            match best.get(&candidate.id) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    best.insert(candidate.id.clone(), candidate);
                }
            }
        }

        let mut ranked: Vec<RankedResult> = best.into_values().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

        Ok(match self.diversity_threshold {
            Some(threshold) => diversify(ranked, threshold),
            None => ranked,
        })
    }
}

fn diversify(ranked: Vec<RankedResult>, threshold: f32) -> Vec<RankedResult> {
    let mut selected: Vec<(RankedResult, BTreeSet<String>)> = Vec::with_capacity(ranked.len());
    for candidate in ranked {
        let words = word_set(candidate.content());
        if selected
            .iter()
            .any(|(_, chosen)| jaccard(&words, chosen) > threshold)
        {
            continue;
        }
        selected.push((candidate, words));
    }
    selected.into_iter().map(|(result, _)| result).collect()
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionId;
    use crate::error::RetrievalError;
    use crate::memory::MemoryEntry;
    use chrono::Utc;
    use mnemo_knowledge::{DocumentType, Metadata};
    use pretty_assertions::assert_eq;

    fn knowledge(doc: &str, chunk: usize, content: &str, score: f32) -> KnowledgeResult {
        KnowledgeResult {
            document_id: doc.to_string(),
            chunk_index: chunk,
            chunk_total: 1,
            content: content.to_string(),
            score,
            title: String::new(),
            source: format!("{doc}.md"),
            doc_type: DocumentType::Markdown,
            tags: Vec::new(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    fn personal(id: &str, content: &str, score: f32) -> PersonalResult {
        PersonalResult {
            entry: MemoryEntry {
                id: id.to_string(),
                sequence: 0,
                session: SessionId::from("s"),
                content: content.to_string(),
                tags: Vec::new(),
                created_at: Utc::now(),
                promoted: false,
            },
            score,
        }
    }

    fn ids(results: &[RankedResult]) -> Vec<&str> {
        results.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_weights_are_normalized_by_their_sum() {
        let ranked = HybridRanker::new()
            .merge(
                vec![knowledge("a", 0, "alpha", 0.8)],
                vec![personal("mem-1", "beta", 0.9)],
                3.0,
                1.0,
            )
            .unwrap();

        assert_eq!(ids(&ranked), vec!["a#0", "mem-1"]);
        assert!((ranked[0].score - 0.6).abs() < 1e-6);
        assert!((ranked[1].score - 0.225).abs() < 1e-6);
        assert_eq!(ranked[1].raw_score, 0.9);
    }

    #[test]
    fn test_order_within_a_source_is_preserved() {
        let ranked = HybridRanker::new()
            .merge(
                vec![
                    knowledge("a", 0, "one", 0.9),
                    knowledge("a", 1, "two", 0.5),
                    knowledge("b", 0, "three", 0.7),
                ],
                Vec::new(),
                0.7,
                0.3,
            )
            .unwrap();
        assert_eq!(ids(&ranked), vec!["a#0", "b#0", "a#1"]);
    }

    #[test]
    fn test_duplicates_keep_higher_score() {
        let ranked = HybridRanker::new()
            .merge(
                vec![knowledge("a", 0, "same", 0.4), knowledge("a", 0, "same", 0.9)],
                Vec::new(),
                1.0,
                1.0,
            )
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].raw_score, 0.9);
    }

    #[test]
    fn test_equal_scores_break_on_id() {
        let ranked = HybridRanker::new()
            .merge(
                vec![knowledge("b", 0, "x", 0.5), knowledge("a", 3, "y", 0.5)],
                Vec::new(),
                1.0,
                0.0,
            )
            .unwrap();
        assert_eq!(ids(&ranked), vec!["a#3", "b#0"]);
    }

    #[test]
    fn test_diversity_rejects_near_duplicates() {
        let results = vec![
            knowledge("a", 0, "the cache evicts the least useful entry", 0.9),
            knowledge("a", 1, "the cache evicts the least useful entry first", 0.8),
            knowledge("b", 0, "ranking merges two result lists", 0.7),
        ];

        let plain = HybridRanker::new().merge(results.clone(), Vec::new(), 1.0, 1.0).unwrap();
        assert_eq!(plain.len(), 3);

        let diverse = HybridRanker::new()
            .with_diversity(Some(0.7))
            .merge(results, Vec::new(), 1.0, 1.0)
            .unwrap();
        assert_eq!(ids(&diverse), vec!["a#0", "b#0"]);
    }

    #[test]
    fn test_zero_weights_rejected() {
        let err = HybridRanker::new()
            .merge(Vec::new(), Vec::new(), 0.0, 0.0)
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidConfiguration(_)));
    }
}
