//! Per-call options for search and context assembly.

use chrono::{DateTime, Utc};
use mnemo_knowledge::{DocumentType, SearchFilter};
use serde::{Deserialize, Serialize};

use crate::config::{ContextConfig, validate_weights};
use crate::error::{Result, RetrievalError};

/// Options for `search_knowledge` and `search_all`.
///
/// `None` limits and thresholds fall back to the engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub score_threshold: Option<f32>,
    pub filter: SearchFilter,
    pub include_personal: bool,
    pub include_knowledge: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: None,
            score_threshold: None,
            filter: SearchFilter::default(),
            include_personal: true,
            include_knowledge: true,
        }
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_score_threshold(mut self, score_threshold: f32) -> Self {
        self.score_threshold = Some(score_threshold);
        self
    }

    /// Restrict to these document types.
    pub fn with_types(mut self, types: impl IntoIterator<Item = DocumentType>) -> Self {
        self.filter.doc_types.extend(types);
        self
    }

    /// Require at least one of these tags.
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.filter.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Restrict to these sources.
    pub fn with_sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.filter.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    /// Documents created in `[after, before)`. Either bound may be open.
    pub fn with_created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.filter.created_after = after;
        self.filter.created_before = before;
        self
    }

    pub fn include_personal(mut self, include: bool) -> Self {
        self.include_personal = include;
        self
    }

    pub fn include_knowledge(mut self, include: bool) -> Self {
        self.include_knowledge = include;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.score_threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(RetrievalError::InvalidConfiguration(format!(
                "score_threshold must be within [0, 1], got {threshold}"
            )));
        }
        Ok(())
    }
}

/// Options for `build_context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub max_tokens: usize,
    pub personal_weight: f32,
    pub knowledge_weight: f32,

    /// Most recent conversation turns considered.
    pub history_limit: usize,

    pub include_sources: bool,
    pub diversity_threshold: Option<f32>,

    /// Filters and limits for the underlying searches. A `None` limit is
    /// derived from `max_tokens`; a `None` threshold comes from the context
    /// configuration, not the index defaults.
    pub search: SearchOptions,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

impl ContextOptions {
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            personal_weight: config.personal_weight,
            knowledge_weight: config.knowledge_weight,
            history_limit: config.history_limit,
            include_sources: config.include_sources,
            diversity_threshold: config.diversity_threshold,
            search: SearchOptions::default(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_weights(mut self, personal_weight: f32, knowledge_weight: f32) -> Self {
        self.personal_weight = personal_weight;
        self.knowledge_weight = knowledge_weight;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    pub fn with_sources(mut self, include_sources: bool) -> Self {
        self.include_sources = include_sources;
        self
    }

    pub fn with_diversity(mut self, threshold: f32) -> Self {
        self.diversity_threshold = Some(threshold);
        self
    }

    pub fn with_search(mut self, search: SearchOptions) -> Self {
        self.search = search;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_weights(self.personal_weight, self.knowledge_weight)?;
        self.search.validate()
    }

    /// Search options used to gather context candidates.
    pub(crate) fn candidate_search(&self, config: &ContextConfig) -> SearchOptions {
        let mut search = self.search.clone();
        let per_result = config.tokens_per_result.max(1);
        search.limit = search.limit.or(Some((self.max_tokens / per_result).max(1)));
        search.score_threshold = search.score_threshold.or(Some(config.score_threshold));
        search
    }
}
