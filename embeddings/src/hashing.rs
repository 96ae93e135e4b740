//! Deterministic offline embedding provider.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::Embedding;
use crate::error::Result;
use crate::provider::EmbeddingProvider;

/// Terms too common to carry meaning on their own.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "to", "was", "were", "with", "this", "what", "which",
];

/// Hashes terms into fixed buckets weighted by term frequency.
///
/// No network, no model files, identical output for identical input. Texts
/// sharing meaningful words land close together, which is enough for tests
/// and air-gapped deployments.
pub struct HashingProvider {
    dimension: usize,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Hash a term into a bucket index using FNV-1a.
    fn bucket(&self, term: &str) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= u64::from(*b);
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.dimension as u64) as usize
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| s.len() >= 2)
            .map(str::to_lowercase)
            .filter(|s| !STOPWORDS.contains(&s.as_str()))
            .collect()
    }

    fn vectorize(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens = Self::tokenize(text);
        if tokens.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.as_str()).or_default() += 1.0;
        }

        let total = tokens.len() as f32;
        for (term, count) in tf {
            // Longer terms are rarer; weight them up.
            let idf = 1.0 + (term.len() as f32).ln();
            vector[self.bucket(term)] += count / total * idf;
        }

        crate::similarity::normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        "fnv1a-tf"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|text| self.vectorize(text)).collect())
    }

    fn is_available(&self) -> bool {
        true
    }
}
