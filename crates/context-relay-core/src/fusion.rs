//! Weighted rank fusion over the lexical and vector rankers.
//!
//! # Fusion Algorithm
//!
//! 1. Fetch `2 × top_k` lexical candidates (BM25 score).
//! 2. Fetch `2 × top_k` vector candidates (cosine similarity), only when an
//!    embedder is supplied. Without one the vector list is empty, so the
//!    ranking degrades to lexical-only.
//! 3. Weight each sub-score: `lexical_weight × bm25`, `vector_weight × cosine`.
//! 4. Merge by document id: a document in both lists gets the sum, a
//!    document in one list gets that list's weighted score alone.
//! 5. Sort by combined score (desc, stable) and truncate to `top_k`.
//!
//! Over-fetching improves recall: a document just outside one ranker's
//! top-k can still surface after the other ranker's contribution is added.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::embedding::Embedder;
use crate::error::RelayError;
use crate::lexical::LexicalRanker;
use crate::models::{sort_by_score_desc, SearchDocument, SearchResult};
use crate::vector::{VectorIndexReport, VectorRanker};

pub const DEFAULT_LEXICAL_WEIGHT: f64 = 0.3;
pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.7;

/// Per-ranker weights. Always sum to `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionWeights {
    pub lexical: f64,
    pub vector: f64,
}

impl FusionWeights {
    /// Scale `lexical` and `vector` so they sum to one.
    ///
    /// `normalized(2.0, 8.0)` gives `0.2 / 0.8`. Negative, non-finite, or
    /// all-zero inputs are rejected.
    pub fn normalized(lexical: f64, vector: f64) -> Result<Self, RelayError> {
        for (field, value) in [("lexicalWeight", lexical), ("vectorWeight", vector)] {
            if !value.is_finite() || value < 0.0 {
                return Err(RelayError::invalid_field(
                    field,
                    "must be a finite, non-negative number",
                ));
            }
        }
        let total = lexical + vector;
        if total <= 0.0 {
            return Err(RelayError::invalid_field(
                "weights",
                "at least one weight must be positive",
            ));
        }
        Ok(Self {
            lexical: lexical / total,
            vector: vector / total,
        })
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            lexical: DEFAULT_LEXICAL_WEIGHT,
            vector: DEFAULT_VECTOR_WEIGHT,
        }
    }
}

/// Summary of indexing both rankers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionIndexReport {
    pub documents: usize,
    pub vectors: Option<VectorIndexReport>,
}

/// Hybrid search over a [`LexicalRanker`] and a [`VectorRanker`].
pub struct RankFusion {
    lexical: Arc<LexicalRanker>,
    vector: Arc<VectorRanker>,
    weights: RwLock<FusionWeights>,
}

impl Default for RankFusion {
    fn default() -> Self {
        Self::new(Arc::new(LexicalRanker::new()), Arc::new(VectorRanker::new()))
    }
}

impl RankFusion {
    pub fn new(lexical: Arc<LexicalRanker>, vector: Arc<VectorRanker>) -> Self {
        Self {
            lexical,
            vector,
            weights: RwLock::new(FusionWeights::default()),
        }
    }

    pub fn lexical(&self) -> &LexicalRanker {
        &self.lexical
    }

    pub fn vector(&self) -> &VectorRanker {
        &self.vector
    }

    pub fn weights(&self) -> FusionWeights {
        *self.weights.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set new weights, normalized to sum to one. Returns the effective weights.
    pub fn set_weights(&self, lexical: f64, vector: f64) -> Result<FusionWeights, RelayError> {
        let weights = FusionWeights::normalized(lexical, vector)?;
        *self.weights.write().unwrap_or_else(PoisonError::into_inner) = weights;
        Ok(weights)
    }

    /// Replace the corpus of both rankers. Vectors are only built when an
    /// embedder is supplied; otherwise the vector ranker is emptied so it
    /// never serves documents from an earlier corpus.
    pub async fn index(
        &self,
        documents: Vec<SearchDocument>,
        embed: Option<&dyn Embedder>,
    ) -> FusionIndexReport {
        let count = documents.len();
        let vectors = match embed {
            Some(embed) => Some(self.vector.index(documents.clone(), embed).await),
            None => {
                self.vector.clear();
                None
            }
        };
        self.lexical.index(documents);
        FusionIndexReport {
            documents: count,
            vectors,
        }
    }

    /// Run both rankers and merge their weighted scores.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        embed: Option<&dyn Embedder>,
    ) -> Vec<SearchResult> {
        if top_k == 0 || query.trim().is_empty() {
            return Vec::new();
        }
        let candidate_k = top_k.saturating_mul(2);

        let lexical_hits = self.lexical.search(query, candidate_k);
        let vector_hits = match embed {
            Some(embed) => match self.vector.search(query, embed, candidate_k).await {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "query embedding failed, using lexical ranking only"
                    );
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let weights = self.weights();
        fuse(lexical_hits, vector_hits, weights, top_k)
    }
}

/// Merge two ranked lists by document id using `weights`.
pub fn fuse(
    lexical_hits: Vec<SearchResult>,
    vector_hits: Vec<SearchResult>,
    weights: FusionWeights,
    top_k: usize,
) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = Vec::with_capacity(lexical_hits.len() + vector_hits.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    let weighted = lexical_hits
        .into_iter()
        .map(|hit| (hit, weights.lexical))
        .chain(vector_hits.into_iter().map(|hit| (hit, weights.vector)));

    for (mut hit, weight) in weighted {
        let score = weight * hit.score;
        match positions.get(&hit.id).copied() {
            Some(pos) => merged[pos].score += score,
            None => {
                hit.score = score;
                positions.insert(hit.id.clone(), merged.len());
                merged.push(hit);
            }
        }
    }

    sort_by_score_desc(&mut merged);
    merged.truncate(top_k);
    merged
}
