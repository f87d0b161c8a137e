//! BM25 lexical ranker.
//!
//! Scores free-text queries against an in-memory corpus snapshot.
//!
//! # Scoring
//!
//! Text is lower-cased and split on whitespace (empty tokens dropped).
//! For every query token `t` and document `d`:
//!
//! ```text
//! idf(t)   = ln((N - df + 0.5) / (df + 0.5) + 1)      (0 when df = 0)
//! norm(d)  = |d| / avgdl                              (0 when avgdl = 0)
//! score    = Σ_t idf(t) · (k1 + 1) · tf / (k1 · (1 - b + b · norm(d)) + tf)
//! ```
//!
//! with `k1 = 1.5` and `b = 0.75`. Repeated query tokens each contribute.
//! Documents whose score is not positive are left out of the results.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::{sort_by_score_desc, SearchDocument, SearchResult};

/// Term-frequency saturation.
pub const BM25_K1: f64 = 1.5;
/// Document-length normalization strength.
pub const BM25_B: f64 = 0.75;

/// Lower-case and split on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Per-document view inside a snapshot.
struct IndexedDocument {
    doc: SearchDocument,
    term_freqs: HashMap<String, u32>,
    len: usize,
}

/// Read-only index derived from one document collection.
///
/// Document lengths, the corpus average length and per-token document
/// frequencies are always built together, so they can never disagree.
#[derive(Default)]
pub struct LexicalSnapshot {
    docs: Vec<IndexedDocument>,
    avg_len: f64,
    doc_freqs: HashMap<String, usize>,
}

impl LexicalSnapshot {
    pub fn build(documents: Vec<SearchDocument>) -> Self {
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        let docs: Vec<IndexedDocument> = documents
            .into_iter()
            .map(|doc| {
                let tokens = tokenize(&doc.content);
                let mut term_freqs: HashMap<String, u32> = HashMap::new();
                for token in &tokens {
                    *term_freqs.entry(token.clone()).or_insert(0) += 1;
                }
                for token in term_freqs.keys() {
                    *doc_freqs.entry(token.clone()).or_insert(0) += 1;
                }
                total_len += tokens.len();
                IndexedDocument {
                    doc,
                    term_freqs,
                    len: tokens.len(),
                }
            })
            .collect();

        let avg_len = if docs.is_empty() {
            0.0
        } else {
            total_len as f64 / docs.len() as f64
        };

        Self {
            docs,
            avg_len,
            doc_freqs,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn avg_len(&self) -> f64 {
        self.avg_len
    }

    /// Number of documents containing `token`.
    pub fn doc_freq(&self, token: &str) -> usize {
        self.doc_freqs.get(token).copied().unwrap_or(0)
    }

    /// Inverse document frequency; `0.0` for tokens absent from the corpus.
    pub fn idf(&self, token: &str) -> f64 {
        let df = self.doc_freq(token);
        if df == 0 {
            return 0.0;
        }
        let n = self.docs.len() as f64;
        let df = df as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score(&self, query_tokens: &[String], indexed: &IndexedDocument) -> f64 {
        let norm_len = if self.avg_len > 0.0 {
            indexed.len as f64 / self.avg_len
        } else {
            0.0
        };
        let length_factor = BM25_K1 * (1.0 - BM25_B + BM25_B * norm_len);

        query_tokens
            .iter()
            .map(|token| {
                let freq = f64::from(indexed.term_freqs.get(token).copied().unwrap_or(0));
                if freq == 0.0 {
                    return 0.0;
                }
                self.idf(token) * (BM25_K1 + 1.0) * freq / (length_factor + freq)
            })
            .sum()
    }

    /// Rank every document against `query`, best first, keeping `top_k`.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<SearchResult> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || self.docs.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let mut results: Vec<SearchResult> = self
            .docs
            .iter()
            .filter_map(|indexed| {
                let score = self.score(&query_tokens, indexed);
                (score > 0.0).then(|| SearchResult::from_document(&indexed.doc, score))
            })
            .collect();

        sort_by_score_desc(&mut results);
        results.truncate(top_k);
        results
    }
}

/// BM25 ranker holding the current corpus snapshot.
///
/// `index` builds a new snapshot off-lock and swaps it in whole, so a
/// concurrent `search` sees either the old corpus or the new one.
#[derive(Default)]
pub struct LexicalRanker {
    snapshot: RwLock<Arc<LexicalSnapshot>>,
}

impl LexicalRanker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the corpus.
    pub fn index(&self, documents: Vec<SearchDocument>) {
        let snapshot = Arc::new(LexicalSnapshot::build(documents));
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn search(&self, query: &str, top_k: usize) -> Vec<SearchResult> {
        self.snapshot().search(query, top_k)
    }

    /// The snapshot currently being served.
    pub fn snapshot(&self) -> Arc<LexicalSnapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}
