//! Core data models shared by the rankers, fusion, and context budgeter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque key-value metadata attached to a document.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A document in the searchable corpus.
///
/// Immutable once indexed. Re-indexing replaces the whole corpus snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    /// Unique document identifier.
    pub id: String,
    /// Full text used for ranking.
    pub content: String,
    /// Where the document came from (collection, connector, URL).
    pub source: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SearchDocument {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: source.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A scored document produced by a single query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub source: String,
    pub metadata: Metadata,
}

impl SearchResult {
    pub(crate) fn from_document(doc: &SearchDocument, score: f64) -> Self {
        Self {
            id: doc.id.clone(),
            content: doc.content.clone(),
            score,
            source: doc.source.clone(),
            metadata: doc.metadata.clone(),
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"user"`, `"assistant"`, or `"system"`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Sort results by score descending.
///
/// Uses a stable sort so equal scores keep their original (index) order.
pub(crate) fn sort_by_score_desc(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
