//! Cosine-similarity vector ranker.
//!
//! `index` calls the injected [`Embedder`] once per document and keeps the
//! resulting vectors in an [`EmbeddingTable`]. A document whose embedding
//! call failed, or whose vector has a different dimensionality from the
//! first one stored, gets no vector and is skipped by `search`; it is never
//! scored as `0.0`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;

use crate::embedding::{cosine_similarity, Embedder};
use crate::models::{sort_by_score_desc, SearchDocument, SearchResult};

/// Document id → embedding vector. At most one vector per document, all
/// vectors share `dims`.
#[derive(Debug, Default, Clone)]
pub struct EmbeddingTable {
    vectors: HashMap<String, Vec<f32>>,
    dims: Option<usize>,
}

impl EmbeddingTable {
    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.vectors.get(id).map(Vec::as_slice)
    }

    /// Dimensionality shared by every stored vector, once one is stored.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Store a vector, rejecting one whose length differs from the table's.
    fn insert(&mut self, id: &str, vector: Vec<f32>) -> std::result::Result<(), usize> {
        match self.dims {
            Some(dims) if dims != vector.len() => return Err(dims),
            None => self.dims = Some(vector.len()),
            _ => {}
        }
        self.vectors.insert(id.to_string(), vector);
        Ok(())
    }
}

#[derive(Default)]
struct VectorSnapshot {
    docs: Vec<SearchDocument>,
    table: EmbeddingTable,
}

/// Summary of one `index` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorIndexReport {
    pub indexed: usize,
    pub skipped: usize,
}

#[derive(Default)]
pub struct VectorRanker {
    snapshot: RwLock<Arc<VectorSnapshot>>,
}

impl VectorRanker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the corpus, embedding each document once.
    ///
    /// The lock is not held across embedding calls; the new snapshot is
    /// swapped in only after every document has been attempted.
    pub async fn index(
        &self,
        documents: Vec<SearchDocument>,
        embed: &dyn Embedder,
    ) -> VectorIndexReport {
        let mut table = EmbeddingTable::default();
        let mut skipped = 0;

        for doc in &documents {
            match embed.embed(&doc.content).await {
                Ok(vector) => {
                    if let Err(expected) = table.insert(&doc.id, vector) {
                        tracing::warn!(
                            doc_id = %doc.id,
                            expected_dims = expected,
                            "embedding dimensionality mismatch, document skipped"
                        );
                        skipped += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        doc_id = %doc.id,
                        error = %e,
                        "embedding failed, document skipped"
                    );
                    skipped += 1;
                }
            }
        }

        let report = VectorIndexReport {
            indexed: table.len(),
            skipped,
        };
        self.replace(VectorSnapshot {
            docs: documents,
            table,
        });
        report
    }

    /// Drop every document and vector. Searches return nothing until the
    /// next `index`.
    pub fn clear(&self) {
        self.replace(VectorSnapshot::default());
    }

    fn replace(&self, snapshot: VectorSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Embed `query` once and rank every document that has a vector.
    pub async fn search(
        &self,
        query: &str,
        embed: &dyn Embedder,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone();
        if snapshot.table.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = embed.embed(query).await?;
        Ok(rank(&snapshot, &query_vec, top_k))
    }

    /// Rank against a precomputed query vector.
    pub fn search_by_vector(&self, query_vec: &[f32], top_k: usize) -> Vec<SearchResult> {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone();
        rank(&snapshot, query_vec, top_k)
    }

    /// A copy of the current embedding table.
    pub fn table(&self) -> EmbeddingTable {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).table.clone()
    }
}

fn rank(snapshot: &VectorSnapshot, query_vec: &[f32], top_k: usize) -> Vec<SearchResult> {
    if top_k == 0 {
        return Vec::new();
    }
    if let Some(dims) = snapshot.table.dims() {
        if dims != query_vec.len() {
            tracing::warn!(
                expected_dims = dims,
                query_dims = query_vec.len(),
                "query embedding dimensionality mismatch, no vector results"
            );
            return Vec::new();
        }
    }

    let mut results: Vec<SearchResult> = Vec::new();
    for doc in &snapshot.docs {
        let Some(vector) = snapshot.table.get(&doc.id) else {
            continue;
        };
        results.push(SearchResult::from_document(
            doc,
            cosine_similarity(query_vec, vector),
        ));
    }

    sort_by_score_desc(&mut results);
    results.truncate(top_k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Embeds known words as fixed vectors; anything else fails.
    struct LookupEmbedder {
        table: HashMap<&'static str, Vec<f32>>,
    }

    #[async_trait]
    impl Embedder for LookupEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.table
                .get(text)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no embedding for {text}"))
        }
        fn model_name(&self) -> &str {
            "lookup"
        }
        fn dims(&self) -> usize {
            3
        }
    }

    fn embedder() -> LookupEmbedder {
        let mut table = HashMap::new();
        table.insert("database", vec![0.9, 0.1, 0.1]);
        table.insert("http", vec![0.2, 0.8, 0.3]);
        table.insert("server", vec![0.1, 0.2, 0.9]);
        table.insert("wide", vec![0.1, 0.2, 0.9, 0.4]);
        table.insert("query:db", vec![0.95, 0.05, 0.05]);
        table.insert("query:short", vec![1.0, 0.0]);
        LookupEmbedder { table }
    }

    fn docs(contents: &[(&str, &str)]) -> Vec<SearchDocument> {
        contents
            .iter()
            .map(|(id, content)| SearchDocument::new(*id, *content, "test"))
            .collect()
    }

    #[tokio::test]
    async fn test_search_ranks_by_cosine() {
        let ranker = VectorRanker::new();
        let embed = embedder();
        let report = ranker
            .index(
                docs(&[("main", "server"), ("db", "database"), ("handlers", "http")]),
                &embed,
            )
            .await;
        assert_eq!(report, VectorIndexReport { indexed: 3, skipped: 0 });

        let results = ranker.search("query:db", &embed, 10).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "db");
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_failed_embedding_is_skipped_not_zero_scored() {
        let ranker = VectorRanker::new();
        let embed = embedder();
        let report = ranker
            .index(docs(&[("db", "database"), ("broken", "no vector here")]), &embed)
            .await;
        assert_eq!(report, VectorIndexReport { indexed: 1, skipped: 1 });

        let results = ranker.search("query:db", &embed, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.iter().all(|r| r.id != "broken"));
        assert!(ranker.table().get("broken").is_none());
    }

    #[tokio::test]
    async fn test_mismatched_dims_rejected_at_index_time() {
        let ranker = VectorRanker::new();
        let embed = embedder();
        let report = ranker
            .index(docs(&[("db", "database"), ("wide", "wide")]), &embed)
            .await;
        assert_eq!(report.skipped, 1);
        assert_eq!(ranker.table().dims(), Some(3));
    }

    #[tokio::test]
    async fn test_query_dims_mismatch_yields_nothing() {
        let ranker = VectorRanker::new();
        let embed = embedder();
        ranker.index(docs(&[("db", "database")]), &embed).await;
        let results = ranker.search("query:short", &embed, 10).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_query_embedding_failure_is_an_error() {
        let ranker = VectorRanker::new();
        let embed = embedder();
        ranker.index(docs(&[("db", "database")]), &embed).await;
        assert!(ranker.search("unknown query", &embed, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_topk_truncates() {
        let ranker = VectorRanker::new();
        let embed = embedder();
        ranker
            .index(
                docs(&[("main", "server"), ("db", "database"), ("handlers", "http")]),
                &embed,
            )
            .await;
        assert_eq!(ranker.search_by_vector(&[0.95, 0.05, 0.05], 2).len(), 2);
        assert!(ranker.search_by_vector(&[0.95, 0.05, 0.05], 0).is_empty());
    }

    #[tokio::test]
    async fn test_clear_drops_previous_corpus() {
        let ranker = VectorRanker::new();
        let embed = embedder();
        ranker.index(docs(&[("db", "database")]), &embed).await;
        ranker.clear();

        assert!(ranker.table().is_empty());
        assert!(ranker.search("query:db", &embed, 10).await.unwrap().is_empty());
    }
}
