//! Scoped similarity retrieval.
//!
//! The [`Retriever`] embeds the query, then asks the [`VectorStore`] for
//! the top-k records restricted to a conversation's attached documents.
//! The scope is passed to the store as a filter, so out-of-scope records
//! are never candidates regardless of how well they score.
//!
//! # Ordering
//!
//! Results are sorted by score (desc), ordinal (asc), chunk id (asc) and
//! truncated to `k`.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{RagError, RagResult};
use crate::models::ScoredChunk;
use crate::store::{rank_order, RecordFilter, VectorStore};

/// Query-time handle over an embedding provider and a vector index.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Return at most `k` chunks from documents in `scope`, best first.
    ///
    /// An empty scope short-circuits without embedding or querying.
    /// Provider and store failures surface as [`RagError::Retrieval`].
    pub async fn retrieve(
        &self,
        query: &str,
        scope: &BTreeSet<String>,
        k: usize,
    ) -> RagResult<Vec<ScoredChunk>> {
        if scope.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(|e| RagError::Retrieval(format!("query embedding: {:#}", e)))?;

        let filter = RecordFilter::AnyDocument(scope.clone());
        let mut matches = self
            .store
            .query(&query_vec, &filter, k)
            .await
            .map_err(|e| RagError::Retrieval(format!("vector store: {:#}", e)))?;

        matches.sort_by(rank_order);
        matches.truncate(k);

        Ok(matches
            .into_iter()
            .map(|m| {
                let filename = m.metadata.filename.clone();
                ScoredChunk {
                    chunk: m.metadata.into_chunk(m.chunk_id),
                    score: m.score,
                    filename,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::models::{EmbeddingRecord, RecordMetadata};
    use crate::store::memory::InMemoryVectorStore;

    /// Counts calls; maps text onto two axes by keyword.
    struct AxisEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("cats") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    fn record(doc: &str, ordinal: u32, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            chunk_id: format!("{}-{}", doc, ordinal),
            vector,
            metadata: RecordMetadata {
                document_id: doc.to_string(),
                thread_ids: BTreeSet::new(),
                ordinal,
                start: 0,
                end: 4,
                text: "text".to_string(),
                hash: String::new(),
                filename: format!("{}.md", doc),
            },
        }
    }

    async fn setup() -> (Retriever, Arc<AxisEmbedder>) {
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .upsert(&[
                record("mine", 0, vec![0.6, 0.8]),
                record("mine", 1, vec![0.8, 0.6]),
                record("mine", 2, vec![0.8, 0.6]),
                record("theirs", 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let embedder = Arc::new(AxisEmbedder {
            calls: AtomicUsize::new(0),
        });
        (Retriever::new(embedder.clone(), store), embedder)
    }

    fn scope(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_scope_skips_the_query() {
        let (retriever, embedder) = setup().await;
        let hits = retriever.retrieve("cats", &BTreeSet::new(), 5).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn never_leaks_outside_scope() {
        let (retriever, _) = setup().await;
        let hits = retriever.retrieve("cats", &scope(&["mine"]), 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.chunk.document_id == "mine"));
    }

    #[tokio::test]
    async fn ranks_by_score_then_ordinal() {
        let (retriever, _) = setup().await;
        let hits = retriever.retrieve("cats", &scope(&["mine"]), 2).await.unwrap();
        let ordinals: Vec<u32> = hits.iter().map(|h| h.chunk.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
        assert!(hits[0].score >= hits[1].score);
        assert_eq!(hits[0].filename, "mine.md");
    }
}
