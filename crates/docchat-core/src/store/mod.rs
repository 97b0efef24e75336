//! Vector index abstraction.
//!
//! The [`VectorStore`] trait is the vector-store collaborator: records are
//! keyed by chunk id and carry enough metadata to filter by document at
//! query time. Backends: [`memory::InMemoryVectorStore`] here, and the
//! SQLite-backed store in the `docchat` app crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::cmp::Ordering;
use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{EmbeddingRecord, RecordMetadata};

/// Restricts which records an operation sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// Records belonging to one document.
    Document(String),
    /// Records belonging to any document in the set. An empty set matches nothing.
    AnyDocument(BTreeSet<String>),
}

impl RecordFilter {
    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        match self {
            RecordFilter::Document(id) => &metadata.document_id == id,
            RecordFilter::AnyDocument(ids) => ids.contains(&metadata.document_id),
        }
    }
}

/// A record returned from a similarity query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMatch {
    pub chunk_id: String,
    pub score: f32,
    pub metadata: RecordMetadata,
}

/// Descending score, then ascending ordinal, then chunk id.
pub fn rank_order(a: &ScoredMatch, b: &ScoredMatch) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.metadata.ordinal.cmp(&b.metadata.ordinal))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Abstract vector index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or overwrite records by chunk id |
/// | [`delete`](VectorStore::delete) | Remove every record matching a filter |
/// | [`replace_document`](VectorStore::replace_document) | Delete a document's records, then write a new set |
/// | [`query`](VectorStore::query) | Top-k cosine similarity within a filter |
/// | [`list`](VectorStore::list) | Enumerate records matching a filter |
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, records: &[EmbeddingRecord]) -> Result<()>;

    /// Returns the number of records removed.
    async fn delete(&self, filter: &RecordFilter) -> Result<usize>;

    /// Stale-cleanup followed by write. Backends that can should do both
    /// atomically; the default runs them back to back.
    async fn replace_document(&self, document_id: &str, records: &[EmbeddingRecord]) -> Result<()> {
        self.delete(&RecordFilter::Document(document_id.to_string()))
            .await?;
        self.upsert(records).await
    }

    /// The filter is applied before scoring, so records outside it are
    /// never candidates. Results are ordered by [`rank_order`].
    async fn query(
        &self,
        vector: &[f32],
        filter: &RecordFilter,
        k: usize,
    ) -> Result<Vec<ScoredMatch>>;

    /// Records matching `filter`, ordered by document id then ordinal.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<EmbeddingRecord>>;
}
