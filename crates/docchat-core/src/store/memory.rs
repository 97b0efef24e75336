//! In-memory [`VectorStore`] implementation for tests and embedding.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock` for thread safety.
//! Queries are brute-force cosine similarity over the filtered records.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::EmbeddingRecord;

use super::{rank_order, RecordFilter, ScoredMatch, VectorStore};

/// In-memory vector index keyed by chunk id.
pub struct InMemoryVectorStore {
    records: RwLock<BTreeMap<String, EmbeddingRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, records: &[EmbeddingRecord]) -> Result<()> {
        let mut stored = self.records.write().unwrap();
        for r in records {
            stored.insert(r.chunk_id.clone(), r.clone());
        }
        Ok(())
    }

    async fn delete(&self, filter: &RecordFilter) -> Result<usize> {
        let mut stored = self.records.write().unwrap();
        let before = stored.len();
        stored.retain(|_, r| !filter.matches(&r.metadata));
        Ok(before - stored.len())
    }

    async fn replace_document(&self, document_id: &str, records: &[EmbeddingRecord]) -> Result<()> {
        // Single write guard: readers never observe the gap.
        let mut stored = self.records.write().unwrap();
        stored.retain(|_, r| r.metadata.document_id != document_id);
        for r in records {
            stored.insert(r.chunk_id.clone(), r.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &RecordFilter,
        k: usize,
    ) -> Result<Vec<ScoredMatch>> {
        let stored = self.records.read().unwrap();
        let mut matches: Vec<ScoredMatch> = stored
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| ScoredMatch {
                chunk_id: r.chunk_id.clone(),
                score: cosine_similarity(vector, &r.vector),
                metadata: r.metadata.clone(),
            })
            .collect();
        matches.sort_by(rank_order);
        matches.truncate(k);
        Ok(matches)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<EmbeddingRecord>> {
        let stored = self.records.read().unwrap();
        let mut out: Vec<EmbeddingRecord> = stored
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.metadata
                .document_id
                .cmp(&b.metadata.document_id)
                .then(a.metadata.ordinal.cmp(&b.metadata.ordinal))
        });
        Ok(out)
    }
}
