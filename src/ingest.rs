//! Document ingestion pipeline.
//!
//! An uploaded document moves through two stages:
//!
//! ```text
//! fetch bytes ─▶ extract text ─▶ chunk      (extract_and_chunk)
//!                                  │
//!                                  ▼
//!            embed batches ─▶ replace index records ─▶ replace chunk rows   (index)
//! ```
//!
//! [`Ingestor::ingest`] runs both on a spawned task under the
//! single-ingestion guard and records the outcome as the document's
//! status: `processing` on start, `indexed` on success, `failed` with the
//! error message otherwise. A `processing` claim older than
//! `stale_after_secs` is taken over by the next ingestion.
//!
//! # Indexing protocol
//!
//! Every batch is embedded before the index is touched. Batches run
//! concurrently up to `max_concurrent_batches`, and each is retried with
//! exponential backoff (`backoff_base_ms`, doubling per retry, capped at
//! `backoff_max_ms`) up to `max_attempts`. When all batches succeed the
//! document's old records are deleted and the new set written. When any
//! batch exhausts its retries, or any later step fails, the document's
//! records and chunk rows are discarded, so a failed document is never
//! retrievable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, error, info, warn};

use docchat_core::chunk::{chunk_text, ChunkParams};
use docchat_core::embedding::EmbeddingProvider;
use docchat_core::models::{Chunk, Document, EmbeddingRecord, IngestStatus};
use docchat_core::repo::{DocumentRepo, DocumentSource, ThreadRepo};
use docchat_core::store::{RecordFilter, VectorStore};
use docchat_core::{RagError, RagResult};

use crate::config::{Config, IndexingConfig};
use crate::extract::extract_text;

/// Tunables for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub chunking: ChunkParams,
    pub indexing: IndexingConfig,
    pub max_documents_per_thread: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkParams::default(),
            indexing: IndexingConfig::default(),
            max_documents_per_thread: 3,
        }
    }
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.params(),
            indexing: config.indexing.clone(),
            max_documents_per_thread: config.conversation.max_documents_per_thread,
        }
    }
}

/// Document processor and embedding indexer over injected collaborators.
#[derive(Clone)]
pub struct Ingestor {
    documents: Arc<dyn DocumentRepo>,
    threads: Arc<dyn ThreadRepo>,
    source: Arc<dyn DocumentSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorStore>,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(
        documents: Arc<dyn DocumentRepo>,
        threads: Arc<dyn ThreadRepo>,
        source: Arc<dyn DocumentSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorStore>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            documents,
            threads,
            source,
            embedder,
            index,
            settings,
        }
    }

    /// Record an upload-completion notice as a `pending` document.
    pub async fn register(
        &self,
        filename: &str,
        storage_key: &str,
        content_type: &str,
    ) -> RagResult<Document> {
        let document = Document::new(filename, storage_key, content_type);
        self.documents.insert_document(&document).await?;
        info!(document_id = %document.id, filename, "document registered");
        Ok(document)
    }

    pub async fn document(&self, document_id: &str) -> RagResult<Document> {
        self.documents
            .get_document(document_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("document {}", document_id)))
    }

    /// Attach a document to a thread, creating the thread if needed.
    ///
    /// Re-attaching is a no-op. A thread already holding
    /// `max_documents_per_thread` documents refuses new ones.
    pub async fn attach(&self, thread_id: &str, document_id: &str) -> RagResult<()> {
        let document = self.document(document_id).await?;
        self.threads.ensure_thread(thread_id, &document.filename).await?;
        let thread = self
            .threads
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("thread {}", thread_id)))?;

        if thread.document_ids.contains(document_id) {
            return Ok(());
        }
        let limit = self.settings.max_documents_per_thread;
        if thread.document_ids.len() >= limit {
            return Err(RagError::AttachLimit {
                thread_id: thread_id.to_string(),
                limit,
            });
        }
        self.threads.attach_document(thread_id, document_id).await?;
        info!(thread_id, document_id, "document attached");
        Ok(())
    }

    /// Fetch, extract and chunk a document.
    ///
    /// Records the extracted text length. Writes nothing else.
    pub async fn extract_and_chunk(&self, document: &Document) -> RagResult<Vec<Chunk>> {
        let format = document.format().ok_or_else(|| {
            RagError::UnsupportedFormat(format!(
                "{} ({})",
                document.filename, document.content_type
            ))
        })?;

        let bytes = self
            .source
            .fetch(document)
            .await
            .map_err(|e| RagError::Extraction(format!("{:#}", e)))?;

        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, format))
            .await
            .map_err(|e| RagError::Extraction(format!("extractor panicked: {}", e)))?
            .map_err(|e| RagError::Extraction(e.to_string()))?;

        if text.trim().is_empty() {
            return Err(RagError::Extraction("document contains no text".to_string()));
        }

        self.documents
            .record_text_len(&document.id, text.chars().count())
            .await?;

        let chunks = chunk_text(&document.id, &text, &self.settings.chunking);
        debug!(document_id = %document.id, chunks = chunks.len(), "document chunked");
        Ok(chunks)
    }

    /// Embed `chunks` and make them the document's only index records.
    ///
    /// Returns the number of records written. On failure the document's
    /// records and chunk rows are discarded.
    pub async fn index(&self, document: &Document, chunks: &[Chunk]) -> RagResult<usize> {
        let indexing = self.settings.indexing.clone();
        let concurrency = indexing.max_concurrent_batches.max(1);
        let batches: Vec<Vec<String>> = chunks
            .chunks(indexing.batch_size.max(1))
            .map(|batch| batch.iter().map(|c| c.text.clone()).collect())
            .collect();

        let embedder = self.embedder.clone();
        let document_id = document.id.clone();
        let embedded: RagResult<Vec<Vec<Vec<f32>>>> = stream::iter(batches.into_iter().enumerate())
            .map(move |(i, texts)| {
                embed_batch(
                    embedder.clone(),
                    indexing.clone(),
                    document_id.clone(),
                    i,
                    texts,
                )
            })
            .buffered(concurrency)
            .try_collect()
            .await;

        let vectors = match embedded {
            Ok(v) => v,
            Err(e) => {
                self.discard(&document.id).await;
                return Err(e);
            }
        };

        let records: Vec<EmbeddingRecord> = chunks
            .iter()
            .zip(vectors.into_iter().flatten())
            .map(|(chunk, vector)| EmbeddingRecord::for_chunk(document, chunk, vector))
            .collect();

        if let Err(e) = self.index.replace_document(&document.id, &records).await {
            self.discard(&document.id).await;
            return Err(RagError::Index(format!("vector store write: {:#}", e)));
        }
        if let Err(e) = self.documents.replace_chunks(&document.id, chunks).await {
            self.discard(&document.id).await;
            return Err(RagError::Index(format!("chunk rows write: {:#}", e)));
        }

        Ok(records.len())
    }

    /// Drop a document's index records and chunk rows, logging failures.
    async fn discard(&self, document_id: &str) {
        let filter = RecordFilter::Document(document_id.to_string());
        match self.index.delete(&filter).await {
            Ok(removed) => debug!(document_id, removed, "purged index records"),
            Err(e) => warn!(document_id, error = %format!("{:#}", e), "failed to purge index records"),
        }
        if let Err(e) = self.documents.replace_chunks(document_id, &[]).await {
            warn!(document_id, error = %format!("{:#}", e), "failed to clear chunk rows");
        }
    }

    /// Record `err` as the document's failure. The original error is what
    /// callers see, so a failed status write is only logged.
    async fn mark_failed(&self, document_id: &str, err: &RagError) {
        let message = err.to_string();
        if let Err(e) = self
            .documents
            .set_status(document_id, IngestStatus::Failed, Some(&message))
            .await
        {
            error!(document_id, error = %format!("{:#}", e), "failed to record failed status");
        }
    }

    /// Claims touched before this instant are abandoned.
    fn stale_before(&self) -> DateTime<Utc> {
        let window = Duration::from_secs(self.settings.indexing.stale_after_secs);
        chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Run extraction and indexing for one document and record the outcome.
    ///
    /// The work runs on its own task, so dropping the returned future
    /// (a closed connection, Ctrl-C) does not strand the document in
    /// `processing`. Fails with [`RagError::IngestInProgress`] when another
    /// live ingestion of the same document is running.
    pub async fn ingest(&self, document_id: &str) -> RagResult<IngestStatus> {
        let this = self.clone();
        let id = document_id.to_string();
        tokio::spawn(async move { this.run_ingest(&id).await })
            .await
            .map_err(|e| RagError::Index(format!("ingestion task aborted: {}", e)))?
    }

    async fn run_ingest(&self, document_id: &str) -> RagResult<IngestStatus> {
        let document = self.document(document_id).await?;
        if !self
            .documents
            .try_begin_ingest(document_id, self.stale_before())
            .await?
        {
            return Err(RagError::IngestInProgress(document_id.to_string()));
        }
        info!(document_id, filename = %document.filename, "ingestion started");

        let outcome = match self.extract_and_chunk(&document).await {
            Ok(chunks) => self.index(&document, &chunks).await,
            Err(e) => {
                // A failed re-ingest must not leave the previous text searchable.
                self.discard(document_id).await;
                Err(e)
            }
        };

        match outcome {
            Ok(records) => {
                self.documents
                    .set_status(document_id, IngestStatus::Indexed, None)
                    .await?;
                info!(document_id, records, "document indexed");
                Ok(IngestStatus::Indexed)
            }
            Err(e) => {
                error!(document_id, code = e.code(), error = %e, "ingestion failed");
                self.mark_failed(document_id, &e).await;
                Err(e)
            }
        }
    }

    /// Ingest every `pending` or `failed` document attached to a thread.
    ///
    /// Documents already `indexed` or `processing` are reported with their
    /// current status and left alone.
    pub async fn ingest_thread(
        &self,
        thread_id: &str,
    ) -> RagResult<Vec<(String, RagResult<IngestStatus>)>> {
        let thread = self
            .threads
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("thread {}", thread_id)))?;

        let concurrency = self.settings.indexing.max_concurrent_batches.max(1);
        let this = self.clone();
        let results = stream::iter(thread.document_ids)
            .map(move |id| {
                let this = this.clone();
                async move {
                    let result = match this.document(&id).await {
                        Ok(doc) if matches!(doc.status, IngestStatus::Pending | IngestStatus::Failed) => {
                            this.ingest(&id).await
                        }
                        Ok(doc) => Ok(doc.status),
                        Err(e) => Err(e),
                    };
                    (id, result)
                }
            })
            .buffered(concurrency)
            .collect()
            .await;
        Ok(results)
    }

    /// Remove a document's index records and chunk rows and reset it to
    /// `pending`. Returns the number of records removed.
    pub async fn unindex(&self, document_id: &str) -> RagResult<usize> {
        let this = self.clone();
        let id = document_id.to_string();
        tokio::spawn(async move { this.run_unindex(&id).await })
            .await
            .map_err(|e| RagError::Index(format!("unindex task aborted: {}", e)))?
    }

    async fn run_unindex(&self, document_id: &str) -> RagResult<usize> {
        self.document(document_id).await?;
        if !self
            .documents
            .try_begin_ingest(document_id, self.stale_before())
            .await?
        {
            return Err(RagError::IngestInProgress(document_id.to_string()));
        }

        let filter = RecordFilter::Document(document_id.to_string());
        let removed = match self.index.delete(&filter).await {
            Ok(n) => n,
            Err(e) => {
                let err = RagError::Index(format!("vector store delete: {:#}", e));
                self.mark_failed(document_id, &err).await;
                return Err(err);
            }
        };
        if let Err(e) = self.documents.replace_chunks(document_id, &[]).await {
            let err = RagError::Index(format!("chunk rows delete: {:#}", e));
            self.mark_failed(document_id, &err).await;
            return Err(err);
        }
        self.documents
            .set_status(document_id, IngestStatus::Pending, None)
            .await?;
        info!(document_id, removed, "document unindexed");
        Ok(removed)
    }
}

/// Embed one batch, retrying with backoff up to `max_attempts`.
async fn embed_batch(
    embedder: Arc<dyn EmbeddingProvider>,
    indexing: IndexingConfig,
    document_id: String,
    batch: usize,
    texts: Vec<String>,
) -> RagResult<Vec<Vec<f32>>> {
    let max_attempts = indexing.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(backoff(&indexing, attempt)).await;
        }

        let err = match embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
            Ok(vectors) => anyhow!(
                "provider returned {} vectors for {} chunks",
                vectors.len(),
                texts.len()
            ),
            Err(e) => e,
        };
        warn!(document_id = %document_id, batch, attempt, error = %format!("{:#}", err), "embedding batch failed");
        last_err = Some(err);
    }

    Err(RagError::Index(format!(
        "batch {} failed after {} attempts: {:#}",
        batch,
        max_attempts,
        last_err.unwrap_or_else(|| anyhow!("no attempts made"))
    )))
}

/// Delay before `attempt` (2, 3, ...): base, 2*base, 4*base, ... capped.
fn backoff(indexing: &IndexingConfig, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(2).min(20);
    Duration::from_millis(
        indexing
            .backoff_base_ms
            .saturating_mul(factor)
            .min(indexing.backoff_max_ms),
    )
}
