//! Persistence and storage collaborators.
//!
//! [`DocumentRepo`] and [`ThreadRepo`] own the relational rows for
//! documents, chunks, threads and messages. [`DocumentSource`] hands out
//! raw document bytes. The pipelines only read and append through these
//! traits; schemas belong to the implementations.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Chunk, Document, IngestStatus, Message, Role, Thread};

/// Document and chunk rows.
#[async_trait]
pub trait DocumentRepo: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Move a document to `processing` unless a live ingestion holds it.
    ///
    /// Returns `false` when another ingestion holds the document. This is
    /// the single-ingestion-in-flight guard, so it must be atomic. A claim
    /// last touched before `stale_before` belongs to an ingestion that
    /// died with its process and is taken over.
    async fn try_begin_ingest(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool>;

    /// Set the status. `error` is stored for `failed` and cleared otherwise.
    async fn set_status(&self, id: &str, status: IngestStatus, error: Option<&str>) -> Result<()>;

    async fn record_text_len(&self, id: &str, text_len: usize) -> Result<()>;

    /// Replace every chunk row of a document.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of a document ordered by ordinal.
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;
}

/// Thread rows, their document attachments, and their messages.
#[async_trait]
pub trait ThreadRepo: Send + Sync {
    /// Create the thread if it does not exist. Returns `true` if created.
    async fn ensure_thread(&self, id: &str, title: &str) -> Result<bool>;

    /// The thread with messages in ordinal order.
    async fn get_thread(&self, id: &str) -> Result<Option<Thread>>;

    /// Attach a document to a thread. Attaching twice is a no-op.
    async fn attach_document(&self, thread_id: &str, document_id: &str) -> Result<()>;

    /// Append a message with the next thread-local ordinal.
    async fn append_message(&self, thread_id: &str, role: Role, content: &str) -> Result<Message>;
}

/// Storage collaborator holding raw upload bytes.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, document: &Document) -> Result<Vec<u8>>;
}
