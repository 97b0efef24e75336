//! Core data models shared by the ingestion and conversation pipelines.
//!
//! Documents and their chunks flow from the storage collaborator through
//! the processor and indexer; threads and messages flow through the
//! conversation graph. Retrieval results are transient and never persisted.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic chunk ids (UUIDv5 over `document_id:ordinal`).
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6d1c_5a0e_9b43_4c7e_a2f1_0c8d_3e5b_7a91);

/// Ingestion lifecycle of a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Processing => "processing",
            IngestStatus::Indexed => "indexed",
            IngestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IngestStatus::Pending),
            "processing" => Ok(IngestStatus::Processing),
            "indexed" => Ok(IngestStatus::Indexed),
            "failed" => Ok(IngestStatus::Failed),
            other => anyhow::bail!("unknown ingest status: {}", other),
        }
    }
}

/// Source formats the document processor can extract text from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Text,
    Markdown,
}

impl DocumentFormat {
    pub const MIME_PDF: &'static str = "application/pdf";
    pub const MIME_DOCX: &'static str =
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
    pub const MIME_TEXT: &'static str = "text/plain";
    pub const MIME_MARKDOWN: &'static str = "text/markdown";

    /// Resolve a format from a MIME type, falling back to the filename
    /// extension when the MIME type is missing or generic.
    pub fn detect(content_type: &str, filename: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            Self::MIME_PDF => return Some(DocumentFormat::Pdf),
            Self::MIME_DOCX => return Some(DocumentFormat::Docx),
            Self::MIME_TEXT => return Some(DocumentFormat::Text),
            Self::MIME_MARKDOWN | "text/x-markdown" => return Some(DocumentFormat::Markdown),
            "" | "application/octet-stream" => {}
            _ => return None,
        }

        let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "txt" => Some(DocumentFormat::Text),
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => Self::MIME_PDF,
            DocumentFormat::Docx => Self::MIME_DOCX,
            DocumentFormat::Text => Self::MIME_TEXT,
            DocumentFormat::Markdown => Self::MIME_MARKDOWN,
        }
    }
}

/// An uploaded document and its ingestion state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Original filename as uploaded.
    pub filename: String,
    /// Key under which the storage collaborator holds the raw bytes.
    pub storage_key: String,
    /// Declared MIME type from the upload.
    pub content_type: String,
    /// Threads this document is attached to.
    pub thread_ids: BTreeSet<String>,
    /// Length of the extracted text in characters, once known.
    pub text_len: Option<usize>,
    pub status: IngestStatus,
    /// Last ingestion error, if the status is `failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Build a freshly uploaded document in `pending` state.
    pub fn new(
        filename: impl Into<String>,
        storage_key: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.into(),
            storage_key: storage_key.into(),
            content_type: content_type.into(),
            thread_ids: BTreeSet::new(),
            text_len: None,
            status: IngestStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn format(&self) -> Option<DocumentFormat> {
        DocumentFormat::detect(&self.content_type, &self.filename)
    }
}

/// A contiguous slice of a document's extracted text.
///
/// Identity is `(document_id, ordinal)`; the `id` is derived from it so
/// that re-ingesting identical text yields identical chunk ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: u32,
    /// Start offset into the extracted text, in characters.
    pub start: usize,
    /// End offset (exclusive) into the extracted text, in characters.
    pub end: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Deterministic chunk id for a document ordinal.
pub fn chunk_id(document_id: &str, ordinal: u32) -> String {
    Uuid::new_v5(
        &CHUNK_NAMESPACE,
        format!("{}:{}", document_id, ordinal).as_bytes(),
    )
    .to_string()
}

/// Metadata stored alongside each vector in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub document_id: String,
    pub thread_ids: BTreeSet<String>,
    pub ordinal: u32,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub hash: String,
    pub filename: String,
}

impl RecordMetadata {
    /// The [`Chunk`] stored under `chunk_id`.
    pub fn into_chunk(self, chunk_id: String) -> Chunk {
        Chunk {
            id: chunk_id,
            document_id: self.document_id,
            ordinal: self.ordinal,
            start: self.start,
            end: self.end,
            text: self.text,
            hash: self.hash,
        }
    }
}

/// One vector in the index, keyed by chunk id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl EmbeddingRecord {
    pub fn for_chunk(document: &Document, chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            vector,
            metadata: RecordMetadata {
                document_id: chunk.document_id.clone(),
                thread_ids: document.thread_ids.clone(),
                ordinal: chunk.ordinal,
                start: chunk.start,
                end: chunk.end,
                text: chunk.text.clone(),
                hash: chunk.hash.clone(),
                filename: document.filename.clone(),
            },
        }
    }

    /// Rebuild the [`Chunk`] this record was produced from.
    pub fn to_chunk(&self) -> Chunk {
        self.metadata.clone().into_chunk(self.chunk_id.clone())
    }
}

/// A chunk paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => anyhow::bail!("unknown message role: {}", other),
        }
    }
}

/// A persisted message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub role: Role,
    /// Thread-local, strictly increasing position starting at 0.
    pub ordinal: u32,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation thread with its full history and attached documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub document_ids: BTreeSet<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}
