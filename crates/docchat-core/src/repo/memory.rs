//! In-memory repository for tests and embedding.
//!
//! Documents, chunks and threads live in `HashMap`s behind
//! `std::sync::RwLock`. Attachments are kept on both sides so
//! `Document::thread_ids` and `Thread::document_ids` stay in sync.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Chunk, Document, IngestStatus, Message, Role, Thread};

use super::{DocumentRepo, ThreadRepo};

pub struct InMemoryRepo {
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<HashMap<String, Vec<Chunk>>>,
    threads: RwLock<HashMap<String, Thread>>,
}

impl InMemoryRepo {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            threads: RwLock::new(HashMap::new()),
        }
    }

    fn update_doc(&self, id: &str, f: impl FnOnce(&mut Document)) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| anyhow!("document not found: {}", id))?;
        f(doc);
        doc.updated_at = Utc::now();
        Ok(())
    }
}

impl Default for InMemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentRepo for InMemoryRepo {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        self.docs
            .write()
            .unwrap()
            .insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.docs.read().unwrap().get(id).cloned())
    }

    async fn try_begin_ingest(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| anyhow!("document not found: {}", id))?;
        if doc.status == IngestStatus::Processing && doc.updated_at >= stale_before {
            return Ok(false);
        }
        doc.status = IngestStatus::Processing;
        doc.error = None;
        doc.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_status(&self, id: &str, status: IngestStatus, error: Option<&str>) -> Result<()> {
        self.update_doc(id, |doc| {
            doc.status = status;
            doc.error = match status {
                IngestStatus::Failed => error.map(str::to_string),
                _ => None,
            };
        })
    }

    async fn record_text_len(&self, id: &str, text_len: usize) -> Result<()> {
        self.update_doc(id, |doc| doc.text_len = Some(text_len))
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut stored = self.chunks.write().unwrap();
        if chunks.is_empty() {
            stored.remove(document_id);
        } else {
            stored.insert(document_id.to_string(), chunks.to_vec());
        }
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let mut chunks = self
            .chunks
            .read()
            .unwrap()
            .get(document_id)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.ordinal);
        Ok(chunks)
    }
}

#[async_trait]
impl ThreadRepo for InMemoryRepo {
    async fn ensure_thread(&self, id: &str, title: &str) -> Result<bool> {
        let mut threads = self.threads.write().unwrap();
        if threads.contains_key(id) {
            return Ok(false);
        }
        threads.insert(
            id.to_string(),
            Thread {
                id: id.to_string(),
                title: title.to_string(),
                document_ids: Default::default(),
                messages: Vec::new(),
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        Ok(self.threads.read().unwrap().get(id).cloned())
    }

    async fn attach_document(&self, thread_id: &str, document_id: &str) -> Result<()> {
        self.update_doc(document_id, |doc| {
            doc.thread_ids.insert(thread_id.to_string());
        })?;
        let mut threads = self.threads.write().unwrap();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| anyhow!("thread not found: {}", thread_id))?;
        thread.document_ids.insert(document_id.to_string());
        Ok(())
    }

    async fn append_message(&self, thread_id: &str, role: Role, content: &str) -> Result<Message> {
        let mut threads = self.threads.write().unwrap();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| anyhow!("thread not found: {}", thread_id))?;
        let message = Message {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            role,
            ordinal: thread.messages.len() as u32,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        thread.messages.push(message.clone());
        Ok(message)
    }
}
