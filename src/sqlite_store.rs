//! SQLite-backed collaborators.
//!
//! [`SqliteStore`] implements the persistence traits ([`DocumentRepo`],
//! [`ThreadRepo`]) and the vector index ([`VectorStore`]) over one pool.
//! Vectors are stored as little-endian `f32` BLOBs and scored with
//! brute-force cosine similarity after the document filter is applied in
//! SQL, so out-of-scope rows are never loaded.

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use docchat_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docchat_core::models::{
    Chunk, Document, EmbeddingRecord, IngestStatus, Message, RecordMetadata, Role, Thread,
};
use docchat_core::repo::{DocumentRepo, ThreadRepo};
use docchat_core::store::{rank_order, RecordFilter, ScoredMatch, VectorStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn thread_ids_for(&self, document_id: &str) -> Result<BTreeSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT thread_id FROM thread_documents WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }
}

fn ts(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn document_from_row(row: &SqliteRow, thread_ids: BTreeSet<String>) -> Result<Document> {
    let status: String = row.get("status");
    let text_len: Option<i64> = row.get("text_len");
    Ok(Document {
        id: row.get("id"),
        filename: row.get("filename"),
        storage_key: row.get("storage_key"),
        content_type: row.get("content_type"),
        thread_ids,
        text_len: text_len.map(|n| n as usize),
        status: status.parse()?,
        error: row.get("error"),
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    })
}

/// Append a `WHERE` clause for `filter`. Returns `false` when the filter
/// cannot match anything, in which case the query should not be run.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RecordFilter) -> bool {
    match filter {
        RecordFilter::Document(id) => {
            qb.push(" WHERE document_id = ").push_bind(id.clone());
            true
        }
        RecordFilter::AnyDocument(ids) => {
            if ids.is_empty() {
                return false;
            }
            qb.push(" WHERE document_id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.clone());
            }
            sep.push_unseparated(")");
            true
        }
    }
}

async fn insert_record(
    conn: &mut sqlx::SqliteConnection,
    record: &EmbeddingRecord,
) -> Result<()> {
    let metadata_json = serde_json::to_string(&record.metadata)?;
    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, document_id, ordinal, dims, vector, metadata_json)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            ordinal = excluded.ordinal,
            dims = excluded.dims,
            vector = excluded.vector,
            metadata_json = excluded.metadata_json
        "#,
    )
    .bind(&record.chunk_id)
    .bind(&record.metadata.document_id)
    .bind(record.metadata.ordinal as i64)
    .bind(record.vector.len() as i64)
    .bind(vec_to_blob(&record.vector))
    .bind(metadata_json)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl DocumentRepo for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, storage_key, content_type, text_len,
                                   status, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.storage_key)
        .bind(&doc.content_type)
        .bind(doc.text_len.map(|n| n as i64))
        .bind(doc.status.as_str())
        .bind(&doc.error)
        .bind(ts(&doc.created_at))
        .bind(ts(&doc.updated_at))
        .execute(&mut *tx)
        .await?;

        for thread_id in &doc.thread_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO thread_documents (thread_id, document_id, attached_at) VALUES (?, ?, ?)",
            )
            .bind(thread_id)
            .bind(&doc.id)
            .bind(ts(&doc.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, filename, storage_key, content_type, text_len, status, error, created_at, updated_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let thread_ids = self.thread_ids_for(id).await?;
                Ok(Some(document_from_row(&row, thread_ids)?))
            }
            None => Ok(None),
        }
    }

    async fn try_begin_ingest(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'processing', error = NULL, updated_at = ? \
             WHERE id = ? AND (status != 'processing' OR updated_at < ?)",
        )
        .bind(ts(&Utc::now()))
        .bind(id)
        .bind(ts(&stale_before))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(anyhow!("document not found: {}", id));
        }
        Ok(false)
    }

    async fn set_status(&self, id: &str, status: IngestStatus, error: Option<&str>) -> Result<()> {
        let error = match status {
            IngestStatus::Failed => error,
            _ => None,
        };
        let result =
            sqlx::query("UPDATE documents SET status = ?, error = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(ts(&Utc::now()))
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("document not found: {}", id));
        }
        Ok(())
    }

    async fn record_text_len(&self, id: &str, text_len: usize) -> Result<()> {
        sqlx::query("UPDATE documents SET text_len = ?, updated_at = ? WHERE id = ?")
            .bind(text_len as i64)
            .bind(ts(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, ordinal, start_offset, end_offset, text, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.ordinal as i64)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, ordinal, start_offset, end_offset, text, hash FROM chunks WHERE document_id = ? ORDER BY ordinal ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Chunk {
                id: row.get("id"),
                document_id: row.get("document_id"),
                ordinal: row.get::<i64, _>("ordinal") as u32,
                start: row.get::<i64, _>("start_offset") as usize,
                end: row.get::<i64, _>("end_offset") as usize,
                text: row.get("text"),
                hash: row.get("hash"),
            })
            .collect())
    }
}

#[async_trait]
impl ThreadRepo for SqliteStore {
    async fn ensure_thread(&self, id: &str, title: &str) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO threads (id, title, created_at) VALUES (?, ?, ?)")
                .bind(id)
                .bind(title)
                .bind(ts(&Utc::now()))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        let row = sqlx::query("SELECT id, title, created_at FROM threads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let document_ids: Vec<String> =
            sqlx::query_scalar("SELECT document_id FROM thread_documents WHERE thread_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let message_rows = sqlx::query(
            "SELECT id, thread_id, ordinal, role, content, created_at FROM messages WHERE thread_id = ? ORDER BY ordinal ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(message_rows.len());
        for r in &message_rows {
            let role: String = r.get("role");
            messages.push(Message {
                id: r.get("id"),
                thread_id: r.get("thread_id"),
                role: role.parse()?,
                ordinal: r.get::<i64, _>("ordinal") as u32,
                content: r.get("content"),
                created_at: from_ts(r.get("created_at")),
            });
        }

        Ok(Some(Thread {
            id: row.get("id"),
            title: row.get("title"),
            document_ids: document_ids.into_iter().collect(),
            messages,
            created_at: from_ts(row.get("created_at")),
        }))
    }

    async fn attach_document(&self, thread_id: &str, document_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO thread_documents (thread_id, document_id, attached_at) VALUES (?, ?, ?)",
        )
        .bind(thread_id)
        .bind(document_id)
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_message(&self, thread_id: &str, role: Role, content: &str) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        // Single statement, so the ordinal read and the insert are atomic.
        let ordinal: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages (id, thread_id, ordinal, role, content, created_at)
            SELECT ?, ?, COALESCE(MAX(ordinal) + 1, 0), ?, ?, ?
            FROM messages WHERE thread_id = ?
            RETURNING ordinal
            "#,
        )
        .bind(&id)
        .bind(thread_id)
        .bind(role.as_str())
        .bind(content)
        .bind(ts(&created_at))
        .bind(thread_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Message {
            id,
            thread_id: thread_id.to_string(),
            role,
            ordinal: ordinal as u32,
            content: content.to_string(),
            created_at,
        })
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, records: &[EmbeddingRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            insert_record(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, filter: &RecordFilter) -> Result<usize> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM embeddings");
        if !push_filter(&mut qb, filter) {
            return Ok(0);
        }
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn replace_document(&self, document_id: &str, records: &[EmbeddingRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for record in records {
            insert_record(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &RecordFilter,
        k: usize,
    ) -> Result<Vec<ScoredMatch>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT chunk_id, vector, metadata_json FROM embeddings");
        if !push_filter(&mut qb, filter) {
            return Ok(Vec::new());
        }
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("vector");
            let metadata_json: String = row.get("metadata_json");
            matches.push(ScoredMatch {
                chunk_id: row.get("chunk_id"),
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
                metadata: serde_json::from_str(&metadata_json)?,
            });
        }

        matches.sort_by(rank_order);
        matches.truncate(k);
        Ok(matches)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<EmbeddingRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT chunk_id, vector, metadata_json FROM embeddings");
        if !push_filter(&mut qb, filter) {
            return Ok(Vec::new());
        }
        qb.push(" ORDER BY document_id ASC, ordinal ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("vector");
            let metadata_json: String = row.get("metadata_json");
            let metadata: RecordMetadata = serde_json::from_str(&metadata_json)?;
            records.push(EmbeddingRecord {
                chunk_id: row.get("chunk_id"),
                vector: blob_to_vec(&blob),
                metadata,
            });
        }
        Ok(records)
    }
}
