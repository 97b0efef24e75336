//! Filesystem storage collaborator.
//!
//! Raw uploads live under `[storage].root`, one file per document, named
//! by storage key. The pipeline only reads through [`DocumentSource`];
//! [`FsDocumentSource::put`] is the upload side used by the CLI.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use docchat_core::models::Document;
use docchat_core::repo::DocumentSource;

use crate::config::StorageConfig;

pub struct FsDocumentSource {
    root: PathBuf,
    max_bytes: u64,
}

impl FsDocumentSource {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            max_bytes: config.max_document_bytes,
        }
    }

    /// Store `bytes` under a fresh key that keeps the file's extension.
    pub async fn put(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        if bytes.len() as u64 > self.max_bytes {
            bail!(
                "{} is {} bytes, limit is {}",
                filename,
                bytes.len(),
                self.max_bytes
            );
        }
        let key = match Path::new(filename).extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext.to_ascii_lowercase()),
            None => Uuid::new_v4().to_string(),
        };
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating storage root {}", self.root.display()))?;
        tokio::fs::write(self.root.join(&key), bytes).await?;
        Ok(key)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid storage key: {}", key);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn fetch(&self, document: &Document) -> Result<Vec<u8>> {
        let path = self.path_for(&document.storage_key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if meta.len() > self.max_bytes {
            bail!(
                "document is {} bytes, limit is {}",
                meta.len(),
                self.max_bytes
            );
        }
        Ok(tokio::fs::read(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(root: &Path, max: u64) -> FsDocumentSource {
        FsDocumentSource::new(&StorageConfig {
            root: root.to_path_buf(),
            max_document_bytes: max,
        })
    }

    #[tokio::test]
    async fn put_then_fetch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = source(tmp.path(), 1024);
        let key = src.put("Notes.MD", b"# hi").await.unwrap();
        assert!(key.ends_with(".md"));

        let doc = Document::new("Notes.MD", key, "");
        assert_eq!(src.fetch(&doc).await.unwrap(), b"# hi");
    }

    #[tokio::test]
    async fn oversized_documents_are_refused() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = source(tmp.path(), 4);
        assert!(src.put("a.txt", b"too long").await.is_err());

        std::fs::write(tmp.path().join("big.txt"), b"too long").unwrap();
        let doc = Document::new("big.txt", "big.txt", "text/plain");
        assert!(src.fetch(&doc).await.is_err());
    }

    #[tokio::test]
    async fn keys_cannot_escape_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = source(tmp.path(), 1024);
        let doc = Document::new("x.txt", "../x.txt", "text/plain");
        assert!(src.fetch(&doc).await.is_err());
    }
}
