//! Process-wide wiring.
//!
//! [`App::open`] connects the database, runs migrations, builds the
//! providers named in the config and injects them into one [`Ingestor`]
//! and one [`ConversationGraph`]. The CLI and the HTTP server both start
//! from here.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use docchat_core::embedding::EmbeddingProvider;
use docchat_core::llm::ModelProvider;
use docchat_core::retrieve::Retriever;

use crate::config::Config;
use crate::conversation::{ConversationGraph, GraphSettings};
use crate::db;
use crate::embedding::create_provider;
use crate::ingest::{IngestSettings, Ingestor};
use crate::llm::create_model;
use crate::sqlite_store::SqliteStore;
use crate::storage::FsDocumentSource;

pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub storage: Arc<FsDocumentSource>,
    pub ingestor: Ingestor,
    pub graph: ConversationGraph,
}

impl App {
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let model = create_model(&config.llm)?;
        Self::with_providers(config, embedder, model).await
    }

    /// Like [`App::open`] with the embedding and model providers given.
    pub async fn with_providers(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn ModelProvider>,
    ) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        db::run_migrations(&pool).await?;

        let store = Arc::new(SqliteStore::new(pool));
        let storage = Arc::new(FsDocumentSource::new(&config.storage));
        info!(
            embedding = embedder.model_name(),
            llm = model.model_name(),
            "providers ready"
        );

        let ingestor = Ingestor::new(
            store.clone(),
            store.clone(),
            storage.clone(),
            embedder.clone(),
            store.clone(),
            IngestSettings::from_config(config),
        );
        let graph = ConversationGraph::new(
            store.clone(),
            Retriever::new(embedder, store.clone()),
            model,
            GraphSettings::from_config(config),
        );

        Ok(Self {
            config: Arc::new(config.clone()),
            store,
            storage,
            ingestor,
            graph,
        })
    }
}
