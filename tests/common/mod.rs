//! Shared fakes for the pipeline tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use docchat::config::{BusyPolicy, IndexingConfig};
use docchat::conversation::{ConversationGraph, GraphSettings, SourceRef, Turn, TurnEvent, TurnFailure};
use docchat::ingest::{IngestSettings, Ingestor};
use docchat_core::chunk::ChunkParams;
use docchat_core::embedding::EmbeddingProvider;
use docchat_core::llm::{ModelProvider, TokenStream};
use docchat_core::models::{Document, Message};
use docchat_core::prompt::Prompt;
use docchat_core::repo::memory::InMemoryRepo;
use docchat_core::repo::DocumentSource;
use docchat_core::retrieve::Retriever;
use docchat_core::store::memory::InMemoryVectorStore;

pub const VOCAB: [&str; 6] = ["apples", "pears", "plums", "ripen", "prunes", "weather"];

/// Three paragraphs that chunk into exactly three chunks with
/// [`scenario_chunking`]; only the second mentions pears.
pub const FRUIT: &str = "Apples grow on tall trees and are picked every autumn day.\n\n\
Pears ripen slowly indoors after harvest in cool rooms.\n\n\
Plums are small stone fruits that dry into prunes well.";

pub fn scenario_chunking() -> ChunkParams {
    ChunkParams {
        chunk_size: 80,
        chunk_overlap: 8,
    }
}

/// Bag-of-keywords vectors over [`VOCAB`], plus a constant component so
/// no vector is zero.
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

pub fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let mut v: Vec<f32> = VOCAB
        .iter()
        .map(|k| words.iter().filter(|w| *w == k).count() as f32)
        .collect();
    v.push(0.1);
    v
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keywords"
    }
    fn dims(&self) -> usize {
        VOCAB.len() + 1
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("embedding service unavailable");
        }
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }
}

/// Replays fixed fragments, optionally pausing before each, and records
/// every prompt it receives.
pub struct ScriptedModel {
    fragments: Vec<String>,
    delay: Duration,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedModel {
    pub fn new(fragments: &[&str]) -> Self {
        Self::with_delay(fragments, Duration::ZERO)
    }

    pub fn with_delay(fragments: &[&str], delay: Duration) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            delay,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn last_prompt(&self) -> Prompt {
        self.prompts.lock().unwrap().last().cloned().unwrap()
    }

    fn script(&self) -> TokenStream {
        let delay = self.delay;
        stream::iter(self.fragments.clone())
            .then(move |f| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, anyhow::Error>(f)
            })
            .boxed()
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }
    async fn generate(&self, prompt: &Prompt) -> Result<TokenStream> {
        self.prompts.lock().unwrap().push(prompt.clone());
        Ok(self.script())
    }
}

/// Emits one fragment, then fails.
pub struct BrokenModel;

#[async_trait]
impl ModelProvider for BrokenModel {
    fn model_name(&self) -> &str {
        "broken"
    }
    async fn generate(&self, _prompt: &Prompt) -> Result<TokenStream> {
        Ok(stream::iter(vec![
            Ok("partial ".to_string()),
            Err(anyhow!("upstream reset")),
        ])
        .boxed())
    }
}

/// The first call emits one fragment and then never finishes; later
/// calls behave like the wrapped [`ScriptedModel`].
pub struct StallOnceModel {
    calls: AtomicUsize,
    pub then: ScriptedModel,
}

impl StallOnceModel {
    pub fn new(then: ScriptedModel) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            then,
        }
    }
}

#[async_trait]
impl ModelProvider for StallOnceModel {
    fn model_name(&self) -> &str {
        "stall-once"
    }
    async fn generate(&self, prompt: &Prompt) -> Result<TokenStream> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(stream::iter(vec![Ok::<_, anyhow::Error>("partial ".to_string())])
                .chain(stream::pending())
                .boxed());
        }
        self.then.generate(prompt).await
    }
}

/// Storage collaborator backed by a map of storage key to bytes.
#[derive(Default)]
pub struct MemorySource(Mutex<HashMap<String, Vec<u8>>>);

impl MemorySource {
    pub fn put(&self, key: &str, bytes: &[u8]) {
        self.0.lock().unwrap().insert(key.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn fetch(&self, document: &Document) -> Result<Vec<u8>> {
        self.0
            .lock()
            .unwrap()
            .get(&document.storage_key)
            .cloned()
            .ok_or_else(|| anyhow!("no blob for {}", document.storage_key))
    }
}

/// In-memory collaborators wired into an ingestor and a graph.
pub struct Harness {
    pub repo: Arc<InMemoryRepo>,
    pub index: Arc<InMemoryVectorStore>,
    pub source: Arc<MemorySource>,
    pub embedder: Arc<KeywordEmbedder>,
    pub ingestor: Ingestor,
    pub graph: ConversationGraph,
}

impl Harness {
    pub fn new(model: Arc<dyn ModelProvider>) -> Self {
        Self::with_policy(model, BusyPolicy::Queue)
    }

    pub fn with_policy(model: Arc<dyn ModelProvider>, busy_policy: BusyPolicy) -> Self {
        let repo = Arc::new(InMemoryRepo::new());
        let index = Arc::new(InMemoryVectorStore::new());
        let source = Arc::new(MemorySource::default());
        let embedder = Arc::new(KeywordEmbedder::new());

        let ingestor = Ingestor::new(
            repo.clone(),
            repo.clone(),
            source.clone(),
            embedder.clone(),
            index.clone(),
            IngestSettings {
                chunking: scenario_chunking(),
                indexing: IndexingConfig {
                    batch_size: 2,
                    max_attempts: 3,
                    backoff_base_ms: 1,
                    backoff_max_ms: 5,
                    max_concurrent_batches: 2,
                    stale_after_secs: 1800,
                },
                max_documents_per_thread: 3,
            },
        );
        let graph = ConversationGraph::new(
            repo.clone(),
            Retriever::new(embedder.clone(), index.clone()),
            model,
            GraphSettings {
                top_k: 3,
                busy_policy,
                ..GraphSettings::default()
            },
        );

        Self {
            repo,
            index,
            source,
            embedder,
            ingestor,
            graph,
        }
    }

    /// Store `text` and register it as a plain-text document.
    pub async fn upload(&self, filename: &str, text: &str) -> Document {
        self.source.put(filename, text.as_bytes());
        self.ingestor
            .register(filename, filename, "text/plain")
            .await
            .unwrap()
    }
}

/// Everything a turn emitted.
#[derive(Debug, Default)]
pub struct Collected {
    pub sources: Option<Vec<SourceRef>>,
    pub text: String,
    pub end: Option<Message>,
    pub error: Option<TurnFailure>,
}

pub async fn collect(mut turn: Turn) -> Collected {
    let mut out = Collected::default();
    let drain = async {
        while let Some(event) = turn.next().await {
            match event {
                TurnEvent::Sources(s) => out.sources = Some(s),
                TurnEvent::Text(t) => out.text.push_str(&t),
                TurnEvent::End(m) => out.end = Some(m),
                TurnEvent::Error(f) => out.error = Some(f),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), drain)
        .await
        .expect("turn did not finish");
    out
}
