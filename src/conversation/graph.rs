//! Per-turn conversation state machine.
//!
//! ```text
//! Start ─▶ RetrieveDecision ─┬─▶ Retrieve ─┬─▶ ComposePrompt ─▶ Generate ─▶ Persist ─▶ End
//!                            └─────────────┘                      │
//!                                                                 └─▶ Failed
//! ```
//!
//! [`ConversationGraph::converse`] takes the thread guard, appends the
//! user message and spawns the rest of the turn. The caller gets a
//! [`Turn`]: a stream of [`TurnEvent`]s ending in exactly one `End` or
//! `Error`. Retrieval failures degrade to an empty context. Generation
//! failures and cancellation end the turn without persisting any
//! assistant content; the user message stays.
//!
//! Cancel with [`Turn::cancel`], a token from [`Turn::cancel_token`], or
//! by dropping the [`Turn`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::anyhow;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docchat_core::llm::ModelProvider;
use docchat_core::models::{Message, Role, ScoredChunk, Thread};
use docchat_core::prompt::{compose_prompt, Prompt, DEFAULT_SYSTEM_PROMPT};
use docchat_core::repo::ThreadRepo;
use docchat_core::retrieve::Retriever;
use docchat_core::{RagError, RagResult};

use super::memory::{ConversationMemory, ThreadGuard};
use crate::config::{BusyPolicy, Config};

const EVENT_BUFFER: usize = 64;
const TITLE_CHARS: usize = 60;

/// Tunables for a turn.
#[derive(Debug, Clone)]
pub struct GraphSettings {
    pub top_k: usize,
    pub include_sources: bool,
    pub history_budget: usize,
    pub context_budget: usize,
    pub system_prompt: String,
    pub busy_policy: BusyPolicy,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            include_sources: true,
            history_budget: 8000,
            context_budget: 6000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            busy_policy: BusyPolicy::Queue,
        }
    }
}

impl GraphSettings {
    pub fn from_config(config: &Config) -> Self {
        let conversation = &config.conversation;
        Self {
            top_k: config.retrieval.top_k,
            include_sources: config.retrieval.include_sources,
            history_budget: conversation.history_budget,
            context_budget: conversation.context_budget,
            system_prompt: conversation
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            busy_policy: conversation.busy_policy,
        }
    }
}

/// A retrieved chunk as reported to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub document_id: String,
    pub filename: String,
    pub ordinal: u32,
    pub score: f32,
}

impl From<&ScoredChunk> for SourceRef {
    fn from(sc: &ScoredChunk) -> Self {
        Self {
            document_id: sc.chunk.document_id.clone(),
            filename: sc.filename.clone(),
            ordinal: sc.chunk.ordinal,
            score: sc.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnFailure {
    pub code: String,
    pub message: String,
}

impl From<&RagError> for TurnFailure {
    fn from(e: &RagError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Output of a turn, in order: optional `Sources`, any number of `Text`,
/// then one `End` or `Error`.
///
/// Serializes as `{"type": "...", "content": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum TurnEvent {
    Sources(Vec<SourceRef>),
    Text(String),
    /// The persisted assistant message.
    End(Message),
    Error(TurnFailure),
}

/// Handle to an in-flight turn.
pub struct Turn {
    thread_id: String,
    user_message: Message,
    events: ReceiverStream<TurnEvent>,
    cancel: CancellationToken,
}

impl Turn {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// The user message appended when the turn started.
    pub fn user_message(&self) -> &Message {
        &self.user_message
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for Turn {
    type Item = TurnEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TurnEvent>> {
        self.get_mut().events.poll_next_unpin(cx)
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// States of one turn. Each step consumes a state and yields the next.
enum TurnState {
    Start,
    RetrieveDecision { thread: Thread },
    Retrieve { thread: Thread },
    ComposePrompt { thread: Thread, retrieved: Vec<ScoredChunk> },
    Generate { prompt: Prompt },
    Persist { content: String },
    End(Message),
    Failed(RagError),
}

impl TurnState {
    fn name(&self) -> &'static str {
        match self {
            TurnState::Start => "start",
            TurnState::RetrieveDecision { .. } => "retrieve_decision",
            TurnState::Retrieve { .. } => "retrieve",
            TurnState::ComposePrompt { .. } => "compose_prompt",
            TurnState::Generate { .. } => "generate",
            TurnState::Persist { .. } => "persist",
            TurnState::End(_) => "end",
            TurnState::Failed(_) => "failed",
        }
    }
}

/// Everything a running turn owns.
struct TurnCtx {
    thread_id: String,
    /// Released before the terminal event so the next turn can start as
    /// soon as the caller sees `End` or `Error`.
    guard: Option<ThreadGuard>,
    query: String,
    events: mpsc::Sender<TurnEvent>,
    cancel: CancellationToken,
}

impl TurnCtx {
    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Deliver an event unless the turn is cancelled first. Returns
    /// `false` if the event was not delivered.
    async fn emit(&self, event: TurnEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

#[derive(Clone)]
pub struct ConversationGraph {
    threads: Arc<dyn ThreadRepo>,
    memory: Arc<ConversationMemory>,
    retriever: Retriever,
    model: Arc<dyn ModelProvider>,
    settings: GraphSettings,
}

impl ConversationGraph {
    pub fn new(
        threads: Arc<dyn ThreadRepo>,
        retriever: Retriever,
        model: Arc<dyn ModelProvider>,
        settings: GraphSettings,
    ) -> Self {
        let memory = Arc::new(ConversationMemory::new(
            threads.clone(),
            settings.busy_policy,
        ));
        Self {
            threads,
            memory,
            retriever,
            model,
            settings,
        }
    }

    /// Start a turn on `thread_id`, creating the thread if it is new.
    ///
    /// Returns once the user message is persisted. Fails with
    /// [`RagError::TurnInProgress`] when the thread is busy and the busy
    /// policy is `reject`.
    pub async fn converse(&self, thread_id: &str, user_message: &str) -> RagResult<Turn> {
        let guard = self.memory.lock(thread_id).await?;

        let title: String = user_message.chars().take(TITLE_CHARS).collect();
        if self.threads.ensure_thread(thread_id, title.trim()).await? {
            info!(thread_id, "thread created");
        }
        let user = self.memory.append(&guard, Role::User, user_message).await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let ctx = TurnCtx {
            thread_id: guard.thread_id().to_string(),
            guard: Some(guard),
            query: user_message.to_string(),
            events: tx,
            cancel: cancel.clone(),
        };

        let graph = self.clone();
        tokio::spawn(async move { graph.drive(ctx).await });

        Ok(Turn {
            thread_id: thread_id.to_string(),
            user_message: user,
            events: ReceiverStream::new(rx),
            cancel,
        })
    }

    async fn drive(self, mut ctx: TurnCtx) {
        let mut state = TurnState::Start;
        loop {
            state = match state {
                TurnState::End(message) => {
                    drop(ctx.guard.take());
                    info!(thread_id = ctx.thread_id(), ordinal = message.ordinal, "turn completed");
                    let _ = ctx.events.send(TurnEvent::End(message)).await;
                    return;
                }
                TurnState::Failed(e) => {
                    drop(ctx.guard.take());
                    let event = TurnEvent::Error(TurnFailure::from(&e));
                    match &e {
                        RagError::Cancelled => {
                            info!(thread_id = ctx.thread_id(), "turn cancelled");
                            let _ = ctx.events.try_send(event);
                        }
                        _ => {
                            error!(thread_id = ctx.thread_id(), code = e.code(), error = %e, "turn failed");
                            ctx.emit(event).await;
                        }
                    }
                    return;
                }
                // Past generation the turn always persists.
                s @ TurnState::Persist { .. } => self.step(s, &ctx).await,
                _ if ctx.cancel.is_cancelled() => TurnState::Failed(RagError::Cancelled),
                s => {
                    debug!(thread_id = ctx.thread_id(), state = s.name(), "turn step");
                    self.step(s, &ctx).await
                }
            };
        }
    }

    async fn step(&self, state: TurnState, ctx: &TurnCtx) -> TurnState {
        match state {
            TurnState::Start => match self.threads.get_thread(ctx.thread_id()).await {
                Ok(Some(thread)) => TurnState::RetrieveDecision { thread },
                Ok(None) => {
                    TurnState::Failed(RagError::NotFound(format!("thread {}", ctx.thread_id())))
                }
                Err(e) => TurnState::Failed(e.into()),
            },

            TurnState::RetrieveDecision { thread } => {
                if thread.document_ids.is_empty() {
                    TurnState::ComposePrompt {
                        thread,
                        retrieved: Vec::new(),
                    }
                } else {
                    TurnState::Retrieve { thread }
                }
            }

            TurnState::Retrieve { thread } => {
                let retrieved = match self
                    .retriever
                    .retrieve(&ctx.query, &thread.document_ids, self.settings.top_k)
                    .await
                {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!(thread_id = ctx.thread_id(), error = %e, "retrieval failed, continuing without context");
                        Vec::new()
                    }
                };
                TurnState::ComposePrompt { thread, retrieved }
            }

            TurnState::ComposePrompt { thread, retrieved } => {
                let history = self
                    .memory
                    .context_for(&thread, self.settings.history_budget);
                let prompt = compose_prompt(
                    &self.settings.system_prompt,
                    &history,
                    &retrieved,
                    self.settings.context_budget,
                );
                if self.settings.include_sources {
                    let sources = prompt.context.iter().map(SourceRef::from).collect();
                    if !ctx.emit(TurnEvent::Sources(sources)).await {
                        return TurnState::Failed(RagError::Cancelled);
                    }
                }
                TurnState::Generate { prompt }
            }

            TurnState::Generate { prompt } => self.generate(&prompt, ctx).await,

            TurnState::Persist { content } => {
                let Some(guard) = ctx.guard.as_ref() else {
                    return TurnState::Failed(RagError::Store(anyhow!("thread guard released before persist")));
                };
                match self.memory.append(guard, Role::Assistant, &content).await {
                    Ok(message) => TurnState::End(message),
                    Err(e) => TurnState::Failed(e),
                }
            }

            terminal @ (TurnState::End(_) | TurnState::Failed(_)) => terminal,
        }
    }

    /// Stream fragments to the caller while accumulating the reply.
    async fn generate(&self, prompt: &Prompt, ctx: &TurnCtx) -> TurnState {
        let started = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return TurnState::Failed(RagError::Cancelled),
            started = self.model.generate(prompt) => started,
        };
        let mut fragments = match started {
            Ok(stream) => stream,
            Err(e) => return TurnState::Failed(RagError::Generation(format!("{:#}", e))),
        };

        let mut content = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return TurnState::Failed(RagError::Cancelled),
                _ = ctx.events.closed() => return TurnState::Failed(RagError::Cancelled),
                next = fragments.next() => next,
            };
            match next {
                Some(Ok(fragment)) if fragment.is_empty() => {}
                Some(Ok(fragment)) => {
                    content.push_str(&fragment);
                    if !ctx.emit(TurnEvent::Text(fragment)).await {
                        return TurnState::Failed(RagError::Cancelled);
                    }
                }
                Some(Err(e)) => {
                    return TurnState::Failed(RagError::Generation(format!("{:#}", e)))
                }
                None => break,
            }
        }

        if content.trim().is_empty() {
            return TurnState::Failed(RagError::Generation(
                "model returned an empty response".to_string(),
            ));
        }
        TurnState::Persist { content }
    }
}
