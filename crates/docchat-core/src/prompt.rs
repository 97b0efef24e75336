//! Prompt composition.
//!
//! A prompt is the system instructions with the retrieved context folded
//! in, followed by the conversation window. Retrieved chunks arrive best
//! first; they are kept until the next one would push the context past
//! its budget, and everything after that point is dropped.

use serde::Serialize;

use crate::models::{Message, Role, ScoredChunk};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions \
using the user's documents. Base your answer on the retrieved documents when they are \
relevant and say which document you used. If they do not contain the answer, say so and \
answer from general knowledge.";

const NO_CONTEXT: &str = "No relevant documents found for this query.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// Model input for one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub messages: Vec<PromptMessage>,
    /// Retrieved chunks that made it into the prompt.
    pub context: Vec<ScoredChunk>,
}

impl Prompt {
    pub fn system(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }
}

/// Longest prefix of `retrieved` whose chunk text fits `budget` characters.
pub fn fit_context(retrieved: &[ScoredChunk], budget: usize) -> Vec<ScoredChunk> {
    let mut used = 0usize;
    let mut kept = Vec::new();
    for sc in retrieved {
        let units = sc.chunk.text.chars().count();
        if used + units > budget {
            break;
        }
        used += units;
        kept.push(sc.clone());
    }
    kept
}

fn render_context(context: &[ScoredChunk]) -> String {
    if context.is_empty() {
        return NO_CONTEXT.to_string();
    }
    let mut out = String::from("Retrieved documents:\n\n");
    for (i, sc) in context.iter().enumerate() {
        out.push_str(&format!(
            "Document {}: {}\nContent: {}\n\n",
            i + 1,
            sc.filename,
            sc.chunk.text
        ));
    }
    out.truncate(out.trim_end().len());
    out
}

/// Merge system instructions, retrieved context and history into a prompt.
pub fn compose_prompt(
    system: &str,
    history: &[Message],
    retrieved: &[ScoredChunk],
    context_budget: usize,
) -> Prompt {
    let context = fit_context(retrieved, context_budget);
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(PromptMessage {
        role: Role::System,
        content: format!("{}\n\n{}", system.trim_end(), render_context(&context)),
    });
    messages.extend(history.iter().map(|m| PromptMessage {
        role: m.role,
        content: m.content.clone(),
    }));
    Prompt { messages, context }
}
