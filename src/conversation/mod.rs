//! Conversation memory and the per-turn graph.

pub mod graph;
pub mod memory;

pub use graph::{ConversationGraph, GraphSettings, SourceRef, Turn, TurnEvent, TurnFailure};
pub use memory::{ConversationMemory, ThreadGuard};
