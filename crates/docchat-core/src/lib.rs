//! # docchat core
//!
//! Shared logic for docchat: data models, the error taxonomy, chunking,
//! collaborator traits (embedding, vector store, model, persistence,
//! storage), scoped retrieval, context-window trimming and prompt
//! composition.
//!
//! This crate contains no tokio runtime, sqlx, HTTP or filesystem I/O.
//! In-memory collaborators are provided for tests and embedding.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod memory;
pub mod models;
pub mod prompt;
pub mod repo;
pub mod retrieve;
pub mod store;

pub use error::{RagError, RagResult};
