//! # docchat
//!
//! Retrieval-augmented chat over a personal document corpus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────┐
//! │ Storage  │──▶│  Ingestor   │──▶│  SQLite   │
//! │ (files)  │   │ chunk+embed │   │ rows+vecs │
//! └──────────┘   └────────────┘   └─────┬─────┘
//!                                       │
//!                 ┌─────────────────────┤
//!                 ▼                     ▼
//!          ┌────────────┐        ┌────────────┐
//!          │ Retriever  │──────▶ │ Conversation│──▶ streamed turn
//!          │ (scoped)   │        │   graph     │
//!          └────────────┘        └────────────┘
//! ```
//!
//! The algorithms (chunking, retrieval, context windows, prompt
//! composition) live in `docchat-core`. This crate supplies the
//! collaborators (SQLite, filesystem, HTTP providers), the pipelines
//! that drive them, the HTTP server and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection and migrations |
//! | [`sqlite_store`] | Relational repository and vector index over SQLite |
//! | [`storage`] | Filesystem storage for uploaded bytes |
//! | [`extract`] | PDF, DOCX and text extraction |
//! | [`embedding`] | OpenAI and Ollama embedding providers |
//! | [`llm`] | Streaming OpenAI and Anthropic chat providers |
//! | [`ingest`] | Document processor and embedding indexer |
//! | [`conversation`] | Thread memory and the per-turn state machine |
//! | [`app`] | Wiring for the CLI and server |
//! | [`server`] | HTTP API with SSE streaming |

pub mod app;
pub mod config;
pub mod conversation;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod server;
pub mod sqlite_store;
pub mod storage;
