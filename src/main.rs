//! # docchat CLI
//!
//! Chat with your documents: register uploads, index them, and ask
//! questions answered from the documents attached to a thread.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the database and storage directory |
//! | `docchat add <path> --thread <id>` | Store a file, register it, attach it to a thread |
//! | `docchat ingest <document-id>` | Extract, chunk and index a document |
//! | `docchat ingest-thread <thread-id>` | Ingest a thread's pending and failed documents |
//! | `docchat status <document-id>` | Show a document's ingestion status |
//! | `docchat unindex <document-id>` | Drop a document from the index |
//! | `docchat ask <thread-id> "<message>"` | Run one turn and stream the answer |
//! | `docchat history <thread-id>` | Print a thread's messages |
//! | `docchat serve` | Start the HTTP server |
//!
//! Log verbosity comes from `[logging].level`; `RUST_LOG` overrides it.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use docchat::app::App;
use docchat::config::{self, Config};
use docchat::conversation::TurnEvent;
use docchat::db;
use docchat::server;
use docchat_core::models::DocumentFormat;
use docchat_core::repo::ThreadRepo;

#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Retrieval-augmented chat over your own documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and storage directory.
    ///
    /// Idempotent: running it again is safe.
    Init,

    /// Store a file and register it as a pending document.
    Add {
        /// File to upload.
        path: PathBuf,

        /// Thread to attach the document to (created if missing).
        #[arg(long)]
        thread: Option<String>,
    },

    /// Extract, chunk and index one document.
    Ingest {
        /// Document UUID.
        document_id: String,
    },

    /// Ingest every pending or failed document attached to a thread.
    IngestThread { thread_id: String },

    /// Show a document's ingestion status.
    Status { document_id: String },

    /// Remove a document's index records and reset it to pending.
    Unindex { document_id: String },

    /// Ask a question on a thread and stream the answer.
    Ask {
        thread_id: String,
        message: String,
    },

    /// Print a thread's messages in order.
    History { thread_id: String },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            db::run_migrations(&pool).await?;
            std::fs::create_dir_all(&cfg.storage.root).with_context(|| {
                format!("creating storage root {}", cfg.storage.root.display())
            })?;
            println!("Database initialized successfully.");
        }
        Commands::Add { path, thread } => {
            let app = App::open(&cfg).await?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();
            let content_type = DocumentFormat::detect("", &filename)
                .map(|f| f.mime())
                .unwrap_or("application/octet-stream");

            let key = app.storage.put(&filename, &bytes).await?;
            let doc = app
                .ingestor
                .register(&filename, &key, content_type)
                .await?;
            if let Some(thread_id) = thread {
                app.ingestor.attach(&thread_id, &doc.id).await?;
                println!("Attached to thread {}", thread_id);
            }
            println!("{}", doc.id);
        }
        Commands::Ingest { document_id } => {
            let app = App::open(&cfg).await?;
            let status = app.ingestor.ingest(&document_id).await?;
            println!("{} {}", document_id, status);
        }
        Commands::IngestThread { thread_id } => {
            let app = App::open(&cfg).await?;
            let results = app.ingestor.ingest_thread(&thread_id).await?;
            let mut failed = 0;
            for (document_id, result) in results {
                match result {
                    Ok(status) => println!("{} {}", document_id, status),
                    Err(e) => {
                        failed += 1;
                        println!("{} failed: {}", document_id, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} document(s) failed to ingest", failed);
            }
        }
        Commands::Status { document_id } => {
            let app = App::open(&cfg).await?;
            let doc = app.ingestor.document(&document_id).await?;
            println!("id:       {}", doc.id);
            println!("filename: {}", doc.filename);
            println!("status:   {}", doc.status);
            if let Some(len) = doc.text_len {
                println!("text_len: {}", len);
            }
            if !doc.thread_ids.is_empty() {
                let threads: Vec<&str> = doc.thread_ids.iter().map(String::as_str).collect();
                println!("threads:  {}", threads.join(", "));
            }
            if let Some(err) = doc.error {
                println!("error:    {}", err);
            }
        }
        Commands::Unindex { document_id } => {
            let app = App::open(&cfg).await?;
            let removed = app.ingestor.unindex(&document_id).await?;
            println!("Removed {} index records from {}", removed, document_id);
        }
        Commands::Ask { thread_id, message } => {
            let app = App::open(&cfg).await?;
            ask(&app, &thread_id, &message).await?;
        }
        Commands::History { thread_id } => {
            let app = App::open(&cfg).await?;
            let Some(thread) = app.store.get_thread(&thread_id).await? else {
                bail!("thread {} not found", thread_id);
            };
            for m in &thread.messages {
                println!("[{}] {}: {}", m.ordinal, m.role.as_str(), m.content);
            }
        }
        Commands::Serve => {
            let app = App::open(&cfg).await?;
            server::run_server(Arc::new(app)).await?;
        }
    }

    Ok(())
}

async fn ask(app: &App, thread_id: &str, message: &str) -> Result<()> {
    let mut turn = app.graph.converse(thread_id, message).await?;
    let mut sources = Vec::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = turn.next().await {
        match event {
            TurnEvent::Sources(s) => sources = s,
            TurnEvent::Text(fragment) => {
                print!("{}", fragment);
                stdout.flush()?;
            }
            TurnEvent::End(_) => {
                println!();
                break;
            }
            TurnEvent::Error(failure) => {
                println!();
                bail!("turn failed ({}): {}", failure.code, failure.message);
            }
        }
    }

    if !sources.is_empty() {
        println!("\nSources:");
        for s in &sources {
            println!("  {} #{} ({:.3})", s.filename, s.ordinal, s.score);
        }
    }
    Ok(())
}
