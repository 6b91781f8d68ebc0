//! # docrag CLI
//!
//! Operational entry points for the ingestion pipeline and query API.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag init` | Create the SQLite database and run schema migrations |
//! | `docrag ingest <bucket> <key>` | Enqueue an upload event for processing |
//! | `docrag work` | Run the pipeline workers (extract, chunk, embed, vdr) |
//! | `docrag serve` | Start the HTTP query API |
//!
//! All commands accept a `--config` flag pointing to a TOML configuration
//! file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use docrag::access::{AccessClassifier, NoExternalGroups};
use docrag::config::{load_config, Config};
use docrag::extract::HandlerRegistry;
use docrag::pipeline::{self, PipelineContext, UploadEvent, VdrContext};
use docrag::progress::ProgressTracker;
use docrag::queue::Queue;
use docrag::retrieval::RetrievalEngine;
use docrag::server::{run_server, AppState};
use docrag::vdr::{HttpVisualEncoder, StderrVdrProgress};
use docrag::{db, embedding, migrate, storage};

#[derive(Parser)]
#[command(
    name = "docrag",
    about = "docrag — document ingestion and hybrid retrieval service",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Enqueue an upload event for the pipeline.
    Ingest {
        bucket: String,
        key: String,
        /// Owner of the uploaded document.
        #[arg(long, default_value = "system")]
        user: String,
    },

    /// Run the pipeline workers until interrupted.
    Work,

    /// Start the HTTP query API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            println!("ok");
            pool.close().await;
        }
        Commands::Ingest { bucket, key, user } => {
            let pool = db::connect(&config).await?;
            let queue = Queue::new(pool.clone(), config.queue.visibility_timeout_secs);
            let event = UploadEvent {
                bucket,
                key,
                user_id: user,
                mime_type: None,
            };
            let id = pipeline::submit_upload(&queue, &event).await?;
            println!("enqueued {}", id);
            pool.close().await;
        }
        Commands::Work => {
            let ctx = build_pipeline_context(&config).await?;
            pipeline::run_workers(&ctx).await;
        }
        Commands::Serve => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            let queue = Queue::new(pool.clone(), config.queue.visibility_timeout_secs);
            let tracker =
                ProgressTracker::new(pool.clone(), queue, config.tracker.stale_after_secs);
            let state = AppState {
                engine: RetrievalEngine::new(
                    pool.clone(),
                    tracker,
                    config.retrieval.clone(),
                ),
                classifier: AccessClassifier::new(pool.clone()),
                embedding: Arc::from(embedding::create_service(&config.embedding)?),
                membership: Arc::new(NoExternalGroups),
                pool,
                config: Arc::new(config),
            };
            run_server(state).await?;
        }
    }

    Ok(())
}

async fn build_pipeline_context(config: &Config) -> Result<PipelineContext> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let queue = Queue::new(pool.clone(), config.queue.visibility_timeout_secs);
    let tracker = ProgressTracker::new(pool.clone(), queue.clone(), config.tracker.stale_after_secs);

    let vdr = match &config.vdr.model_url {
        Some(url) => Some(VdrContext {
            rasterizer: default_rasterizer()?,
            encoder: Arc::new(HttpVisualEncoder::new(url.clone(), config.vdr.timeout_secs)?),
            reporter: Arc::new(StderrVdrProgress),
            dpi: config.vdr.dpi,
        }),
        None => None,
    };

    Ok(PipelineContext {
        queue,
        registry: HandlerRegistry::with_builtins(),
        store: Arc::from(storage::create_store(&config.storage)?),
        embedding: Arc::from(embedding::create_service(&config.embedding)?),
        tracker,
        min_chunk_size: config.chunking.min_chunk_size,
        vdr,
        pool,
    })
}

#[cfg(feature = "vdr-pdfium")]
fn default_rasterizer() -> Result<Arc<dyn docrag::vdr::PageRasterizer>> {
    Ok(Arc::new(docrag::vdr::PdfiumRasterizer))
}

#[cfg(not(feature = "vdr-pdfium"))]
fn default_rasterizer() -> Result<Arc<dyn docrag::vdr::PageRasterizer>> {
    anyhow::bail!("visual pipeline requires the vdr-pdfium feature")
}
