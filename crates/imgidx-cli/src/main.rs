//! imgidx CLI - Command-line interface
//!
//! Usage:
//!   imgidx download [--input urls.txt] [--output images/]
//!   imgidx index [--policy create-if-absent|recreate] [--workers N]
//!   imgidx bootstrap [--policy ...]
//!   imgidx search <query> [--top-k 15]
//!
//! Author: hephaex@gmail.com

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use imgidx_core::{AppConfig, CollectionPolicy, LoggingConfig};
use imgidx_pipeline::{load_urls, CollectionBootstrapper, Downloader, IndexWriter, RetryPolicy};
use imgidx_queue::{AmqpChannel, IngestionChannel};
use imgidx_vector::{EmbeddingClient, HttpEmbeddingClient, QdrantStore, VectorStore};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgidx")]
#[command(about = "Image download and vector indexing pipeline")]
#[command(version)]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true, env = "IMGIDX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every listed image and queue it for indexing
    Download {
        /// Newline-separated URL list
        #[arg(long)]
        input: Option<PathBuf>,
        /// Directory images are written to
        #[arg(long)]
        output: Option<PathBuf>,
        /// Maximum downloads in flight
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Consume the queue and write embeddings to the vector store
    Index {
        #[arg(long)]
        policy: Option<CollectionPolicy>,
        /// Concurrent consumers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Create or verify the vector collection, then exit
    Bootstrap {
        #[arg(long)]
        policy: Option<CollectionPolicy>,
    },
    /// Find the images closest to a text query
    Search {
        query: String,
        #[arg(long, default_value_t = 15)]
        top_k: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Download {
            input,
            output,
            concurrency,
        } => {
            let mut config = config;
            if let Some(input) = input {
                config.input.urls_file = input;
            }
            if let Some(output) = output {
                config.storage.output_dir = output;
            }
            if let Some(n) = concurrency {
                config.pipeline.download_concurrency = n.max(1);
            }
            download(&config).await
        }
        Commands::Index { policy, workers } => {
            let policy = policy.unwrap_or(config.vector.policy);
            let workers = workers.unwrap_or(config.pipeline.index_workers).max(1);
            index(&config, policy, workers).await
        }
        Commands::Bootstrap { policy } => {
            let store = connect_store(&config).await?;
            bootstrap(&config, store, policy.unwrap_or(config.vector.policy)).await
        }
        Commands::Search { query, top_k } => search(&config, &query, top_k).await,
    }
}

// ============================================================================
// Setup
// ============================================================================

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Token cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing in-flight work");
            trigger.cancel();
        }
    });
    token
}

async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<dyn VectorStore>> {
    let store = QdrantStore::new(&config.vector)?;
    store
        .ping()
        .await
        .with_context(|| format!("Vector store unreachable at {}", config.vector.qdrant_url))?;
    Ok(Arc::new(store))
}

async fn connect_channel(config: &AppConfig, prefetch: u16) -> anyhow::Result<Arc<AmqpChannel>> {
    let channel = AmqpChannel::connect(&config.broker, prefetch)
        .await
        .with_context(|| format!("Broker unreachable at {}", config.broker.host))?;
    Ok(Arc::new(channel))
}

// ============================================================================
// Commands
// ============================================================================

async fn download(config: &AppConfig) -> anyhow::Result<()> {
    let urls = load_urls(&config.input.urls_file)?;
    tracing::info!(
        count = urls.len(),
        input = %config.input.urls_file.display(),
        "Loaded URL list"
    );

    let channel = connect_channel(config, 1).await?;
    let downloader = Downloader::from_config(config, channel.clone())?;
    let shutdown = shutdown_on_ctrl_c();

    let progress = ProgressBar::new(urls.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("  Downloading: [{bar:30}] {pos}/{len} ({eta})")?
            .progress_chars("=> "),
    );

    let report = downloader.run(urls, &shutdown, &progress).await;
    progress.finish_and_clear();
    channel.close().await?;

    println!(
        "Queued {} of {} images ({} rejected, {} failed, {} orphaned, {} skipped)",
        report.published,
        report.total,
        report.rejected.len(),
        report.failed.len(),
        report.orphaned.len(),
        report.skipped
    );
    Ok(())
}

async fn index(config: &AppConfig, policy: CollectionPolicy, workers: usize) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    bootstrap(config, store.clone(), policy).await?;

    let embedder: Arc<dyn EmbeddingClient> =
        Arc::new(HttpEmbeddingClient::from_config(&config.embedding)?);
    let prefetch = u16::try_from(workers).unwrap_or(u16::MAX);
    let channel = connect_channel(config, prefetch).await?;

    let writer = IndexWriter::new(
        channel.clone(),
        embedder,
        store,
        RetryPolicy::from_config(&config.pipeline),
    );

    let shutdown = shutdown_on_ctrl_c();
    let result = writer.run(workers, &shutdown).await;

    if let Err(e) = channel.close().await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }

    let report = result?;
    println!(
        "Indexed {} images ({} retries, {} dead-lettered)",
        report.acked, report.retried, report.dead_lettered
    );
    Ok(())
}

async fn bootstrap(
    config: &AppConfig,
    store: Arc<dyn VectorStore>,
    policy: CollectionPolicy,
) -> anyhow::Result<()> {
    let outcome = CollectionBootstrapper::new(store, config.collection_schema())
        .ensure(policy)
        .await
        .with_context(|| format!("Cannot use collection {}", config.vector.collection))?;
    tracing::debug!(?outcome, "Bootstrap finished");
    Ok(())
}

async fn search(config: &AppConfig, query: &str, top_k: usize) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let embedder = HttpEmbeddingClient::from_config(&config.embedding)?;

    let vector = embedder.embed_text(query).await?;
    let hits = store.search(&vector, top_k).await?;

    if hits.is_empty() {
        println!("No results");
        return Ok(());
    }
    for hit in hits {
        println!("{:.4}  {}  {}", hit.score, hit.payload.src_url, hit.payload.path);
    }
    Ok(())
}
