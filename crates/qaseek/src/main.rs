//! # qaseek CLI
//!
//! Command-line interface for qaseek, semantic retrieval over a product
//! Q&A corpus stored in OpenSearch.
//!
//! ## Commands
//!
//! - `qaseek index` - Embed every record of a source collection into a kNN collection
//! - `qaseek query <TEXT>` - Nearest-neighbour search over the kNN collection
//! - `qaseek status` - Document count and vector dimension of a collection
//! - `qaseek config show|init|path` - Inspect configuration
//!
//! ## Examples
//!
//! ```bash
//! export OPENSEARCH_INITIAL_ADMIN_PASSWORD=...
//!
//! # Index the canonical collection
//! qaseek index --source amazon_qa_software --destination amazon_qa_software_vec
//!
//! # Index straight from a converted NDJSON file
//! qaseek index --from-file data/software.ndjson
//!
//! # Ask a question
//! qaseek query "Is this good for gaming on Windows?" -k 5 --format json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qaseek_core::{
    verify_dimension, Embedder, EmbeddingConfig, IndexingSummary, QueryHit, QueryRequest,
    VectorCollection, VectorIndex,
};
#[cfg(feature = "candle")]
use qaseek_embed::CandleEmbedder;
use qaseek_embed::{EmbedderPool, HashEmbedder, HASH_MODEL_NAME};
use qaseek_index::{IndexingPipeline, PipelineConfig};
use qaseek_query::QueryEngine;
use qaseek_store::{NdjsonSource, OpenSearchStore};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;

use config::{Config, EmbeddingSection};

#[derive(Parser)]
#[command(name = "qaseek")]
#[command(about = "Semantic search over product Q&A stored in OpenSearch")]
#[command(version)]
struct Cli {
    /// Path to config file (default: ~/.config/qaseek/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// OpenSearch URL (overrides config and environment)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed a source collection into a kNN collection
    Index {
        /// Source collection holding canonical records
        #[arg(short, long, conflicts_with = "from_file")]
        source: Option<String>,

        /// Destination kNN collection
        #[arg(short, long)]
        destination: Option<String>,

        /// Documents per bulk write
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Read records from a canonical NDJSON file instead of OpenSearch
        #[arg(long)]
        from_file: Option<PathBuf>,
    },

    /// Query the kNN collection
    Query {
        /// Question text
        text: String,

        /// Number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Collection to search
        #[arg(long)]
        collection: Option<String>,
    },

    /// Show collection status
    Status {
        /// Collection to inspect (default: the query collection)
        collection: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Print sample configuration file
    Init,
    /// Show config file path
    Path,
}

/// Output structure for query results.
#[derive(Serialize)]
struct QueryOutput<'a> {
    query: &'a str,
    results: &'a [QueryHit],
}

/// Output structure for status.
#[derive(Serialize)]
struct StatusOutput {
    url: String,
    collection: String,
    documents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimension: Option<usize>,
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    // RUST_LOG wins over config and flags
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;

    match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set tracing subscriber")?;
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set tracing subscriber")?;
        }
    }
    Ok(())
}

/// Build the embedder named in the configuration, gated by a pool.
async fn create_embedder(config: &EmbeddingSection) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = if config.model == HASH_MODEL_NAME {
        Arc::new(HashEmbedder::with_dimension(config.dimension).with_max_tokens(config.max_tokens))
    } else {
        load_model(config).await?
    };

    if embedder.dimension() != config.dimension {
        return Err(qaseek_core::Error::Config(format!(
            "model {} produces {}-dimensional vectors, configured dimension is {}",
            embedder.model_name(),
            embedder.dimension(),
            config.dimension
        ))
        .into());
    }

    Ok(Arc::new(EmbedderPool::new(embedder, config.max_concurrent)))
}

#[cfg(feature = "candle")]
async fn load_model(config: &EmbeddingSection) -> Result<Arc<dyn Embedder>> {
    let cache_dir = config
        .cache_dir
        .clone()
        .or_else(|| config::cache_dir().map(|dir| dir.join("models")));

    info!(
        "Loading embedding model {} (this may download the model on first run)...",
        config.model
    );
    let embedder = CandleEmbedder::load(&config.model, cache_dir)
        .await
        .map_err(qaseek_core::Error::Embedding)
        .context("Failed to initialize embedder")?;
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "candle"))]
async fn load_model(config: &EmbeddingSection) -> Result<Arc<dyn Embedder>> {
    Err(qaseek_core::Error::Config(format!(
        "model {} needs a build with the `candle` feature; use model = \"{}\" otherwise",
        config.model, HASH_MODEL_NAME
    ))
    .into())
}

fn connect(config: &Config) -> Result<Arc<OpenSearchStore>> {
    let store = OpenSearchStore::new(config.opensearch()?)
        .context("Failed to create OpenSearch client")?;
    Ok(Arc::new(store))
}

/// Connection check shared by every backend command.
async fn ping(store: &OpenSearchStore) -> Result<()> {
    store
        .ping()
        .await
        .map_err(qaseek_core::Error::Backend)
        .with_context(|| format!("Cannot reach OpenSearch at {}", store.base_url()))?;
    info!("Connected to OpenSearch at {}", store.base_url());
    Ok(())
}

fn print_summary(summary: &IndexingSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
        OutputFormat::Text => {
            println!("Indexing summary");
            println!("  Attempted: {}", summary.attempted);
            println!("  Succeeded: {}", summary.succeeded);
            println!("  Skipped:   {}", summary.skipped);
            println!("  Failed:    {}", summary.failed);
            if summary.abandoned > 0 {
                println!("  Abandoned: {}", summary.abandoned);
            }
            if summary.cancelled {
                println!("  (cancelled)");
            }
            if let Some(elapsed) = summary.elapsed() {
                println!("  Elapsed:   {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(ref path) = cli.config {
        Config::load_from(Some(path.clone()))
            .with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        Config::load().context("Failed to load config")?
    };
    if let Some(url) = cli.url.clone() {
        config.backend.url = url;
    }

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Index {
            source,
            destination,
            batch_size,
            from_file,
        } => {
            let source = source.unwrap_or_else(|| config.indexing.source.clone());
            let destination = VectorCollection::new(
                destination.unwrap_or_else(|| config.indexing.destination.clone()),
            )
            .with_vector_field(config.indexing.vector_field.clone());

            let store = connect(&config)?;
            ping(&store).await?;
            let embedder = create_embedder(&config.embedding).await?;

            let pipeline_config = PipelineConfig {
                batch_size: batch_size.unwrap_or(config.indexing.batch_size),
                page_size: config.indexing.page_size,
                micro_batch_size: config.embedding.micro_batch_size,
                embed_workers: config.embedding.max_concurrent,
                max_inflight_batches: config.indexing.max_inflight_batches,
                retry: config.indexing.retry_policy(),
                progress_every: config.indexing.progress_every,
                embed_config: EmbeddingConfig::default(),
                composer: config.indexing.composer(),
            };
            let pipeline = IndexingPipeline::new(
                embedder,
                Arc::clone(&store) as Arc<dyn VectorIndex>,
                pipeline_config,
            );

            pipeline
                .preflight(&destination)
                .await
                .context("Startup checks failed")?;

            // Ctrl+C stops reading; batches already submitted still finish
            let cancel = pipeline.cancel_handle();
            let signal_handle = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted; finishing in-flight batches");
                    cancel.cancel();
                }
            });

            let result = match from_file {
                Some(path) => {
                    let path = path.to_string_lossy().to_string();
                    info!("Reading records from {}", path);
                    pipeline
                        .run(&NdjsonSource::default(), &path, &destination)
                        .await
                }
                None => pipeline.run(store.as_ref(), &source, &destination).await,
            };
            signal_handle.abort();

            match result {
                Ok(summary) => {
                    print_summary(&summary, cli.format)?;
                }
                Err(failure) => {
                    print_summary(&failure.summary, cli.format)?;
                    return Err(failure.error).context("Indexing failed");
                }
            }
        }

        Commands::Query {
            text,
            top_k,
            collection,
        } => {
            let collection = VectorCollection::new(
                collection.unwrap_or_else(|| config.query.collection.clone()),
            )
            .with_vector_field(config.indexing.vector_field.clone());
            let top_k = top_k.unwrap_or(config.query.default_top_k);

            run_query(&config, &text, top_k, collection, cli.format).await?;
        }

        Commands::Status { collection } => {
            let collection = VectorCollection::new(
                collection.unwrap_or_else(|| config.query.collection.clone()),
            )
            .with_vector_field(config.indexing.vector_field.clone());

            let store = connect(&config)?;
            ping(&store).await?;

            let documents = store
                .count(&collection.name)
                .await
                .map_err(qaseek_core::Error::Backend)
                .with_context(|| format!("Failed to count {}", collection.name))?;
            let dimension = store
                .vector_dimension(&collection)
                .await
                .map_err(qaseek_core::Error::Backend)?;

            match cli.format {
                OutputFormat::Json => {
                    let output = StatusOutput {
                        url: store.base_url().to_string(),
                        collection: collection.name.clone(),
                        documents,
                        dimension,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Text => {
                    println!("Collection {} at {}", collection.name, store.base_url());
                    println!("  Documents: {documents}");
                    match dimension {
                        Some(dim) => println!("  Dimension: {dim} ({})", collection.vector_field),
                        None => println!("  Dimension: unknown ({} not mapped)", collection.vector_field),
                    }
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => match cli.format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&redacted(&config))
                            .context("Failed to serialize config")?
                    );
                }
                OutputFormat::Text => {
                    println!(
                        "{}",
                        toml::to_string_pretty(&redacted(&config))
                            .context("Failed to serialize config")?
                    );
                }
            },
            ConfigAction::Init => {
                println!("{}", Config::sample_toml());
            }
            ConfigAction::Path => {
                if let Some(path) = Config::config_path() {
                    println!("{}", path.display());
                } else {
                    println!("Could not determine config directory");
                }
            }
        },
    }

    Ok(())
}

/// Copy of the configuration safe to print.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if config.backend.password.is_some() {
        config.backend.password = Some("********".to_string());
    }
    config
}

/// Truncate a string to max characters, adding ellipsis if needed.
fn truncate(s: &str, max_len: usize) -> String {
    let s = s.replace('\n', " ").replace('\r', "");
    if s.chars().count() <= max_len {
        s
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Answer one query. Blank text is answered before any connection is made.
async fn run_query(
    config: &Config,
    text: &str,
    top_k: usize,
    collection: VectorCollection,
    format: OutputFormat,
) -> Result<()> {
    let request = QueryRequest::new(text, top_k)?;
    if request.is_blank() {
        return print_hits(text, &[], format);
    }

    let store = connect(config)?;
    ping(&store).await?;
    let embedder = create_embedder(&config.embedding).await?;
    verify_dimension(embedder.as_ref(), store.as_ref(), &collection)
        .await
        .context("Startup checks failed")?;

    let engine =
        QueryEngine::new(embedder, store, collection).with_max_top_k(config.query.max_top_k);

    let results = engine
        .query(&request)
        .await
        .context("Query execution failed")?;
    print_hits(text, &results, format)
}

fn print_hits(text: &str, results: &[QueryHit], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let output = QueryOutput {
                query: text,
                results,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Query: {text}\n");
            if results.is_empty() {
                println!("No results found.");
            } else {
                for (i, hit) in results.iter().enumerate() {
                    println!("{}. (score: {:.4}) [{}]", i + 1, hit.score, hit.asin);
                    println!("   Q: {}", truncate(&hit.question, 200));
                    println!("   A: {}", truncate(&hit.answer, 200));
                    println!();
                }
            }
        }
    }
    Ok(())
}
