//! `mem` — thin CLI over the indexing and retrieval core.
//!
//! Wires configuration (defaults plus `MEMORY_*` environment overrides) into
//! the indexer and searcher and prints results. The heavy lifting lives in
//! the library crate.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use memory_search::config::{Config, SourceRoot};
use memory_search::contextualizer::Contextualizer;
use memory_search::embedding::EmbeddingClient;
use memory_search::expander::QueryExpander;
use memory_search::indexer::{IndexOptions, Indexer};
use memory_search::reranker::Reranker;
use memory_search::searcher::Searcher;
use memory_search::shutdown::Shutdown;
use memory_search::store::Store;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mem",
    about = "Hybrid semantic search over your Markdown notes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan roots and (re)index changed Markdown files
    Index {
        /// Roots to scan; each becomes a collection named after its basename
        roots: Vec<PathBuf>,

        /// Delete file rows not encountered during the scan
        #[arg(long)]
        prune: bool,

        /// Report counts without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Search indexed notes
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,

        /// Skip the cross-encoder reranker
        #[arg(long)]
        no_rerank: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Prune aged entries from the on-disk caches
    PruneCaches {
        /// Maximum entry age in days
        #[arg(long, default_value_t = 30)]
        max_age_days: i64,
    },
}

fn init_tracing() {
    let level = std::env::var("MEMORY_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = match level.as_str() {
        "silent" => EnvFilter::new("off"),
        other => EnvFilter::new(other),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Index {
            roots,
            prune,
            dry_run,
        } => {
            for root in roots {
                let collection = root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "notes".to_string());
                config.index.sources.push(SourceRoot { root, collection });
            }
            if config.index.sources.is_empty() {
                anyhow::bail!("no source roots given; pass one or more directories");
            }

            let store = Arc::new(Store::open(&config.store, config.embedding.dims).await?);
            let embedder = Arc::new(EmbeddingClient::new(config.embedding.clone())?);
            let contextualizer = config
                .context
                .enabled
                .then(|| Contextualizer::new(config.context.clone()).map(Arc::new))
                .transpose()?;

            let shutdown = Shutdown::new();
            {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("interrupt received; finishing current file");
                        shutdown.trigger();
                    }
                });
            }

            let indexer = Indexer::new(
                store,
                embedder,
                contextualizer,
                config.chunking.clone(),
                config.index.clone(),
            );
            let options = IndexOptions { prune, dry_run };
            let report = indexer.run(&options, &shutdown, None).await?;

            println!("index{}", if dry_run { " (dry-run)" } else { "" });
            println!("  scanned: {}", report.scanned);
            println!("  indexed: {}", report.indexed);
            println!("  skipped: {}", report.skipped);
            if report.empty > 0 {
                println!("  empty: {}", report.empty);
            }
            if prune {
                println!("  deleted: {}", report.deleted);
            }
            if report.embed_errors > 0 {
                println!("  embedding errors: {}", report.embed_errors);
            }
            if report.errors > 0 {
                println!("  errors: {}", report.errors);
            }
            println!("ok");
        }

        Commands::Search {
            query,
            limit,
            no_rerank,
            json,
        } => {
            if no_rerank {
                config.search.disable_rerank = true;
            }
            if let Some(limit) = limit {
                config.search.top_k = limit;
            }

            let store = Arc::new(Store::open(&config.store, config.embedding.dims).await?);
            let embedder = Arc::new(EmbeddingClient::new(config.embedding.clone())?);
            let expander = Arc::new(QueryExpander::new(
                &config.expand,
                config.primary_llm().cloned(),
            )?);
            let reranker = Reranker::new(config.rerank.clone())?;
            let searcher = Searcher::new(
                store,
                embedder,
                Some(expander),
                Some(reranker),
                config.search.clone(),
            );

            let outcome = searcher.search(&query).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }

            for stage in &outcome.stages {
                eprintln!("· {stage}");
            }
            if outcome.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, result) in outcome.results.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {}:{}-{}",
                    i + 1,
                    result.score,
                    result.file,
                    result.line_start,
                    result.line_end
                );
                println!(
                    "    excerpt: \"{}\"",
                    result.snippet.replace('\n', " ").trim()
                );
            }
        }

        Commands::PruneCaches { max_age_days } => {
            let store = Store::open(&config.store, config.embedding.dims).await?;
            let max_age_secs = max_age_days * 24 * 3600;
            let queries = store.prune_query_cache(max_age_secs).await?;
            let contexts = store.prune_context_cache(max_age_secs).await?;
            let reranks = store.prune_rerank_cache(max_age_secs).await?;
            let orphans = store.sweep_orphans().await?;
            println!("prune caches");
            println!("  query embeddings removed: {queries}");
            println!("  context prefixes removed: {contexts}");
            println!("  rerank scores removed: {reranks}");
            println!("  orphan rows removed: {orphans}");
            println!("ok");
        }
    }

    Ok(())
}
