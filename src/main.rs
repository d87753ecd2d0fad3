//! # Corpus Harness CLI (`corpus`)
//!
//! ## Usage
//!
//! ```bash
//! corpus --config ./config/corpus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `corpus init` | Create the SQLite database and run schema migrations |
//! | `corpus sync` | Ingest the configured source directory |
//! | `corpus search "<query>"` | Term, vector, or fused search, optionally reranked |
//! | `corpus get <scope> <path>` | Show one document and its chunks |
//! | `corpus stats` | Per-scope index statistics |
//! | `corpus eval <queries.json>` | Run a golden-query evaluation |
//!
//! ## Examples
//!
//! ```bash
//! corpus init
//! corpus sync --cleanup
//! corpus search "PROJ-1234" --mode term
//! corpus search "how do tokens get exchanged" --mode fused --explain
//! corpus eval ./golden.json --strict
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use corpus_harness::config;
use corpus_harness::eval;
use corpus_harness::get;
use corpus_harness::ingest::{self, SyncOptions};
use corpus_harness::logging;
use corpus_harness::migrate;
use corpus_harness::progress::ProgressMode;
use corpus_harness::search;
use corpus_harness::stats;

/// Corpus Harness: ingest a text corpus and search it through term and
/// vector channels with rank fusion and optional judge reranking.
#[derive(Parser)]
#[command(name = "corpus", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/corpus.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest the configured source into the configured scope.
    Sync {
        /// Rewrite and re-index documents even when their hash is unchanged.
        #[arg(long)]
        force: bool,

        /// Soft-delete documents whose source file is gone.
        #[arg(long)]
        cleanup: bool,

        /// Show what would change without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of items to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress on stderr: human, json, or off. Default: human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Search the configured scope.
    Search {
        query: String,

        /// term, vector, or fused.
        #[arg(long, default_value = "fused")]
        mode: String,

        /// Rerank fused candidates with the configured judge.
        #[arg(long)]
        rerank: bool,

        #[arg(long)]
        limit: Option<usize>,

        /// Print channel scores and score components.
        #[arg(long)]
        explain: bool,
    },

    /// Show one document and its chunks.
    Get { scope: String, path: String },

    /// Per-scope index statistics.
    Stats,

    /// Evaluate retrieval against a golden query file.
    Eval {
        queries: PathBuf,

        /// Also evaluate fused + rerank.
        #[arg(long)]
        rerank: bool,

        /// Artifact directory (default: [eval].output_dir).
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Exit non-zero when any threshold fails.
        #[arg(long)]
        strict: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            force,
            cleanup,
            dry_run,
            limit,
            progress,
        } => {
            let progress = match progress {
                Some(mode) => ProgressMode::parse(&mode)?,
                None => ProgressMode::default_for_tty(),
            };
            ingest::run_sync(
                &cfg,
                SyncOptions {
                    force,
                    cleanup,
                    dry_run,
                    limit,
                    progress,
                },
            )
            .await?;
        }
        Commands::Search {
            query,
            mode,
            rerank,
            limit,
            explain,
        } => {
            search::run_search(&cfg, &query, &mode, rerank, limit, explain).await?;
        }
        Commands::Get { scope, path } => {
            get::run_get(&cfg, &scope, &path).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Eval {
            queries,
            rerank,
            output_dir,
            strict,
        } => {
            let passed = eval::run_eval(&cfg, &queries, rerank, output_dir).await?;
            if strict && !passed {
                anyhow::bail!("evaluation thresholds failed");
            }
        }
    }

    Ok(())
}
