//! Command-line interface: the operator control surface of the pipeline.
//!
//! Exit code 0 on success; non-zero only for unrecoverable configuration
//! errors (missing credentials, unreachable database). Per-item failures
//! are recorded on their staging items and surface through `stats`.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "subvenia")]
#[command(about = "Spanish grants registry ingestion and semantic search pipeline")]
#[command(version)]
pub struct Cli {
    /// Data directory (database and downloads live under it)
    #[arg(long, global = true, env = "SUBVENIA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database schema
    Init,

    /// Fetch grants from the registry into the staging queue
    Ingest {
        /// Purpose code filter (e.g. 11 for culture)
        #[arg(long)]
        finalidad: Option<String>,
        /// Comma-separated beneficiary type codes (e.g. "3,2")
        #[arg(long)]
        tipos_beneficiario: Option<String>,
        /// Only currently-open grants (pass false to include closed ones)
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        abierto: bool,
        /// Batch identifier; generated when omitted
        #[arg(long)]
        batch_id: Option<String>,
        /// Maximum number of items to fetch
        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Download and extract text from pending PDFs
    ProcessPdfs {
        /// Number of staging items to claim
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Run LLM summarization and field extraction
    Llm {
        /// Number of extractions to process
        #[arg(short, long, default_value = "50")]
        limit: u32,
        /// Reprocess even when the model tag already matches
        #[arg(long)]
        force: bool,
    },

    /// Generate embeddings for extracted text
    Embed {
        /// Number of extractions to process
        #[arg(short, long, default_value = "100")]
        limit: u32,
        /// Drop and regenerate existing embeddings
        #[arg(long)]
        reprocess: bool,
    },

    /// Semantic search over ingested grants
    Search {
        /// Natural-language query
        query: String,
        /// Maximum number of hits
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Minimum similarity score (0-1)
        #[arg(long, default_value = "0.5")]
        min_similarity: f64,
        /// Substring filter on the granting organisation
        #[arg(long)]
        organismo: Option<String>,
        /// Scope filter (Local, Provincial, …)
        #[arg(long)]
        ambito: Option<String>,
        /// Purpose code filter
        #[arg(long)]
        finalidad: Option<String>,
        /// Publication date range start (YYYY-MM-DD)
        #[arg(long)]
        desde: Option<String>,
        /// Publication date range end (YYYY-MM-DD)
        #[arg(long)]
        hasta: Option<String>,
        /// Open/closed filter: abierta, cerrada or proxima
        #[arg(long)]
        estado: Option<String>,
    },

    /// Grants similar to a reference grant
    Similar {
        /// Grant row id
        grant_id: i64,
        /// Maximum number of hits
        #[arg(short, long, default_value = "5")]
        limit: usize,
        /// Minimum similarity score (0-1)
        #[arg(long, default_value = "0.6")]
        min_similarity: f64,
    },

    /// Counts by entity and status, plus vector index readiness
    Stats,

    /// Reset terminal staging items back to pending
    Requeue {
        /// External id of one item to requeue
        external_id: Option<String>,
        /// Requeue every failed item
        #[arg(long)]
        all_failed: bool,
    },
}

/// Parse arguments and dispatch.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env(cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Init => commands::init(&settings),
        Commands::Ingest {
            finalidad,
            tipos_beneficiario,
            abierto,
            batch_id,
            max_items,
        } => {
            commands::ingest(
                &settings,
                finalidad,
                tipos_beneficiario,
                abierto,
                batch_id,
                max_items,
            )
            .await
        }
        Commands::ProcessPdfs { limit } => commands::process_pdfs(&settings, limit).await,
        Commands::Llm { limit, force } => commands::llm(&settings, limit, force).await,
        Commands::Embed { limit, reprocess } => commands::embed(&settings, limit, reprocess).await,
        Commands::Search {
            query,
            limit,
            min_similarity,
            organismo,
            ambito,
            finalidad,
            desde,
            hasta,
            estado,
        } => {
            commands::search(
                &settings,
                &query,
                limit,
                min_similarity,
                commands::SearchFilterArgs {
                    organismo,
                    ambito,
                    finalidad,
                    desde,
                    hasta,
                    estado,
                },
            )
            .await
        }
        Commands::Similar {
            grant_id,
            limit,
            min_similarity,
        } => commands::similar(&settings, grant_id, limit, min_similarity),
        Commands::Stats => commands::stats(&settings),
        Commands::Requeue {
            external_id,
            all_failed,
        } => commands::requeue(&settings, external_id, all_failed),
    }
}
