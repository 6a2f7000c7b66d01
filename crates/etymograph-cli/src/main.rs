//! Etymograph CLI - bulk lexical ingestion and enrichment
//!
//! A command-line interface for driving the processing pipelines against a
//! local data directory.
//!
//! # Usage
//!
//! ```bash
//! # Ingest a Wiktionary-style JSONL extract
//! etymograph ingest --file en.jsonl --source wikt-en --format json
//!
//! # Generate embeddings for everything ingested from that source
//! etymograph process --source wikt-en
//!
//! # Show store counts and checkpoints
//! etymograph status
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use etymograph_pipeline::PipelineError;

mod commands;
mod progress;

/// Etymograph - lexical ingestion, embedding enrichment and cognate detection
#[derive(Parser, Debug)]
#[command(name = "etymograph")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOptions,
}

/// Global options available to all commands
#[derive(Args, Debug, Clone)]
struct GlobalOptions {
    /// Data directory (SQLite stores and caches)
    #[arg(long, global = true, env = "ETYMOGRAPH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Qdrant server URL
    #[arg(long, global = true, env = "ETYMOGRAPH_QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Embedding provider type (local, remote)
    #[arg(long, global = true, env = "ETYMOGRAPH_EMBEDDING_PROVIDER", value_parser = parse_embedding_provider)]
    embedding_provider: Option<etymograph_config::EmbeddingProviderType>,

    /// Enable verbose output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

/// Parse embedding provider from string
fn parse_embedding_provider(
    s: &str,
) -> Result<etymograph_config::EmbeddingProviderType, String> {
    s.parse()
        .map_err(|e: etymograph_config::ConfigError| e.to_string())
}

impl GlobalOptions {
    /// Convert global options to config overrides
    fn to_config_overrides(&self) -> etymograph_config::ConfigOverrides {
        etymograph_config::ConfigOverrides {
            data_dir: self.data_dir.clone(),
            qdrant_url: self.qdrant_url.clone(),
            embedding_provider: self.embedding_provider,
            workers: None,
            log_level: None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest a source file into the raw and typed stores
    Ingest(commands::ingest::IngestArgs),

    /// Generate embeddings for ingested entries
    Process(commands::process::ProcessArgs),

    /// Show store counts and pipeline checkpoints
    Status(commands::status::StatusArgs),
}

fn init_tracing(global: &GlobalOptions, configured_level: &str) {
    let level = if global.verbose {
        "debug"
    } else if global.quiet {
        "warn"
    } else {
        configured_level
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("etymograph={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load layered configuration with CLI overrides applied last
    let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = match etymograph_config::ConfigLoader::new()
        .load(&workdir, Some(&cli.global.to_config_overrides()))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(65);
        }
    };

    init_tracing(&cli.global, &config.logging.level);

    let quiet = cli.global.quiet;
    let result: Result<()> = match cli.command {
        Commands::Ingest(args) => commands::ingest::run(args, &config, quiet).await,
        Commands::Process(args) => commands::process::run(args, &config, quiet).await,
        Commands::Status(args) => commands::status::run(args, &config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(70);
            ExitCode::from(code as u8)
        }
    }
}
