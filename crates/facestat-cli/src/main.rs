mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facestat_io::{CheckpointManager, CommitPolicy, InputFormat};
use facestat_pipeline::{Orchestrator, PipelineState};
use tracing_subscriber::EnvFilter;

use crate::config::FlagOverrides;

#[derive(Parser)]
#[command(
    name = "facestat",
    version,
    about = "Resumable statistics over face-recognition event dumps"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process an input file, resuming from a checkpoint if asked
    Run(RunArgs),
    /// Print the checkpoint stored in an output directory
    Status {
        /// Output directory of a previous run
        output_dir: PathBuf,
    },
    /// Remove checkpoint files from an output directory
    Clear {
        /// Output directory of a previous run
        output_dir: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON array, JSONL or line-delimited text file
    input: PathBuf,
    /// Output directory (photos/, reports/, image_cache/, checkpoint)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Input layout: json, jsonl or text (detected when omitted)
    #[arg(long)]
    input_format: Option<InputFormat>,
    /// Report formats to hand to report generators (html,pdf,excel,json)
    #[arg(short, long, value_delimiter = ',')]
    format: Vec<String>,
    /// Resume from the checkpoint in the output directory
    #[arg(short, long)]
    resume: bool,
    /// Start over when the checkpoint belongs to a different input
    #[arg(long)]
    restart_on_mismatch: bool,
    /// Initial (or fixed, with --skip-optimization) batch size
    #[arg(long)]
    batch_size: Option<usize>,
    /// Maximum concurrent workers
    #[arg(long)]
    max_workers: Option<usize>,
    /// Memory limit as a percentage of system memory
    #[arg(long)]
    memory_limit: Option<f64>,
    /// Use fixed batch size and workers instead of memory-driven sizing
    #[arg(long)]
    skip_optimization: bool,
    /// Image request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Commit a checkpoint after this many records
    #[arg(long)]
    checkpoint_records: Option<u64>,
    /// Commit a checkpoint after this many seconds
    #[arg(long)]
    checkpoint_secs: Option<u64>,
    /// Largest image accepted, in bytes
    #[arg(long)]
    max_image_size: Option<u64>,
    /// Image cache size cap, in bytes
    #[arg(long)]
    max_cache_size: Option<u64>,
    /// Pause after this many records in total
    #[arg(long)]
    limit: Option<u64>,
    /// Do not write errors.jsonl
    #[arg(long)]
    no_error_log: bool,
    /// TOML file with pipeline settings
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl RunArgs {
    fn into_overrides(self) -> (FlagOverrides, Option<PathBuf>) {
        let flags = FlagOverrides {
            input: self.input,
            output_dir: self.output_dir,
            input_format: self.input_format,
            formats: self
                .format
                .into_iter()
                .map(|f| f.trim().to_ascii_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
            resume: self.resume,
            restart_on_mismatch: self.restart_on_mismatch,
            batch_size: self.batch_size,
            max_workers: self.max_workers,
            memory_limit: self.memory_limit,
            skip_optimization: self.skip_optimization,
            timeout_secs: self.timeout,
            checkpoint_records: self.checkpoint_records,
            checkpoint_secs: self.checkpoint_secs,
            max_image_bytes: self.max_image_size,
            max_cache_bytes: self.max_cache_size,
            limit: self.limit,
            no_error_log: self.no_error_log,
        };
        (flags, self.config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Status { output_dir } => {
            let manager = CheckpointManager::new(&output_dir, CommitPolicy::default());
            match manager.peek()? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("no checkpoint in {}", output_dir.display()),
            }
            Ok(())
        }
        Commands::Clear { output_dir } => {
            CheckpointManager::new(&output_dir, CommitPolicy::default()).clear()?;
            println!("checkpoint cleared in {}", output_dir.display());
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let (flags, file) = args.into_overrides();
    let config = config::load(flags, file.as_deref())?;
    config.validate()?;

    let orchestrator =
        Orchestrator::from_config(config).context("failed to set up the pipeline")?;

    let token = orchestrator.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, pausing");
            token.cancel();
        }
    });

    let result = orchestrator.run().await;
    interrupt.abort();

    let summary = result?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.state == PipelineState::Paused {
        tracing::info!(offset = summary.offset, "run paused, continue with --resume");
    }
    Ok(())
}
