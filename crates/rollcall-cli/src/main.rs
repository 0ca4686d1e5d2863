use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rollcall_engine::Config;

mod replay;
mod store_cmd;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Rollcall attendance biometrics tool")]
struct Cli {
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show encoding store statistics.
    Status,
    /// List enrolled subjects.
    List,
    /// Remove a subject's encodings and reference images.
    Remove { subject_id: String },
    /// Delete every stored encoding.
    Reset {
        /// Required; there is no undo.
        #[arg(long)]
        yes: bool,
    },
    /// Match a feature vector against the stored encodings.
    Match {
        /// JSON array of numbers, or `@path` to read it from a file.
        #[arg(long)]
        query: String,
        /// Similarity threshold (defaults to ROLLCALL_SIMILARITY_THRESHOLD).
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Run the blink detector over a recorded EAR sequence.
    ReplayBlink {
        /// Comma-separated EAR samples, e.g. `0.30,0.30,0.15,0.15,0.30`.
        #[arg(long, value_delimiter = ',', required = true, allow_hyphen_values = true)]
        ears: Vec<f32>,
        /// Time between samples.
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,
        /// `fixed` or `adaptive` (defaults to ROLLCALL_BLINK_STRATEGY).
        #[arg(long)]
        strategy: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid ROLLCALL_* configuration")?;

    match cli.cmd {
        Commands::Status => store_cmd::status(&config, cli.json).await,
        Commands::List => store_cmd::list(&config, cli.json).await,
        Commands::Remove { subject_id } => store_cmd::remove(&config, &subject_id).await,
        Commands::Reset { yes } => store_cmd::reset(&config, yes).await,
        Commands::Match { query, threshold } => {
            store_cmd::match_query(&config, &query, threshold, cli.json).await
        }
        Commands::ReplayBlink {
            ears,
            interval_ms,
            strategy,
        } => replay::run(&config, &ears, interval_ms, strategy.as_deref(), cli.json),
    }
}
