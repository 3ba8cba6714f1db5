//! fanout CLI: run a command once per input line with bounded concurrency.

use clap::{Parser, Subcommand};
use fanout::config::Config;
use fanout::engine::concurrency_bound;
use fanout::job::Job;
use fanout::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

#[derive(Parser)]
#[command(name = "fanout", about = "Run a command per item, at most N at a time")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command for every line of input
    Run {
        /// Maximum commands in flight (defaults to FANOUT_MAX_CONCURRENCY or 1)
        #[arg(long, short = 'j', allow_negative_numbers = true)]
        max_concurrency: Option<i64>,
        /// Read items from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
        /// Command and arguments; `{}` is the item, `{#}` its position
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run a TOML job file
    Job {
        /// Path to the job file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "fanout".to_string(),
        log_level: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Run {
            max_concurrency,
            input,
            command,
        } => cmd_run(&config, max_concurrency, input, command).await,
        Command::Job { path } => {
            Job::load(&path)?.run().await?;
            Ok(())
        }
    }
}

async fn cmd_run(
    config: &Config,
    max_concurrency: Option<i64>,
    input: Option<PathBuf>,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let bound = match max_concurrency {
        Some(n) => concurrency_bound(n)?,
        None => config.max_concurrency,
    };

    let raw = match input {
        Some(path) => tokio::fs::read_to_string(&path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    let items = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string);

    let bound = i64::try_from(bound)?;
    Job::new(command)
        .items(items)
        .max_concurrency(bound)
        .run()
        .await?;
    Ok(())
}
