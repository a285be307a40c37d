//! reelq: polling scheduler for video generation jobs.

use clap::{Parser, Subcommand};
use reelq_config::ReelqConfig;
use reelq_core::JobPayload;
use reelq_db::PgConnector;
use std::path::PathBuf;

mod command_job;
mod commands;
mod logging;
mod shutdown;

#[derive(Parser)]
#[command(name = "reelq")]
#[command(about = "Polling job scheduler for video generation tasks", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./reelq.kdl when present)
    #[arg(long, short, env = "REELQ_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database URL, overrides the config's database block
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler
    Run {
        /// Claim and dispatch a single batch, then drain and exit
        #[arg(long)]
        once: bool,
    },
    /// Write a starter reelq.kdl
    Init {
        /// Target directory
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        path: Option<PathBuf>,
        /// Print the resolved configuration as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations
    Migrate,
    /// Re-queue jobs left in flight (no scheduler may be running)
    Recover,
    /// Insert a pending job
    Enqueue {
        /// Prompt passed to the job command
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, default_value_t = 1280)]
        width: i32,
        #[arg(long, default_value_t = 720)]
        height: i32,
        /// Task identifier, generated when omitted
        #[arg(long)]
        task_uuid: Option<String>,
    },
}

/// Load the config, install logging and build the store connector.
fn setup(cli: &Cli) -> anyhow::Result<(ReelqConfig, PgConnector)> {
    let config = commands::load(cli.config.as_deref())?;
    if let Some(path) = logging::init(config.log_path.as_deref(), cli.log_json)? {
        tracing::info!(path = %path.display(), "Logging to file");
    }
    let connector = commands::connector(&config.database, cli.database_url.as_deref())?;
    Ok((config, connector))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { dir } => {
            logging::init(None, cli.log_json)?;
            commands::init(dir)?;
        }
        Commands::Validate { path, json } => {
            logging::init(None, cli.log_json)?;
            commands::validate(path.as_deref().or(cli.config.as_deref()), *json)?;
        }
        Commands::Run { once } => {
            let (config, connector) = setup(&cli)?;
            commands::run::run(&config, connector, *once).await?;
        }
        Commands::Migrate => {
            let (_, connector) = setup(&cli)?;
            commands::migrate(&connector).await?;
        }
        Commands::Recover => {
            let (config, connector) = setup(&cli)?;
            commands::recover(&connector, &commands::retry_policy(&config)).await?;
        }
        Commands::Enqueue {
            prompt,
            width,
            height,
            task_uuid,
        } => {
            let (config, connector) = setup(&cli)?;
            let payload = JobPayload {
                task_uuid: task_uuid
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
                prompt: prompt.clone(),
                width: *width,
                height: *height,
            };
            commands::enqueue(&connector, &commands::retry_policy(&config), payload).await?;
        }
    }

    Ok(())
}
