//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use reelq_config::{DEFAULT_CONFIG_FILE, DatabaseConfig, ReelqConfig, load_config};
use reelq_core::JobPayload;
use reelq_db::{Connector, PgConnector, RetryPolicy, jobs, run_migrations};
use reelq_scheduler::recovery::recover_in_flight;
use sqlx::postgres::PgConnectOptions;
use std::path::{Path, PathBuf};

/// Load `path`, or `reelq.kdl` in the working directory when no path is
/// given. A missing default file means built-in defaults.
pub fn load(path: Option<&Path>) -> Result<ReelqConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                return Ok(ReelqConfig::default());
            }
            default
        }
    };
    load_config(&path).with_context(|| format!("Failed to load config: {}", path.display()))
}

/// Build the Postgres connector. `database_url` wins over the config block.
pub fn connector(db: &DatabaseConfig, database_url: Option<&str>) -> Result<PgConnector> {
    if let Some(url) = database_url {
        return PgConnector::from_url(url).context("Invalid DATABASE_URL");
    }

    let mut options = PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user)
        .database(&db.name);
    if let Some(password) = &db.password {
        options = options.password(password);
    }
    Ok(PgConnector::new(options))
}

pub fn retry_policy(config: &ReelqConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.scheduler.max_retry_times,
        config.scheduler.retry_delay,
    )
}

pub fn init(dir: &Path) -> Result<()> {
    let path = reelq_config::write_template(dir)
        .with_context(|| format!("Failed to initialize config in {}", dir.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

pub fn validate(path: Option<&Path>, json: bool) -> Result<()> {
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    match load_config(path) {
        Ok(mut config) => {
            if json {
                if config.database.password.is_some() {
                    config.database.password = Some("********".to_string());
                }
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Configuration is valid");
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub async fn migrate(connector: &PgConnector) -> Result<()> {
    run_migrations(connector.options())
        .await
        .context("Failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

/// Manual recovery pass: re-queue every in-flight job. Only safe while no
/// scheduler is running against the same table.
pub async fn recover(connector: &PgConnector, retry: &RetryPolicy) -> Result<()> {
    let mut conn = connector.connect().await.context("Failed to connect")?;
    let ids = recover_in_flight(conn.as_mut(), retry)
        .await
        .context("Recovery failed")?;
    conn.close().await.ok();
    println!("Re-queued {} job(s)", ids.len());
    Ok(())
}

pub async fn enqueue(
    connector: &PgConnector,
    retry: &RetryPolicy,
    payload: JobPayload,
) -> Result<()> {
    let mut conn = connector.connect().await.context("Failed to connect")?;
    let id = jobs::insert(conn.as_mut(), retry, payload)
        .await
        .context("Failed to enqueue job")?;
    conn.close().await.ok();
    println!("Enqueued job {}", id);
    Ok(())
}
