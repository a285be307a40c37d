//! The scheduler service command.

use anyhow::{Context, Result};
use reelq_config::ReelqConfig;
use reelq_db::{ConnectionPool, PgConnector};
use reelq_scheduler::{Scheduler, SchedulerConfig};
use std::sync::Arc;
use tracing::info;

use crate::command_job::CommandJob;
use crate::shutdown::install_shutdown_handler;

/// Run the scheduler until SIGINT/SIGTERM, or for a single pass with `once`.
pub async fn run(config: &ReelqConfig, connector: PgConnector, once: bool) -> Result<()> {
    let connector = Arc::new(connector);
    let job = Arc::new(CommandJob::new(&config.job)?);

    let pool = ConnectionPool::new(config.pool.max_connections, connector.clone())
        .await
        .context("Failed to open connection pool")?;

    let mut scheduler = Scheduler::new(
        connector,
        pool,
        job,
        SchedulerConfig::from(&config.scheduler),
    )
    .await
    .context("Failed to start scheduler")?;

    let stats = if once {
        let claimed = scheduler.run_once().await.context("Claim failed")?;
        info!(claimed, "Single pass claimed jobs, waiting for them to finish");
        scheduler.shutdown().await?
    } else {
        install_shutdown_handler(scheduler.handle());
        scheduler.run().await?
    };

    println!(
        "Recovered {}, claimed {}, dispatched {}",
        stats.recovered, stats.claimed, stats.dispatched
    );
    Ok(())
}
