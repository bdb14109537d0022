use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use olr_sync::{report_recent_runs, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "olr-cli")]
#[command(about = "Order ledger reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and exit.
    Sync,
    /// Run passes on the configured cron schedule until interrupted.
    Daemon,
    /// Rewrite review labels across one year of order ledgers.
    BackfillReviews {
        #[arg(long)]
        year: i32,
    },
    /// Print the most recent run summaries.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = SyncPipeline::from_config(config)?.run_once().await?;
            println!(
                "sync complete: run_id={} orders={} tables={} written={} failed={} reports={}",
                summary.run_id,
                summary.fetched_orders,
                summary.tables.len(),
                summary.written_tables(),
                summary.failed_tables(),
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            if summary.failed_tables() > 0 {
                anyhow::bail!("{} table(s) failed to reconcile", summary.failed_tables());
            }
        }
        Commands::Daemon => {
            let pipeline = Arc::new(SyncPipeline::from_config(config)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set OLR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::BackfillReviews { year } => {
            let outcomes = SyncPipeline::from_config(config)?
                .backfill_reviews(year)
                .await?;
            for outcome in &outcomes {
                println!(
                    "{}: updated_cells={} written={}",
                    outcome.table, outcome.updated_cells, outcome.written
                );
            }
            println!("backfill complete: tables={}", outcomes.len());
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(runs, &config.workspace_root)?);
        }
    }

    Ok(())
}
