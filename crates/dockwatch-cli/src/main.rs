use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dockwatch_monitor::{maybe_build_scheduler, Monitor, MonitorConfig, SourceRegistry};
use dockwatch_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dockwatch")]
#[command(about = "Marine dealer inventory monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one monitor pass over every enabled source.
    Run,
    /// Serve the JSON dashboard.
    Serve,
    /// Keep running monitor passes on the configured cron schedule.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();
    let registry = Arc::new(SourceRegistry::load(config.sources_path.clone()).await?);
    let monitor = Arc::new(Monitor::from_config(&config)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = monitor.run_all(&registry).await;
            for report in &summary.reports {
                match (&report.outcome, &report.error) {
                    (Some(outcome), _) => println!(
                        "{}: {} listings over {} pages, {} changes{}",
                        report.source_key,
                        outcome.listing_count,
                        outcome.pages_fetched,
                        outcome.changes.total_changes(),
                        if outcome.notified { ", notified" } else { "" },
                    ),
                    (None, Some(error)) => println!("{}: failed: {}", report.source_key, error),
                    (None, None) => {}
                }
            }
        }
        Commands::Serve => {
            info!("serving dashboard");
            dockwatch_web::serve(AppState::new(monitor, registry)).await?;
        }
        Commands::Schedule => {
            let mut forced = config.clone();
            forced.scheduler_enabled = true;
            let scheduler = maybe_build_scheduler(&forced, monitor, registry)
                .await?
                .context("scheduler should be enabled")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %forced.monitor_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
