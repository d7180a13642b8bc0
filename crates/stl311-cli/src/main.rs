use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use stl311_core::{RunState, SyncWindow};
use stl311_store::{PgStore, RunHistory};
use stl311_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stl311-cli")]
#[command(about = "St. Louis 311 sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync for the given window (default: yesterday).
    Sync {
        #[command(subcommand)]
        window: Option<WindowCommand>,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Show the most recent run summaries.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Debug, Subcommand)]
enum WindowCommand {
    Yesterday,
    LastDays {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    Range {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    SinceLastSuccess,
}

impl WindowCommand {
    fn into_window(self) -> SyncWindow {
        match self {
            Self::Yesterday => SyncWindow::Yesterday,
            Self::LastDays { days } => SyncWindow::LastDays(days),
            Self::Range { start, end } => SyncWindow::Range { start, end },
            Self::SinceLastSuccess => SyncWindow::SinceLastSuccess,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { window: None }) {
        Commands::Sync { window } => {
            let window = window
                .unwrap_or(WindowCommand::Yesterday)
                .into_window();
            let summary = stl311_sync::run_sync_once_from_env(window).await?;
            println!(
                "sync {}: run_id={} fetched={} accepted={} rejected={} inserted={} updated={} unchanged={}",
                summary.state.as_str(),
                summary.run_id,
                summary.counts.fetched,
                summary.counts.accepted,
                summary.counts.rejected,
                summary.counts.inserted,
                summary.counts.updated,
                summary.counts.unchanged,
            );
            if let Some(error) = &summary.last_error {
                eprintln!("last error: {error}");
            }
            if summary.state == RunState::Failed {
                std::process::exit(1);
            }
        }
        Commands::Schedule => {
            let scheduler = stl311_sync::scheduler_from_env().await?;
            scheduler.start().await?;
            let status = scheduler.status().await;
            println!(
                "scheduler running; next sync {:?}, next cleanup {:?}",
                status.next_sync_at, status.next_cleanup_at
            );
            tokio::signal::ctrl_c().await?;
            scheduler.stop().await?;
        }
        Commands::Runs { limit } => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            for run in store.recent_runs(limit).await? {
                println!(
                    "{} {} window={} fetched={} inserted={} updated={} unchanged={} error={}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.state.as_str(),
                    run.window,
                    run.counts.fetched,
                    run.counts.inserted,
                    run.counts.updated,
                    run.counts.unchanged,
                    run.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}
