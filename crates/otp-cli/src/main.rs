use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use otp_poll::{poller_from_env, Scheduler};
use tracing::info;

/// All settings come from the environment (PROVIDER_API_ROOT, S3_BUCKET, ...).
#[derive(Debug, Parser)]
#[command(name = "otp")]
#[command(about = "Poll a JSON provider and store each distinct projection once")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on PROVIDER_REFRESH_INTERVAL until interrupted.
    Run,
    /// Run a single poll cycle and exit.
    Once,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let (config, poller) = poller_from_env()?;
    poller
        .provision()
        .await
        .with_context(|| format!("provisioning container {}", config.container))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!(
                url = %config.provider_url,
                expression = %config.expression,
                interval_ms = config.refresh_interval.as_millis() as u64,
                container = %config.container,
                "poller started"
            );
            let scheduler = Scheduler::new(config.refresh_interval);
            tokio::select! {
                _ = poller.run(&scheduler) => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listening for ctrl-c")?;
                    let stats = poller.stats();
                    info!(
                        cycles = stats.cycles,
                        written = stats.written,
                        skipped = stats.skipped,
                        failed = stats.failed,
                        "poller stopped"
                    );
                }
            }
        }
        Commands::Once => {
            let report = poller.poll_once(Utc::now()).await?;
            println!(
                "cycle complete: cycle_id={} key={} bytes={} written={}",
                report.cycle_id, report.key, report.bytes, report.written
            );
        }
    }

    Ok(())
}
