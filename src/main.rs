use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ocea_collector::auth::AuthClient;
use ocea_collector::clock::SystemClock;
use ocea_collector::config::{default_config_path, Config};
use ocea_collector::engine::Reconciler;
use ocea_collector::fetch::DataFetcher;
use ocea_collector::poller::Poller;
use ocea_collector::stats::JsonlStatisticsSink;
use ocea_collector::store::JsonFileStore;

#[derive(Parser)]
#[command(name = "ocea-collector", version, about = "Utility consumption collector")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll once and print the per-fluid report.
    Fetch,
    /// Poll on the configured interval until interrupted.
    Run,
    /// Print the resolved configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = Config::load_or_default(&config_path)?;

    match cli.command {
        Command::Config => {
            println!("config file: {}", config_path.display());
            println!("username: {}", config.username);
            println!("data dir: {}", config.resolve_data_dir(&config_path).display());
            println!("update interval: {}s (jitter {}s)", config.update_interval, config.update_jitter);
            Ok(())
        }
        Command::Fetch => {
            let poller = build_poller(&config, &config_path)?;
            let results = poller.poll_once().await.context("poll failed")?;
            for (fluid, result) in &results {
                println!("{} ({})", fluid.label(), result.unit);
                match result.total {
                    Some(total) => println!("  total: {total} {}", result.unit),
                    None => println!("  total: unavailable"),
                }
                println!("  status: {}", result.value_status);
                match result.daily {
                    Some(daily) => println!(
                        "  daily: {daily} {} ({})",
                        result.unit, result.daily_status
                    ),
                    None => println!("  daily: none ({})", result.daily_status),
                }
                if let Some(estimate) = result.estimated_today {
                    println!("  estimated today: {estimate} {}", result.unit);
                }
                if let Some(date) = result.latest_date {
                    println!("  as of: {date}");
                }
                println!("  leak: {}", result.leak_estimate);
            }
            Ok(())
        }
        Command::Run => {
            let poller = Arc::new(build_poller(&config, &config_path)?);
            let refresh = poller.refresh_handle();

            // SIGHUP doubles as the "fetch now" trigger.
            tokio::spawn(async move {
                let Ok(mut hangup) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                else {
                    return;
                };
                while hangup.recv().await.is_some() {
                    refresh.notify_one();
                }
            });

            let interval = config.update_interval;
            let jitter = config.update_jitter;
            tokio::select! {
                _ = poller.run(interval, jitter) => {}
                result = tokio::signal::ctrl_c() => {
                    result.context("waiting for shutdown signal")?;
                    tracing::info!("shutting down");
                }
            }
            Ok(())
        }
    }
}

fn build_poller(config: &Config, config_path: &std::path::Path) -> anyhow::Result<Poller> {
    if config.username.is_empty() || config.password.is_empty() {
        bail!(
            "username and password must be set in {}",
            config_path.display()
        );
    }

    let auth = Arc::new(AuthClient::new(
        config.username.clone(),
        config.password.clone(),
    )?);
    let clock = Arc::new(SystemClock);
    let fetcher = DataFetcher::new(auth, clock.clone());

    let data_dir = config.resolve_data_dir(config_path);
    let sink = Arc::new(JsonlStatisticsSink::new(data_dir.join("statistics")));
    let store = Arc::new(JsonFileStore::new(data_dir.join("state.json")));
    let reconciler = Reconciler::new(sink, clock, "ocea");

    Ok(Poller::new(fetcher, reconciler, store))
}
