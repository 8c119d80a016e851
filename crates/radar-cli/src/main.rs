use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use radar_collectors::{default_strategies, run_strategies, StaticPage};
use radar_core::MonitorConfig;
use radar_storage::ConfigStore;
use radar_sync::{build_monitor, CycleKind, PollLoop, RadarSettings};
use radar_web::AppState;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "radar")]
#[command(about = "Listing radar: poll a token catalog and push alerts for new listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the poll loop and the dashboard.
    Serve,
    /// Run one persisted cycle and exit.
    Once,
    /// Write the default config file if it is missing.
    InitConfig,
    /// Exercise a running server's API.
    Probe {
        #[arg(long, default_value = "http://localhost:5002")]
        base_url: String,
        /// Also send a test push.
        #[arg(long)]
        push: bool,
    },
    /// Run the extraction strategies against a saved page source.
    Replay {
        #[arg(long)]
        html: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,radar=info")))
        .init();

    let cli = Cli::parse();
    let settings = RadarSettings::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&settings).await?,
        Commands::Once => once(&settings).await?,
        Commands::InitConfig => {
            let store = ConfigStore::new(settings.config_path.clone());
            if store.ensure_default().await? {
                println!("wrote default config to {}", store.path().display());
            } else {
                println!("config already exists at {}", store.path().display());
            }
        }
        Commands::Probe { base_url, push } => probe(&base_url, push).await?,
        Commands::Replay { html, limit } => replay(html, limit).await?,
    }

    Ok(())
}

async fn serve(settings: &RadarSettings) -> Result<()> {
    let monitor = Arc::new(build_monitor(settings).await?);
    let port = match settings.web_port {
        Some(port) => port,
        None => monitor.config().await.webui_port,
    };

    let poll = PollLoop::new(monitor.clone()).spawn();
    let web = tokio::spawn(radar_web::serve(AppState::new(monitor.clone()), port));

    tokio::select! {
        result = poll => {
            match result.context("poll loop task panicked")? {
                Ok(()) => Ok(()),
                Err(err) => {
                    error!(error = %err, "poll loop stopped");
                    Err(err.into())
                }
            }
        }
        result = web => {
            result.context("dashboard task panicked")?.context("dashboard server failed")
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            monitor.shutdown().await;
            Ok(())
        }
    }
}

async fn once(settings: &RadarSettings) -> Result<()> {
    let monitor = build_monitor(settings).await?;
    let mut poll = monitor.restore().await;
    monitor.prepare().await?;
    let outcome = monitor.run_cycle(&mut poll).await;
    monitor.shutdown().await;

    match outcome?.kind {
        CycleKind::Baseline { total } => println!("baseline stored: {total} items, no alerts sent"),
        CycleKind::Completed { total, new, notify } => {
            println!("cycle complete: {total} items, {new} new");
            if let Some(report) = notify {
                println!(
                    "notifications: delivered={} failed={} skipped={}",
                    report.delivered, report.failed, report.skipped
                );
            }
        }
        CycleKind::Empty => bail!("collector returned no items; snapshot left unchanged"),
        CycleKind::Failed { error } => bail!("collection failed: {error}"),
    }
    Ok(())
}

async fn probe(base_url: &str, push: bool) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let base = base_url.trim_end_matches('/');

    let mut endpoints = vec!["api/state", "api/config", "api/check_now"];
    if push {
        endpoints.push("api/test_push");
    }

    for endpoint in endpoints {
        let url = format!("{base}/{endpoint}");
        let resp = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("decoding {url}"))?;
        println!("== {endpoint} ({status})");
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}

async fn replay(html: PathBuf, limit: Option<usize>) -> Result<()> {
    let source = tokio::fs::read_to_string(&html)
        .await
        .with_context(|| format!("reading {}", html.display()))?;
    let page = StaticPage::new(source);
    let limit = limit.unwrap_or(MonitorConfig::default().max_rows);

    match run_strategies(&page, &default_strategies(), limit).await? {
        Some(outcome) => {
            println!("strategy {} matched {} rows", outcome.strategy, outcome.rows.len());
            for row in outcome.rows {
                println!("#{} {}", row.rank, row.text.replace('\n', " | "));
            }
        }
        None => println!("no strategy matched any rows in {}", html.display()),
    }
    Ok(())
}
