//! Collector contract plus the structured-API and rendered-page implementations.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use radar_core::{CollectorKind, Item, MonitorConfig};
use radar_storage::{DebugArtifactStore, HttpClientConfig, HttpFetcher};
use thiserror::Error;

pub mod alpha;
pub mod rendered;
pub mod strategy;
pub mod webdriver;

pub use alpha::{AlphaApiCollector, ALPHA_TOKEN_LIST_URL};
pub use rendered::{RenderedPageCollector, RenderedPageOptions, MEME_RUSH_URL};
pub use strategy::{default_strategies, run_strategies, ExtractionStrategy, StaticPage, StrategyKind};
pub use webdriver::{BrowserOptions, BrowserSessionError, WebDriverSession};

pub const CRATE_NAME: &str = "radar-collectors";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },
    #[error("upstream returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("unexpected envelope from {url}: {detail}")]
    Envelope { url: String, detail: String },
    #[error("malformed payload from {url}: {detail}")]
    Parse { url: String, detail: String },
    #[error("no rows extracted from {url} after {strategies} strategies")]
    NoRows { url: String, strategies: usize },
    #[error("browser session error: {0}")]
    Browser(#[from] BrowserSessionError),
    #[error("browser session unavailable after {attempts} attempts: {last}")]
    SessionUnavailable { attempts: u32, last: BrowserSessionError },
}

impl CollectorError {
    /// Only a browser that cannot be started at all stops the poll loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionUnavailable { .. })
    }
}

/// How a collector presents itself in alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorProfile {
    pub label: String,
    pub link: Option<String>,
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn kind(&self) -> CollectorKind;
    fn profile(&self) -> CollectorProfile;

    /// Acquire long-lived resources before the first cycle.
    async fn prepare(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }

    /// The current remote collection, most significant first. An empty list
    /// means the source legitimately reported nothing.
    async fn collect(&mut self) -> Result<Vec<Item>, CollectorError>;

    async fn shutdown(&mut self) {}
}

/// Process-level inputs a collector needs beyond `MonitorConfig`.
#[derive(Debug, Clone)]
pub struct CollectorEnv {
    pub webdriver_url: String,
    pub debug_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout: Duration,
}

impl Default for CollectorEnv {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            debug_dir: PathBuf::from("logs"),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36".to_string(),
            http_timeout: Duration::from_secs(15),
        }
    }
}

pub fn collector_for(config: &MonitorConfig, env: &CollectorEnv) -> Result<Box<dyn Collector>> {
    match config.collector {
        CollectorKind::AlphaApi => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: env.http_timeout,
                user_agent: Some(env.user_agent.clone()),
                ..Default::default()
            })?;
            let url = config
                .source_url
                .clone()
                .unwrap_or_else(|| ALPHA_TOKEN_LIST_URL.to_string());
            Ok(Box::new(AlphaApiCollector::new(http, url)))
        }
        CollectorKind::RenderedPage => {
            let options = RenderedPageOptions {
                page_url: config
                    .source_url
                    .clone()
                    .unwrap_or_else(|| MEME_RUSH_URL.to_string()),
                webdriver_url: env.webdriver_url.clone(),
                browser: BrowserOptions {
                    headless: config.headless,
                    user_agent: env.user_agent.clone(),
                    ..BrowserOptions::default()
                },
                settle: Duration::from_secs(config.settle_secs),
                max_rows: config.max_rows.max(1),
                ..RenderedPageOptions::default()
            };
            Ok(Box::new(
                RenderedPageCollector::new(options)
                    .with_debug_store(DebugArtifactStore::new(env.debug_dir.clone())),
            ))
        }
    }
}
