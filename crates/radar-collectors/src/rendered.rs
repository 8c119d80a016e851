//! Rendered-page collector: drives a WebDriver browser session over the
//! Meme Rush rank page and extracts rows by strategy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use radar_core::{attr, CollectorKind, Item};
use radar_storage::DebugArtifactStore;
use tracing::{error, info, warn};

use crate::strategy::{default_strategies, run_strategies, ExtractionStrategy, StrategyOutcome};
use crate::webdriver::{BrowserOptions, WebDriverSession};
use crate::{Collector, CollectorError, CollectorProfile};

pub const MEME_RUSH_URL: &str = "https://web3.binance.com/zh-CN/meme-rush/rank?chain=bsc";

#[derive(Debug, Clone)]
pub struct RenderedPageOptions {
    pub page_url: String,
    pub webdriver_url: String,
    pub browser: BrowserOptions,
    pub settle: Duration,
    pub max_rows: usize,
    pub max_init_failures: u32,
    pub init_retry_delay: Duration,
}

impl Default for RenderedPageOptions {
    fn default() -> Self {
        Self {
            page_url: MEME_RUSH_URL.to_string(),
            webdriver_url: "http://localhost:9515".to_string(),
            browser: BrowserOptions::default(),
            settle: Duration::from_secs(5),
            max_rows: 50,
            max_init_failures: 3,
            init_retry_delay: Duration::from_secs(2),
        }
    }
}

pub struct RenderedPageCollector {
    options: RenderedPageOptions,
    strategies: Vec<ExtractionStrategy>,
    debug: Option<DebugArtifactStore>,
    session: Option<WebDriverSession>,
    init_failures: u32,
}

impl RenderedPageCollector {
    pub fn new(options: RenderedPageOptions) -> Self {
        Self {
            options,
            strategies: default_strategies(),
            debug: None,
            session: None,
            init_failures: 0,
        }
    }

    pub fn with_debug_store(mut self, store: DebugArtifactStore) -> Self {
        self.debug = Some(store);
        self
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Hand out the live session, recreating it if it died. Consecutive
    /// start failures past the limit become `SessionUnavailable`.
    async fn acquire_session(&mut self) -> Result<WebDriverSession, CollectorError> {
        if let Some(session) = self.session.take() {
            if session.is_alive().await {
                return Ok(session);
            }
            warn!(session_id = session.id(), "browser session found dead; recreating");
            session.quit().await;
        }

        match WebDriverSession::start(&self.options.webdriver_url, &self.options.browser).await {
            Ok(session) => {
                info!(session_id = session.id(), headless = self.options.browser.headless, "browser session ready");
                self.init_failures = 0;
                Ok(session)
            }
            Err(err) => {
                self.init_failures += 1;
                if self.init_failures >= self.options.max_init_failures {
                    error!(attempts = self.init_failures, error = %err, "browser session could not be initialized");
                    Err(CollectorError::SessionUnavailable {
                        attempts: self.init_failures,
                        last: err,
                    })
                } else {
                    warn!(attempts = self.init_failures, error = %err, "browser session start failed");
                    Err(CollectorError::Browser(err))
                }
            }
        }
    }

    async fn scrape(&self, session: &WebDriverSession) -> Result<Vec<Item>, CollectorError> {
        let url = &self.options.page_url;
        info!(%url, "loading rendered page");
        session.navigate(url).await?;
        tokio::time::sleep(self.options.settle).await;

        match run_strategies(session, &self.strategies, self.options.max_rows).await? {
            Some(outcome) => Ok(rows_to_items(outcome)),
            None => {
                self.capture_page(session).await;
                Err(CollectorError::NoRows {
                    url: url.clone(),
                    strategies: self.strategies.len(),
                })
            }
        }
    }

    async fn capture_page(&self, session: &WebDriverSession) {
        let Some(store) = &self.debug else {
            return;
        };
        match session.page_source().await {
            Ok(html) => match store.store_page(Utc::now(), &html).await {
                Ok(stored) => warn!(
                    path = %stored.latest_path.display(),
                    bytes = stored.byte_size,
                    "no rows extracted; page source saved for inspection"
                ),
                Err(err) => warn!(error = %err, "saving page source failed"),
            },
            Err(err) => warn!(error = %err, "reading page source failed"),
        }
    }
}

fn rows_to_items(outcome: StrategyOutcome) -> Vec<Item> {
    let observed_at = Utc::now();
    outcome
        .rows
        .into_iter()
        .map(|row| {
            let mut item = Item::new(row.text.clone(), observed_at)
                .with_attr(attr::RAW_TEXT, row.text)
                .with_attr(attr::RANK, row.rank.to_string());
            if let Some(preview) = row.html_preview {
                item = item.with_attr(attr::HTML_PREVIEW, preview);
            }
            item
        })
        .collect()
}

#[async_trait]
impl Collector for RenderedPageCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::RenderedPage
    }

    fn profile(&self) -> CollectorProfile {
        CollectorProfile {
            label: "Binance Meme Rush".to_string(),
            link: Some(self.options.page_url.clone()),
        }
    }

    async fn prepare(&mut self) -> Result<(), CollectorError> {
        loop {
            match self.acquire_session().await {
                Ok(session) => {
                    self.session = Some(session);
                    return Ok(());
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => tokio::time::sleep(self.options.init_retry_delay).await,
            }
        }
    }

    async fn collect(&mut self) -> Result<Vec<Item>, CollectorError> {
        let session = self.acquire_session().await?;
        let outcome = self.scrape(&session).await;
        match &outcome {
            Err(CollectorError::Browser(err)) if err.is_session_loss() => {
                warn!(error = %err, "browser session lost during collection; will recreate next cycle");
            }
            _ => self.session = Some(session),
        }
        outcome
    }

    async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.quit().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeDriver {
        created: u32,
        live: HashSet<String>,
        navigations: Vec<String>,
        element_rows: Vec<String>,
        script_rows: Vec<(String, String)>,
        source: String,
    }

    type Shared = Arc<Mutex<FakeDriver>>;

    fn gone() -> (StatusCode, Json<Value>) {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"value": {"error": "invalid session id", "message": "session deleted"}})),
        )
    }

    fn ok(value: Value) -> (StatusCode, Json<Value>) {
        (StatusCode::OK, Json(json!({ "value": value })))
    }

    fn fake_driver_router(state: Shared) -> Router {
        Router::new()
            .route(
                "/session",
                post(|State(s): State<Shared>| async move {
                    let mut d = s.lock().unwrap();
                    d.created += 1;
                    let id = format!("s{}", d.created);
                    d.live.insert(id.clone());
                    ok(json!({"sessionId": id, "capabilities": {}}))
                }),
            )
            .route(
                "/session/{id}",
                axum::routing::delete(|State(s): State<Shared>, Path(id): Path<String>| async move {
                    s.lock().unwrap().live.remove(&id);
                    ok(Value::Null)
                }),
            )
            .route(
                "/session/{id}/url",
                get(|State(s): State<Shared>, Path(id): Path<String>| async move {
                    if s.lock().unwrap().live.contains(&id) {
                        ok(json!("about:blank"))
                    } else {
                        gone()
                    }
                })
                .post(
                    |State(s): State<Shared>, Path(id): Path<String>, Json(body): Json<Value>| async move {
                        let mut d = s.lock().unwrap();
                        if !d.live.contains(&id) {
                            return gone();
                        }
                        d.navigations.push(body["url"].as_str().unwrap_or_default().to_string());
                        ok(Value::Null)
                    },
                ),
            )
            .route(
                "/session/{id}/elements",
                post(|State(s): State<Shared>| async move {
                    let d = s.lock().unwrap();
                    let refs: Vec<Value> = (0..d.element_rows.len())
                        .map(|i| json!({ "element-6066-11e4-a52e-4f735466cecf": format!("e{i}") }))
                        .collect();
                    ok(Value::Array(refs))
                }),
            )
            .route(
                "/session/{id}/element/{eid}/text",
                get(|State(s): State<Shared>, Path((_id, eid)): Path<(String, String)>| async move {
                    let d = s.lock().unwrap();
                    let idx: usize = eid.trim_start_matches('e').parse().unwrap();
                    ok(json!(d.element_rows[idx]))
                }),
            )
            .route(
                "/session/{id}/execute/sync",
                post(|State(s): State<Shared>| async move {
                    let d = s.lock().unwrap();
                    let rows: Vec<Value> = d
                        .script_rows
                        .iter()
                        .map(|(text, html)| json!({"text": text, "html": html}))
                        .collect();
                    ok(Value::Array(rows))
                }),
            )
            .route(
                "/session/{id}/source",
                get(|State(s): State<Shared>| async move { ok(json!(s.lock().unwrap().source.clone())) }),
            )
            .with_state(state)
    }

    async fn spawn_driver(state: Shared) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, fake_driver_router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn options(webdriver_url: String) -> RenderedPageOptions {
        RenderedPageOptions {
            page_url: "https://example.test/rank".to_string(),
            webdriver_url,
            settle: Duration::ZERO,
            init_retry_delay: Duration::ZERO,
            max_init_failures: 2,
            ..RenderedPageOptions::default()
        }
    }

    #[tokio::test]
    async fn element_rows_become_items_keyed_by_text() {
        let state = Shared::default();
        state.lock().unwrap().element_rows = vec!["1 PEPE2 $1.2M".into(), "".into(), "3 WOJAK $800K".into()];
        let base = spawn_driver(state.clone()).await;

        let mut collector = RenderedPageCollector::new(options(base));
        let items = collector.collect().await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].identity, "1 PEPE2 $1.2M");
        assert_eq!(items[1].attr(attr::RANK), Some("3"));
        assert!(collector.has_session());
        assert_eq!(state.lock().unwrap().navigations, vec!["https://example.test/rank"]);
    }

    #[tokio::test]
    async fn script_fallback_runs_when_specific_selectors_miss() {
        let state = Shared::default();
        state.lock().unwrap().script_rows = vec![("DOGEX +41%".into(), "<div class=\"rank\">".into())];
        let base = spawn_driver(state).await;

        let mut collector = RenderedPageCollector::new(options(base));
        let items = collector.collect().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attr(attr::HTML_PREVIEW), Some("<div class=\"rank\">"));
    }

    #[tokio::test]
    async fn empty_page_is_an_error_and_leaves_a_capture() {
        let state = Shared::default();
        state.lock().unwrap().source = "<html><body>blocked</body></html>".into();
        let base = spawn_driver(state).await;
        let dir = tempdir().unwrap();

        let mut collector =
            RenderedPageCollector::new(options(base)).with_debug_store(DebugArtifactStore::new(dir.path()));
        let err = collector.collect().await.unwrap_err();

        assert!(matches!(err, CollectorError::NoRows { strategies: 2, .. }));
        assert!(!err.is_fatal());
        let saved = std::fs::read_to_string(dir.path().join(DebugArtifactStore::LATEST_PAGE)).unwrap();
        assert!(saved.contains("blocked"));
    }

    #[tokio::test]
    async fn dead_session_is_recreated_on_next_collect() {
        let state = Shared::default();
        state.lock().unwrap().element_rows = vec!["row".into()];
        let base = spawn_driver(state.clone()).await;

        let mut collector = RenderedPageCollector::new(options(base));
        collector.prepare().await.unwrap();
        state.lock().unwrap().live.clear();

        let items = collector.collect().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(state.lock().unwrap().created, 2);
    }

    #[tokio::test]
    async fn repeated_start_failures_become_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut collector = RenderedPageCollector::new(options(format!("http://{addr}")));
        let first = collector.collect().await.unwrap_err();
        assert!(matches!(first, CollectorError::Browser(_)));
        assert!(!first.is_fatal());

        let second = collector.collect().await.unwrap_err();
        assert!(matches!(second, CollectorError::SessionUnavailable { attempts: 2, .. }));
        assert!(second.is_fatal());
    }

    #[tokio::test]
    async fn prepare_gives_up_after_the_failure_limit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut collector = RenderedPageCollector::new(options(format!("http://{addr}")));
        let err = collector.prepare().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
