//! Axum + Askama dashboard and introspection endpoints for the radar.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use radar_core::{attr, CollectorKind, Item, NotifyMethod, NotifyTarget};
use radar_sync::Monitor;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "radar-web";

/// Cards rendered on the dashboard.
const DASHBOARD_CARDS: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}

#[derive(Debug, Clone)]
struct ItemCard {
    rank: usize,
    title: String,
    subtitle: String,
    chain: String,
    contract: String,
    raw_text: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    label: String,
    source_link: String,
    total: usize,
    new_count: usize,
    displayed: usize,
    last_check: String,
    interval_minutes: u64,
    cards: Vec<ItemCard>,
}

#[derive(Template)]
#[template(path = "manage.html")]
struct ManageTemplate {
    label: String,
    check_interval: u64,
    notify_method: &'static str,
    collector: &'static str,
    config_path: String,
    targets: Vec<NotifyTarget>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/manage", get(manage_handler))
        .route("/api/state", get(api_state_handler))
        .route("/api/config", get(api_config_handler))
        .route("/api/check_now", get(api_check_now_handler))
        .route("/api/test_push", get(api_test_push_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.monitor.state().snapshot().await;
    let config = state.monitor.config().await;
    let profile = state.monitor.profile();

    let cards: Vec<ItemCard> = snapshot
        .items
        .iter()
        .take(DASHBOARD_CARDS)
        .enumerate()
        .map(|(idx, item)| item_card(idx + 1, item))
        .collect();

    render_html(IndexTemplate {
        label: profile.label.clone(),
        source_link: profile.link.clone().unwrap_or_default(),
        total: snapshot.item_count,
        new_count: snapshot.new_count,
        displayed: cards.len(),
        last_check: format_last_check(snapshot.last_check),
        interval_minutes: config.check_interval / 60,
        cards,
    })
}

async fn manage_handler(State(state): State<Arc<AppState>>) -> Response {
    let config = state.monitor.config().await.redacted();
    render_html(ManageTemplate {
        label: state.monitor.profile().label.clone(),
        check_interval: config.check_interval,
        notify_method: match config.notify_method {
            NotifyMethod::None => "none",
            NotifyMethod::Push => "push",
            NotifyMethod::Both => "both",
        },
        collector: match config.collector {
            CollectorKind::AlphaApi => "alpha_api",
            CollectorKind::RenderedPage => "rendered_page",
        },
        config_path: state.monitor.config_path().display().to_string(),
        targets: config.notify_targets,
    })
}

async fn api_state_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.monitor.state().snapshot().await).into_response()
}

async fn api_config_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.monitor.config().await.redacted()).into_response()
}

async fn api_check_now_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.check_now().await {
        Ok(report) if report.total == 0 => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": "upstream returned no items"})),
        )
            .into_response(),
        Ok(report) => Json(json!({
            "status": "success",
            "total": report.total,
            "new": report.new,
            "message": format!("Check complete: {} items, {} new", report.total, report.new),
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "manual check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn api_test_push_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.monitor.send_test_notification().await;
    let (status, message) = if report.suppressed {
        ("skipped", "push notifications are disabled".to_string())
    } else if report.delivered > 0 {
        (
            "success",
            format!(
                "test notification delivered to {} target(s), {} failed",
                report.delivered, report.failed
            ),
        )
    } else if report.failed > 0 {
        ("error", format!("all {} enabled target(s) failed", report.failed))
    } else {
        ("error", "no enabled notification targets".to_string())
    };
    Json(json!({"status": status, "message": message})).into_response()
}

fn item_card(rank: usize, item: &Item) -> ItemCard {
    if let Some(raw) = item.attr(attr::RAW_TEXT) {
        let title = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or(raw);
        return ItemCard {
            rank: item.attr(attr::RANK).and_then(|r| r.parse().ok()).unwrap_or(rank),
            title: title.trim().to_string(),
            subtitle: String::new(),
            chain: String::new(),
            contract: String::new(),
            raw_text: raw.to_string(),
        };
    }
    ItemCard {
        rank,
        title: item.attr(attr::SYMBOL).unwrap_or(&item.identity).to_string(),
        subtitle: item.attr(attr::NAME).unwrap_or_default().to_string(),
        chain: item
            .attr(attr::CHAIN_NAME)
            .or(item.attr(attr::CHAIN))
            .unwrap_or_default()
            .to_string(),
        contract: item
            .attr(attr::CONTRACT_ADDRESS)
            .map(shorten_contract)
            .unwrap_or_default(),
        raw_text: String::new(),
    }
}

fn shorten_contract(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() <= 18 {
        return address.to_string();
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{head}...{tail}")
}

fn format_last_check(last_check: Option<DateTime<Utc>>) -> String {
    last_check
        .map(|ts| ts.format("%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use radar_collectors::{Collector, CollectorError, CollectorProfile};
    use radar_core::{MonitorConfig, Snapshot};
    use radar_notify::{Notifier, NotifierError, PushChannel};
    use radar_storage::{ConfigStore, SnapshotStore};
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    struct FixedCollector {
        result: Option<Vec<Item>>,
    }

    #[async_trait]
    impl Collector for FixedCollector {
        fn kind(&self) -> CollectorKind {
            CollectorKind::AlphaApi
        }

        fn profile(&self) -> CollectorProfile {
            CollectorProfile {
                label: "Binance Alpha".into(),
                link: None,
            }
        }

        async fn collect(&mut self) -> Result<Vec<Item>, CollectorError> {
            self.result.clone().ok_or_else(|| CollectorError::Status {
                status: 503,
                url: "https://upstream.test/list".into(),
            })
        }
    }

    #[derive(Default)]
    struct CountingChannel {
        sent: Mutex<usize>,
    }

    #[async_trait]
    impl PushChannel for CountingChannel {
        async fn send(&self, _target: &NotifyTarget, _html: &str) -> Result<(), NotifierError> {
            *self.sent.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 3, 14, 7, 0).single().unwrap()
    }

    fn token(id: &str, symbol: &str) -> Item {
        Item::new(id, ts())
            .with_attr(attr::SYMBOL, symbol)
            .with_attr(attr::NAME, format!("{symbol} Token"))
            .with_attr(attr::CONTRACT_ADDRESS, "0x1234567890abcdef1234567890abcdef12345678")
    }

    async fn test_app(
        dir: &tempfile::TempDir,
        previous: Option<Snapshot>,
        collected: Option<Vec<Item>>,
    ) -> (Router, Arc<CountingChannel>) {
        let snapshots = SnapshotStore::new(dir.path().join("state.json"));
        let configs = ConfigStore::new(dir.path().join("config.json"));
        let config = MonitorConfig {
            check_interval: 600,
            notify_targets: vec![NotifyTarget {
                name: "ops".into(),
                credential: "8331180504:AAFU-secret".into(),
                channel_id: "-100".into(),
                enabled: true,
            }],
            ..MonitorConfig::default()
        };
        configs.save(&config).await.unwrap();
        if let Some(previous) = previous {
            snapshots.save(&previous).await.unwrap();
        }
        let channel = Arc::new(CountingChannel::default());
        let monitor = Monitor::new(
            Box::new(FixedCollector { result: collected }),
            snapshots,
            configs,
            config,
            Notifier::new(channel.clone()).with_pace(Duration::ZERO),
        );
        monitor.restore().await;
        (app(AppState::new(Arc::new(monitor))), channel)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn long_contracts_are_shortened() {
        assert_eq!(
            shorten_contract("0x1234567890abcdef1234567890abcdef12345678"),
            "0x12345678...12345678"
        );
        assert_eq!(shorten_contract("0xshort"), "0xshort");
    }

    #[tokio::test]
    async fn dashboard_before_first_check() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(&dir, None, Some(vec![])).await;
        let (status, body) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Binance Alpha"));
        assert!(body.contains("never"));
        assert!(body.contains("10 min"));
        assert!(body.contains("No items recorded yet."));
    }

    #[tokio::test]
    async fn dashboard_renders_cards_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<Item> = (0..25).map(|i| token(&format!("A{i}"), &format!("T{i}"))).collect();
        let (app, _) = test_app(&dir, Some(Snapshot::from_cycle(&items, 2, ts())), None).await;
        let (status, body) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("06-03 14:07"));
        assert!(body.contains("#1 T0"));
        assert!(body.contains("#20 T19"));
        assert!(!body.contains("#21 T20"));
        assert!(body.contains("0x12345678...12345678"));
    }

    #[tokio::test]
    async fn state_and_redacted_config_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::from_cycle(&[token("A1", "ONE")], 0, ts());
        let (app, _) = test_app(&dir, Some(snapshot), None).await;

        let (status, body) = get(app.clone(), "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        let state: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(state["item_count"], 1);
        assert_eq!(state["items"][0]["identity"], "A1");

        let (_, body) = get(app, "/api/config").await;
        let config: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(config["notify_targets"][0]["credential"], "8331180504...");
        assert!(!body.contains("AAFU-secret"));
    }

    #[tokio::test]
    async fn check_now_reports_counts_without_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let previous = Snapshot::from_cycle(&[token("A1", "ONE")], 0, ts());
        let collected = vec![token("A1", "ONE"), token("A2", "TWO")];
        let (app, channel) = test_app(&dir, Some(previous), Some(collected)).await;

        let (status, body) = get(app.clone(), "/api/check_now").await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["status"], "success");
        assert_eq!(report["total"], 2);
        assert_eq!(report["new"], 1);

        let (_, body) = get(app, "/api/state").await;
        let state: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(state["item_count"], 1);
        assert_eq!(*channel.sent.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn check_now_failure_is_a_500() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(&dir, None, None).await;
        let (status, body) = get(app, "/api/check_now").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["status"], "error");
        assert!(report["message"].as_str().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn check_now_with_nothing_collected_is_a_500() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(&dir, None, Some(vec![])).await;
        let (status, body) = get(app, "/api/check_now").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("no items"));
    }

    #[tokio::test]
    async fn test_push_and_manage_page() {
        let dir = tempfile::tempdir().unwrap();
        let (app, channel) = test_app(&dir, None, None).await;

        let (status, body) = get(app.clone(), "/api/test_push").await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["status"], "success");
        assert_eq!(*channel.sent.lock().unwrap(), 1);

        let (status, body) = get(app, "/manage").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ops"));
        assert!(body.contains("8331180504..."));
        assert!(body.contains("600 s"));
    }
}
