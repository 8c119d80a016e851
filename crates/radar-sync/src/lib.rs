//! Poll cycle orchestration: collect, diff against the held snapshot, notify,
//! persist, sleep.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use radar_collectors::{collector_for, Collector, CollectorEnv, CollectorError, CollectorProfile};
use radar_core::{Item, MonitorConfig, Snapshot};
use radar_notify::{AlertSource, Notifier, NotifyReport, TelegramChannel, DEFAULT_PUSH_API_BASE};
use radar_storage::{ConfigStore, SnapshotStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "radar-sync";

/// Sleep after a failed or empty collection.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RadarSettings {
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub debug_dir: PathBuf,
    pub webdriver_url: String,
    pub push_api_base: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: Option<u16>,
}

impl RadarSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = CollectorEnv::default();
        Self {
            config_path: lookup("RADAR_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config_files/config.json")),
            state_path: lookup("RADAR_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/monitor_state.json")),
            debug_dir: lookup("RADAR_DEBUG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.debug_dir),
            webdriver_url: lookup("RADAR_WEBDRIVER_URL").unwrap_or(defaults.webdriver_url),
            push_api_base: lookup("RADAR_PUSH_API_BASE")
                .unwrap_or_else(|| DEFAULT_PUSH_API_BASE.to_string()),
            http_timeout_secs: lookup("RADAR_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout.as_secs()),
            user_agent: lookup("RADAR_USER_AGENT").unwrap_or(defaults.user_agent),
            web_port: lookup("RADAR_WEB_PORT").and_then(|v| v.parse().ok()),
        }
    }

    pub fn collector_env(&self) -> CollectorEnv {
        CollectorEnv {
            webdriver_url: self.webdriver_url.clone(),
            debug_dir: self.debug_dir.clone(),
            user_agent: self.user_agent.clone(),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOutcome {
    pub new_items: Vec<Item>,
    pub effective_new_count: usize,
}

/// Items of `current` whose identity is absent from `previous`, in
/// `current` order. The first run reports nothing.
pub fn diff(current: &[Item], previous: &[Item], is_first_run: bool) -> DiffOutcome {
    let known: HashSet<&str> = previous.iter().map(|i| i.identity.as_str()).collect();
    diff_against_known(current, &known, is_first_run)
}

pub fn diff_against_known(current: &[Item], known: &HashSet<&str>, is_first_run: bool) -> DiffOutcome {
    if is_first_run {
        return DiffOutcome::default();
    }
    let mut emitted = HashSet::new();
    let new_items: Vec<Item> = current
        .iter()
        .filter(|item| !known.contains(item.identity.as_str()))
        .filter(|item| emitted.insert(item.identity.as_str()))
        .cloned()
        .collect();
    DiffOutcome {
        effective_new_count: new_items.len(),
        new_items,
    }
}

/// The snapshot shared with request handlers. Only `Monitor` writes it.
#[derive(Debug, Clone, Default)]
pub struct MonitorState {
    inner: Arc<RwLock<Snapshot>>,
}

impl MonitorState {
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    pub(crate) async fn replace(&self, snapshot: Snapshot) {
        *self.inner.write().await = snapshot;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollState {
    pub is_first_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleKind {
    /// First successful collection; stored without alerting.
    Baseline { total: usize },
    Completed {
        total: usize,
        new: usize,
        notify: Option<NotifyReport>,
    },
    Empty,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub next_sleep: Duration,
    pub kind: CycleKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub total: usize,
    pub new: usize,
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("collector cannot continue: {0}")]
    Collector(#[source] CollectorError),
}

pub struct Monitor {
    collector: Mutex<Box<dyn Collector>>,
    profile: CollectorProfile,
    snapshots: SnapshotStore,
    configs: ConfigStore,
    config: RwLock<MonitorConfig>,
    notifier: Notifier,
    state: MonitorState,
    error_backoff: Duration,
}

impl Monitor {
    pub fn new(
        collector: Box<dyn Collector>,
        snapshots: SnapshotStore,
        configs: ConfigStore,
        config: MonitorConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            profile: collector.profile(),
            collector: Mutex::new(collector),
            snapshots,
            configs,
            config: RwLock::new(config),
            notifier,
            state: MonitorState::default(),
            error_backoff: ERROR_BACKOFF,
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn profile(&self) -> &CollectorProfile {
        &self.profile
    }

    pub fn config_path(&self) -> &Path {
        self.configs.path()
    }

    /// Re-read the config file, falling back to the last good copy.
    pub async fn config(&self) -> MonitorConfig {
        let last_good = self.config.read().await.clone();
        let fresh = self.configs.load_or(&last_good).await;
        if fresh != last_good {
            *self.config.write().await = fresh.clone();
        }
        fresh
    }

    /// Load the persisted snapshot into shared state and derive the cold-start flag.
    pub async fn restore(&self) -> PollState {
        let snapshot = self.snapshots.load().await;
        let poll = PollState {
            is_first_run: snapshot.is_cold(),
        };
        info!(
            path = %self.snapshots.path().display(),
            retained = snapshot.items.len(),
            first_run = poll.is_first_run,
            "snapshot restored"
        );
        self.state.replace(snapshot).await;
        poll
    }

    pub async fn prepare(&self) -> Result<(), FatalError> {
        self.collector
            .lock()
            .await
            .prepare()
            .await
            .map_err(FatalError::Collector)
    }

    pub async fn shutdown(&self) {
        self.collector.lock().await.shutdown().await;
    }

    /// One pass of the poll state machine. Recoverable failures leave state
    /// untouched and ask for the error backoff.
    pub async fn run_cycle(&self, poll: &mut PollState) -> Result<CycleOutcome, FatalError> {
        let collected = {
            let mut collector = self.collector.lock().await;
            collector.collect().await
        };

        let current = match collected {
            Ok(items) if items.is_empty() => {
                warn!(source = %self.profile.label, backoff_secs = self.error_backoff.as_secs(), "collector returned no items");
                return Ok(self.backoff(CycleKind::Empty));
            }
            Ok(items) => items,
            Err(err) if err.is_fatal() => return Err(FatalError::Collector(err)),
            Err(err) => {
                warn!(source = %self.profile.label, error = %err, backoff_secs = self.error_backoff.as_secs(), "collection failed");
                return Ok(self.backoff(CycleKind::Failed {
                    error: err.to_string(),
                }));
            }
        };

        let previous = self.state.snapshot().await;
        let outcome = diff_against_known(&current, &previous.known_identity_set(), poll.is_first_run);
        let config = self.config().await;

        let notify = if outcome.effective_new_count > 0 {
            info!(new = outcome.effective_new_count, total = current.len(), "new items detected");
            Some(
                self.notifier
                    .notify(&config, &self.alert_source(), &outcome.new_items)
                    .await,
            )
        } else {
            None
        };

        let snapshot = Snapshot::from_cycle(&current, outcome.effective_new_count, Utc::now());
        if let Err(err) = self.snapshots.save(&snapshot).await {
            error!(error = %err, "persisting snapshot failed; keeping in-memory copy");
        }
        self.state.replace(snapshot).await;

        let kind = if std::mem::replace(&mut poll.is_first_run, false) {
            info!(total = current.len(), "baseline established");
            CycleKind::Baseline { total: current.len() }
        } else {
            info!(total = current.len(), new = outcome.effective_new_count, "cycle completed");
            CycleKind::Completed {
                total: current.len(),
                new: outcome.effective_new_count,
                notify,
            }
        };

        let interval = self.config().await.check_interval.max(1);
        Ok(CycleOutcome {
            next_sleep: Duration::from_secs(interval),
            kind,
        })
    }

    /// Collect and diff now without notifying or persisting. Queues behind an
    /// in-flight cycle. Against a cold snapshot every item counts as new.
    pub async fn check_now(&self) -> Result<CheckReport, CollectorError> {
        let current = {
            let mut collector = self.collector.lock().await;
            collector.collect().await?
        };
        let previous = self.state.snapshot().await;
        let outcome = diff_against_known(&current, &previous.known_identity_set(), false);
        Ok(CheckReport {
            total: current.len(),
            new: outcome.effective_new_count,
        })
    }

    pub async fn send_test_notification(&self) -> NotifyReport {
        let config = self.config().await;
        self.notifier.send_test(&config, &self.alert_source()).await
    }

    fn alert_source(&self) -> AlertSource {
        AlertSource {
            label: self.profile.label.clone(),
            link: self.profile.link.clone(),
        }
    }

    fn backoff(&self, kind: CycleKind) -> CycleOutcome {
        CycleOutcome {
            next_sleep: self.error_backoff,
            kind,
        }
    }
}

/// Assemble a monitor from process settings, creating a default config file
/// when none exists.
pub async fn build_monitor(settings: &RadarSettings) -> Result<Monitor> {
    let configs = ConfigStore::new(settings.config_path.clone());
    if configs.ensure_default().await? {
        info!(path = %configs.path().display(), "wrote default config");
    }
    let config = configs.load().await?;
    let collector = collector_for(&config, &settings.collector_env())?;
    let channel = TelegramChannel::new(&settings.push_api_base).context("building push client")?;
    Ok(Monitor::new(
        collector,
        SnapshotStore::new(settings.state_path.clone()),
        configs,
        config,
        Notifier::new(Arc::new(channel)),
    ))
}

pub struct PollLoop {
    monitor: Arc<Monitor>,
}

impl PollLoop {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }

    /// Runs until the collector reports an unrecoverable failure.
    pub async fn run(self) -> Result<(), FatalError> {
        let mut poll = self.monitor.restore().await;
        if let Err(err) = self.monitor.prepare().await {
            error!(error = %err, "collector failed to start");
            return Err(err);
        }

        loop {
            match self.monitor.run_cycle(&mut poll).await {
                Ok(outcome) => tokio::time::sleep(outcome.next_sleep).await,
                Err(err) => {
                    error!(error = %err, "poll loop stopping");
                    self.monitor.shutdown().await;
                    return Err(err);
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<(), FatalError>> {
        tokio::spawn(self.run())
    }
}
