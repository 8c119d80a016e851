//! Core domain model for the listing radar: observed items, the persisted
//! snapshot, and operator configuration.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "radar-core";

/// Upper bound on `Snapshot::items`.
pub const MAX_RETAINED_ITEMS: usize = 100;

/// Well-known attribute keys. Collectors are free to add others.
pub mod attr {
    pub const NAME: &str = "name";
    pub const SYMBOL: &str = "symbol";
    pub const CHAIN: &str = "chain";
    pub const CHAIN_NAME: &str = "chain_name";
    pub const CONTRACT_ADDRESS: &str = "contract_address";
    pub const RAW_TEXT: &str = "raw_text";
    pub const RANK: &str = "rank";
    pub const HTML_PREVIEW: &str = "html_preview";
}

/// One observed member of the remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub identity: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub observed_at: DateTime<Utc>,
}

impl Item {
    pub fn new(identity: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            attributes: BTreeMap::new(),
            observed_at,
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Persisted outcome of the most recent completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    #[serde(with = "optional_timestamp", default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub item_count: usize,
    #[serde(default)]
    pub new_count: usize,
    /// Every identity seen in the most recent collection, including the ones
    /// that did not fit in `items`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_identities: Vec<String>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the snapshot that closes a cycle. `current` is kept in collector
    /// order and cut to `MAX_RETAINED_ITEMS`.
    pub fn from_cycle(current: &[Item], new_count: usize, checked_at: DateTime<Utc>) -> Self {
        let mut seen = HashSet::with_capacity(current.len());
        let known_identities = current
            .iter()
            .filter(|item| seen.insert(item.identity.as_str()))
            .map(|item| item.identity.clone())
            .collect();
        Self {
            last_check: Some(checked_at),
            items: current.iter().take(MAX_RETAINED_ITEMS).cloned().collect(),
            item_count: current.len(),
            new_count,
            known_identities,
        }
    }

    /// True when no baseline has been established yet.
    pub fn is_cold(&self) -> bool {
        self.items.is_empty()
    }

    /// Identities the next diff should treat as already seen. Falls back to
    /// the retained items for snapshots written without the full set.
    pub fn known_identity_set(&self) -> HashSet<&str> {
        if self.known_identities.is_empty() {
            self.items.iter().map(|i| i.identity.as_str()).collect()
        } else {
            self.known_identities.iter().map(String::as_str).collect()
        }
    }
}

/// `last_check` is an RFC 3339 string or `""` when no cycle has completed.
mod optional_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_str(&ts.to_rfc3339()),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMethod {
    None,
    #[default]
    #[serde(alias = "telegram")]
    Push,
    Both,
}

impl NotifyMethod {
    pub fn pushes(self) -> bool {
        matches!(self, Self::Push | Self::Both)
    }
}

/// A single outbound destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyTarget {
    pub name: String,
    #[serde(alias = "bot_token")]
    pub credential: String,
    #[serde(alias = "chat_id")]
    pub channel_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl NotifyTarget {
    pub fn redacted(&self) -> Self {
        let visible: String = self.credential.chars().take(10).collect();
        Self {
            credential: format!("{visible}..."),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    #[default]
    AlphaApi,
    RenderedPage,
}

/// Operator-editable configuration, re-read every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_webui_port")]
    pub webui_port: u16,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default)]
    pub notify_method: NotifyMethod,
    #[serde(default)]
    pub notify_targets: Vec<NotifyTarget>,
    #[serde(default)]
    pub collector: CollectorKind,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            webui_port: default_webui_port(),
            check_interval: default_check_interval(),
            notify_method: NotifyMethod::default(),
            notify_targets: Vec::new(),
            collector: CollectorKind::default(),
            headless: true,
            source_url: None,
            settle_secs: default_settle_secs(),
            max_rows: default_max_rows(),
        }
    }
}

impl MonitorConfig {
    /// Copy safe to hand to the dashboard.
    pub fn redacted(&self) -> Self {
        Self {
            notify_targets: self.notify_targets.iter().map(NotifyTarget::redacted).collect(),
            ..self.clone()
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_webui_port() -> u16 {
    5002
}

fn default_check_interval() -> u64 {
    300
}

fn default_settle_secs() -> u64 {
    5
}

fn default_max_rows() -> usize {
    50
}
