//! Minimal W3C WebDriver client: one browser session, the handful of
//! commands the rendered-page collector needs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::strategy::{PageSurface, RowCapture};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const ROWS_SCRIPT: &str = r#"
const limit = arguments[1];
return Array.from(document.querySelectorAll(arguments[0]))
    .slice(0, limit)
    .map(el => ({ text: el.innerText, html: el.outerHTML.substring(0, 200) }));
"#;

#[derive(Debug, Error)]
pub enum BrowserSessionError {
    #[error("webdriver unreachable at {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },
    #[error("webdriver session is gone: {0}")]
    Dead(String),
    #[error("webdriver command {command} failed ({error}): {message}")]
    Command {
        command: &'static str,
        error: String,
        message: String,
    },
    #[error("unexpected webdriver response to {command}: {detail}")]
    Protocol { command: &'static str, detail: String },
}

impl BrowserSessionError {
    /// The session cannot be used again and must be recreated.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Dead(_))
    }
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub user_agent: String,
    pub command_timeout: Duration,
    pub page_load_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)".to_string(),
            command_timeout: Duration::from_secs(30),
            page_load_timeout: Duration::from_secs(20),
        }
    }
}

impl BrowserOptions {
    fn capabilities(&self) -> JsonValue {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            "--window-size=1920,1080".to_string(),
            format!("--user-agent={}", self.user_agent),
        ];
        if self.headless {
            args.insert(0, "--headless".to_string());
        }
        let page_load_ms = self.page_load_timeout.as_millis() as u64;
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args },
                    "timeouts": { "pageLoad": page_load_ms, "script": page_load_ms }
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

/// A live browser session. Dropping it leaves the remote session running;
/// call `quit` to release it.
#[derive(Debug)]
pub struct WebDriverSession {
    http: reqwest::Client,
    endpoint: String,
    session_id: String,
}

impl WebDriverSession {
    pub async fn start(endpoint: &str, options: &BrowserOptions) -> Result<Self, BrowserSessionError> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(options.command_timeout)
            .build()
            .map_err(|e| BrowserSessionError::Unreachable {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?;

        let value = send(
            &http,
            &endpoint,
            Method::POST,
            &format!("{endpoint}/session"),
            Some(options.capabilities()),
            "new_session",
        )
        .await?;

        let session_id = value
            .get("sessionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| BrowserSessionError::Protocol {
                command: "new_session",
                detail: "missing sessionId".to_string(),
            })?
            .to_string();

        debug!(%session_id, "webdriver session started");
        Ok(Self {
            http,
            endpoint,
            session_id,
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        name: &'static str,
    ) -> Result<JsonValue, BrowserSessionError> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, path);
        send(&self.http, &self.endpoint, method, &url, body, name).await
    }

    pub async fn is_alive(&self) -> bool {
        self.command(Method::GET, "/url", None, "get_url").await.is_ok()
    }

    pub async fn navigate(&self, url: &str) -> Result<(), BrowserSessionError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })), "navigate")
            .await
            .map(|_| ())
    }

    pub async fn page_source(&self) -> Result<String, BrowserSessionError> {
        let value = self.command(Method::GET, "/source", None, "page_source").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrowserSessionError::Protocol {
                command: "page_source",
                detail: "source is not a string".to_string(),
            })
    }

    pub async fn find_element_ids(&self, css: &str) -> Result<Vec<String>, BrowserSessionError> {
        let value = self
            .command(
                Method::POST,
                "/elements",
                Some(json!({ "using": "css selector", "value": css })),
                "find_elements",
            )
            .await?;
        let refs = value.as_array().ok_or_else(|| BrowserSessionError::Protocol {
            command: "find_elements",
            detail: "expected an array of element references".to_string(),
        })?;
        Ok(refs
            .iter()
            .filter_map(|r| r.get(ELEMENT_KEY).and_then(JsonValue::as_str))
            .map(str::to_string)
            .collect())
    }

    pub async fn element_text(&self, element_id: &str) -> Result<String, BrowserSessionError> {
        let value = self
            .command(
                Method::GET,
                &format!("/element/{element_id}/text"),
                None,
                "element_text",
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn execute(&self, script: &str, args: Vec<JsonValue>) -> Result<JsonValue, BrowserSessionError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
            "execute",
        )
        .await
    }

    pub async fn quit(self) {
        if let Err(err) = self.command(Method::DELETE, "", None, "delete_session").await {
            debug!(session_id = %self.session_id, error = %err, "closing webdriver session failed");
        }
    }
}

#[async_trait]
impl PageSurface for WebDriverSession {
    async fn element_rows(&self, selector: &str, limit: usize) -> Result<Vec<RowCapture>, BrowserSessionError> {
        let ids = self.find_element_ids(selector).await?;
        let mut rows = Vec::with_capacity(ids.len().min(limit));
        for id in ids.into_iter().take(limit) {
            match self.element_text(&id).await {
                Ok(text) => rows.push(RowCapture { text, html_preview: None }),
                Err(err) if err.is_session_loss() => return Err(err),
                // stale element: the row re-rendered between lookup and read
                Err(_) => rows.push(RowCapture::default()),
            }
        }
        Ok(rows)
    }

    async fn script_rows(&self, selector: &str, limit: usize) -> Result<Vec<RowCapture>, BrowserSessionError> {
        let value = self.execute(ROWS_SCRIPT, vec![json!(selector), json!(limit)]).await?;
        let entries = value.as_array().ok_or_else(|| BrowserSessionError::Protocol {
            command: "execute",
            detail: "script did not return an array".to_string(),
        })?;
        Ok(entries
            .iter()
            .map(|entry| RowCapture {
                text: entry
                    .get("text")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                html_preview: entry.get("html").and_then(JsonValue::as_str).map(str::to_string),
            })
            .collect())
    }
}

async fn send(
    http: &reqwest::Client,
    endpoint: &str,
    method: Method,
    url: &str,
    body: Option<JsonValue>,
    name: &'static str,
) -> Result<JsonValue, BrowserSessionError> {
    let mut req = http.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await.map_err(|e| BrowserSessionError::Unreachable {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;
    let status = resp.status();
    let mut payload: JsonValue = resp.json().await.map_err(|e| BrowserSessionError::Protocol {
        command: name,
        detail: format!("status {status}: {e}"),
    })?;
    let value = payload
        .get_mut("value")
        .map(JsonValue::take)
        .unwrap_or(JsonValue::Null);

    if status.is_success() {
        return Ok(value);
    }

    let wire: WireError = serde_json::from_value(value).map_err(|_| BrowserSessionError::Protocol {
        command: name,
        detail: format!("status {status} without error payload"),
    })?;
    if matches!(wire.error.as_str(), "invalid session id" | "no such window" | "session not created") {
        return Err(BrowserSessionError::Dead(format!("{}: {}", wire.error, wire.message)));
    }
    Err(BrowserSessionError::Command {
        command: name,
        error: wire.error,
        message: wire.message,
    })
}
