//! Row extraction strategies for rendered listing pages.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::webdriver::BrowserSessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Element lookup, reading each element's rendered text.
    Elements,
    /// In-page script over a broader selector set; also returns an HTML preview.
    Script,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStrategy {
    pub name: String,
    pub kind: StrategyKind,
    pub selectors: Vec<String>,
}

impl ExtractionStrategy {
    pub fn new(name: &str, kind: StrategyKind, selectors: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn selector_group(&self) -> String {
        self.selectors.join(", ")
    }
}

/// Most specific first.
pub fn default_strategies() -> Vec<ExtractionStrategy> {
    vec![
        ExtractionStrategy::new(
            "rank-rows",
            StrategyKind::Elements,
            &["tr[data-token]", ".token-row", "[class*='rank-item']"],
        ),
        ExtractionStrategy::new(
            "generic-script",
            StrategyKind::Script,
            &["table tbody tr", "[class*=\"rank\"]", "[class*=\"token-item\"]"],
        ),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowCapture {
    pub text: String,
    pub html_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRow {
    pub rank: usize,
    pub text: String,
    pub html_preview: Option<String>,
}

/// Anything rows can be read from: a live browser session or a saved page.
#[async_trait]
pub trait PageSurface: Send + Sync {
    async fn element_rows(&self, selector: &str, limit: usize) -> Result<Vec<RowCapture>, BrowserSessionError>;
    async fn script_rows(&self, selector: &str, limit: usize) -> Result<Vec<RowCapture>, BrowserSessionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyOutcome {
    pub strategy: String,
    pub rows: Vec<ExtractedRow>,
}

/// Try each strategy in order and return the first non-empty result.
/// `Ok(None)` means every strategy came back empty. Session loss aborts
/// immediately; any other strategy failure falls through to the next one.
pub async fn run_strategies(
    page: &dyn PageSurface,
    strategies: &[ExtractionStrategy],
    limit: usize,
) -> Result<Option<StrategyOutcome>, BrowserSessionError> {
    for strategy in strategies {
        let selector = strategy.selector_group();
        let captured = match strategy.kind {
            StrategyKind::Elements => page.element_rows(&selector, limit).await,
            StrategyKind::Script => page.script_rows(&selector, limit).await,
        };
        let captured = match captured {
            Ok(rows) => rows,
            Err(err) if err.is_session_loss() => return Err(err),
            Err(err) => {
                warn!(strategy = %strategy.name, error = %err, "extraction strategy failed");
                continue;
            }
        };

        let rows = ranked_rows(captured, limit);
        info!(strategy = %strategy.name, rows = rows.len(), "extraction strategy finished");
        if !rows.is_empty() {
            return Ok(Some(StrategyOutcome {
                strategy: strategy.name.clone(),
                rows,
            }));
        }
    }
    Ok(None)
}

fn ranked_rows(captured: Vec<RowCapture>, limit: usize) -> Vec<ExtractedRow> {
    captured
        .into_iter()
        .take(limit)
        .enumerate()
        .filter(|(_, row)| !row.text.trim().is_empty())
        .map(|(idx, row)| ExtractedRow {
            rank: idx + 1,
            text: row.text,
            html_preview: row.html_preview,
        })
        .collect()
}

/// A saved page source, for replaying strategies offline against a capture.
pub struct StaticPage {
    html: String,
}

impl StaticPage {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    fn select(&self, selector: &str, limit: usize, with_preview: bool) -> Result<Vec<RowCapture>, BrowserSessionError> {
        let sel = Selector::parse(selector).map_err(|e| BrowserSessionError::Command {
            command: "select",
            error: "invalid selector".to_string(),
            message: e.to_string(),
        })?;
        let document = Html::parse_document(&self.html);
        Ok(document
            .select(&sel)
            .take(limit)
            .map(|node| RowCapture {
                text: node
                    .text()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n"),
                html_preview: with_preview.then(|| node.html().chars().take(200).collect()),
            })
            .collect())
    }
}

#[async_trait]
impl PageSurface for StaticPage {
    async fn element_rows(&self, selector: &str, limit: usize) -> Result<Vec<RowCapture>, BrowserSessionError> {
        self.select(selector, limit, false)
    }

    async fn script_rows(&self, selector: &str, limit: usize) -> Result<Vec<RowCapture>, BrowserSessionError> {
        self.select(selector, limit, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANK_TABLE: &str = r#"
        <html><body>
          <table><tbody>
            <tr data-token="a"><td>1</td><td>PEPE2</td><td>$1.2M</td></tr>
            <tr data-token="b"><td>2</td><td>WOJAK</td><td>$800K</td></tr>
            <tr data-token="c"><td>   </td></tr>
          </tbody></table>
        </body></html>"#;

    const GENERIC_LIST: &str = r#"
        <html><body>
          <div class="meme-rank-list">
            <div class="token-item-card"><span>DOGEX</span> <span>+41%</span></div>
          </div>
        </body></html>"#;

    #[tokio::test]
    async fn specific_strategy_wins_when_it_has_rows() {
        let page = StaticPage::new(RANK_TABLE);
        let outcome = run_strategies(&page, &default_strategies(), 50)
            .await
            .unwrap()
            .expect("rows");
        assert_eq!(outcome.strategy, "rank-rows");
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[0].text, "1\nPEPE2\n$1.2M");
        assert_eq!(outcome.rows[1].rank, 2);
        assert!(outcome.rows[0].html_preview.is_none());
    }

    #[tokio::test]
    async fn falls_back_to_broader_selectors() {
        let page = StaticPage::new(GENERIC_LIST);
        let outcome = run_strategies(&page, &default_strategies(), 50)
            .await
            .unwrap()
            .expect("rows");
        assert_eq!(outcome.strategy, "generic-script");
        assert!(outcome.rows.iter().any(|r| r.text.contains("DOGEX")));
        assert!(outcome.rows[0].html_preview.as_deref().unwrap().starts_with("<div"));
    }

    #[tokio::test]
    async fn empty_page_yields_none() {
        let page = StaticPage::new("<html><body><p>loading…</p></body></html>");
        assert!(run_strategies(&page, &default_strategies(), 50).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn row_limit_applies_before_filtering() {
        let page = StaticPage::new(RANK_TABLE);
        let outcome = run_strategies(&page, &default_strategies()[..1], 1)
            .await
            .unwrap()
            .expect("rows");
        assert_eq!(outcome.rows.len(), 1);
    }

    #[test]
    fn strategies_are_plain_data() {
        let json = serde_json::to_value(default_strategies()).unwrap();
        assert_eq!(json[0]["kind"], "elements");
        assert_eq!(json[1]["selectors"][0], "table tbody tr");
    }
}
