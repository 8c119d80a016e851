//! Structured-API collector for the Binance Alpha token catalog.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{attr, CollectorKind, Item};
use radar_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::{Collector, CollectorError, CollectorProfile};

pub const ALPHA_TOKEN_LIST_URL: &str =
    "https://www.binance.com/bapi/defi/v1/public/wallet-direct/buw/wallet/cex/alpha/all/token/list";

const SUCCESS_CODE: &str = "000000";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default, deserialize_with = "opt_scalar_string")]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlphaToken {
    #[serde(deserialize_with = "scalar_string")]
    alpha_id: String,
    name: String,
    symbol: String,
    #[serde(default, deserialize_with = "opt_scalar_string")]
    chain_id: Option<String>,
    #[serde(default)]
    chain_name: Option<String>,
    #[serde(default)]
    contract_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Text(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
        }
    }
}

fn scalar_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Scalar::deserialize(d).map(Scalar::into_string)
}

fn opt_scalar_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(Scalar::into_string))
}

/// Validate the envelope and turn every token into an `Item`. Any deviation
/// from the documented shape is an error, never a silently skipped row.
pub fn parse_token_list(
    url: &str,
    body: &[u8],
    observed_at: DateTime<Utc>,
) -> Result<Vec<Item>, CollectorError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| CollectorError::Parse {
        url: url.to_string(),
        detail: format!("envelope: {e}"),
    })?;

    match envelope.code.as_deref() {
        Some(SUCCESS_CODE) => {}
        other => {
            return Err(CollectorError::Envelope {
                url: url.to_string(),
                detail: format!(
                    "code {:?} ({})",
                    other.unwrap_or("<missing>"),
                    envelope.message.as_deref().unwrap_or("no message")
                ),
            })
        }
    }

    let entries = match envelope.data {
        Some(JsonValue::Array(entries)) => entries,
        Some(other) => {
            return Err(CollectorError::Envelope {
                url: url.to_string(),
                detail: format!("data is {} rather than a list", json_kind(&other)),
            })
        }
        None => {
            return Err(CollectorError::Envelope {
                url: url.to_string(),
                detail: "missing data field".to_string(),
            })
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            let token: AlphaToken = serde_json::from_value(entry).map_err(|e| CollectorError::Parse {
                url: url.to_string(),
                detail: format!("token #{idx}: {e}"),
            })?;
            if token.alpha_id.trim().is_empty() {
                return Err(CollectorError::Parse {
                    url: url.to_string(),
                    detail: format!("token #{idx}: empty alphaId"),
                });
            }
            Ok(token_to_item(token, observed_at))
        })
        .collect()
}

fn token_to_item(token: AlphaToken, observed_at: DateTime<Utc>) -> Item {
    let mut item = Item::new(token.alpha_id, observed_at)
        .with_attr(attr::NAME, token.name)
        .with_attr(attr::SYMBOL, token.symbol);
    if let Some(chain) = token.chain_id {
        item = item.with_attr(attr::CHAIN, chain);
    }
    if let Some(chain_name) = token.chain_name {
        item = item.with_attr(attr::CHAIN_NAME, chain_name);
    }
    if let Some(contract) = token.contract_address {
        item = item.with_attr(attr::CONTRACT_ADDRESS, contract);
    }
    item
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "an object",
    }
}

pub struct AlphaApiCollector {
    http: HttpFetcher,
    url: String,
}

impl AlphaApiCollector {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Collector for AlphaApiCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::AlphaApi
    }

    fn profile(&self) -> CollectorProfile {
        CollectorProfile {
            label: "Binance Alpha".to_string(),
            link: None,
        }
    }

    async fn collect(&mut self) -> Result<Vec<Item>, CollectorError> {
        let response = self
            .http
            .fetch_json_bytes("alpha-api", &self.url)
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, url } => CollectorError::Status { status, url },
                FetchError::Request(e) => CollectorError::Transport {
                    url: self.url.clone(),
                    message: e.to_string(),
                },
            })?;
        let items = parse_token_list(&response.final_url, &response.body, Utc::now())?;
        info!(url = %self.url, tokens = items.len(), "alpha token list fetched");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use chrono::TimeZone;
    use radar_storage::{BackoffPolicy, HttpClientConfig};
    use std::time::Duration;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn parses_tokens_in_catalog_order() {
        let body = br#"{
            "code": "000000",
            "message": null,
            "data": [
                {"alphaId": "ALPHA_321", "name": "Moon Cat", "symbol": "MCAT", "chainId": "56",
                 "chainName": "BSC", "contractAddress": "0xabc", "price": "0.01"},
                {"alphaId": 17, "name": "Numbers", "symbol": "NUM", "chainId": 1}
            ],
            "success": true
        }"#;
        let items = parse_token_list("u", body, ts()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].identity, "ALPHA_321");
        assert_eq!(items[0].attr(attr::SYMBOL), Some("MCAT"));
        assert_eq!(items[0].attr(attr::CONTRACT_ADDRESS), Some("0xabc"));
        assert_eq!(items[1].identity, "17");
        assert_eq!(items[1].attr(attr::CHAIN), Some("1"));
        assert_eq!(items[1].attr(attr::CONTRACT_ADDRESS), None);
        assert_eq!(items[1].observed_at, ts());
    }

    #[test]
    fn empty_catalog_is_not_an_error() {
        let items = parse_token_list("u", br#"{"code":"000000","data":[]}"#, ts()).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn non_success_code_is_an_envelope_error() {
        let err = parse_token_list("u", br#"{"code":"100001","message":"busy","data":[]}"#, ts())
            .unwrap_err();
        assert!(matches!(err, CollectorError::Envelope { .. }));
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn missing_data_or_wrong_shape_is_rejected() {
        let missing = parse_token_list("u", br#"{"code":"000000"}"#, ts()).unwrap_err();
        assert!(matches!(missing, CollectorError::Envelope { .. }));
        let object = parse_token_list("u", br#"{"code":"000000","data":{"list":[]}}"#, ts()).unwrap_err();
        assert!(matches!(object, CollectorError::Envelope { .. }));
    }

    #[test]
    fn token_missing_required_field_fails_the_whole_payload() {
        let body = br#"{"code":"000000","data":[
            {"alphaId":"A","name":"a","symbol":"A"},
            {"alphaId":"B","name":"b"}
        ]}"#;
        let err = parse_token_list("u", body, ts()).unwrap_err();
        assert!(matches!(err, CollectorError::Parse { .. }));
        assert!(err.to_string().contains("token #1"));
    }

    #[test]
    fn garbage_body_is_a_parse_error() {
        let err = parse_token_list("u", b"<html>captcha</html>", ts()).unwrap_err();
        assert!(matches!(err, CollectorError::Parse { .. }));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("radar-test".into()),
            backoff: BackoffPolicy::none(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn collects_over_http() {
        let base = serve(Router::new().route(
            "/list",
            get(|| async {
                Json(serde_json::json!({
                    "code": "000000",
                    "data": [{"alphaId": "X1", "name": "Ex", "symbol": "EX"}]
                }))
            }),
        ))
        .await;
        let mut collector = AlphaApiCollector::new(fetcher(), format!("{base}/list"));
        let items = collector.collect().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].identity, "X1");
    }

    #[tokio::test]
    async fn server_error_maps_to_status_error() {
        let base = serve(Router::new().route(
            "/list",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        ))
        .await;
        let mut collector = AlphaApiCollector::new(fetcher(), format!("{base}/list"));
        let err = collector.collect().await.unwrap_err();
        assert!(matches!(err, CollectorError::Status { status: 503, .. }));
        assert!(!err.is_fatal());
    }
}
