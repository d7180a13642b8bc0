//! HTTP client for the St. Louis Open311 batch API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use stl311_core::{ResolvedWindow, RetryDisposition};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "stl311-client";

/// Flat record exactly as the source emits it: string-typed dates and raw
/// coordinate pairs that may arrive as JSON strings or numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawServiceRequest {
    #[serde(default, alias = "SERVICE_REQUEST_ID", deserialize_with = "lenient_string")]
    pub service_request_id: Option<String>,
    #[serde(default, alias = "STATUS", deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(default, alias = "PRIORITY", deserialize_with = "lenient_string")]
    pub priority: Option<String>,
    #[serde(default, alias = "SERVICE_NAME", deserialize_with = "lenient_string")]
    pub service_name: Option<String>,
    #[serde(default, alias = "SERVICE_CODE", deserialize_with = "lenient_string")]
    pub service_code: Option<String>,
    #[serde(default, alias = "ADDRESS", deserialize_with = "lenient_string")]
    pub address: Option<String>,
    #[serde(default, alias = "ZIPCODE", deserialize_with = "lenient_string")]
    pub zipcode: Option<String>,
    #[serde(default, alias = "AGENCY_RESPONSIBLE", deserialize_with = "lenient_string")]
    pub agency_responsible: Option<String>,
    #[serde(default, alias = "NEIGHBORHOOD", deserialize_with = "lenient_string")]
    pub neighborhood: Option<String>,
    #[serde(default, alias = "WARD", deserialize_with = "lenient_string")]
    pub ward: Option<String>,
    #[serde(default, alias = "REQUESTED_DATETIME", deserialize_with = "lenient_string")]
    pub requested_datetime: Option<String>,
    #[serde(default, alias = "UPDATED_DATETIME", deserialize_with = "lenient_string")]
    pub updated_datetime: Option<String>,
    #[serde(default, alias = "CANCELLED_DATETIME", deserialize_with = "lenient_string")]
    pub cancelled_datetime: Option<String>,
    #[serde(default, alias = "EXPECTED_DATETIME", deserialize_with = "lenient_string")]
    pub expected_datetime: Option<String>,
    #[serde(default, alias = "SRX", deserialize_with = "lenient_string")]
    pub srx: Option<String>,
    #[serde(default, alias = "SRY", deserialize_with = "lenient_string")]
    pub sry: Option<String>,
    #[serde(default, alias = "LAT", deserialize_with = "lenient_string")]
    pub lat: Option<String>,
    #[serde(default, alias = "LONG", deserialize_with = "lenient_string")]
    pub long: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(text)) => Some(text),
        Some(JsonValue::Number(number)) => Some(number.to_string()),
        Some(JsonValue::Bool(flag)) => Some(flag.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// One page of raw records. `has_more` is false once the source returns a
/// short (or empty) batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPage {
    pub records: Vec<RawServiceRequest>,
    pub has_more: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed response payload: {0}")]
    Schema(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Transport(err) => classify_reqwest_error(err),
            Self::Schema(_) => RetryDisposition::NonRetryable,
        }
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Delay schedule for orchestrator-level retries; the attempt ceiling lives
/// in the sync configuration.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Page-granular source of raw service requests. Implementations perform
/// exactly one fetch per call; retry is the orchestrator's concern.
#[async_trait]
pub trait RequestSource: Send + Sync {
    async fn fetch_page(
        &self,
        window: ResolvedWindow,
        status_filter: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<RawPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct Open311ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for Open311ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.stlouis-mo.gov/powernap/stlouis/api.cfm".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            user_agent: "stl311-sync/0.1".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct Open311Client {
    client: reqwest::Client,
    config: Open311ClientConfig,
}

impl Open311Client {
    pub fn new(config: Open311ClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl RequestSource for Open311Client {
    async fn fetch_page(
        &self,
        window: ResolvedWindow,
        status_filter: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<RawPage, FetchError> {
        let url = format!("{}/requests.json", self.config.base_url.trim_end_matches('/'));
        let mut request = self.client.get(&url).query(&[
            ("start_date", window.start.format("%Y-%m-%d").to_string()),
            ("end_date", window.end.format("%Y-%m-%d").to_string()),
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ]);
        if let Some(key) = &self.config.api_key {
            request = request.query(&[("api_key", key.as_str())]);
        }
        if let Some(status) = status_filter {
            request = request.query(&[("status", status)]);
        }

        debug!(page, page_size, "fetching service request page");
        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let payload: JsonValue = response
            .json()
            .await
            .map_err(|err| FetchError::Schema(err.to_string()))?;
        let records = parse_batch(payload)?;
        let has_more = !records.is_empty() && records.len() as u32 >= page_size;
        Ok(RawPage { records, has_more })
    }
}

/// The source answers either `{"service_requests": [...]}` or a bare array;
/// anything else is a schema defect, not a retryable hiccup.
fn parse_batch(payload: JsonValue) -> Result<Vec<RawServiceRequest>, FetchError> {
    let items = match payload {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("service_requests") {
            Some(JsonValue::Array(items)) => items,
            Some(_) => {
                return Err(FetchError::Schema(
                    "service_requests is not an array".to_string(),
                ))
            }
            None => {
                return Err(FetchError::Schema(
                    "response object lacks service_requests".to_string(),
                ))
            }
        },
        other => {
            return Err(FetchError::Schema(format!(
                "unexpected top-level payload: {other}"
            )))
        }
    };

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<RawServiceRequest>(item)
                .map_err(|err| FetchError::Schema(err.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn schema_defects_are_never_retried() {
        let err = FetchError::Schema("bad".to_string());
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);

        let err = FetchError::HttpStatus {
            status: 503,
            url: "http://example".to_string(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[test]
    fn parse_batch_accepts_wrapped_and_bare_payloads() {
        let wrapped = json!({"service_requests": [{"SERVICE_REQUEST_ID": 101}]});
        let records = parse_batch(wrapped).expect("wrapped parses");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].service_request_id.as_deref(), Some("101"));

        let bare = json!([{"SERVICE_REQUEST_ID": "102", "STATUS": "open"}]);
        let records = parse_batch(bare).expect("bare parses");
        assert_eq!(records[0].status.as_deref(), Some("open"));
    }

    #[test]
    fn parse_batch_rejects_unexpected_shapes() {
        assert!(matches!(
            parse_batch(json!({"requests": []})),
            Err(FetchError::Schema(_))
        ));
        assert!(matches!(
            parse_batch(json!("not a batch")),
            Err(FetchError::Schema(_))
        ));
    }

    #[test]
    fn raw_records_tolerate_numeric_and_string_fields() {
        let record: RawServiceRequest = serde_json::from_value(json!({
            "SERVICE_REQUEST_ID": 7700123,
            "STATUS": "Open",
            "ZIPCODE": 63103,
            "WARD": "7",
            "SRX": -10040000.5,
            "SRY": "4650000"
        }))
        .expect("record parses");

        assert_eq!(record.service_request_id.as_deref(), Some("7700123"));
        assert_eq!(record.zipcode.as_deref(), Some("63103"));
        assert_eq!(record.ward.as_deref(), Some("7"));
        assert_eq!(record.srx.as_deref(), Some("-10040000.5"));
        assert_eq!(record.sry.as_deref(), Some("4650000"));
    }
}
