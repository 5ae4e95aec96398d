use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::error::BackendError;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePoint {
    pub timestamp: f64,
    pub value: f64,
}

impl<'de> Deserialize<'de> for SamplePoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (timestamp, raw): (f64, String) = Deserialize::deserialize(deserializer)?;
        let value = parse_sample_value(&raw).map_err(serde::de::Error::custom)?;
        Ok(Self { timestamp, value })
    }
}

fn parse_sample_value(raw: &str) -> Result<f64, String> {
    raw.trim()
        .parse::<f64>()
        .map_err(|err| format!("invalid sample value {raw:?}: {err}"))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstantSample {
    #[serde(default)]
    pub metric: Labels,
    pub value: SamplePoint,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RangeSeries {
    #[serde(default)]
    pub metric: Labels,
    #[serde(default)]
    pub values: Vec<SamplePoint>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryData {
    Vector(Vec<InstantSample>),
    Matrix(Vec<RangeSeries>),
    Scalar(SamplePoint),
    String((f64, String)),
}

impl QueryData {
    pub fn type_name(&self) -> &'static str {
        match self {
            QueryData::Vector(_) => "vector",
            QueryData::Matrix(_) => "matrix",
            QueryData::Scalar(_) => "scalar",
            QueryData::String(_) => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub data: QueryData,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: Duration,
}

/// The two query operations the replicator needs from a metrics backend.
pub trait MetricsBackend {
    fn query_instant(
        &self,
        query: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<QueryOutput, BackendError>> + Send;

    fn query_range(
        &self,
        query: &str,
        range: QueryRange,
    ) -> impl Future<Output = Result<QueryOutput, BackendError>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEnvelope {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

/// Prometheus HTTP API (`/api/v1/query`, `/api/v1/query_range`).
#[derive(Clone)]
pub struct PrometheusClient {
    base_url: String,
    http: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<QueryOutput, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).query(params).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        decode_response(status, &body)
    }
}

impl MetricsBackend for PrometheusClient {
    async fn query_instant(
        &self,
        query: &str,
        at: DateTime<Utc>,
    ) -> Result<QueryOutput, BackendError> {
        let params = [("query", query.to_string()), ("time", unix_seconds(at))];
        self.get("/api/v1/query", &params).await
    }

    async fn query_range(
        &self,
        query: &str,
        range: QueryRange,
    ) -> Result<QueryOutput, BackendError> {
        let params = [
            ("query", query.to_string()),
            ("start", unix_seconds(range.start)),
            ("end", unix_seconds(range.end)),
            ("step", format!("{}", range.step.as_secs_f64())),
        ];
        self.get("/api/v1/query_range", &params).await
    }
}

fn unix_seconds(ts: DateTime<Utc>) -> String {
    format!("{:.3}", ts.timestamp_millis() as f64 / 1000.0)
}

fn decode_response(status: reqwest::StatusCode, body: &str) -> Result<QueryOutput, BackendError> {
    let envelope: ApiEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            if !status.is_success() {
                return Err(BackendError::Status {
                    status,
                    body: body.chars().take(512).collect(),
                });
            }
            return Err(BackendError::Decode(err.to_string()));
        }
    };

    if envelope.status != "success" {
        return Err(BackendError::Api {
            error_type: envelope.error_type.unwrap_or_else(|| "unknown".to_string()),
            message: envelope
                .error
                .unwrap_or_else(|| format!("status {} ({})", envelope.status, status)),
        });
    }

    let data = envelope
        .data
        .ok_or_else(|| BackendError::Decode("success response without data".to_string()))?;
    Ok(QueryOutput {
        data,
        warnings: envelope.warnings,
    })
}
