use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReplicatorError, ReplicatorResult};
use crate::window::{PeriodProperty, TimeWindow};

/// One evaluated property (at one quantile, if it takes one) within a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordInfo {
    #[serde(rename = "chart")]
    pub chart: String,
    #[serde(rename = "original_formula")]
    pub formula: String,
    pub description: String,
    pub unit: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quantile: String,
}

/// Per-window document persisted as `<tags>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub warnings: Vec<String>,
    pub records: Vec<RecordInfo>,
    /// Group-level properties.
    pub network: Vec<PeriodProperty>,
    /// Window-level (swept) properties.
    pub properties: Vec<PeriodProperty>,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl WindowResult {
    pub fn new(window: &TimeWindow, warnings: Vec<String>, records: Vec<RecordInfo>) -> Self {
        Self {
            warnings,
            records,
            network: window.fixed.clone(),
            properties: window.tagged.clone(),
            description: window.description.clone(),
            start_time: window.start,
            end_time: window.end,
        }
    }

    /// Looks up a property value, window-level first, then group-level.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .chain(&self.network)
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn record(&self, chart: &str, quantile: &str) -> Option<&RecordInfo> {
        self.records
            .iter()
            .find(|r| r.chart == chart && r.quantile == quantile)
    }

    pub fn to_json(&self) -> ReplicatorResult<Vec<u8>> {
        if let Some(bad) = self.records.iter().find(|r| !r.value.is_finite()) {
            return Err(ReplicatorError::Serialization {
                what: "window result".to_string(),
                message: format!(
                    "chart `{}`{} has non-finite value {}",
                    bad.chart,
                    if bad.quantile.is_empty() {
                        String::new()
                    } else {
                        format!(" (quantile {})", bad.quantile)
                    },
                    bad.value
                ),
            });
        }
        encode_json("window result", self)
    }
}

/// Run manifest consumed by the report: chart names in catalog order and the quantiles used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputIndex {
    pub charts: Vec<String>,
    pub quantiles: Vec<String>,
}

impl OutputIndex {
    pub fn to_json(&self) -> ReplicatorResult<Vec<u8>> {
        encode_json("output index", self)
    }
}

fn encode_json<T: Serialize>(what: &str, value: &T) -> ReplicatorResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| ReplicatorError::Serialization {
        what: what.to_string(),
        message: err.to_string(),
    })
}
