use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, ReplicatorError, ReplicatorResult};
use crate::prometheus::{MetricsBackend, QueryData, QueryOutput, QueryRange};
use crate::properties::{PropertyDefinition, QueryParams};
use crate::records::RecordInfo;
use crate::window::{prometheus_duration, TimeWindow};

pub const DEFAULT_RANGE_STEP: Duration = Duration::from_secs(10);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// How a window is reduced to one value per (property, quantile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationMode {
    /// Range query over `[start, end]` sampled every `step`; keeps the largest
    /// sample across all series.
    RangeMax { step: Duration },
    /// Instant query at `end`; the template aggregates over the trailing window itself.
    InstantAtEnd,
}

impl AggregationMode {
    pub fn uses_window_slot(&self) -> bool {
        matches!(self, AggregationMode::InstantAtEnd)
    }
}

impl Default for AggregationMode {
    fn default() -> Self {
        AggregationMode::RangeMax {
            step: DEFAULT_RANGE_STEP,
        }
    }
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationMode::RangeMax { step } => {
                write!(f, "range_max(step={})", prometheus_duration(*step))
            }
            AggregationMode::InstantAtEnd => write!(f, "instant_at_end"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grabbed {
    pub record: RecordInfo,
    pub warnings: Vec<String>,
}

pub struct WindowAggregator<'a, B> {
    backend: &'a B,
    mode: &'a AggregationMode,
    timeout: Duration,
    cancel: &'a CancellationToken,
}

impl<'a, B: MetricsBackend> WindowAggregator<'a, B> {
    pub fn new(
        backend: &'a B,
        mode: &'a AggregationMode,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            backend,
            mode,
            timeout,
            cancel,
        }
    }

    pub fn build_query(
        &self,
        property: &PropertyDefinition,
        quantile: Option<&str>,
        window: &TimeWindow,
    ) -> ReplicatorResult<String> {
        let window_length = self
            .mode
            .uses_window_slot()
            .then(|| prometheus_duration(window.length));
        property.template.render(QueryParams {
            quantile,
            window: window_length.as_deref(),
        })
    }

    pub async fn grab_record(
        &self,
        property: &PropertyDefinition,
        quantile: Option<&str>,
        window: &TimeWindow,
    ) -> ReplicatorResult<Grabbed> {
        let query = self.build_query(property, quantile, window)?;
        tracing::debug!(
            chart = %property.name,
            quantile = quantile.unwrap_or(""),
            query = %query,
            mode = %self.mode,
            "querying backend"
        );

        let (value, warnings) = match self.mode {
            AggregationMode::RangeMax { step } => {
                let range = QueryRange {
                    start: window.start,
                    end: window.end,
                    step: *step,
                };
                let output = self
                    .bounded(&query, self.backend.query_range(&query, range))
                    .await?;
                (max_over_range(&query, &output.data)?, output.warnings)
            }
            AggregationMode::InstantAtEnd => {
                let output = self
                    .bounded(&query, self.backend.query_instant(&query, window.end))
                    .await?;
                (first_instant_value(&query, &output.data)?, output.warnings)
            }
        };

        for warning in &warnings {
            tracing::warn!(query = %query, warning = %warning, "backend reported warning");
        }

        Ok(Grabbed {
            record: RecordInfo {
                chart: property.name.clone(),
                formula: query,
                description: property.description.clone(),
                unit: property.unit.clone(),
                value,
                quantile: quantile.unwrap_or_default().to_string(),
            },
            warnings,
        })
    }

    async fn bounded<F>(&self, query: &str, call: F) -> ReplicatorResult<QueryOutput>
    where
        F: Future<Output = Result<QueryOutput, BackendError>>,
    {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            res = tokio::time::timeout(self.timeout, call) => match res {
                Ok(res) => res,
                Err(_) => Err(BackendError::Timeout(self.timeout)),
            },
        };
        result.map_err(|source| ReplicatorError::backend(query, source))
    }
}

/// Largest finite sample across every series of a matrix. A window without
/// any finite sample (no series, or only NaN/Inf) reads as 0.
pub fn max_over_range(query: &str, data: &QueryData) -> ReplicatorResult<f64> {
    let QueryData::Matrix(series) = data else {
        return Err(ReplicatorError::UnexpectedResultShape {
            query: query.to_string(),
            expected: "matrix",
            actual: data.type_name(),
        });
    };

    let max = series
        .iter()
        .flat_map(|s| s.values.iter())
        .map(|p| p.value)
        .filter(|v| v.is_finite())
        .reduce(f64::max);
    match max {
        Some(value) => Ok(value),
        None => {
            let samples: usize = series.iter().map(|s| s.values.len()).sum();
            tracing::warn!(
                query = %query,
                series = series.len(),
                samples,
                "no finite samples in window, recording 0"
            );
            Ok(0.0)
        }
    }
}

/// Value of the first series of an instant vector.
pub fn first_instant_value(query: &str, data: &QueryData) -> ReplicatorResult<f64> {
    let QueryData::Vector(samples) = data else {
        return Err(ReplicatorError::UnexpectedResultShape {
            query: query.to_string(),
            expected: "vector",
            actual: data.type_name(),
        });
    };
    samples
        .first()
        .map(|s| s.value.value)
        .ok_or_else(|| ReplicatorError::EmptyResult {
            query: query.to_string(),
        })
}
