use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::aggregate::{AggregationMode, WindowAggregator, DEFAULT_QUERY_TIMEOUT};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::files::FileSink;
use crate::prometheus::MetricsBackend;
use crate::properties::PropertyCatalog;
use crate::records::{OutputIndex, WindowResult};
use crate::window::TimeWindow;

/// Filenames written for a batch, in window order, plus the catalog chart names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabOutcome {
    pub files: Vec<String>,
    pub charts: Vec<String>,
}

/// Batch extraction engine: windows in order, properties in catalog order,
/// quantiles in list order, one backend call at a time.
pub struct Replicator<B, S> {
    backend: B,
    sink: S,
    catalog: PropertyCatalog,
    mode: AggregationMode,
    query_timeout: Duration,
    cancel: CancellationToken,
}

impl<B: MetricsBackend, S: FileSink> Replicator<B, S> {
    /// Fails with `Config` when `catalog` was validated for a different mode.
    pub fn new(
        backend: B,
        sink: S,
        catalog: PropertyCatalog,
        mode: AggregationMode,
    ) -> ReplicatorResult<Self> {
        if catalog.mode() != &mode {
            return Err(ReplicatorError::config(format!(
                "property catalog was built for {} but the replicator runs in {mode}",
                catalog.mode()
            )));
        }
        Ok(Self {
            backend,
            sink,
            catalog,
            mode,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn catalog(&self) -> &PropertyCatalog {
        &self.catalog
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Evaluates every (property, quantile) pair for one window. Nothing is
    /// written; the first failure discards the records gathered so far.
    pub async fn collect_window(
        &self,
        quantiles: &[String],
        window: &TimeWindow,
    ) -> ReplicatorResult<WindowResult> {
        let aggregator =
            WindowAggregator::new(&self.backend, &self.mode, self.query_timeout, &self.cancel);
        let mut records = Vec::with_capacity(self.catalog.expected_record_count(quantiles.len()));
        let mut warnings = Vec::new();

        for property in self.catalog.iter() {
            if property.requires_quantile {
                for quantile in quantiles {
                    let grabbed = aggregator
                        .grab_record(property, Some(quantile.as_str()), window)
                        .await?;
                    warnings.extend(grabbed.warnings);
                    records.push(grabbed.record);
                }
            } else {
                let grabbed = aggregator.grab_record(property, None, window).await?;
                warnings.extend(grabbed.warnings);
                records.push(grabbed.record);
            }
        }

        Ok(WindowResult::new(window, warnings, records))
    }

    /// Extracts one window and persists it under its derived filename.
    pub async fn grab_records_by_period(
        &self,
        quantiles: &[String],
        window: &TimeWindow,
    ) -> ReplicatorResult<String> {
        let filename = window
            .output_filename()
            .map_err(|err| err.in_window(window.label()))?;
        let result = self
            .collect_window(quantiles, window)
            .await
            .map_err(|err| err.in_window(&filename))?;
        let bytes = result.to_json().map_err(|err| err.in_window(&filename))?;
        self.sink
            .write_file(&filename, &bytes)
            .map_err(|err| err.in_window(&filename))?;

        tracing::info!(
            window = %filename,
            records = result.records.len(),
            warnings = result.warnings.len(),
            "window saved"
        );
        Ok(filename)
    }

    /// Extracts every window in order and stops at the first failure. Files of
    /// windows that finished earlier stay in the sink.
    pub async fn grab_records(
        &self,
        quantiles: &[String],
        windows: &[TimeWindow],
    ) -> ReplicatorResult<GrabOutcome> {
        if quantiles.is_empty() && self.catalog.iter().any(|p| p.requires_quantile) {
            return Err(ReplicatorError::config(
                "quantile list is empty but the catalog has quantile properties",
            ));
        }
        check_unique_filenames(windows)?;

        let mut files = Vec::with_capacity(windows.len());
        for window in windows {
            files.push(self.grab_records_by_period(quantiles, window).await?);
        }
        Ok(GrabOutcome {
            files,
            charts: self.catalog.names(),
        })
    }

    pub fn make_index_file(&self, index: &OutputIndex, filename: &str) -> ReplicatorResult<()> {
        let bytes = index.to_json()?;
        self.sink.write_file(filename, &bytes)?;
        tracing::info!(file = %filename, charts = index.charts.len(), "index saved");
        Ok(())
    }
}

fn check_unique_filenames(windows: &[TimeWindow]) -> ReplicatorResult<()> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (i, window) in windows.iter().enumerate() {
        let filename = window
            .output_filename()
            .map_err(|err| err.in_window(window.label()))?;
        if let Some(first) = seen.insert(filename.clone(), i) {
            return Err(ReplicatorError::config(format!(
                "windows #{first} and #{i} both map to {filename}"
            )));
        }
    }
    Ok(())
}
