use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ReplicatorError, ReplicatorResult};

pub const JSON_EXTENSION: &str = ".json";

/// A `(name, value)` pair describing the experiment a window belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodProperty {
    pub name: String,
    pub value: String,
}

impl PeriodProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One declared measurement window.
///
/// `tagged` holds the independent variables swept across windows (e.g. network size),
/// `fixed` the ones shared by the whole group (e.g. induced latency).
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub length: Duration,
    pub tagged: Vec<PeriodProperty>,
    pub fixed: Vec<PeriodProperty>,
    pub description: String,
}

impl TimeWindow {
    pub fn starting_at(start: DateTime<Utc>, length: Duration) -> ReplicatorResult<Self> {
        let delta = chrono::Duration::from_std(length)
            .map_err(|err| ReplicatorError::config(format!("window length {length:?}: {err}")))?;
        let end = start
            .checked_add_signed(delta)
            .ok_or_else(|| ReplicatorError::config(format!("window end overflows: {start} + {length:?}")))?;
        Ok(Self {
            start,
            end,
            length,
            tagged: Vec::new(),
            fixed: Vec::new(),
            description: String::new(),
        })
    }

    pub fn with_tagged(mut self, tagged: Vec<PeriodProperty>) -> Self {
        self.tagged = tagged;
        self
    }

    pub fn with_fixed(mut self, fixed: Vec<PeriodProperty>) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Short human label used in logs and error context.
    pub fn label(&self) -> String {
        let raw = raw_filename(&self.fixed, &self.tagged);
        if raw == JSON_EXTENSION {
            format!("[{} .. {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
        } else {
            raw
        }
    }

    /// Output filename for this window, rejecting tag sets that cannot name a file.
    pub fn output_filename(&self) -> ReplicatorResult<String> {
        if self.end < self.start {
            return Err(ReplicatorError::config(format!(
                "window {} ends before it starts",
                self.label()
            )));
        }
        if self.fixed.is_empty() && self.tagged.is_empty() {
            return Err(ReplicatorError::config(format!(
                "window {} has no tagged or group properties; its output file would be named `{JSON_EXTENSION}`",
                self.label()
            )));
        }
        for prop in self.fixed.iter().chain(&self.tagged) {
            let bad = |s: &str| s.contains(['/', '\\', '\0']);
            if bad(&prop.name) || bad(&prop.value) {
                return Err(ReplicatorError::config(format!(
                    "property {}={} contains a path separator and cannot be used in a filename",
                    prop.name, prop.value
                )));
            }
        }
        Ok(raw_filename(&self.fixed, &self.tagged))
    }
}

/// Joins group properties then window properties as `name_value` fragments.
///
/// Pure function of its inputs. Both lists empty yields the degenerate `.json`;
/// callers that need a usable name go through [`TimeWindow::output_filename`].
pub fn raw_filename(fixed: &[PeriodProperty], tagged: &[PeriodProperty]) -> String {
    let parts: Vec<&str> = fixed
        .iter()
        .chain(tagged)
        .flat_map(|p| [p.name.as_str(), p.value.as_str()])
        .collect();
    format!("{}{JSON_EXTENSION}", parts.join("_"))
}

/// Renders a duration the way PromQL range selectors expect it (`5m`, `1h30m`, `250ms`).
pub fn prometheus_duration(duration: Duration) -> String {
    let mut millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, size) in [("h", 3_600_000u128), ("m", 60_000), ("s", 1_000), ("ms", 1)] {
        let count = millis / size;
        if count > 0 {
            out.push_str(&format!("{count}{unit}"));
            millis -= count * size;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> TimeWindow {
        TimeWindow::starting_at(
            Utc.timestamp_opt(1_590_000_000, 0).unwrap(),
            Duration::from_secs(300),
        )
        .unwrap()
    }

    #[test]
    fn end_is_start_plus_length() {
        let w = window();
        assert_eq!((w.end - w.start).num_seconds(), 300);
        assert_eq!(w.length, Duration::from_secs(300));
    }

    #[test]
    fn filename_from_tagged_only() {
        let w = window().with_tagged(vec![PeriodProperty::new("network_size", "5")]);
        assert_eq!(w.output_filename().unwrap(), "network_size_5.json");
    }

    #[test]
    fn filename_puts_group_properties_first() {
        let fixed = vec![PeriodProperty::new("latency", "50ms")];
        let five = window()
            .with_fixed(fixed.clone())
            .with_tagged(vec![PeriodProperty::new("network_size", "5")]);
        let ten = window()
            .with_fixed(fixed)
            .with_tagged(vec![PeriodProperty::new("network_size", "10")]);

        assert_eq!(
            five.output_filename().unwrap(),
            "latency_50ms_network_size_5.json"
        );
        assert_eq!(
            ten.output_filename().unwrap(),
            "latency_50ms_network_size_10.json"
        );
    }

    #[test]
    fn filename_is_deterministic() {
        let w = window().with_tagged(vec![
            PeriodProperty::new("network_size", "5"),
            PeriodProperty::new("pulse", "10s"),
        ]);
        assert_eq!(w.output_filename().unwrap(), w.output_filename().unwrap());
        assert_eq!(w.output_filename().unwrap(), "network_size_5_pulse_10s.json");
    }

    #[test]
    fn empty_tag_sets_degenerate_and_are_rejected() {
        assert_eq!(raw_filename(&[], &[]), ".json");

        let err = window().output_filename().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn path_separators_are_rejected() {
        let w = window().with_tagged(vec![PeriodProperty::new("dir", "../etc")]);
        assert!(w.output_filename().is_err());
    }

    #[test]
    fn prometheus_durations() {
        assert_eq!(prometheus_duration(Duration::from_secs(300)), "5m");
        assert_eq!(prometheus_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(prometheus_duration(Duration::from_secs(10)), "10s");
        assert_eq!(prometheus_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(prometheus_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(prometheus_duration(Duration::from_millis(1500)), "1s500ms");
        assert_eq!(prometheus_duration(Duration::ZERO), "0s");
    }
}
