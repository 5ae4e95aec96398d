use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::AggregationMode;
use crate::window::{PeriodProperty, TimeWindow};

const ENV_PREFIX: &str = "REPLICATOR_";
const REDACTED: &str = "***";

fn default_range_step_seconds() -> u64 {
    10
}

fn default_query_timeout_seconds() -> u64 {
    30
}

fn default_webdav_timeout_seconds() -> u64 {
    60
}

fn default_x_axis_property() -> String {
    "network_size".to_string()
}

fn default_x_axis_name() -> String {
    "Nodes count".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub quantiles: Vec<String>,
    #[serde(default)]
    pub tmp_dir: PathBuf,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub webdav: Option<WebDavConfig>,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    #[default]
    RangeMax,
    InstantAtEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub aggregation: AggregationKind,
    #[serde(default = "default_range_step_seconds")]
    pub range_step_seconds: u64,
    #[serde(default = "default_query_timeout_seconds")]
    pub query_timeout_seconds: u64,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            aggregation: AggregationKind::default(),
            range_step_seconds: default_range_step_seconds(),
            query_timeout_seconds: default_query_timeout_seconds(),
        }
    }
}

/// Windows sharing group-level (`network`) properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub network: Vec<PeriodProperty>,
    #[serde(default)]
    pub ranges: Vec<RangeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeConfig {
    /// Unix seconds.
    pub start_time: i64,
    /// Plain seconds (`300`) or a humantime string (`"5m"`, `"1h 30m"`).
    #[serde(alias = "interval_seconds", with = "interval_format")]
    pub interval: Duration,
    #[serde(default)]
    pub props: Vec<PeriodProperty>,
}

mod interval_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => {
                let text = text.trim();
                if let Ok(secs) = text.parse::<u64>() {
                    return Ok(Duration::from_secs(secs));
                }
                humantime::parse_duration(text).map_err(|err| {
                    serde::de::Error::custom(format!("invalid interval `{text}`: {err}"))
                })
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebDavConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_webdav_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub directory: Option<String>,
}

impl Default for WebDavConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_seconds: default_webdav_timeout_seconds(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_x_axis_property")]
    pub x_axis_property: String,
    #[serde(default = "default_x_axis_name")]
    pub x_axis_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            x_axis_property: default_x_axis_property(),
            x_axis_name: default_x_axis_name(),
        }
    }
}

impl Config {
    /// Reads `path` and applies `.env` and `REPLICATOR_*` overrides, without validating.
    pub fn read(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// [`Config::read`] followed by the checks `replicate` needs.
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// [`Config::read`] followed by the checks `report` needs.
    pub fn load_for_report(path: &Path, needs_webdav: bool) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate_report(needs_webdav)?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// `lookup` receives the full variable name; blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = get("PROMETHEUS_HOST") {
            self.prometheus.host = host;
        }
        if let Some(dir) = get("TMP_DIR") {
            self.tmp_dir = PathBuf::from(dir);
        }
        if let Some(branch) = get("GIT_BRANCH") {
            self.git.branch = branch;
        }
        if let Some(hash) = get("GIT_HASH") {
            self.git.hash = hash;
        }

        let webdav_overrides = [
            get("WEBDAV_HOST"),
            get("WEBDAV_USERNAME"),
            get("WEBDAV_PASSWORD"),
            get("WEBDAV_DIRECTORY"),
        ];
        if webdav_overrides.iter().any(Option::is_some) {
            let webdav = self.webdav.get_or_insert_with(WebDavConfig::default);
            let [host, username, password, directory] = webdav_overrides;
            if let Some(host) = host {
                webdav.host = host;
            }
            if let Some(username) = username {
                webdav.username = username;
            }
            if let Some(password) = password {
                webdav.password = password;
            }
            if directory.is_some() {
                webdav.directory = directory;
            }
        }
    }

    /// Checks the whole config and reports every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.quantiles.is_empty() {
            errors.push("quantiles: at least one quantile is required".to_string());
        }
        for q in &self.quantiles {
            match q.trim().parse::<f64>() {
                Ok(v) if (0.0..=1.0).contains(&v) => {}
                _ => errors.push(format!("quantiles: `{q}` is not a number in [0, 1]")),
            }
        }
        if self.tmp_dir.as_os_str().is_empty() {
            errors.push("tmp_dir: required".to_string());
        }
        if self.prometheus.host.trim().is_empty() {
            errors.push("prometheus.host: required".to_string());
        }
        if self.prometheus.aggregation == AggregationKind::RangeMax
            && self.prometheus.range_step_seconds == 0
        {
            errors.push("prometheus.range_step_seconds: must be > 0".to_string());
        }
        if self.prometheus.query_timeout_seconds == 0 {
            errors.push("prometheus.query_timeout_seconds: must be > 0".to_string());
        }

        if self.groups.is_empty() {
            errors.push("groups: at least one group is required".to_string());
        }
        for (g, group) in self.groups.iter().enumerate() {
            if group.ranges.is_empty() {
                errors.push(format!("groups[{g}].ranges: at least one range is required"));
            }
            for (r, range) in group.ranges.iter().enumerate() {
                let at = format!("groups[{g}].ranges[{r}]");
                if range.interval.is_zero() {
                    errors.push(format!("{at}.interval: must be > 0"));
                } else if range.interval.subsec_nanos() != 0 {
                    errors.push(format!("{at}.interval: must be a whole number of seconds"));
                }
                if range.props.is_empty() {
                    errors.push(format!("{at}.props: at least one property is required"));
                }
                if Utc.timestamp_opt(range.start_time, 0).single().is_none() {
                    errors.push(format!("{at}.start_time: {} is out of range", range.start_time));
                }
            }
        }

        self.check_webdav(&mut errors);
        finish_validation(errors)
    }

    /// Checks only what rendering a report reads: the x axis settings and, when
    /// the report is fetched from or uploaded to WebDAV, the webdav section and
    /// remote directory. Quantiles, groups and Prometheus are not consulted.
    pub fn validate_report(&self, needs_webdav: bool) -> Result<()> {
        let mut errors = Vec::new();
        if self.report.x_axis_property.trim().is_empty() {
            errors.push("report.x_axis_property: required".to_string());
        }
        if needs_webdav {
            if self.webdav.is_none() {
                errors.push("webdav: required to read or upload reports remotely".to_string());
            }
            if let Err(err) = self.remote_dir() {
                errors.push(err.to_string());
            }
        }
        self.check_webdav(&mut errors);
        finish_validation(errors)
    }

    fn check_webdav(&self, errors: &mut Vec<String>) {
        if let Some(webdav) = &self.webdav {
            if webdav.host.trim().is_empty() {
                errors.push("webdav.host: required when webdav is configured".to_string());
            }
            if webdav.timeout_seconds == 0 {
                errors.push("webdav.timeout_seconds: must be > 0".to_string());
            }
        }
    }

    pub fn aggregation_mode(&self) -> AggregationMode {
        match self.prometheus.aggregation {
            AggregationKind::RangeMax => AggregationMode::RangeMax {
                step: Duration::from_secs(self.prometheus.range_step_seconds),
            },
            AggregationKind::InstantAtEnd => AggregationMode::InstantAtEnd,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.prometheus.query_timeout_seconds)
    }

    /// Expands groups into windows, in declaration order.
    pub fn windows(&self) -> Result<Vec<TimeWindow>> {
        let mut windows = Vec::new();
        for group in &self.groups {
            for range in &group.ranges {
                let start = Utc
                    .timestamp_opt(range.start_time, 0)
                    .single()
                    .with_context(|| format!("start_time {} is out of range", range.start_time))?;
                let window =
                    TimeWindow::starting_at(start, range.interval)?
                        .with_tagged(range.props.clone())
                        .with_fixed(group.network.clone())
                        .with_description(group.description.clone());
                windows.push(window);
            }
        }
        Ok(windows)
    }

    /// Remote directory for uploads: the configured one, else the git hash.
    pub fn remote_dir(&self) -> Result<String> {
        let configured = self
            .webdav
            .as_ref()
            .and_then(|w| w.directory.as_deref())
            .map(|d| d.trim_matches('/'))
            .filter(|d| !d.is_empty());
        if let Some(dir) = configured {
            return Ok(dir.to_string());
        }
        if self.git.hash.trim().is_empty() {
            anyhow::bail!("git.hash is required when webdav.directory is not set");
        }
        Ok(self.git.hash.trim().to_string())
    }

    /// Copy safe to log.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(webdav) = copy.webdav.as_mut() {
            if !webdav.password.is_empty() {
                webdav.password = REDACTED.to_string();
            }
        }
        copy
    }
}

fn finish_validation(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    anyhow::bail!("invalid config:\n  - {}", errors.join("\n  - "))
}
