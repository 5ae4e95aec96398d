use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::files::INDEX_FILENAME;
use crate::records::{OutputIndex, WindowResult};
use crate::webdav::WebDavClient;
use crate::window::JSON_EXTENSION;

pub const REPORT_FILENAME: &str = "index.html";

const TEMPLATE: &str = include_str!("report_template.html");

/// Run index plus every window document found next to it.
#[derive(Debug, Clone)]
pub struct ReportInput {
    pub index: OutputIndex,
    pub windows: Vec<(String, WindowResult)>,
}

fn is_window_document(name: &str) -> bool {
    name.ends_with(JSON_EXTENSION) && name != INDEX_FILENAME
}

fn parse_document<T: serde::de::DeserializeOwned>(bytes: &[u8], source: &str) -> Result<T> {
    serde_json::from_slice(bytes).with_context(|| format!("failed to parse {source}"))
}

pub fn read_report_input(dir: &Path) -> Result<ReportInput> {
    let index_path = dir.join(INDEX_FILENAME);
    let bytes = std::fs::read(&index_path)
        .with_context(|| format!("failed to read {}", index_path.display()))?;
    let index: OutputIndex = parse_document(&bytes, &index_path.display().to_string())?;

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_window_document(&name) {
            names.push(name);
        }
    }
    names.sort();

    let mut windows = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        let bytes =
            std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let window: WindowResult = parse_document(&bytes, &path.display().to_string())?;
        windows.push((name, window));
    }
    Ok(ReportInput { index, windows })
}

/// Reads the run index and window documents a previous `replicate` uploaded
/// into `remote_dir`.
pub async fn read_remote_report_input(
    client: &WebDavClient,
    remote_dir: &str,
) -> Result<ReportInput> {
    let index_path = format!("{remote_dir}/{INDEX_FILENAME}");
    let bytes = client
        .get(&index_path)
        .await
        .with_context(|| format!("failed to fetch {index_path}"))?;
    let index: OutputIndex = parse_document(&bytes, &index_path)?;

    let names: Vec<String> = client
        .list_files(remote_dir)
        .await?
        .into_iter()
        .filter(|name| is_window_document(name))
        .collect();

    let mut windows = Vec::with_capacity(names.len());
    for name in names {
        let path = format!("{remote_dir}/{name}");
        let bytes = client
            .get(&path)
            .await
            .with_context(|| format!("failed to fetch {path}"))?;
        let window: WindowResult = parse_document(&bytes, &path)?;
        windows.push((name, window));
    }
    tracing::debug!(remote_dir = %remote_dir, windows = windows.len(), "read remote report input");
    Ok(ReportInput { index, windows })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct XAxis {
    pub name: String,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    /// One point per x axis entry; `None` where the window has no such record.
    pub data: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub name: String,
    pub description: String,
    pub series: Vec<Series>,
    pub y_axis_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportData {
    pub x_axis: XAxis,
    pub charts: Vec<Chart>,
}

/// Lays window documents out along the numeric `x_property` and builds one
/// chart per indexed chart name. Records are matched by (chart, quantile).
pub fn build_report_data(
    input: &ReportInput,
    x_property: &str,
    x_axis_name: &str,
) -> Result<ReportData> {
    let mut points: Vec<(f64, &WindowResult)> = Vec::new();
    for (name, window) in &input.windows {
        let Some(raw) = window.property(x_property) else {
            tracing::warn!(file = %name, property = %x_property, "window has no x axis property, skipping");
            continue;
        };
        match raw.trim().parse::<f64>() {
            Ok(x) if x.is_finite() => points.push((x, window)),
            _ => {
                tracing::warn!(file = %name, property = %x_property, value = %raw, "x axis value is not a number, skipping");
            }
        }
    }
    if points.is_empty() {
        anyhow::bail!("no window carries a numeric `{x_property}` property");
    }
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let charts = input
        .index
        .charts
        .iter()
        .map(|chart| {
            let sample = points
                .iter()
                .find_map(|(_, w)| w.records.iter().find(|r| &r.chart == chart));
            let takes_quantile = sample.is_some_and(|r| !r.quantile.is_empty());
            let series_keys: Vec<&str> = if takes_quantile {
                input.index.quantiles.iter().map(String::as_str).collect()
            } else {
                vec![""]
            };
            let series = series_keys
                .into_iter()
                .map(|quantile| Series {
                    name: if quantile.is_empty() {
                        chart.clone()
                    } else {
                        quantile.to_string()
                    },
                    data: points
                        .iter()
                        .map(|(_, w)| w.record(chart, quantile).map(|r| r.value))
                        .collect(),
                })
                .collect();
            Chart {
                name: chart.clone(),
                description: sample.map(|r| r.description.clone()).unwrap_or_default(),
                series,
                y_axis_name: sample.map(|r| r.unit.clone()).unwrap_or_default(),
            }
        })
        .collect();

    Ok(ReportData {
        x_axis: XAxis {
            name: x_axis_name.to_string(),
            data: points.iter().map(|(x, _)| *x).collect(),
        },
        charts,
    })
}

pub fn render_html(data: &ReportData, git_branch: &str, git_hash: &str) -> Result<String> {
    let x_axis = script_json(&data.x_axis).context("encode x axis")?;
    let charts = script_json(&data.charts).context("encode charts")?;
    Ok(fill_template(
        TEMPLATE,
        &[
            ("GIT_BRANCH", html_escape(git_branch)),
            ("GIT_HASH", html_escape(git_hash)),
            ("X_AXIS_JSON", x_axis),
            ("CHARTS_JSON", charts),
        ],
    ))
}

/// JSON that is safe to inline in a `<script>` element.
fn script_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    Ok(json
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026"))
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Single pass over `{{NAME}}` placeholders; substituted text is never rescanned.
fn fill_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let replaced = after.find("}}").and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (value, close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
