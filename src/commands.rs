use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::files::{WorkDir, INDEX_FILENAME};
use crate::prometheus::PrometheusClient;
use crate::properties::PropertyCatalog;
use crate::records::OutputIndex;
use crate::replicator::Replicator;
use crate::report::{
    build_report_data, read_remote_report_input, read_report_input, render_html, REPORT_FILENAME,
};
use crate::webdav::WebDavClient;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicateOptions {
    pub keep_tmp: bool,
    pub skip_upload: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateSummary {
    pub files: Vec<String>,
    pub charts: Vec<String>,
    pub remote_dir: Option<String>,
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .build()
        .context("failed to build http client")
}

fn webdav_client(config: &Config, http: reqwest::Client) -> Result<WebDavClient> {
    let webdav = config
        .webdav
        .as_ref()
        .context("webdav section is required for upload")?;
    WebDavClient::new(
        &webdav.host,
        &webdav.username,
        &webdav.password,
        Duration::from_secs(webdav.timeout_seconds),
        http,
    )
}

/// Queries every configured window into a fresh working dir, writes the index
/// and uploads everything to WebDAV.
pub async fn replicate(
    config: &Config,
    options: ReplicateOptions,
    cancel: CancellationToken,
) -> Result<ReplicateSummary> {
    let windows = config.windows()?;
    let mode = config.aggregation_mode();
    let catalog = PropertyCatalog::consensus(&mode)?;
    let http = http_client()?;

    let upload = if options.skip_upload {
        None
    } else {
        Some((webdav_client(config, http.clone())?, config.remote_dir()?))
    };

    let mut work = WorkDir::create(&config.tmp_dir)?;
    if options.keep_tmp {
        work.keep();
    }

    tracing::info!(
        windows = windows.len(),
        properties = catalog.len(),
        quantiles = config.quantiles.len(),
        mode = %mode,
        "starting extraction"
    );
    let backend = PrometheusClient::new(&config.prometheus.host, http);
    let replicator = Replicator::new(backend, work.sink(), catalog, mode)?
        .with_query_timeout(config.query_timeout())
        .with_cancellation(cancel);

    let outcome = replicator
        .grab_records(&config.quantiles, &windows)
        .await
        .context("failed to grab records")?;
    replicator
        .make_index_file(
            &OutputIndex {
                charts: outcome.charts.clone(),
                quantiles: config.quantiles.clone(),
            },
            INDEX_FILENAME,
        )
        .context("failed to write index")?;

    let mut remote_dir = None;
    if let Some((client, dir)) = upload {
        let mut files = outcome.files.clone();
        files.push(INDEX_FILENAME.to_string());
        client
            .upload_files(work.path(), &dir, &files)
            .await
            .context("failed to upload files")?;
        tracing::info!(remote_dir = %dir, files = files.len(), "upload finished");
        remote_dir = Some(dir);
    }

    Ok(ReplicateSummary {
        files: outcome.files,
        charts: outcome.charts,
        remote_dir,
    })
}

/// Where `report` reads the run index and window documents from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportSource {
    /// A local directory, e.g. a working dir kept with `--keep-tmp`.
    Dir(PathBuf),
    /// The WebDAV directory the run was uploaded to.
    Remote,
}

impl ReportSource {
    pub fn needs_webdav(&self) -> bool {
        matches!(self, Self::Remote)
    }
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub source: ReportSource,
    /// Defaults to `index.html` in the input dir, or in the current dir for remote input.
    pub output: Option<PathBuf>,
    pub upload: bool,
}

/// Renders `index.html` from a run's documents; returns where it was written.
pub async fn report(config: &Config, options: &ReportOptions) -> Result<PathBuf> {
    let client = if options.upload || options.source.needs_webdav() {
        Some((webdav_client(config, http_client()?)?, config.remote_dir()?))
    } else {
        None
    };

    let input = match &options.source {
        ReportSource::Dir(dir) => read_report_input(dir)?,
        ReportSource::Remote => {
            let (client, remote_dir) = client
                .as_ref()
                .context("webdav section is required for remote input")?;
            read_remote_report_input(client, remote_dir).await?
        }
    };
    let data = build_report_data(
        &input,
        &config.report.x_axis_property,
        &config.report.x_axis_name,
    )?;
    let html = render_html(&data, &config.git.branch, &config.git.hash)?;

    let output = match (&options.output, &options.source) {
        (Some(path), _) => path.clone(),
        (None, ReportSource::Dir(dir)) => dir.join(REPORT_FILENAME),
        (None, ReportSource::Remote) => PathBuf::from(REPORT_FILENAME),
    };
    write_replacing(&output, html.as_bytes())?;
    tracing::info!(
        path = %output.display(),
        charts = data.charts.len(),
        points = data.x_axis.data.len(),
        "report written"
    );

    if let Some((client, remote_dir)) = client.filter(|_| options.upload) {
        client.mkdir_all(&remote_dir).await?;
        client
            .put(&format!("{remote_dir}/{REPORT_FILENAME}"), html.into_bytes())
            .await
            .context("failed to upload report")?;
        tracing::info!(remote_dir = %remote_dir, "report uploaded");
    }
    Ok(output)
}

fn write_replacing(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to stage {}", path.display()))?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RecordInfo, WindowResult};
    use crate::test_support::FakeWebDav;
    use crate::window::{PeriodProperty, TimeWindow};
    use chrono::{TimeZone, Utc};

    fn config(webdav_host: &str) -> Config {
        let yaml = format!(
            r#"
quantiles: ["0.8"]
tmp_dir: /tmp/unused
prometheus:
  host: http://127.0.0.1:1
groups:
  - ranges:
      - start_time: 1590000000
        interval_seconds: 60
        props: [{{name: network_size, value: "5"}}]
webdav:
  host: {webdav_host}
  username: bench
  password: secret
git:
  branch: master
  hash: abc123
"#
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn write_inputs(dir: &Path) -> anyhow::Result<()> {
        let index = OutputIndex {
            charts: vec!["phase2_duration".to_string()],
            quantiles: vec!["0.8".to_string()],
        };
        std::fs::write(dir.join(INDEX_FILENAME), index.to_json()?)?;
        for size in ["5", "10"] {
            let window = TimeWindow::starting_at(
                Utc.timestamp_opt(1_590_000_000, 0).unwrap(),
                Duration::from_secs(60),
            )?
            .with_tagged(vec![PeriodProperty::new("network_size", size)]);
            let result = WindowResult::new(
                &window,
                vec![],
                vec![RecordInfo {
                    chart: "phase2_duration".to_string(),
                    formula: "q".to_string(),
                    description: "Duration of consensus phase2".to_string(),
                    unit: "ms".to_string(),
                    value: size.parse()?,
                    quantile: "0.8".to_string(),
                }],
            );
            std::fs::write(dir.join(window.output_filename()?), result.to_json()?)?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn report_writes_and_uploads_html() -> anyhow::Result<()> {
        let server = FakeWebDav::start("bench", "secret").await?;
        let dir = tempfile::tempdir()?;
        write_inputs(dir.path())?;

        let output = report(
            &config(&server.base_url()),
            &ReportOptions {
                source: ReportSource::Dir(dir.path().to_path_buf()),
                output: None,
                upload: true,
            },
        )
        .await?;

        assert_eq!(output, dir.path().join(REPORT_FILENAME));
        let html = std::fs::read_to_string(&output)?;
        assert!(html.contains("abc123"));
        assert!(html.contains("\"data\":[5.0,10.0]"), "{html}");
        assert_eq!(server.file("abc123/index.html"), Some(html.into_bytes()));
        Ok(())
    }

    #[tokio::test]
    async fn report_overwrites_previous_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_inputs(dir.path())?;
        let out = dir.path().join("custom.html");
        std::fs::write(&out, "old")?;

        let options = ReportOptions {
            source: ReportSource::Dir(dir.path().to_path_buf()),
            output: Some(out.clone()),
            upload: false,
        };
        report(&config("http://127.0.0.1:1"), &options).await?;
        assert_ne!(std::fs::read_to_string(&out)?, "old");
        Ok(())
    }

    #[tokio::test]
    async fn report_reads_uploaded_run_back_from_webdav() -> anyhow::Result<()> {
        let server = FakeWebDav::start("bench", "secret").await?;
        let config = config(&server.base_url());
        let staged = tempfile::tempdir()?;
        write_inputs(staged.path())?;
        let client = webdav_client(&config, reqwest::Client::new())?;
        let mut files: Vec<String> = std::fs::read_dir(staged.path())?
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        files.sort();
        client.upload_files(staged.path(), "abc123", &files).await?;

        let out = tempfile::tempdir()?;
        let output = report(
            &config,
            &ReportOptions {
                source: ReportSource::Remote,
                output: Some(out.path().join("report.html")),
                upload: true,
            },
        )
        .await?;

        let html = std::fs::read_to_string(&output)?;
        assert!(html.contains("\"data\":[5.0,10.0]"), "{html}");
        assert_eq!(server.file("abc123/index.html"), Some(html.into_bytes()));
        assert!(server.requests().contains(&"PROPFIND /abc123".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn remote_report_without_webdav_fails_early() -> anyhow::Result<()> {
        let mut config = config("http://127.0.0.1:1");
        config.webdav = None;
        let out = tempfile::tempdir()?;
        let err = report(
            &config,
            &ReportOptions {
                source: ReportSource::Remote,
                output: Some(out.path().join("report.html")),
                upload: false,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("webdav"), "{err}");
        assert!(!out.path().join("report.html").exists());
        Ok(())
    }

    #[test]
    fn failed_persist_names_the_target() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("taken");
        std::fs::create_dir(&target)?;
        std::fs::write(target.join("keep"), "x")?;
        let err = write_replacing(&target, b"html").unwrap_err();
        assert!(err.to_string().contains("failed to persist"), "{err}");
        assert!(err.to_string().contains("taken"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn replicate_checks_upload_target_before_querying() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let mut config = config("http://127.0.0.1:1");
        config.tmp_dir = root.path().join("run");
        config.webdav = None;

        let err = replicate(&config, ReplicateOptions::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("webdav"), "{err}");
        assert!(!config.tmp_dir.exists());
        Ok(())
    }
}
