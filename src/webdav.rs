use anyhow::{Context, Result};
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, StatusCode};
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_WEBDAV_TIMEOUT: Duration = Duration::from_secs(60);

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

/// Minimal WebDAV client for publishing run artifacts.
#[derive(Clone)]
pub struct WebDavClient {
    base_url: Url,
    username: String,
    password: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl WebDavClient {
    pub fn new(
        host: &str,
        username: &str,
        password: &str,
        timeout: Duration,
        http: reqwest::Client,
    ) -> Result<Self> {
        let base_url = Url::parse(host.trim_end_matches('/'))
            .with_context(|| format!("invalid webdav host {host}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("webdav host {host} cannot be used as a base url");
        }
        Ok(Self {
            base_url,
            username: username.to_string(),
            password: password.to_string(),
            timeout,
            http,
        })
    }

    pub fn url_for(&self, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("webdav host {} has no path", self.base_url))?;
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.timeout)
    }

    /// Creates one collection. An existing collection (405) is not an error.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let url = self.url_for(path)?;
        let method = Method::from_bytes(b"MKCOL").context("build MKCOL method")?;
        let resp = self
            .request(method, url.clone())
            .send()
            .await
            .with_context(|| format!("webdav MKCOL request failed for {url}"))?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            tracing::debug!(url = %url, status = %status, "webdav collection ready");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("webdav MKCOL {url} failed: {status} {body}");
    }

    /// Creates `path` and each missing parent collection.
    pub async fn mkdir_all(&self, path: &str) -> Result<()> {
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            self.mkdir(&prefix).await?;
        }
        Ok(())
    }

    pub async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.url_for(path)?;
        let resp = self
            .request(Method::PUT, url.clone())
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("webdav PUT request failed for {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("webdav PUT {url} failed: {status} {body}");
        }
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url_for(path)?;
        let resp = self
            .request(Method::GET, url.clone())
            .send()
            .await
            .with_context(|| format!("webdav GET request failed for {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("webdav GET {url} failed: {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Names of the plain files directly inside the collection at `path`,
    /// sorted. Sub-collections are left out.
    pub async fn list_files(&self, path: &str) -> Result<Vec<String>> {
        let mut url = self.url_for(path)?;
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }
        let method = Method::from_bytes(b"PROPFIND").context("build PROPFIND method")?;
        let resp = self
            .request(method, url.clone())
            .header("Depth", "1")
            .header(reqwest::header::CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await
            .with_context(|| format!("webdav PROPFIND request failed for {url}"))?;
        let status = resp.status();
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("webdav PROPFIND {url} failed: {status} {body}");
        }
        let body = resp.text().await?;
        let mut names: Vec<String> = parse_multistatus(&body)
            .with_context(|| format!("invalid PROPFIND response from {url}"))?
            .into_iter()
            .filter(|entry| !entry.collection)
            .filter_map(|entry| entry_name(&entry.href))
            .collect();
        names.sort();
        tracing::debug!(url = %url, files = names.len(), "webdav listing");
        Ok(names)
    }

    /// Uploads `files` from `local_dir` into `remote_dir`, in order. The first
    /// failure aborts the upload.
    pub async fn upload_files(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        files: &[String],
    ) -> Result<()> {
        self.mkdir_all(remote_dir).await?;
        for name in files {
            let local = local_dir.join(name);
            let bytes = tokio::fs::read(&local)
                .await
                .with_context(|| format!("failed to read {}", local.display()))?;
            let size = bytes.len();
            self.put(&format!("{remote_dir}/{name}"), bytes).await?;
            tracing::info!(file = %name, remote_dir = %remote_dir, bytes = size, "uploaded");
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq)]
struct DavEntry {
    href: String,
    collection: bool,
}

/// Pulls `href` and the collection flag out of each `response` element,
/// whatever namespace prefix the server uses.
fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut in_href = false;
    loop {
        match reader.read_event()? {
            Event::Start(tag) => match tag.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"href" => in_href = true,
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.collection = true;
                    }
                }
                _ => {}
            },
            Event::Empty(tag) if tag.local_name().as_ref() == b"collection" => {
                if let Some(entry) = current.as_mut() {
                    entry.collection = true;
                }
            }
            Event::Text(text) if in_href => {
                if let Some(entry) = current.as_mut() {
                    entry.href.push_str(&text.unescape()?);
                }
            }
            Event::End(tag) => match tag.local_name().as_ref() {
                b"href" => in_href = false,
                b"response" => entries.extend(current.take()),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

/// Last path segment of an href (absolute URL or path), percent-decoded.
fn entry_name(href: &str) -> Option<String> {
    let path = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|name| name.into_owned())
}
