use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

use crate::aggregate::AggregationMode;
use crate::error::BackendError;
use crate::prometheus::{
    InstantSample, Labels, MetricsBackend, QueryData, QueryOutput, QueryRange, RangeSeries,
    SamplePoint,
};
use crate::properties::{PropertyCatalog, PropertyDefinition};

#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub query: String,
    pub at: Option<DateTime<Utc>>,
    pub range: Option<QueryRange>,
}

type Handler = Box<dyn Fn(&BackendCall) -> Result<QueryData, BackendError> + Send + Sync>;

/// Scripted backend: every call is recorded and answered by `handler`.
pub struct MockBackend {
    handler: Handler,
    warnings: Vec<String>,
    calls: Mutex<Vec<BackendCall>>,
}

impl MockBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&BackendCall) -> Result<QueryData, BackendError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            warnings: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, call: BackendCall) -> Result<QueryOutput, BackendError> {
        let result = (self.handler)(&call);
        self.calls.lock().unwrap().push(call);
        result.map(|data| QueryOutput {
            data,
            warnings: self.warnings.clone(),
        })
    }
}

impl MetricsBackend for MockBackend {
    async fn query_instant(
        &self,
        query: &str,
        at: DateTime<Utc>,
    ) -> Result<QueryOutput, BackendError> {
        self.answer(BackendCall {
            query: query.to_string(),
            at: Some(at),
            range: None,
        })
    }

    async fn query_range(
        &self,
        query: &str,
        range: QueryRange,
    ) -> Result<QueryOutput, BackendError> {
        self.answer(BackendCall {
            query: query.to_string(),
            at: None,
            range: Some(range),
        })
    }
}

/// Backend that answers only after `delay`.
pub struct SlowBackend {
    delay: Duration,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl MetricsBackend for SlowBackend {
    async fn query_instant(
        &self,
        _query: &str,
        _at: DateTime<Utc>,
    ) -> Result<QueryOutput, BackendError> {
        tokio::time::sleep(self.delay).await;
        Ok(QueryOutput {
            data: vector(&[1.0]),
            warnings: Vec::new(),
        })
    }

    async fn query_range(
        &self,
        _query: &str,
        _range: QueryRange,
    ) -> Result<QueryOutput, BackendError> {
        tokio::time::sleep(self.delay).await;
        Ok(QueryOutput {
            data: matrix(&[&[1.0]]),
            warnings: Vec::new(),
        })
    }
}

pub fn vector(values: &[f64]) -> QueryData {
    QueryData::Vector(
        values
            .iter()
            .enumerate()
            .map(|(i, value)| InstantSample {
                metric: labels(i),
                value: SamplePoint {
                    timestamp: 0.0,
                    value: *value,
                },
            })
            .collect(),
    )
}

pub fn matrix(series: &[&[f64]]) -> QueryData {
    QueryData::Matrix(
        series
            .iter()
            .enumerate()
            .map(|(i, values)| RangeSeries {
                metric: labels(i),
                values: values
                    .iter()
                    .enumerate()
                    .map(|(t, value)| SamplePoint {
                        timestamp: (t * 10) as f64,
                        value: *value,
                    })
                    .collect(),
            })
            .collect(),
    )
}

fn labels(i: usize) -> Labels {
    Labels::from([("instance".to_string(), format!("node-{i}"))])
}

/// Three-property catalog: two quantile properties around one plain one.
pub fn small_catalog(mode: &AggregationMode) -> PropertyCatalog {
    let rate = if mode.uses_window_slot() { "${window}" } else { "20s" };
    PropertyCatalog::new(
        vec![
            PropertyDefinition::new(
                "sent_traffic_per_node",
                &format!("quantile(${{quantile}}, sum(rate(insolar_consensus_packets_sent_bytes[{rate}])) by (instance))"),
                "Sent consensus bytes by node per second",
                "bytes/sec",
                true,
            )
            .unwrap(),
            PropertyDefinition::new(
                "phase2_duration",
                &format!("histogram_quantile(${{quantile}}, sum(rate(insolar_phase2_latency_bucket[{rate}])) by (le))"),
                "Duration of consensus phase2",
                "ms",
                true,
            )
            .unwrap(),
            PropertyDefinition::new(
                "sent_traffic",
                &format!("sum(rate(insolar_consensus_packets_sent_bytes[{rate}]))"),
                "Overall network sent bytes per second",
                "bytes/sec",
                false,
            )
            .unwrap(),
        ],
        mode,
    )
    .unwrap()
}

#[derive(Default)]
struct DavStore {
    collections: std::collections::HashSet<String>,
    files: std::collections::HashMap<String, Vec<u8>>,
    requests: Vec<String>,
}

#[derive(Clone)]
struct DavState {
    store: std::sync::Arc<Mutex<DavStore>>,
    authorization: String,
}

/// In-process WebDAV server with basic auth, MKCOL, PUT, GET and a Depth 1 PROPFIND.
pub struct FakeWebDav {
    addr: std::net::SocketAddr,
    store: std::sync::Arc<Mutex<DavStore>>,
}

impl FakeWebDav {
    /// `authorization` is the full expected `Authorization` header value.
    pub async fn start_with_header(authorization: &str) -> anyhow::Result<Self> {
        let store = std::sync::Arc::new(Mutex::new(DavStore::default()));
        let app = axum::Router::new()
            .fallback(dav_handler)
            .with_state(DavState {
                store: store.clone(),
                authorization: authorization.to_string(),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Ok(Self { addr, store })
    }

    /// Only `bench:secret` is accepted.
    pub async fn start(username: &str, password: &str) -> anyhow::Result<Self> {
        assert_eq!((username, password), ("bench", "secret"));
        Self::start_with_header("Basic YmVuY2g6c2VjcmV0").await
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<String> {
        self.store.lock().unwrap().requests.clone()
    }

    pub fn has_collection(&self, path: &str) -> bool {
        self.store.lock().unwrap().collections.contains(path)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.store.lock().unwrap().files.get(path).cloned()
    }
}

async fn dav_handler(
    axum::extract::State(state): axum::extract::State<DavState>,
    method: axum::http::Method,
    uri: axum::http::Uri,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> (axum::http::StatusCode, Vec<u8>) {
    use axum::http::StatusCode;

    let authorized = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(state.authorization.as_str());
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Vec::new());
    }

    let path = uri.path().trim_matches('/').to_string();
    let mut store = state.store.lock().unwrap();
    let parent_exists = match path.rsplit_once('/') {
        Some((parent, _)) => store.collections.contains(parent),
        None => true,
    };
    store.requests.push(format!("{} /{}", method, path));
    match method.as_str() {
        "MKCOL" if store.collections.contains(&path) => (StatusCode::METHOD_NOT_ALLOWED, Vec::new()),
        "MKCOL" if !parent_exists => (StatusCode::CONFLICT, Vec::new()),
        "MKCOL" => {
            store.collections.insert(path);
            (StatusCode::CREATED, Vec::new())
        }
        "PUT" if !parent_exists => (StatusCode::CONFLICT, Vec::new()),
        "PUT" => {
            store.files.insert(path, body.to_vec());
            (StatusCode::CREATED, Vec::new())
        }
        "GET" => match store.files.get(&path) {
            Some(bytes) => (StatusCode::OK, bytes.clone()),
            None => (StatusCode::NOT_FOUND, Vec::new()),
        },
        "PROPFIND" if !path.is_empty() && !store.collections.contains(&path) => {
            (StatusCode::NOT_FOUND, Vec::new())
        }
        "PROPFIND" => (StatusCode::MULTI_STATUS, multistatus(&store, &path).into_bytes()),
        _ => (StatusCode::METHOD_NOT_ALLOWED, Vec::new()),
    }
}

fn multistatus(store: &DavStore, dir: &str) -> String {
    let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
    let child = |key: &String| {
        key.strip_prefix(&prefix)
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
    };
    let response = |href: String, collection: bool| {
        let kind = if collection { "<D:collection/>" } else { "" };
        format!(
            "<D:response><D:href>{href}</D:href><D:propstat><D:prop>\
             <D:resourcetype>{kind}</D:resourcetype></D:prop>\
             <D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>"
        )
    };

    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><D:multistatus xmlns:D="DAV:">"#);
    xml.push_str(&response(format!("/{prefix}"), true));
    for key in store.collections.iter().filter(|k| child(k)) {
        xml.push_str(&response(format!("/{key}/"), true));
    }
    for key in store.files.keys().filter(|k| child(k)) {
        xml.push_str(&response(format!("/{key}"), false));
    }
    xml.push_str("</D:multistatus>");
    xml
}
