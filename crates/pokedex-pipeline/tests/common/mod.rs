//! Shared helpers for pipeline integration tests
//!
//! - wiremock fixtures shaped like the catalog API
//! - an in-memory [`SinkBackend`] that records every call in order
//! - a scripted [`CatalogClient`] for tests that need exact control over
//!   timing and concurrency

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use pokedex_pipeline::catalog::CatalogClient;
use pokedex_pipeline::config::PipelineConfig;
use pokedex_pipeline::error::{FetchError, ListError, SinkError};
use pokedex_pipeline::model::{CatalogReference, DetailRecord, SinkRow, SinkSchema};
use pokedex_pipeline::sink::SinkBackend;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

pub const CATALOG_PATH: &str = "/api/v2/pokemon";

/// Initialize tracing for tests
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,pokedex_pipeline=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

/// Config pointed at a mock server and a temp staging dir, with no throttle
/// and millisecond backoff
pub fn test_config(base_url: &str, staging: &Path, limit: u32) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.source.base_url = base_url.to_string();
    config.source.catalog_limit = limit;
    config.staging.path = staging.to_path_buf();
    config.fetch.concurrency = 4;
    config.fetch.throttle_interval = Duration::ZERO;
    config.fetch.max_retries = 3;
    config.fetch.retry_backoff = Duration::from_millis(1);
    config.fetch.request_timeout = Duration::from_secs(5);
    config
}

pub fn catalog_url(server: &MockServer) -> String {
    format!("{}{}", server.uri(), CATALOG_PATH)
}

pub fn detail_url(server: &MockServer, id: i32) -> String {
    format!("{}{}/{}/", server.uri(), CATALOG_PATH, id)
}

pub fn detail_path(id: i32) -> String {
    format!("{CATALOG_PATH}/{id}/")
}

/// Catalog page in the source's shape
pub fn catalog_json(server: &MockServer, entries: &[(i32, &str)]) -> Value {
    let results: Vec<Value> = entries
        .iter()
        .map(|(id, name)| json!({ "name": name, "url": detail_url(server, *id) }))
        .collect();
    json!({ "count": 1302, "next": null, "previous": null, "results": results })
}

/// Detail document with a few fields beyond the projected ones
pub fn detail_json(id: i32, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "height": id * 3,
        "weight": id * 50,
        "base_experience": 60 + id,
        "order": id,
        "is_default": true,
        "types": [{ "slot": 1, "type": { "name": "grass" } }]
    })
}

pub async fn mount_catalog(server: &MockServer, entries: &[(i32, &str)], limit: u32) {
    Mock::given(method("GET"))
        .and(path(CATALOG_PATH))
        .and(query_param("limit", limit.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(catalog_json(server, entries)))
        .mount(server)
        .await;
}

pub async fn mount_detail(server: &MockServer, id: i32, name: &str) {
    Mock::given(method("GET"))
        .and(path(detail_path(id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(detail_json(id, name)))
        .mount(server)
        .await;
}

pub async fn mount_detail_status(server: &MockServer, id: i32, status: u16) {
    Mock::given(method("GET"))
        .and(path(detail_path(id)))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

// ============================================================================
// Event log shared by the recording doubles
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

// ============================================================================
// Recording sink
// ============================================================================

/// In-memory sink; append keeps a primary key set like the real table
#[derive(Default)]
pub struct RecordingSink {
    pub log: EventLog,
    pub rows: Mutex<Vec<SinkRow>>,
    pub writes: AtomicUsize,
    pub fail_provisioning: bool,
    pub slow_provisioning: bool,
}

impl RecordingSink {
    pub fn with_log(log: EventLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn failing_provisioning(log: EventLog) -> Self {
        Self {
            log,
            fail_provisioning: true,
            ..Default::default()
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn row_ids(&self) -> Vec<i32> {
        self.rows.lock().unwrap().iter().map(|r| r.id).collect()
    }
}

#[async_trait]
impl SinkBackend for RecordingSink {
    async fn ensure_database(&self, database: &str) -> Result<bool, SinkError> {
        self.log.push(format!("ensure_database:{database}"));
        if self.fail_provisioning {
            return Err(SinkError::Connection("connection refused".to_string()));
        }
        if self.slow_provisioning {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(false)
    }

    async fn ensure_table(&self, schema: &SinkSchema) -> Result<Vec<String>, SinkError> {
        self.log.push(format!("ensure_table:{}", schema.table()));
        Ok(SinkSchema::column_names().map(str::to_string).collect())
    }

    async fn append_rows(&self, _schema: &SinkSchema, rows: &[SinkRow]) -> Result<u64, SinkError> {
        self.log.push(format!("append:{}", rows.len()));
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut stored = self.rows.lock().unwrap();
        if let Some(dup) = rows.iter().find(|r| stored.iter().any(|s| s.id == r.id)) {
            return Err(SinkError::DuplicateKey(format!("Key (id)=({}) already exists.", dup.id)));
        }
        stored.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }
}

// ============================================================================
// Scripted catalog client
// ============================================================================

/// Catalog client answering from memory, tracking concurrent detail calls
pub struct ScriptedClient {
    pub references: Vec<CatalogReference>,
    pub failures: HashMap<i32, FetchError>,
    pub delay: Duration,
    pub log: EventLog,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(ids: impl IntoIterator<Item = i32>, delay: Duration, log: EventLog) -> Self {
        let references = ids
            .into_iter()
            .map(|id| {
                CatalogReference::from_entry(
                    format!("entity-{id}"),
                    format!("http://catalog.test/pokemon/{id}/"),
                )
                .unwrap()
            })
            .collect();
        Self {
            references,
            failures: HashMap::new(),
            delay,
            log,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, id: i32, error: FetchError) -> Self {
        self.failures.insert(id, error);
        self
    }
}

#[async_trait]
impl CatalogClient for ScriptedClient {
    async fn list(&self, limit: NonZeroU32) -> Result<Vec<CatalogReference>, ListError> {
        self.log.push("list");
        Ok(self.references.iter().take(limit.get() as usize).cloned().collect())
    }

    async fn fetch_detail(&self, reference: &CatalogReference) -> Result<DetailRecord, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.log.push(format!("fetched:{}", reference.id));

        match self.failures.get(&reference.id) {
            Some(error) => Err(error.clone()),
            None => Ok(DetailRecord::new(
                reference.id,
                reference.name.clone(),
                reference.id * 3,
                reference.id * 50,
                Some(60 + reference.id),
            )),
        }
    }
}
