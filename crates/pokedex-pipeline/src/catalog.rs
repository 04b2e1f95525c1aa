//! Catalog source client and lister
//!
//! [`CatalogClient`] is the seam to the remote API: one call lists the
//! catalog, one call fetches a detail document. [`HttpCatalogClient`] speaks
//! the PokéAPI shape over reqwest; tests substitute their own client.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::{FetchConfig, SourceConfig};
use crate::error::{FetchError, ListError};
use crate::model::{CatalogReference, DetailRecord};

const USER_AGENT: &str = concat!("pokedex-pipeline/", env!("CARGO_PKG_VERSION"));

/// Remote catalog API
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch at most `limit` catalog references in source order
    async fn list(&self, limit: NonZeroU32) -> Result<Vec<CatalogReference>, ListError>;

    /// Fetch one detail document; errors say whether a retry may help
    async fn fetch_detail(&self, reference: &CatalogReference) -> Result<DetailRecord, FetchError>;
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    results: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    url: String,
}

/// [`CatalogClient`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    /// Build a client whose every request is bounded by the fetch timeout
    pub fn new(source: &SourceConfig, fetch: &FetchConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(fetch.request_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http,
            base_url: source.base_url.clone(),
        })
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn list(&self, limit: NonZeroU32) -> Result<Vec<CatalogReference>, ListError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("limit", limit.get())])
            .send()
            .await
            .map_err(|e| ListError::SourceUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ListError::SourceUnavailable(format!(
                "GET {} returned {}",
                self.base_url, status
            )));
        }

        let page: CatalogPage = response
            .json()
            .await
            .map_err(|e| ListError::MalformedResponse(e.to_string()))?;

        page.results
            .into_iter()
            .take(limit.get() as usize)
            .map(|entry| {
                CatalogReference::from_entry(&entry.name, &entry.url).ok_or_else(|| {
                    ListError::MalformedResponse(format!(
                        "entry '{}' has no numeric id in its url '{}'",
                        entry.name, entry.url
                    ))
                })
            })
            .collect()
    }

    async fn fetch_detail(&self, reference: &CatalogReference) -> Result<DetailRecord, FetchError> {
        let response = self
            .http
            .get(&reference.locator)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("GET {} returned {}", reference.locator, status);
            return Err(if is_transient_status(status) {
                FetchError::Transient(message)
            } else {
                FetchError::Permanent(message)
            });
        }

        // A body cut short is a network problem; a complete body that does
        // not decode is not.
        let body = response.bytes().await.map_err(classify_request_error)?;
        serde_json::from_slice(&body).map_err(|e| {
            FetchError::Permanent(format!(
                "detail document at {} did not decode: {}",
                reference.locator, e
            ))
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify_request_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Permanent(err.to_string())
    }
}

/// Lists the catalog once per run
#[derive(Clone)]
pub struct CatalogLister {
    client: Arc<dyn CatalogClient>,
}

impl CatalogLister {
    pub fn new(client: Arc<dyn CatalogClient>) -> Self {
        Self { client }
    }

    /// List the catalog; a reference id appearing twice makes the whole
    /// listing malformed, since each id is fetched by exactly one task
    #[instrument(skip(self))]
    pub async fn list(&self, limit: NonZeroU32) -> Result<Vec<CatalogReference>, ListError> {
        debug!("Requesting catalog listing");
        let references = self.client.list(limit).await?;

        let mut seen = HashSet::with_capacity(references.len());
        if let Some(duplicate) = references.iter().find(|r| !seen.insert(r.id)) {
            return Err(ListError::MalformedResponse(format!(
                "catalog lists id {} more than once",
                duplicate.id
            )));
        }

        info!(references = references.len(), "Catalog listed");
        Ok(references)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }

    struct FixedClient(Vec<CatalogReference>);

    #[async_trait]
    impl CatalogClient for FixedClient {
        async fn list(&self, _limit: NonZeroU32) -> Result<Vec<CatalogReference>, ListError> {
            Ok(self.0.clone())
        }

        async fn fetch_detail(
            &self,
            _reference: &CatalogReference,
        ) -> Result<DetailRecord, FetchError> {
            Err(FetchError::Permanent("not used".to_string()))
        }
    }

    #[tokio::test]
    async fn test_lister_rejects_duplicate_ids() {
        let reference = CatalogReference::from_entry("ditto", "http://localhost/pokemon/132/").unwrap();
        let lister = CatalogLister::new(Arc::new(FixedClient(vec![reference.clone(), reference])));

        let err = lister.list(NonZeroU32::new(2).unwrap()).await.unwrap_err();
        assert!(matches!(err, ListError::MalformedResponse(_)));
    }
}
