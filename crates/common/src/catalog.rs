//! Client for the catalog agent HTTP API.
//!
//! Register and deregister never return errors: every failure is logged and
//! reported as `false` so a batch keeps going.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::parse_owner;
use crate::{Action, CatalogEntry, CatalogService, Outcome, ServiceRecord};

pub const DEFAULT_CATALOG_URL: &str = "http://localhost:8500";
pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Upper bound on concurrent catalog requests issued by one batch.
pub const MAX_IN_FLIGHT: usize = 8;

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl CatalogClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    /// Idempotent upsert keyed by the record id.
    pub async fn register(&self, record: &ServiceRecord) -> bool {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let req = self.authorized(self.http.put(&url).json(record));
        match req.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("register {} returned {}", record.id, resp.status());
                false
            }
            Err(e) => {
                warn!("register request failed: {}", e);
                false
            }
        }
    }

    /// Removing an id the catalog does not know is a success.
    pub async fn deregister(&self, id: &str) -> bool {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);
        let req = self.authorized(self.http.get(&url).header("accept", "application/json"));
        match req.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                debug!("{} already absent from catalog", id);
                true
            }
            Ok(resp) => {
                warn!("deregister {} returned {}", id, resp.status());
                false
            }
            Err(e) => {
                warn!("deregister request failed: {}", e);
                false
            }
        }
    }

    /// Every service in the catalog, tagged with its owner when the id
    /// follows the host-scoped scheme.
    pub async fn list_all(&self) -> Result<Vec<CatalogEntry>> {
        let url = format!("{}/v1/agent/services", self.base_url);
        let req = self.authorized(self.http.get(&url).header("accept", "application/json"));
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Status {
                url,
                status: resp.status().as_u16(),
            });
        }
        let body = resp.text().await?;
        let services: HashMap<String, CatalogService> =
            serde_json::from_str(&body).map_err(|source| Error::Decode { url, source })?;

        let mut entries: Vec<CatalogEntry> = services
            .into_iter()
            .map(|(key, mut service)| {
                if service.id.is_empty() {
                    service.id = key;
                }
                let owner = parse_owner(&service.id);
                CatalogEntry { service, owner }
            })
            .collect();
        entries.sort_by(|a, b| a.service.id.cmp(&b.service.id));
        Ok(entries)
    }

    pub async fn list_host(&self, host_uuid: &str) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|e| e.owned_by_host(host_uuid))
            .collect())
    }

    pub async fn list_container(
        &self,
        host_uuid: &str,
        container_id: &str,
    ) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|e| e.owned_by_container(host_uuid, container_id))
            .collect())
    }

    /// Register all records concurrently; outcomes are in input order.
    pub async fn register_all(&self, records: &[ServiceRecord]) -> Vec<Outcome> {
        stream::iter(records.to_vec())
            .map(|record: ServiceRecord| async move {
                let ok = self.register(&record).await;
                Outcome {
                    id: record.id,
                    action: Action::Register,
                    ok,
                }
            })
            .buffered(MAX_IN_FLIGHT)
            .collect()
            .await
    }

    pub async fn deregister_all<I, S>(&self, ids: I) -> Vec<Outcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        stream::iter(ids.into_iter().map(Into::into))
            .map(|id: String| async move {
                let ok = self.deregister(&id).await;
                Outcome {
                    id,
                    action: Action::Deregister,
                    ok,
                }
            })
            .buffered(MAX_IN_FLIGHT)
            .collect()
            .await
    }
}
