//! Read-only client for the orchestrator's metadata service.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{ContainerObservation, HostIdentity};

pub const DEFAULT_METADATA_URL: &str = "http://rancher-metadata";

pub const CONTAINER_UUID_LABEL: &str = "io.rancher.container.uuid";
pub const CONTAINER_NAME_LABEL: &str = "io.rancher.container.name";

/// One container as described by `/latest/containers/`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerDescriptor {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host_uuid: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub image_uuid: Option<String>,
    #[serde(default)]
    pub ports: Option<Vec<String>>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

impl ContainerDescriptor {
    pub fn container_id(&self) -> &str {
        if !self.uuid.is_empty() {
            return &self.uuid;
        }
        self.labels
            .as_ref()
            .and_then(|l| l.get(CONTAINER_UUID_LABEL))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn display_name(&self) -> &str {
        self.labels
            .as_ref()
            .and_then(|l| l.get(CONTAINER_NAME_LABEL))
            .map(String::as_str)
            .unwrap_or(self.name.as_str())
    }

    fn matches_id(&self, id: &str) -> bool {
        self.uuid == id
            || self
                .labels
                .as_ref()
                .and_then(|l| l.get(CONTAINER_UUID_LABEL))
                .is_some_and(|v| v == id)
    }

    pub fn observe(self, host_ip: &str) -> ContainerObservation {
        ContainerObservation {
            container_id: self.container_id().to_string(),
            display_name: self.display_name().to_string(),
            name: self.name,
            image: self.image_uuid.unwrap_or_default(),
            service_name: self.service_name,
            raw_ports: self.ports.unwrap_or_default(),
            labels: self.labels.unwrap_or_default(),
            host_ip: host_ip.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct MetadataClient {
    http: Client,
    base_url: String,
    host: OnceCell<HostIdentity>,
}

impl MetadataClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            host: OnceCell::new(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header("accept", "application/json")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Status {
                url,
                status: resp.status().as_u16(),
            });
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|source| Error::Decode { url, source })
    }

    /// Identity of this host. Fetched on first success and reused for the
    /// lifetime of the client; failures are retried on the next call.
    pub async fn host_identity(&self) -> Result<HostIdentity> {
        self.host
            .get_or_try_init(|| self.get_json::<HostIdentity>("/latest/self/host"))
            .await
            .cloned()
    }

    /// Every container known to the metadata service, on any host.
    /// Entries that do not decode are logged and skipped.
    pub async fn containers(&self) -> Result<Vec<ContainerDescriptor>> {
        let raw: Vec<serde_json::Value> = self.get_json("/latest/containers/").await?;
        Ok(raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    warn!("Skipping undecodable container descriptor: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn on_host(&self, host: &HostIdentity) -> Result<Vec<ContainerDescriptor>> {
        let all = self.containers().await?;
        let total = all.len();
        let mine: Vec<_> = all
            .into_iter()
            .filter(|c| c.host_uuid == host.uuid)
            .collect();
        debug!("{} of {} containers on host {}", mine.len(), total, host.uuid);
        Ok(mine)
    }

    /// Containers of this host in `running` state.
    pub async fn running_containers(&self, host: &HostIdentity) -> Result<Vec<ContainerObservation>> {
        Ok(self
            .on_host(host)
            .await?
            .into_iter()
            .filter(|c| c.state == "running")
            .map(|c| c.observe(&host.agent_ip))
            .collect())
    }

    pub async fn container_by_id(
        &self,
        host: &HostIdentity,
        id: &str,
    ) -> Result<Option<ContainerObservation>> {
        let mut matching: Vec<_> = self
            .on_host(host)
            .await?
            .into_iter()
            .filter(|c| c.matches_id(id))
            .collect();
        if matching.len() != 1 {
            return Ok(None);
        }
        Ok(matching.pop().map(|c| c.observe(&host.agent_ip)))
    }

    /// Case-insensitive lookup by display name or container name.
    pub async fn container_by_name(
        &self,
        host: &HostIdentity,
        name: &str,
    ) -> Result<Option<ContainerObservation>> {
        let mut matching: Vec<_> = self
            .on_host(host)
            .await?
            .into_iter()
            .filter(|c| {
                c.display_name().eq_ignore_ascii_case(name) || c.name.eq_ignore_ascii_case(name)
            })
            .collect();
        if matching.len() != 1 {
            return Ok(None);
        }
        Ok(matching.pop().map(|c| c.observe(&host.agent_ip)))
    }
}
