use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod catalog;
pub mod error;
pub mod health;
pub mod labels;
pub mod metadata;
pub mod pipeline;
pub mod ports;
pub mod record;

pub use catalog::CatalogClient;
pub use error::{Error, Result, Skip};
pub use metadata::MetadataClient;
pub use pipeline::{derive_ids, derive_records, DerivationSettings};

/// Identity of the host this process runs on, as reported by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub uuid: String,
    #[serde(default)]
    pub agent_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerObservation {
    pub container_id: String,
    pub name: String,
    pub display_name: String,
    pub image: String,
    pub service_name: Option<String>,
    pub raw_ports: Vec<String>,
    pub labels: HashMap<String, String>,
    pub host_ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Some(Transport::Tcp),
            "udp" => Some(Transport::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub address: String,
    pub public_port: u16,
    pub private_port: String,
    pub transport: Transport,
    pub health_check: Option<HealthCheckSpec>,
}

/// HTTP check attached to a catalog entry. Durations are kept in the
/// catalog's own notation (`10s`, `500ms`, `1m`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheckSpec {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "HTTP")]
    pub http_url: String,
    pub interval: String,
    pub timeout: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePolicy {
    pub ignore: bool,
    pub base_name: Option<String>,
    pub tags: Vec<String>,
    pub port_names: HashMap<String, String>,
}

/// A catalog entry as sent to `/v1/agent/service/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRecord {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub check: Option<HealthCheckSpec>,
}

/// Host and container an entry id was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOwner {
    pub host_uuid: String,
    pub container_id: String,
}

/// A service as listed by `/v1/agent/services`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogService {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub service: CatalogService,
    pub owner: Option<EntryOwner>,
}

impl CatalogEntry {
    pub fn owned_by_host(&self, host_uuid: &str) -> bool {
        self.owner.as_ref().is_some_and(|o| o.host_uuid == host_uuid)
    }

    pub fn owned_by_container(&self, host_uuid: &str, container_id: &str) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|o| o.host_uuid == host_uuid && o.container_id == container_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Register,
    Deregister,
}

/// Result of one catalog mutation, rendered as the `<id> registered` log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub id: String,
    pub action: Action,
    pub ok: bool,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match (self.action, self.ok) {
            (_, false) => "failed",
            (Action::Register, true) => "registered",
            (Action::Deregister, true) => "deregistered",
        };
        write!(f, "{} {}", self.id, verb)
    }
}
