//! Service record composition and the catalog id scheme.
//!
//! Ids are `<hostUuid>:<containerId>:<publicPort>` with a `:udp` suffix for
//! udp bindings, so entries from different hosts, containers and ports never
//! collide in a shared catalog.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::pipeline::DerivationSettings;
use crate::{EntryOwner, HostIdentity, PortBinding, ServicePolicy, ServiceRecord, Transport};

static OWNED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9][a-zA-Z0-9_.-]+):([a-zA-Z0-9][a-zA-Z0-9_.-]+):[0-9]+(?::udp)?$")
        .expect("static regex")
});

pub fn service_id(
    host_uuid: &str,
    container_id: &str,
    public_port: u16,
    transport: Transport,
) -> String {
    match transport {
        Transport::Udp => format!("{host_uuid}:{container_id}:{public_port}:udp"),
        Transport::Tcp => format!("{host_uuid}:{container_id}:{public_port}"),
    }
}

/// Recover the owning host and container from a catalog id. Ids from other
/// producers do not match and yield `None`.
pub fn parse_owner(id: &str) -> Option<EntryOwner> {
    let caps = OWNED_ID.captures(id)?;
    Some(EntryOwner {
        host_uuid: caps[1].to_string(),
        container_id: caps[2].to_string(),
    })
}

/// Container tags followed by base tags, each tag kept once at its first
/// occurrence.
pub fn merge_tags(container_tags: &[String], base_tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    container_tags
        .iter()
        .chain(base_tags)
        .filter(|tag| seen.insert(*tag))
        .cloned()
        .collect()
}

/// Build the catalog records for one container.
///
/// `fallback_name` is used when neither `SERVICE_NAME` nor a per-port name
/// is set. It does not count as a name for `ignore_unnamed`.
pub fn build_records(
    host: &HostIdentity,
    container_id: &str,
    fallback_name: &str,
    policy: &ServicePolicy,
    bindings: &[PortBinding],
    settings: &DerivationSettings,
) -> Vec<ServiceRecord> {
    let tags = merge_tags(&policy.tags, &settings.base_tags);
    let multi_port = bindings.len() > 1;

    bindings
        .iter()
        .filter_map(|binding| {
            let port_name = policy.port_names.get(&binding.private_port);

            if settings.ignore_unnamed && port_name.is_none() && policy.base_name.is_none() {
                info!(
                    "skipping unnamed binding {}:{}",
                    container_id, binding.private_port
                );
                return None;
            }

            let name = match port_name {
                Some(port_name) => format!("{}{}", settings.prefix, port_name),
                None => {
                    let base = policy.base_name.as_deref().unwrap_or(fallback_name);
                    if multi_port {
                        format!("{}{}-{}", settings.prefix, base, binding.private_port)
                    } else {
                        format!("{}{}", settings.prefix, base)
                    }
                }
            };

            Some(ServiceRecord {
                id: service_id(&host.uuid, container_id, binding.public_port, binding.transport),
                name,
                address: binding.address.clone(),
                port: binding.public_port,
                tags: tags.clone(),
                check: binding.health_check.clone(),
            })
        })
        .collect()
}
