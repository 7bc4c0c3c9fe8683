use crate::error::Skip;
use crate::{health, labels, ports, record};
use crate::{ContainerObservation, HostIdentity, ServiceRecord};

/// Process-wide inputs to record derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivationSettings {
    pub prefix: String,
    pub base_tags: Vec<String>,
    pub ignore_unnamed: bool,
}

/// Run the full derivation for one container: label policy, port bindings,
/// health checks, then record composition. Stops at the first condition that
/// rules the container out.
pub fn derive_records(
    host: &HostIdentity,
    container: &ContainerObservation,
    settings: &DerivationSettings,
) -> Result<Vec<ServiceRecord>, Skip> {
    let policy = labels::parse_policy(&container.labels);
    if policy.ignore {
        return Err(Skip::Ignored(container.display_name.clone()));
    }

    let bindings = ports::resolve_bindings(&container.raw_ports, &container.host_ip);
    if bindings.is_empty() {
        return Err(Skip::NoPortMappings(container.display_name.clone()));
    }

    let bindings = health::attach_checks(&container.labels, bindings, &container.name);

    let fallback = container
        .service_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(container.name.as_str());

    Ok(record::build_records(
        host,
        &container.container_id,
        fallback,
        &policy,
        &bindings,
        settings,
    ))
}

/// Catalog ids of every binding the container publishes. Labels play no
/// part, so this also covers records of containers that were renamed or
/// ignored after registration.
pub fn derive_ids(host: &HostIdentity, container: &ContainerObservation) -> Result<Vec<String>, Skip> {
    let bindings = ports::resolve_bindings(&container.raw_ports, &container.host_ip);
    if bindings.is_empty() {
        return Err(Skip::NoPortMappings(container.display_name.clone()));
    }
    Ok(bindings
        .iter()
        .map(|b| record::service_id(&host.uuid, &container.container_id, b.public_port, b.transport))
        .collect())
}
