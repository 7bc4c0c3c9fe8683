use tracing::warn;

use crate::{PortBinding, Transport};

/// Parse one publication string: `[bindAddr:]hostPort:containerPort[/proto]`.
/// The bind address is discarded; bindings are always advertised on the
/// host address.
pub fn parse_binding(raw: &str, host_ip: &str) -> Option<PortBinding> {
    let (rest, private) = raw.trim().rsplit_once(':')?;
    let public = rest.rsplit(':').next()?;

    let (private_port, transport) = match private.split_once('/') {
        Some((port, proto)) => (port, Transport::parse(proto)?),
        None => (private, Transport::Tcp),
    };
    if private_port.is_empty() || !private_port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(PortBinding {
        address: host_ip.to_string(),
        public_port: public.parse().ok()?,
        private_port: private_port.to_string(),
        transport,
        health_check: None,
    })
}

/// Resolve every publication of a container. Unparseable entries are logged
/// and dropped; an empty result means the container has no port mappings.
pub fn resolve_bindings(raw_ports: &[String], host_ip: &str) -> Vec<PortBinding> {
    raw_ports
        .iter()
        .filter_map(|raw| {
            let binding = parse_binding(raw, host_ip);
            if binding.is_none() {
                warn!("Ignoring malformed port mapping {:?}", raw);
            }
            binding
        })
        .collect()
}
