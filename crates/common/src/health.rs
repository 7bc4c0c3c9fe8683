//! Attaches HTTP health checks declared through `SERVICE_<N>_CHECK_*`
//! labels to the binding whose private port is `<N>`.

use std::collections::HashMap;

use tracing::debug;

use crate::labels::{index_port_labels, PortLabels};
use crate::{HealthCheckSpec, PortBinding};

pub const DEFAULT_INTERVAL: &str = "10s";
pub const DEFAULT_TIMEOUT: &str = "1s";

fn build_check(
    container_name: &str,
    private_port: &str,
    public_port: u16,
    labels: &PortLabels,
) -> Option<HealthCheckSpec> {
    let path = labels.check_http.as_deref()?;
    let id = format!("{container_name}_SERVICE_{private_port}_CHECK_HTTP");
    Some(HealthCheckSpec {
        name: id.clone(),
        id,
        http_url: format!("http://localhost:{public_port}{path}"),
        interval: labels
            .check_interval
            .clone()
            .unwrap_or_else(|| DEFAULT_INTERVAL.to_string()),
        timeout: labels
            .check_timeout
            .clone()
            .unwrap_or_else(|| DEFAULT_TIMEOUT.to_string()),
    })
}

/// Returns the bindings with `health_check` populated where a check label
/// names their private port. Checks for ports without a binding are dropped.
pub fn attach_checks(
    labels: &HashMap<String, String>,
    bindings: Vec<PortBinding>,
    container_name: &str,
) -> Vec<PortBinding> {
    let index = index_port_labels(labels);

    for (port, port_labels) in &index {
        let has_check_labels = port_labels.check_http.is_some()
            || port_labels.check_interval.is_some()
            || port_labels.check_timeout.is_some();
        if has_check_labels && !bindings.iter().any(|b| &b.private_port == port) {
            debug!("No binding for private port {port}, dropping its health check");
        }
    }

    bindings
        .into_iter()
        .map(|binding| {
            let health_check = index.get(&binding.private_port).and_then(|l| {
                build_check(container_name, &binding.private_port, binding.public_port, l)
            });
            PortBinding {
                health_check,
                ..binding
            }
        })
        .collect()
}
