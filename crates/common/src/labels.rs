//! Container label grammar.
//!
//! Recognised keys: `SERVICE_IGNORE`, `SERVICE_NAME`, `SERVICE_TAGS` and the
//! per-port family `SERVICE_<N>_NAME`, `SERVICE_<N>_CHECK_HTTP`,
//! `SERVICE_<N>_CHECK_INTERVAL`, `SERVICE_<N>_CHECK_TIMEOUT` where `<N>` is
//! a private port. Anything else is ignored.

use std::collections::{BTreeMap, HashMap};

use crate::ServicePolicy;

pub const SERVICE_IGNORE: &str = "SERVICE_IGNORE";
pub const SERVICE_NAME: &str = "SERVICE_NAME";
pub const SERVICE_TAGS: &str = "SERVICE_TAGS";

/// Every per-port label found for one private port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortLabels {
    pub name: Option<String>,
    pub check_http: Option<String>,
    pub check_interval: Option<String>,
    pub check_timeout: Option<String>,
}

/// Per-port labels keyed by private port, built in one pass so the result
/// does not depend on label iteration order.
pub type PortLabelIndex = BTreeMap<String, PortLabels>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortLabelKind {
    Name,
    CheckHttp,
    CheckInterval,
    CheckTimeout,
}

fn parse_port_key(key: &str) -> Option<(&str, PortLabelKind)> {
    let rest = key.strip_prefix("SERVICE_")?;
    let (port, suffix) = rest.split_once('_')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let kind = match suffix {
        "NAME" => PortLabelKind::Name,
        "CHECK_HTTP" => PortLabelKind::CheckHttp,
        "CHECK_INTERVAL" => PortLabelKind::CheckInterval,
        "CHECK_TIMEOUT" => PortLabelKind::CheckTimeout,
        _ => return None,
    };
    Some((port, kind))
}

pub fn index_port_labels(labels: &HashMap<String, String>) -> PortLabelIndex {
    let mut index = PortLabelIndex::new();
    for (key, value) in labels {
        let Some((port, kind)) = parse_port_key(key) else {
            continue;
        };
        let entry = index.entry(port.to_string()).or_default();
        let slot = match kind {
            PortLabelKind::Name => &mut entry.name,
            PortLabelKind::CheckHttp => &mut entry.check_http,
            PortLabelKind::CheckInterval => &mut entry.check_interval,
            PortLabelKind::CheckTimeout => &mut entry.check_timeout,
        };
        *slot = Some(value.clone());
    }
    index
}

/// Split a comma separated tag list, trimming and dropping empty entries.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(labels: &HashMap<String, String>, key: &str) -> Option<String> {
    labels
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parse a label set into a [`ServicePolicy`]. `SERVICE_IGNORE` short-cuts
/// the rest of the grammar: nothing else matters for an ignored container.
pub fn parse_policy(labels: &HashMap<String, String>) -> ServicePolicy {
    if labels.contains_key(SERVICE_IGNORE) {
        return ServicePolicy {
            ignore: true,
            ..Default::default()
        };
    }

    let port_names = index_port_labels(labels)
        .into_iter()
        .filter_map(|(port, l)| l.name.map(|name| (port, name)))
        .filter(|(_, name)| !name.trim().is_empty())
        .collect();

    ServicePolicy {
        ignore: false,
        base_name: non_empty(labels, SERVICE_NAME),
        tags: labels.get(SERVICE_TAGS).map(|t| split_tags(t)).unwrap_or_default(),
        port_names,
    }
}
