use std::time::Duration;

use clap::{ArgAction, Parser};
use common::catalog::DEFAULT_CATALOG_URL;
use common::labels::split_tags;
use common::metadata::DEFAULT_METADATA_URL;
use common::DerivationSettings;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Keeps the service catalog in sync with this host's containers", long_about = None)]
pub struct Config {
    /// Prefix prepended to every derived service name
    #[arg(long, env = "SVC_PREFIX", default_value = "")]
    pub prefix: String,

    /// Catalog agent base URL
    #[arg(long, env = "CONSUL_ADDR", default_value = DEFAULT_CATALOG_URL)]
    pub consul_addr: String,

    /// Catalog access token
    #[arg(long, env = "CONSUL_TOKEN")]
    pub consul_token: Option<String>,

    /// Comma separated tags added to every record
    #[arg(long, env = "SERVICE_TAGS", default_value = "")]
    pub service_tags: String,

    /// Skip bindings that have no label-declared service name
    #[arg(long, env = "SERVICE_IGNORE_NAMELESS", default_value = "", action = ArgAction::Set, value_parser = parse_flag)]
    pub ignore_nameless: bool,

    /// Metadata service base URL
    #[arg(long, env = "METADATA_URL", default_value = DEFAULT_METADATA_URL)]
    pub metadata_url: String,

    /// Container runtime socket (unix:// or tcp://); local defaults when unset
    #[arg(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,

    /// Wait after a start event before querying the container's metadata
    #[arg(long, env = "SETTLE_DELAY_MS", default_value_t = 5000)]
    pub settle_delay_ms: u64,

    /// Per-request timeout for metadata and catalog calls
    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = 5000)]
    pub http_timeout_ms: u64,
}

/// Environment-style boolean: anything but empty, `0`, `false`, `no` or
/// `off` is true.
pub fn parse_flag(raw: &str) -> Result<bool, String> {
    let v = raw.trim().to_ascii_lowercase();
    Ok(!matches!(v.as_str(), "" | "0" | "false" | "no" | "off"))
}

impl Config {
    pub fn derivation(&self) -> DerivationSettings {
        DerivationSettings {
            prefix: self.prefix.clone(),
            base_tags: split_tags(&self.service_tags),
            ignore_unnamed: self.ignore_nameless,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
