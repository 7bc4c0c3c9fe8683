use thiserror::Error;

/// Failures talking to the metadata service or the catalog.
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reasons a single container produces no service records. These are
/// reported per container and never abort a batch.
#[derive(Error, Debug)]
pub enum Skip {
    #[error("container {0} is ignored by label")]
    Ignored(String),

    #[error("no port mappings for {0}")]
    NoPortMappings(String),

    #[error("container {0} not found on this host")]
    NotFound(String),

    #[error("metadata lookup failed for {container}: {source}")]
    Lookup {
        container: String,
        #[source]
        source: Error,
    },
}
