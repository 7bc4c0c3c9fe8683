use thiserror::Error;

/// Conditions that stop the daemon. Everything per-container is handled
/// where it happens and never reaches this type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("startup sync failed while {stage}: {source}")]
    Sync {
        stage: &'static str,
        #[source]
        source: common::Error,
    },

    #[error("client setup failed: {0}")]
    Setup(#[from] common::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
