use thiserror::Error;

/// Crate-wide error type for the registration / discovery / pool core.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("no service group registered under this name")]
    NoService,

    #[error("service has no healthy instance")]
    NoHealthy,

    #[error("balancer does not support keyed selection")]
    UnsupportedBalancer,

    #[error("operation timed out")]
    Timeout,

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("lease lost")]
    LeaseLost,

    #[error("invalid instance record: {0}")]
    InvalidRecord(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}
