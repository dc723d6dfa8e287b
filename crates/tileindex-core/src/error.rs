use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Routing failed: {0}")]
    Routing(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Vector store unavailable: {0}")]
    VectorStoreUnavailable(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    /// Outages that may clear up on their own; worth a local retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RegistryUnavailable(_) | Error::VectorStoreUnavailable(_) | Error::Queue(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
