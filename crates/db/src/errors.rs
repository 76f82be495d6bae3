use thiserror::Error;

/// Errors surfaced by database operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// No header stored at the requested height.
    #[error("missing header at height {0}")]
    MissingHeader(u64),

    /// No epoch record for the requested number.
    #[error("missing epoch {0}")]
    MissingEpoch(u64),

    /// No IBD progress record persisted yet.
    #[error("missing progress record")]
    MissingProgress,

    /// Stored data violates an invariant, indicates corruption.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Failed to (de)serialize a record.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Other unspecified error.
    #[error("{0}")]
    Other(String),
}

impl DbError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
