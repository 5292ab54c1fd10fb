use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PolyMongoError>;

/// Everything that can go wrong running the pool.
#[derive(Debug, Error)]
pub enum PolyMongoError {
    #[error("invalid mongo URI: {0}")]
    InvalidMongoURI(String),

    #[error("invalid database name {name:?}: {reason}")]
    InvalidDatabaseName { name: String, reason: &'static str },

    #[error("invalid priority {0}: must be -1 or a non-negative integer")]
    InvalidPriority(i64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("orchestrator is not initialized")]
    NotInitialized,

    #[error("failed to initialize metadata store")]
    MetadataInitFailed(#[source] mongodb::error::Error),

    #[error("failed to open connection to database {db_name:?}")]
    ConnectionFailed {
        db_name: String,
        #[source]
        source: mongodb::error::Error,
    },

    #[error("max connections exceeded: no eviction candidates available")]
    MaxConnectionsExceeded,
}
