//! Data routing error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("primary unreachable: {0}")]
    PrimaryUnreachable(String),

    #[error("replica unreachable: {0}")]
    ReplicaUnreachable(String),

    #[error("lag introspection failed for {endpoint}: {reason}")]
    Introspection { endpoint: String, reason: String },
}

pub type DataResult<T> = Result<T, DataError>;
