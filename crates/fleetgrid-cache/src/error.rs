//! Cache error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache ring has no shards")]
    NoShards,

    #[error("cache shard unavailable: {0}")]
    ShardUnavailable(String),

    #[error("cache node error: {0}")]
    Node(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
