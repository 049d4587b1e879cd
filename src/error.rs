use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid schedule {expr:?}: {reason}")]
    Schedule { expr: String, reason: String },

    #[error("lease store unavailable: {0}")]
    Store(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
