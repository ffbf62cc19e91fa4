//! Pool store errors

use thiserror::Error;

/// Errors raised by a pool store engine
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row lookup by key found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write would violate a primary or unique key
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The engine has no table for the requested record type
    #[error("Unknown table: {0}")]
    UnknownTable(&'static str),
}
