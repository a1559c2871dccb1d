//! Error types for the hivegrid object store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An object with the same ID already exists.
    #[error("object already exists")]
    Exist,

    /// The referenced object does not exist.
    #[error("object does not exist")]
    NotExist,

    /// The name is already in use, possibly by another entity type that
    /// shares the same name-space.
    #[error("name conflicts with an existing object")]
    NameConflict,

    /// The requested selector is not supported by this table.
    #[error("selector type is not supported by this table")]
    InvalidFindBy,

    /// A replayed store action carried an unrecognized action kind.
    #[error("unknown store action")]
    UnknownStoreAction,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
