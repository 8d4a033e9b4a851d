use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RawStoreError {
    #[error("I/O error on raw store path '{0}'")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to encode metadata for fetch '{0}'")]
    MetaEncode(String, #[source] serde_json::Error),

    #[error("Failed to decode raw fetch metadata '{0}'")]
    MetaDecode(PathBuf, #[source] serde_json::Error),

    #[error("Raw fetch '{fetch_id}' already exists and the store is write-once")]
    AlreadyExists { fetch_id: String },

    #[error("Raw fetch '{fetch_id}' already exists with different content")]
    ContentConflict { fetch_id: String },

    #[error("Location id '{0}' cannot be used as a raw store key")]
    InvalidLocationId(String),

    #[error("Malformed fetch id '{0}'")]
    MalformedFetchId(String),

    #[error("Raw fetch '{0}' not found")]
    NotFound(String),
}
