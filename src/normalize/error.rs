use polars::error::PolarsError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    /// The payload does not have the provider's section layout; nothing from it can be used.
    #[error("Malformed payload in fetch '{fetch_id}': {reason}")]
    MalformedPayload { fetch_id: String, reason: String },

    #[error("I/O error on normalized layer path '{0}'")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Encoding error writing snapshot '{0}'")]
    SnapshotWrite(PathBuf, #[source] PolarsError),

    #[error("Failed to read snapshot '{0}'")]
    SnapshotRead(PathBuf, #[source] PolarsError),

    #[error("Snapshot '{path}' has unexpected content: {message}")]
    SnapshotSchema { path: PathBuf, message: String },

    #[error("Failed to encode manifest for batch '{0}'")]
    ManifestEncode(String, #[source] serde_json::Error),

    #[error("Failed to decode batch manifest '{0}'")]
    ManifestDecode(PathBuf, #[source] serde_json::Error),

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}
