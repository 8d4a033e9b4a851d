use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("Failed to read geo reference file '{0}'")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse geo reference data from '{0}'")]
    Parse(String, #[source] serde_json::Error),

    #[error("Geo reference entry '{name}' has invalid coordinates ({latitude}, {longitude})")]
    InvalidCoordinates {
        name: String,
        latitude: f64,
        longitude: f64,
    },

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}
