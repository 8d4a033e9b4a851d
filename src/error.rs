use crate::client::error::FetchError;
use crate::config::ConfigError;
use crate::geo::GeoError;
use crate::normalize::ValidationError;
use crate::raw_store::RawStoreError;
use crate::warehouse::{LoadError, TransformError, WarehouseError};
use std::error::Error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    RawStore(#[from] RawStoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Renders an error with its whole `source()` chain, `outer: inner: root`.
pub fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_includes_sources() {
        let err = LoadError::Snapshot {
            batch_id: "batch-sopron-20260221T000000000Z".to_string(),
            source: ValidationError::MalformedPayload {
                fetch_id: "sopron@20260221T000000000Z".to_string(),
                reason: "missing `time` array".to_string(),
            },
        };
        let chain = error_chain(&PipelineError::from(err));
        assert!(chain.starts_with("Failed to read snapshot for batch 'batch-sopron-"));
        assert!(chain.contains("missing `time` array"), "{chain}");
    }
}
