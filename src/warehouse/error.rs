use crate::normalize::ValidationError;
use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("Failed to create warehouse directory '{0}'")]
    DirCreation(PathBuf, #[source] std::io::Error),

    #[error("Failed to open warehouse '{0}'")]
    Open(PathBuf, #[source] duckdb::Error),

    #[error("Failed to create warehouse schema")]
    Schema(#[source] duckdb::Error),

    #[error("Warehouse query failed")]
    Query(#[from] duckdb::Error),

    #[error("Unknown warehouse table '{0}'")]
    UnknownTable(String),

    #[error("Warehouse connection lock poisoned")]
    LockPoisoned,

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// A failed batch load. The transaction is always rolled back and the batch stays eligible
/// for a retry.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read snapshot for batch '{batch_id}'")]
    Snapshot {
        batch_id: String,
        #[source]
        source: ValidationError,
    },

    #[error("Batch '{batch_id}' references unconfigured location '{location_id}'")]
    UnknownLocation {
        batch_id: String,
        location_id: String,
    },

    #[error("Dimension upsert failed for batch '{batch_id}'")]
    DimensionUpsertFailed {
        batch_id: String,
        #[source]
        source: duckdb::Error,
    },

    #[error("Batch '{batch_id}' has no dimension row for {what}")]
    MissingDimension { batch_id: String, what: String },

    #[error("Fact upsert failed for batch '{batch_id}'")]
    FactUpsertFailed {
        batch_id: String,
        #[source]
        source: duckdb::Error,
    },

    #[error("Failed to record batch '{batch_id}' as loaded")]
    Ledger {
        batch_id: String,
        #[source]
        source: duckdb::Error,
    },

    #[error("Transaction failed for batch '{batch_id}'")]
    Transaction {
        batch_id: String,
        #[source]
        source: duckdb::Error,
    },

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Transform for {as_of} failed")]
    Query {
        as_of: NaiveDate,
        #[source]
        source: duckdb::Error,
    },

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}
