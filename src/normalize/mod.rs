//! The validated layer: typed [`ForecastRecord`](crate::ForecastRecord) snapshots in Parquet,
//! one per ingestion batch, plus the batch ledger.

pub mod checks;
pub mod error;
pub mod ledger;
mod payload;
pub mod snapshot;
pub mod validator;

pub use error::ValidationError;
pub use ledger::{BatchLedger, ProcessedFetches};
pub use validator::{normalize_records, Validator};
