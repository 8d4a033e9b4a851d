pub mod client;
pub mod config;
mod error;
pub mod geo;
pub mod normalize;
pub mod pipeline;
pub mod raw_store;
mod types;
mod utils;
pub mod warehouse;

#[cfg(test)]
mod test_support;

pub use error::{error_chain, PipelineError};

pub use client::error::FetchError;
pub use client::forecast_client::{Endpoint, ForecastClient, RawPayload};
pub use config::{Config, ConfigError, RetryConfig};

pub use types::frequency::Frequency;
pub use types::location::{slugify, LatLon, Location, TimeWindow};
pub use types::records::{ForecastRecord, IngestionBatch, RawFetch};

pub use raw_store::{FetchLedger, RawStore, RawStoreError, WritePolicy};
pub use normalize::{BatchLedger, ValidationError, Validator};
pub use geo::{Enrichment, GeoError, GeoReference, ReferencePlace};

pub use warehouse::loader::{LoadResult, Loader};
pub use warehouse::transform::{TransformEngine, TransformResult};
pub use warehouse::{LoadError, TransformError, Warehouse, WarehouseError};

pub use pipeline::{Layer, LayerFailure, Pipeline, RunReport, StatusReport};
