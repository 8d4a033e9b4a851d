//! Runs the layers in order: fetch, validate, load, transform.
//!
//! Every layer reads only what the previous layer committed, so a failure in one unit (a
//! location, a fetch, a batch) is recorded in the [`RunReport`] and the rest of the run
//! carries on. A failed unit is picked up again by the next run.

use crate::client::error::FetchError;
use crate::client::forecast_client::{Endpoint, ForecastClient};
use crate::config::Config;
use crate::error::{error_chain, PipelineError};
use crate::geo::GeoReference;
use crate::normalize::Validator;
use crate::raw_store::{RawStore, RawStoreError};
use crate::types::location::{Location, TimeWindow};
use crate::types::records::{IngestionBatch, RawFetch};
use crate::warehouse::loader::Loader;
use crate::warehouse::schema::TABLES;
use crate::warehouse::transform::{TransformEngine, TransformResult};
use crate::warehouse::Warehouse;
use chrono::{NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
    Fetch,
    Validate,
    Load,
    Transform,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layer::Fetch => "fetch",
            Layer::Validate => "validate",
            Layer::Load => "load",
            Layer::Transform => "transform",
        };
        write!(f, "{name}")
    }
}

/// A unit of work that failed. `key` is the location id, fetch id, batch id or `as_of`
/// date the operator retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFailure {
    pub layer: Layer,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunReport {
    /// Fetch ids written to the raw store.
    pub fetched: Vec<String>,
    /// Batch ids produced by the validator.
    pub validated: Vec<String>,
    /// Batch ids committed to the warehouse.
    pub loaded: Vec<String>,
    pub transform: Option<TransformResult>,
    pub failures: Vec<LayerFailure>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn failures_in(&self, layer: Layer) -> impl Iterator<Item = &LayerFailure> {
        self.failures.iter().filter(move |f| f.layer == layer)
    }

    fn fail(&mut self, layer: Layer, key: impl Into<String>, err: &dyn std::error::Error) {
        let key = key.into();
        let message = error_chain(err);
        error!("{} failed for {}: {}", layer, key, message);
        self.failures.push(LayerFailure {
            layer,
            key,
            message,
        });
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fetched:   {}", self.fetched.len())?;
        writeln!(f, "validated: {}", self.validated.len())?;
        writeln!(f, "loaded:    {}", self.loaded.len())?;
        match &self.transform {
            Some(t) => writeln!(
                f,
                "transform: as of {} ({} metric rows, {} dates refreshed)",
                t.as_of, t.metric_rows, t.dates_refreshed
            )?,
            None => writeln!(f, "transform: not run")?,
        }
        if self.cancelled {
            writeln!(f, "run cancelled before completion")?;
        }
        for failure in &self.failures {
            writeln!(
                f,
                "FAILED [{}] {}: {}",
                failure.layer, failure.key, failure.message
            )?;
        }
        Ok(())
    }
}

/// Row counts and ledger state, as printed by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub table_counts: Vec<(String, usize)>,
    pub raw_fetches: usize,
    pub unprocessed_fetches: usize,
    pub ledger_batches: usize,
    pub loaded_batches: usize,
}

impl StatusReport {
    pub fn pending_loads(&self) -> usize {
        self.ledger_batches.saturating_sub(self.loaded_batches)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (table, count) in &self.table_counts {
            writeln!(f, "{table:<22} {count:>10}")?;
        }
        writeln!(f, "raw fetches            {:>10}", self.raw_fetches)?;
        writeln!(f, "unprocessed fetches    {:>10}", self.unprocessed_fetches)?;
        writeln!(f, "ledger batches         {:>10}", self.ledger_batches)?;
        writeln!(f, "loaded batches         {:>10}", self.loaded_batches)?;
        write!(f, "pending loads          {:>10}", self.pending_loads())
    }
}

pub struct Pipeline {
    config: Config,
    client: ForecastClient,
    raw_store: RawStore,
    validator: Validator,
    warehouse: Warehouse,
    loader: Loader,
    transform: TransformEngine,
}

impl Pipeline {
    /// Opens the warehouse and loads the geo reference for `config`.
    pub async fn new(config: Config) -> Result<Self, PipelineError> {
        let client = ForecastClient::new(&config)?;
        let raw_store = RawStore::new(&config.raw_dir(), config.write_policy);
        let validator = Validator::new(&config.normalized_dir());

        let warehouse_path = config.warehouse_path.clone();
        let warehouse = task::spawn_blocking(move || Warehouse::open(&warehouse_path)).await??;
        let geo = GeoReference::load(&config.reference_path).await?;
        if geo.is_empty() {
            warn!("Geo reference has no places, locations load without enrichment");
        } else {
            info!("Geo reference holds {} places", geo.len());
        }
        let loader = Loader::new(
            warehouse.clone(),
            Arc::new(geo),
            &config.locations,
            config.max_reference_distance_km,
        );
        let transform = TransformEngine::new(warehouse.clone());

        Ok(Self {
            config,
            client,
            raw_store,
            validator,
            warehouse,
            loader,
            transform,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn raw_store(&self) -> &RawStore {
        &self.raw_store
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    /// Runs all four layers for the forecast window starting at `as_of`.
    ///
    /// The transform covers every date up to the last day of the window, so each loaded
    /// forecast day gets its metric rows.
    ///
    /// With `run_timeout` configured the run stops once it elapses. Work already committed
    /// stays; the interrupted unit is either fully written or not visible at all. A raw
    /// persist or warehouse load already handed to a blocking thread is not interrupted and
    /// may still commit after the report is returned. Such work is missing from the report;
    /// `status` or the next run picks it up.
    pub async fn run(&self, as_of: NaiveDate) -> RunReport {
        let mut report = RunReport::default();
        info!("Starting pipeline run as of {}", as_of);

        match self.config.run_timeout {
            Some(limit) => {
                let finished = tokio::time::timeout(limit, self.run_layers(as_of, &mut report))
                    .await
                    .is_ok();
                if !finished {
                    warn!("Pipeline run cancelled after {:?}", limit);
                    self.record_cancellation(&mut report);
                }
            }
            None => self.run_layers(as_of, &mut report).await,
        }

        info!(
            "Pipeline run as of {} finished: {} fetched, {} validated, {} loaded, {} failures",
            as_of,
            report.fetched.len(),
            report.validated.len(),
            report.loaded.len(),
            report.failures.len()
        );
        report
    }

    async fn run_layers(&self, as_of: NaiveDate, report: &mut RunReport) {
        let window = TimeWindow::starting_at(as_of, self.config.fetch_window_days);
        self.fetch_into(window, Endpoint::Forecast, report).await;
        self.validate_into(report).await;
        self.load_into(report).await;
        self.transform_into(window.end, report).await;
    }

    fn record_cancellation(&self, report: &mut RunReport) {
        report.cancelled = true;
        // Locations still in flight when the fetch layer was interrupted.
        for location in &self.config.locations {
            let prefix = format!("{}@", location.id);
            let attempted = report.fetched.iter().any(|id| id.starts_with(&prefix))
                || report
                    .failures_in(Layer::Fetch)
                    .any(|f| f.key == location.id);
            if !attempted {
                let err = FetchError::Cancelled {
                    location_id: location.id.clone(),
                };
                report.fail(Layer::Fetch, location.id.as_str(), &err);
            }
        }
    }

    /// Fetches every configured location for `window`.
    pub async fn fetch(&self, window: TimeWindow, endpoint: Endpoint) -> RunReport {
        let mut report = RunReport::default();
        self.fetch_into(window, endpoint, &mut report).await;
        report
    }

    /// Validates every raw fetch not yet referenced by the batch ledger.
    pub async fn validate(&self) -> RunReport {
        let mut report = RunReport::default();
        self.validate_into(&mut report).await;
        report
    }

    /// Loads every ledger batch not yet committed to the warehouse.
    pub async fn load(&self) -> RunReport {
        let mut report = RunReport::default();
        self.load_into(&mut report).await;
        report
    }

    pub async fn transform(&self, as_of: NaiveDate) -> RunReport {
        let mut report = RunReport::default();
        self.transform_into(as_of, &mut report).await;
        report
    }

    async fn fetch_into(&self, window: TimeWindow, endpoint: Endpoint, report: &mut RunReport) {
        info!(
            "Fetching {} locations for {} to {} ({} at a time)",
            self.config.locations.len(),
            window.start,
            window.end,
            self.config.concurrency_limit
        );
        let mut fetches = stream::iter(self.config.locations.iter())
            .map(|location| async move {
                let result = self.fetch_location(location, window, endpoint).await;
                (location.id.clone(), result)
            })
            .buffer_unordered(self.config.concurrency_limit);

        while let Some((location_id, result)) = fetches.next().await {
            match result {
                Ok(fetch) => report.fetched.push(fetch.fetch_id),
                Err(e) => {
                    warn!("Skipping location {} for this run", location_id);
                    report.fail(Layer::Fetch, location_id, &e);
                }
            }
        }
    }

    async fn fetch_location(
        &self,
        location: &Location,
        window: TimeWindow,
        endpoint: Endpoint,
    ) -> Result<RawFetch, PipelineError> {
        let requested_at = Utc::now();
        let payload = self
            .client
            .fetch()
            .location(location)
            .window(window)
            .endpoint(endpoint)
            .call()
            .await?;

        let store = self.raw_store.clone();
        let location_id = location.id.clone();
        let fetch = task::spawn_blocking(move || {
            store.persist(
                &location_id,
                requested_at,
                &payload.bytes,
                &payload.source_url,
            )
        })
        .await??;
        Ok(fetch)
    }

    async fn validate_into(&self, report: &mut RunReport) {
        let store = self.raw_store.clone();
        let ledger = self.validator.ledger().clone();
        let listing = task::spawn_blocking(move || {
            let processed = ledger.processed_fetches()?;
            let mut grouped: BTreeMap<String, Vec<RawFetch>> = BTreeMap::new();
            let mut unreadable = Vec::new();
            for item in store.list_unprocessed(&processed)? {
                match item {
                    Ok(fetch) => grouped
                        .entry(fetch.location_id.clone())
                        .or_default()
                        .push(fetch),
                    Err(e) => unreadable.push(e),
                }
            }
            Ok::<_, PipelineError>((grouped, unreadable))
        })
        .await;

        let (grouped, unreadable) = match listing {
            Ok(Ok(listing)) => listing,
            Ok(Err(e)) => return report.fail(Layer::Validate, "raw store", &e),
            Err(e) => return report.fail(Layer::Validate, "raw store", &e),
        };
        for e in unreadable {
            report.fail(Layer::Validate, raw_store_key(&e), &e);
        }
        if grouped.is_empty() {
            info!("No unprocessed raw fetches");
            return;
        }

        // Within a location fetches run in requested_at order; locations run side by side.
        let mut outcomes = stream::iter(grouped)
            .map(|(_, fetches)| async move {
                let mut results = Vec::with_capacity(fetches.len());
                for fetch in fetches {
                    let result = self.validator.process(&fetch).await;
                    results.push((fetch.fetch_id, result));
                }
                results
            })
            .buffer_unordered(self.config.concurrency_limit);

        while let Some(results) = outcomes.next().await {
            for (fetch_id, result) in results {
                match result {
                    Ok(batch) => report.validated.push(batch.batch_id),
                    Err(e) => report.fail(Layer::Validate, fetch_id, &e),
                }
            }
        }
    }

    async fn load_into(&self, report: &mut RunReport) {
        let pending = match self.pending_batches().await {
            Ok(pending) => pending,
            Err(e) => return report.fail(Layer::Load, "ledger", &e),
        };
        if pending.is_empty() {
            info!("No batches pending load");
            return;
        }

        // One connection serves the warehouse, so batches load one after another.
        for batch in pending {
            match self.loader.load(&batch).await {
                Ok(result) if result.already_loaded => {}
                Ok(result) => report.loaded.push(result.batch_id),
                Err(e) => report.fail(Layer::Load, batch.batch_id.as_str(), &e),
            }
        }
    }

    async fn pending_batches(&self) -> Result<Vec<IngestionBatch>, PipelineError> {
        let ledger = self.validator.ledger().clone();
        let batches = task::spawn_blocking(move || ledger.batches()).await??;
        let loaded = self.warehouse.loaded_batch_ids().await?;
        Ok(batches
            .into_iter()
            .filter(|b| !loaded.contains(&b.batch_id))
            .collect())
    }

    async fn transform_into(&self, as_of: NaiveDate, report: &mut RunReport) {
        match self.transform.transform(as_of).await {
            Ok(result) => report.transform = Some(result),
            Err(e) => report.fail(Layer::Transform, as_of.to_string(), &e),
        }
    }

    pub async fn status(&self) -> Result<StatusReport, PipelineError> {
        let mut table_counts = Vec::with_capacity(TABLES.len());
        for table in TABLES {
            table_counts.push((table.to_string(), self.warehouse.table_count(table).await?));
        }
        let loaded_batches = self.warehouse.loaded_batch_ids().await?.len();

        let store = self.raw_store.clone();
        let ledger = self.validator.ledger().clone();
        let (raw_fetches, unprocessed_fetches, ledger_batches) =
            task::spawn_blocking(move || {
                let processed = ledger.processed_fetches()?;
                let raw = store.list_all()?.count();
                let unprocessed = store.list_unprocessed(&processed)?.count();
                let batches = ledger.batches()?.len();
                Ok::<_, PipelineError>((raw, unprocessed, batches))
            })
            .await??;

        Ok(StatusReport {
            table_counts,
            raw_fetches,
            unprocessed_fetches,
            ledger_batches,
            loaded_batches,
        })
    }
}

fn raw_store_key(err: &RawStoreError) -> String {
    match err {
        RawStoreError::Io(path, _) | RawStoreError::MetaDecode(path, _) => {
            path.display().to_string()
        }
        RawStoreError::AlreadyExists { fetch_id } | RawStoreError::ContentConflict { fetch_id } => {
            fetch_id.clone()
        }
        RawStoreError::MetaEncode(key, _)
        | RawStoreError::InvalidLocationId(key)
        | RawStoreError::MalformedFetchId(key)
        | RawStoreError::NotFound(key) => key.clone(),
    }
}
