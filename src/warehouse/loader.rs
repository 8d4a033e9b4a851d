//! Transactional loading of ingestion batches.
//!
//! Each batch is loaded in one transaction: `dim_location`, then `dim_date`, then a key check,
//! then `fact_forecast`, then the `_loaded_batches` entry. Any failure rolls the whole batch
//! back, so a batch is either fully visible and marked loaded or not visible at all.

use crate::geo::{Enrichment, GeoReference};
use crate::normalize::snapshot::read_snapshot;
use crate::types::location::Location;
use crate::types::records::{ForecastRecord, IngestionBatch};
use crate::warehouse::error::LoadError;
use crate::warehouse::{Warehouse, SQL_TIMESTAMP_FORMAT};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use duckdb::{params, Connection, OptionalExt};
use log::{debug, info};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub batch_id: String,
    pub locations_upserted: usize,
    pub dates_upserted: usize,
    pub facts_upserted: usize,
    /// Rows in the snapshot with `is_valid = false`.
    pub skipped_invalid: usize,
    /// The batch was already recorded in `_loaded_batches`; nothing was written.
    pub already_loaded: bool,
}

impl LoadResult {
    fn already_loaded(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            locations_upserted: 0,
            dates_upserted: 0,
            facts_upserted: 0,
            skipped_invalid: 0,
            already_loaded: true,
        }
    }
}

/// `YYYYMMDD` surrogate key of a calendar date.
pub fn date_key(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

pub struct Loader {
    warehouse: Warehouse,
    geo: Arc<GeoReference>,
    locations: HashMap<String, Location>,
    max_reference_distance_km: f64,
}

impl Loader {
    pub fn new(
        warehouse: Warehouse,
        geo: Arc<GeoReference>,
        locations: &[Location],
        max_reference_distance_km: f64,
    ) -> Self {
        Self {
            warehouse,
            geo,
            locations: locations
                .iter()
                .map(|l| (l.id.clone(), l.clone()))
                .collect(),
            max_reference_distance_km,
        }
    }

    /// Loads one batch. Loading a batch that is already recorded is a no-op.
    pub async fn load(&self, batch: &IngestionBatch) -> Result<LoadResult, LoadError> {
        let location = self
            .locations
            .get(&batch.location_id)
            .cloned()
            .ok_or_else(|| LoadError::UnknownLocation {
                batch_id: batch.batch_id.clone(),
                location_id: batch.location_id.clone(),
            })?;
        let enrichment = self
            .geo
            .nearest(location.lat_lon(), self.max_reference_distance_km);
        if enrichment.is_none() {
            debug!(
                "No geo reference within {} km of {}",
                self.max_reference_distance_km, location.id
            );
        }

        let snapshot_file = batch.snapshot_file.clone();
        let records = task::spawn_blocking(move || read_snapshot(&snapshot_file))
            .await
            .map_err(|e| LoadError::Warehouse(e.into()))?
            .map_err(|e| LoadError::Snapshot {
                batch_id: batch.batch_id.clone(),
                source: e,
            })?;

        let batch = batch.clone();
        let result = self
            .warehouse
            .run_blocking(move |conn| {
                load_in_transaction(conn, &batch, &location, enrichment.as_ref(), &records)
            })
            .await?;

        if result.already_loaded {
            info!("Batch {} already loaded, skipping", result.batch_id);
        } else {
            info!(
                "Loaded batch {}: {} facts, {} dates, {} invalid rows skipped",
                result.batch_id, result.facts_upserted, result.dates_upserted, result.skipped_invalid
            );
        }
        Ok(result)
    }
}

fn load_in_transaction(
    conn: &mut Connection,
    batch: &IngestionBatch,
    location: &Location,
    enrichment: Option<&Enrichment>,
    records: &[ForecastRecord],
) -> Result<LoadResult, LoadError> {
    let batch_id = batch.batch_id.as_str();
    let tx = conn.transaction().map_err(|e| LoadError::Transaction {
        batch_id: batch_id.to_string(),
        source: e,
    })?;

    let already: Option<String> = tx
        .query_row(
            "SELECT batch_id FROM _loaded_batches WHERE batch_id = ?",
            params![batch_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| LoadError::Ledger {
            batch_id: batch_id.to_string(),
            source: e,
        })?;
    if already.is_some() {
        return Ok(LoadResult::already_loaded(batch_id));
    }

    let now = Utc::now().format(SQL_TIMESTAMP_FORMAT).to_string();
    let dimension_failed = |e| LoadError::DimensionUpsertFailed {
        batch_id: batch_id.to_string(),
        source: e,
    };

    let facts: Vec<(&ForecastRecord, NaiveDateTime, f64)> = records
        .iter()
        .filter(|r| r.is_valid)
        .filter_map(|r| Some((r, r.forecast_time?, r.value?)))
        .collect();
    let dates: BTreeSet<NaiveDate> = facts.iter().map(|(_, time, _)| time.date()).collect();

    // (a) location, (b) dates
    let location_key = upsert_location(&tx, location, enrichment, &now).map_err(dimension_failed)?;
    upsert_dates(&tx, &dates).map_err(dimension_failed)?;

    // (c) both keys must resolve before any fact is written
    verify_dimensions(&tx, batch_id, location_key, &dates)?;
    let mut stmt = tx
        .prepare(
            "INSERT INTO fact_forecast (
                location_key, date_key, forecast_time, frequency, variable_name, value,
                ingestion_batch_id, fetch_id, requested_at, loaded_at
             ) VALUES (?, ?, CAST(? AS TIMESTAMP), ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP))
             ON CONFLICT (location_key, date_key, forecast_time, frequency, variable_name) DO UPDATE SET
                value = EXCLUDED.value,
                ingestion_batch_id = EXCLUDED.ingestion_batch_id,
                fetch_id = EXCLUDED.fetch_id,
                requested_at = EXCLUDED.requested_at,
                loaded_at = EXCLUDED.loaded_at
             WHERE EXCLUDED.requested_at >= fact_forecast.requested_at",
        )
        .map_err(|e| LoadError::FactUpsertFailed {
            batch_id: batch_id.to_string(),
            source: e,
        })?;
    for (record, time, value) in &facts {
        stmt.execute(params![
            location_key,
            date_key(time.date()),
            time.format(SQL_TIMESTAMP_FORMAT).to_string(),
            record.frequency.section_key(),
            record.variable_name,
            *value,
            record.ingestion_batch_id,
            record.fetch_id,
            record.requested_at.format(SQL_TIMESTAMP_FORMAT).to_string(),
            now,
        ])
        .map_err(|e| LoadError::FactUpsertFailed {
            batch_id: batch_id.to_string(),
            source: e,
        })?;
    }
    drop(stmt);

    // (d) ledger
    tx.execute(
        "INSERT INTO _loaded_batches (batch_id, location_id, requested_at, fact_rows, loaded_at)
         VALUES (?, ?, CAST(? AS TIMESTAMP), ?, CAST(? AS TIMESTAMP))
         ON CONFLICT (batch_id) DO NOTHING",
        params![
            batch_id,
            batch.location_id,
            batch.requested_at.format(SQL_TIMESTAMP_FORMAT).to_string(),
            facts.len() as i64,
            now,
        ],
    )
    .map_err(|e| LoadError::Ledger {
        batch_id: batch_id.to_string(),
        source: e,
    })?;

    tx.commit().map_err(|e| LoadError::Transaction {
        batch_id: batch_id.to_string(),
        source: e,
    })?;

    Ok(LoadResult {
        batch_id: batch_id.to_string(),
        locations_upserted: 1,
        dates_upserted: dates.len(),
        facts_upserted: facts.len(),
        skipped_invalid: records.iter().filter(|r| !r.is_valid).count(),
        already_loaded: false,
    })
}

fn upsert_location(
    conn: &Connection,
    location: &Location,
    enrichment: Option<&Enrichment>,
    now: &str,
) -> duckdb::Result<i64> {
    let place = enrichment.map(|e| &e.place);
    conn.execute(
        "INSERT INTO dim_location (
            location_id, name, latitude, longitude, timezone, elevation, region, country,
            reference_name, reference_distance_km, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP))
         ON CONFLICT (location_id) DO UPDATE SET
            name = EXCLUDED.name,
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            timezone = EXCLUDED.timezone,
            elevation = EXCLUDED.elevation,
            region = EXCLUDED.region,
            country = EXCLUDED.country,
            reference_name = EXCLUDED.reference_name,
            reference_distance_km = EXCLUDED.reference_distance_km,
            updated_at = EXCLUDED.updated_at",
        params![
            location.id,
            location.name,
            location.latitude,
            location.longitude,
            location.timezone,
            place.and_then(|p| p.elevation),
            place.and_then(|p| p.region.clone()),
            place.map(|p| p.country.clone()),
            place.map(|p| p.name.clone()),
            enrichment.map(|e| e.distance_km),
            now,
        ],
    )?;
    conn.query_row(
        "SELECT location_key FROM dim_location WHERE location_id = ?",
        params![location.id],
        |row| row.get(0),
    )
}

fn upsert_dates(conn: &Connection, dates: &BTreeSet<NaiveDate>) -> duckdb::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO dim_date (
            date_key, full_date, year, quarter, month, day, day_of_week, day_name, is_weekend
         ) VALUES (?, CAST(? AS DATE), ?, ?, ?, ?, ?, ?, NULL)
         ON CONFLICT (date_key) DO NOTHING",
    )?;
    for date in dates {
        stmt.execute(params![
            date_key(*date),
            date.format("%Y-%m-%d").to_string(),
            date.year(),
            (date.month0() / 3 + 1) as i32,
            date.month() as i32,
            date.day() as i32,
            date.weekday().number_from_monday() as i32,
            date.format("%A").to_string(),
        ])?;
    }
    Ok(())
}

fn verify_dimensions(
    conn: &Connection,
    batch_id: &str,
    location_key: i64,
    dates: &BTreeSet<NaiveDate>,
) -> Result<(), LoadError> {
    let query_failed = |e| LoadError::DimensionUpsertFailed {
        batch_id: batch_id.to_string(),
        source: e,
    };
    let location_rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM dim_location WHERE location_key = ?",
            params![location_key],
            |row| row.get(0),
        )
        .map_err(query_failed)?;
    if location_rows != 1 {
        return Err(LoadError::MissingDimension {
            batch_id: batch_id.to_string(),
            what: format!("location_key {location_key}"),
        });
    }

    let mut stmt = conn
        .prepare("SELECT COUNT(*) FROM dim_date WHERE date_key = ?")
        .map_err(query_failed)?;
    for date in dates {
        let key = date_key(*date);
        let found: i64 = stmt
            .query_row(params![key], |row| row.get(0))
            .map_err(query_failed)?;
        if found == 0 {
            return Err(LoadError::MissingDimension {
                batch_id: batch_id.to_string(),
                what: format!("date_key {key}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Validator;
    use crate::test_support::{day_start, hourly_payload, payload_bytes, sample_location};
    use crate::types::records::RawFetch;
    use chrono::{DateTime, TimeZone};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        validator: Validator,
        warehouse: Warehouse,
        loader: Loader,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let validator = Validator::new(&dir.path().join("normalized"));
        let warehouse = Warehouse::open(&dir.path().join("warehouse.duckdb")).unwrap();
        let geo = Arc::new(GeoReference::bundled().unwrap());
        let loader = Loader::new(warehouse.clone(), geo, &[sample_location()], 50.0);
        Fixture {
            _dir: dir,
            validator,
            warehouse,
            loader,
        }
    }

    fn fetch_at(hour: u32, payload: &Value) -> RawFetch {
        let requested_at: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 2, 21, hour, 0, 0).unwrap();
        RawFetch {
            fetch_id: RawFetch::fetch_id_for("sopron", requested_at),
            location_id: "sopron".to_string(),
            requested_at,
            payload: payload_bytes(payload),
            source_url: "http://provider/v1/forecast".to_string(),
        }
    }

    fn scenario_payload() -> Value {
        let mut payload = hourly_payload(day_start(2026, 2, 21), 24, 5.0);
        payload["hourly"]["temperature_2m"][7] = json!(999.0);
        payload
    }

    #[test]
    fn test_date_key() {
        assert_eq!(date_key(NaiveDate::from_ymd_opt(2026, 2, 21).unwrap()), 20260221);
        assert_eq!(date_key(NaiveDate::from_ymd_opt(1999, 12, 1).unwrap()), 19991201);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let f = fixture();
        let batch = f.validator.process(&fetch_at(6, &scenario_payload())).await.unwrap();

        let first = f.loader.load(&batch).await.unwrap();
        assert_eq!(first.facts_upserted, 47);
        assert_eq!(first.skipped_invalid, 1);
        assert_eq!(first.dates_upserted, 1);
        assert_eq!(first.locations_upserted, 1);
        assert!(!first.already_loaded);

        let second = f.loader.load(&batch).await.unwrap();
        assert!(second.already_loaded);
        assert_eq!(f.warehouse.table_count("fact_forecast").await.unwrap(), 47);
        assert_eq!(f.warehouse.table_count("dim_location").await.unwrap(), 1);
        assert_eq!(f.warehouse.table_count("dim_date").await.unwrap(), 1);
        assert_eq!(
            f.warehouse.loaded_batch_ids().await.unwrap(),
            BTreeSet::from([batch.batch_id.clone()])
        );
    }

    #[tokio::test]
    async fn test_facts_trace_back_to_their_fetch() {
        let f = fixture();
        let fetch = fetch_at(6, &scenario_payload());
        let batch = f.validator.process(&fetch).await.unwrap();
        f.loader.load(&batch).await.unwrap();

        let facts = f.warehouse.facts_for("sopron").await.unwrap();
        assert_eq!(facts.len(), 47);
        for fact in &facts {
            assert_eq!(fact.fetch_id, fetch.fetch_id);
            assert_eq!(fact.ingestion_batch_id, batch.batch_id);
            assert_eq!(fact.requested_at, fetch.requested_at);
            assert_eq!(fact.date_key, 20260221);
        }
        let rejected_time = day_start(2026, 2, 21) + chrono::Duration::hours(7);
        assert!(!facts
            .iter()
            .any(|f| f.forecast_time == rejected_time && f.variable_name == "temperature_2m"));
    }

    #[tokio::test]
    async fn test_location_is_enriched_from_reference() {
        let f = fixture();
        let batch = f.validator.process(&fetch_at(6, &scenario_payload())).await.unwrap();
        f.loader.load(&batch).await.unwrap();

        let row = f.warehouse.dim_location("sopron").await.unwrap().unwrap();
        assert_eq!(row.name, "Sopron");
        assert_eq!(row.country.as_deref(), Some("HU"));
        assert_eq!(row.region.as_deref(), Some("Győr-Moson-Sopron"));
        assert_eq!(row.elevation, Some(234.0));
        assert!(row.location_key >= 1);
    }

    #[tokio::test]
    async fn test_unreferenced_location_gets_null_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let validator = Validator::new(&dir.path().join("normalized"));
        let warehouse = Warehouse::open(&dir.path().join("warehouse.duckdb")).unwrap();
        let mut remote = sample_location();
        remote.latitude = 30.0;
        remote.longitude = -40.0;
        let loader = Loader::new(
            warehouse.clone(),
            Arc::new(GeoReference::bundled().unwrap()),
            &[remote],
            50.0,
        );

        let batch = validator.process(&fetch_at(6, &scenario_payload())).await.unwrap();
        loader.load(&batch).await.unwrap();
        let row = warehouse.dim_location("sopron").await.unwrap().unwrap();
        assert_eq!(row.country, None);
        assert_eq!(row.elevation, None);
        assert_eq!(row.reference_name, None);
    }

    #[tokio::test]
    async fn test_dimension_failure_rolls_back_everything() {
        let f = fixture();
        let batch = f.validator.process(&fetch_at(6, &scenario_payload())).await.unwrap();
        f.warehouse
            .execute_batch(
                "DROP VIEW v_dim_date; DROP VIEW v_forecast; DROP VIEW v_daily_metrics;
                 DROP TABLE dim_date;",
            )
            .await
            .unwrap();

        let result = f.loader.load(&batch).await;
        match result {
            Err(LoadError::DimensionUpsertFailed { batch_id, .. }) => {
                assert_eq!(batch_id, batch.batch_id)
            }
            other => panic!("expected DimensionUpsertFailed, got {other:?}"),
        }
        // the location upsert that preceded the failure was rolled back too
        assert_eq!(f.warehouse.table_count("dim_location").await.unwrap(), 0);
        assert_eq!(f.warehouse.table_count("fact_forecast").await.unwrap(), 0);
        assert!(f.warehouse.loaded_batch_ids().await.unwrap().is_empty());

        // the batch stays eligible and loads once the warehouse is repaired
        f.warehouse.recreate_schema().await.unwrap();
        let retried = f.loader.load(&batch).await.unwrap();
        assert_eq!(retried.facts_upserted, 47);
    }

    #[tokio::test]
    async fn test_fact_failure_leaves_no_dimension_rows() {
        let f = fixture();
        let batch = f.validator.process(&fetch_at(6, &scenario_payload())).await.unwrap();
        f.warehouse
            .execute_batch(
                "DROP VIEW v_forecast; DROP TABLE fact_forecast;
                 CREATE TABLE fact_forecast (location_key BIGINT);",
            )
            .await
            .unwrap();

        let result = f.loader.load(&batch).await;
        assert!(matches!(result, Err(LoadError::FactUpsertFailed { .. })));
        assert_eq!(f.warehouse.table_count("dim_location").await.unwrap(), 0);
        assert_eq!(f.warehouse.table_count("dim_date").await.unwrap(), 0);
        assert!(f.warehouse.loaded_batch_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_some_facts_rolls_back_whole_batch() {
        let f = fixture();
        let batch = f.validator.process(&fetch_at(6, &scenario_payload())).await.unwrap();
        // precipitation and the first temperatures pass, later temperatures violate the check
        f.warehouse
            .execute_batch(
                "DROP VIEW v_forecast; DROP TABLE fact_forecast;
                 CREATE TABLE fact_forecast (
                    location_key BIGINT NOT NULL,
                    date_key INTEGER NOT NULL,
                    forecast_time TIMESTAMP NOT NULL,
                    frequency VARCHAR NOT NULL,
                    variable_name VARCHAR NOT NULL,
                    value DOUBLE NOT NULL CHECK (value < 6.5),
                    ingestion_batch_id VARCHAR NOT NULL,
                    fetch_id VARCHAR NOT NULL,
                    requested_at TIMESTAMP NOT NULL,
                    loaded_at TIMESTAMP NOT NULL,
                    PRIMARY KEY (location_key, date_key, forecast_time, frequency, variable_name)
                 );",
            )
            .await
            .unwrap();

        let result = f.loader.load(&batch).await;
        match result {
            Err(LoadError::FactUpsertFailed { batch_id, .. }) => {
                assert_eq!(batch_id, batch.batch_id)
            }
            other => panic!("expected FactUpsertFailed, got {other:?}"),
        }
        assert_eq!(f.warehouse.table_count("fact_forecast").await.unwrap(), 0);
        assert_eq!(f.warehouse.table_count("dim_location").await.unwrap(), 0);
        assert_eq!(f.warehouse.table_count("dim_date").await.unwrap(), 0);
        assert!(f.warehouse.loaded_batch_ids().await.unwrap().is_empty());

        f.warehouse
            .execute_batch("DROP TABLE fact_forecast;")
            .await
            .unwrap();
        f.warehouse.recreate_schema().await.unwrap();
        assert_eq!(f.loader.load(&batch).await.unwrap().facts_upserted, 47);
    }

    #[test]
    fn test_missing_dimensions_are_reported() {
        let conn = Connection::open_in_memory().unwrap();
        crate::warehouse::schema::create_schema(&conn).unwrap();
        let dates = BTreeSet::from([NaiveDate::from_ymd_opt(2026, 2, 21).unwrap()]);

        match verify_dimensions(&conn, "b", 999, &dates) {
            Err(LoadError::MissingDimension { batch_id, what }) => {
                assert_eq!(batch_id, "b");
                assert_eq!(what, "location_key 999");
            }
            other => panic!("expected MissingDimension, got {other:?}"),
        }

        let now = Utc::now().format(SQL_TIMESTAMP_FORMAT).to_string();
        let key = upsert_location(&conn, &sample_location(), None, &now).unwrap();
        match verify_dimensions(&conn, "b", key, &dates) {
            Err(LoadError::MissingDimension { what, .. }) => {
                assert_eq!(what, "date_key 20260221")
            }
            other => panic!("expected MissingDimension, got {other:?}"),
        }

        upsert_dates(&conn, &dates).unwrap();
        assert!(verify_dimensions(&conn, "b", key, &dates).is_ok());
    }

    #[tokio::test]
    async fn test_latest_requested_at_wins_regardless_of_load_order() {
        let f = fixture();
        // 00:00..11:00 requested at 06:00, 06:00..17:00 requested at 09:00
        let early = fetch_at(6, &hourly_payload(day_start(2026, 2, 21), 12, 5.0));
        let late = fetch_at(
            9,
            &hourly_payload(day_start(2026, 2, 21) + chrono::Duration::hours(6), 12, 20.0),
        );
        let late_batch = f.validator.process(&late).await.unwrap();
        let early_batch = f.validator.process(&early).await.unwrap();

        f.loader.load(&late_batch).await.unwrap();
        f.loader.load(&early_batch).await.unwrap();

        let temps: Vec<_> = f
            .warehouse
            .facts_for("sopron")
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.variable_name == "temperature_2m")
            .collect();
        assert_eq!(temps.len(), 18);
        for fact in &temps {
            let hour = (fact.forecast_time - day_start(2026, 2, 21)).num_hours();
            let expected = if hour < 6 { &early.fetch_id } else { &late.fetch_id };
            assert_eq!(&fact.fetch_id, expected, "hour {hour}");
        }

        // the warehouse agrees with the normalized layer
        let resolved = f.validator.resolve_latest("sopron").await.unwrap();
        let facts = f.warehouse.facts_for("sopron").await.unwrap();
        assert_eq!(resolved.len(), facts.len());
        for (record, fact) in resolved.iter().zip(&facts) {
            assert_eq!(record.forecast_time, Some(fact.forecast_time));
            assert_eq!(record.value, Some(fact.value));
        }
    }

    #[tokio::test]
    async fn test_unknown_location_is_rejected() {
        let f = fixture();
        let requested_at: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 2, 21, 6, 0, 0).unwrap();
        let fetch = RawFetch {
            fetch_id: RawFetch::fetch_id_for("atlantis", requested_at),
            location_id: "atlantis".to_string(),
            requested_at,
            payload: payload_bytes(&scenario_payload()),
            source_url: String::new(),
        };
        let batch = f.validator.process(&fetch).await.unwrap();
        assert!(matches!(
            f.loader.load(&batch).await,
            Err(LoadError::UnknownLocation { .. })
        ));
    }
}
