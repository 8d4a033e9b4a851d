//! The embedded DuckDB warehouse.
//!
//! A single [`duckdb::Connection`] is shared behind a mutex and only ever used from blocking
//! tasks. Loads and transforms each run in one DuckDB transaction, so readers see either the
//! state before a step or after it.

pub mod error;
pub mod loader;
pub mod schema;
pub mod transform;

use crate::types::frequency::Frequency;
use crate::utils::ensure_dir_exists;
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{AccessMode, Config as DuckConfig, Connection};
pub use error::{LoadError, TransformError, WarehouseError};
use log::info;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task;

/// Layout used when binding timestamps as text.
pub(crate) const SQL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// One row of `fact_forecast` with its natural location key.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub location_id: String,
    pub date_key: i32,
    pub forecast_time: NaiveDateTime,
    pub frequency: Frequency,
    pub variable_name: String,
    pub value: f64,
    pub ingestion_batch_id: String,
    pub fetch_id: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimLocationRow {
    pub location_key: i64,
    pub location_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub reference_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyMetricRow {
    pub location_id: String,
    pub date_key: i32,
    pub variable_name: String,
    pub frequency: Frequency,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub mean_value: Option<f64>,
    pub sample_count: i64,
}

#[derive(Clone)]
pub struct Warehouse {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Warehouse {
    /// Opens (or creates) the warehouse file and ensures the schema exists.
    pub fn open(path: &Path) -> Result<Self, WarehouseError> {
        if let Some(parent) = path.parent() {
            ensure_dir_exists(parent)
                .map_err(|e| WarehouseError::DirCreation(parent.to_path_buf(), e))?;
        }
        let conn =
            Connection::open(path).map_err(|e| WarehouseError::Open(path.to_path_buf(), e))?;
        schema::create_schema(&conn).map_err(WarehouseError::Schema)?;
        info!("Opened warehouse at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// A read-only connection for downstream consumers such as dashboards.
    ///
    /// Fails while another process holds the file open for writing.
    pub fn open_read_only(path: &Path) -> Result<Connection, WarehouseError> {
        let config = DuckConfig::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(|e| WarehouseError::Open(path.to_path_buf(), e))?;
        Connection::open_with_flags(path, config)
            .map_err(|e| WarehouseError::Open(path.to_path_buf(), e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` against the shared connection on a blocking thread.
    pub(crate) async fn run_blocking<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<WarehouseError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| WarehouseError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| E::from(WarehouseError::TaskJoin(e)))?
    }

    pub async fn table_count(&self, table: &str) -> Result<usize, WarehouseError> {
        if !schema::TABLES.contains(&table) {
            return Err(WarehouseError::UnknownTable(table.to_string()));
        }
        let sql = format!("SELECT COUNT(*) FROM {table}");
        self.run_blocking(move |conn| {
            let count: i64 = conn.prepare(&sql)?.query_row([], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }

    pub async fn loaded_batch_ids(&self) -> Result<BTreeSet<String>, WarehouseError> {
        self.run_blocking(|conn| {
            let mut stmt = conn.prepare("SELECT batch_id FROM _loaded_batches")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    /// Fact rows for one location ordered by `(forecast_time, frequency, variable_name)`.
    pub async fn facts_for(&self, location_id: &str) -> Result<Vec<FactRow>, WarehouseError> {
        let location_id = location_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT l.location_id, f.date_key, epoch_ms(f.forecast_time), f.frequency,
                        f.variable_name, f.value, f.ingestion_batch_id, f.fetch_id,
                        epoch_ms(f.requested_at)
                 FROM fact_forecast f
                 JOIN dim_location l ON l.location_key = f.location_key
                 WHERE l.location_id = ?
                 ORDER BY f.forecast_time, f.frequency, f.variable_name",
            )?;
            let rows = stmt
                .query_map(duckdb::params![location_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i32>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .filter_map(
                    |(location_id, date_key, time_ms, frequency, variable_name, value, batch, fetch, req_ms)| {
                        Some(FactRow {
                            location_id,
                            date_key,
                            forecast_time: DateTime::<Utc>::from_timestamp_millis(time_ms)?
                                .naive_utc(),
                            frequency: Frequency::from_str(&frequency).ok()?,
                            variable_name,
                            value,
                            ingestion_batch_id: batch,
                            fetch_id: fetch,
                            requested_at: DateTime::<Utc>::from_timestamp_millis(req_ms)?,
                        })
                    },
                )
                .collect())
        })
        .await
    }

    pub async fn dim_location(
        &self,
        location_id: &str,
    ) -> Result<Option<DimLocationRow>, WarehouseError> {
        let location_id = location_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT location_key, location_id, name, latitude, longitude, elevation,
                        region, country, reference_name
                 FROM dim_location WHERE location_id = ?",
            )?;
            let mut rows = stmt.query_map(duckdb::params![location_id], |row| {
                Ok(DimLocationRow {
                    location_key: row.get(0)?,
                    location_id: row.get(1)?,
                    name: row.get(2)?,
                    latitude: row.get(3)?,
                    longitude: row.get(4)?,
                    elevation: row.get(5)?,
                    region: row.get(6)?,
                    country: row.get(7)?,
                    reference_name: row.get(8)?,
                })
            })?;
            Ok(rows.next().transpose()?)
        })
        .await
    }

    /// Daily metrics for one location ordered by `(date_key, variable_name, frequency)`.
    pub async fn metrics_for(
        &self,
        location_id: &str,
    ) -> Result<Vec<DailyMetricRow>, WarehouseError> {
        let location_id = location_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT l.location_id, m.date_key, m.variable_name, m.frequency,
                        m.min_value, m.max_value, m.mean_value, m.sample_count
                 FROM metric_daily_weather m
                 JOIN dim_location l ON l.location_key = m.location_key
                 WHERE l.location_id = ?
                 ORDER BY m.date_key, m.variable_name, m.frequency",
            )?;
            let rows = stmt
                .query_map(duckdb::params![location_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .filter_map(
                    |(location_id, date_key, variable_name, frequency, min, max, mean, count)| {
                        Some(DailyMetricRow {
                            location_id,
                            date_key,
                            variable_name,
                            frequency: Frequency::from_str(&frequency).ok()?,
                            min_value: min,
                            max_value: max,
                            mean_value: mean,
                            sample_count: count,
                        })
                    },
                )
                .collect())
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<(), WarehouseError> {
        let sql = sql.to_string();
        self.run_blocking(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
    }

    #[cfg(test)]
    pub(crate) async fn recreate_schema(&self) -> Result<(), WarehouseError> {
        self.run_blocking(|conn| schema::create_schema(conn).map_err(WarehouseError::Schema))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_is_idempotent_and_creates_tables() -> Result<(), WarehouseError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weather_dwh.duckdb");
        {
            let warehouse = Warehouse::open(&path)?;
            for table in schema::TABLES {
                assert_eq!(warehouse.table_count(table).await?, 0);
            }
            warehouse.recreate_schema().await?;
        }
        let reopened = Warehouse::open(&path)?;
        assert!(reopened.loaded_batch_ids().await?.is_empty());
        assert!(reopened.facts_for("sopron").await?.is_empty());
        assert_eq!(reopened.dim_location("sopron").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_table_count_rejects_unknown_tables() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Warehouse::open(&dir.path().join("w.duckdb")).unwrap();
        assert!(matches!(
            warehouse.table_count("dim_location; DROP TABLE dim_date").await,
            Err(WarehouseError::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_connection_sees_views() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.duckdb");
        drop(Warehouse::open(&path).unwrap());

        let conn = Warehouse::open_read_only(&path).unwrap();
        let count: i64 = conn
            .prepare("SELECT COUNT(*) FROM v_forecast")
            .unwrap()
            .query_row([], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(conn.execute_batch("DELETE FROM dim_date").is_err());
    }
}
