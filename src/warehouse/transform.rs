//! Derived tables computed from committed facts.

use crate::warehouse::error::TransformError;
use crate::warehouse::loader::date_key;
use crate::warehouse::{Warehouse, SQL_TIMESTAMP_FORMAT};
use chrono::{NaiveDate, Utc};
use duckdb::{params, Connection};
use log::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult {
    pub as_of: NaiveDate,
    pub metric_rows: usize,
    pub dates_refreshed: usize,
}

pub struct TransformEngine {
    warehouse: Warehouse,
}

impl TransformEngine {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Rebuilds the derived tables for every date up to and including `as_of`.
    ///
    /// Metric rows for those dates are replaced, never appended, so running twice for the
    /// same `as_of` leaves the same rows.
    pub async fn transform(&self, as_of: NaiveDate) -> Result<TransformResult, TransformError> {
        let result = self
            .warehouse
            .run_blocking(move |conn| transform_in_transaction(conn, as_of))
            .await?;
        info!(
            "Transform as of {}: {} metric rows, {} dates refreshed",
            result.as_of, result.metric_rows, result.dates_refreshed
        );
        Ok(result)
    }
}

fn transform_in_transaction(
    conn: &mut Connection,
    as_of: NaiveDate,
) -> Result<TransformResult, TransformError> {
    let failed = |e| TransformError::Query { as_of, source: e };
    let as_of_key = date_key(as_of);
    let as_of_text = as_of.format("%Y-%m-%d").to_string();
    let now = Utc::now().format(SQL_TIMESTAMP_FORMAT).to_string();

    let tx = conn.transaction().map_err(failed)?;

    let dates_refreshed = tx
        .execute(
            "UPDATE dim_date SET is_weekend = day_of_week IN (6, 7)",
            [],
        )
        .map_err(failed)?;

    tx.execute(
        "DELETE FROM metric_daily_weather WHERE date_key <= ?",
        params![as_of_key],
    )
    .map_err(failed)?;
    let metric_rows = tx
        .execute(
            "INSERT INTO metric_daily_weather (
                location_key, date_key, variable_name, frequency, min_value, max_value,
                mean_value, sample_count, as_of, computed_at
             )
             SELECT location_key, date_key, variable_name, frequency,
                    MIN(value), MAX(value), AVG(value), COUNT(*),
                    CAST(? AS DATE), CAST(? AS TIMESTAMP)
             FROM fact_forecast
             WHERE date_key <= ?
             GROUP BY location_key, date_key, variable_name, frequency",
            params![as_of_text, now, as_of_key],
        )
        .map_err(failed)?;

    tx.execute(
        "INSERT INTO _transform_runs (as_of, metric_rows, dates_refreshed, completed_at)
         VALUES (CAST(? AS DATE), ?, ?, CAST(? AS TIMESTAMP))
         ON CONFLICT (as_of) DO UPDATE SET
            metric_rows = EXCLUDED.metric_rows,
            dates_refreshed = EXCLUDED.dates_refreshed,
            completed_at = EXCLUDED.completed_at",
        params![as_of_text, metric_rows as i64, dates_refreshed as i64, now],
    )
    .map_err(failed)?;

    tx.commit().map_err(failed)?;

    Ok(TransformResult {
        as_of,
        metric_rows,
        dates_refreshed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoReference;
    use crate::normalize::Validator;
    use crate::test_support::{
        day_start, hourly_payload, hourly_times, payload_bytes, sample_location,
    };
    use crate::types::frequency::Frequency;
    use crate::types::records::RawFetch;
    use crate::warehouse::loader::Loader;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::sync::Arc;

    async fn warehouse_with(dir: &std::path::Path, payload: &Value) -> Warehouse {
        let validator = Validator::new(&dir.join("normalized"));
        let warehouse = Warehouse::open(&dir.join("warehouse.duckdb")).unwrap();
        let loader = Loader::new(
            warehouse.clone(),
            Arc::new(GeoReference::bundled().unwrap()),
            &[sample_location()],
            50.0,
        );
        let requested_at = Utc.with_ymd_and_hms(2026, 2, 21, 0, 0, 0).unwrap();
        let fetch = RawFetch {
            fetch_id: RawFetch::fetch_id_for("sopron", requested_at),
            location_id: "sopron".to_string(),
            requested_at,
            payload: payload_bytes(payload),
            source_url: String::new(),
        };
        let batch = validator.process(&fetch).await.unwrap();
        loader.load(&batch).await.unwrap();
        warehouse
    }

    async fn loaded_warehouse(dir: &std::path::Path) -> Warehouse {
        // 2026-02-21 (Saturday) and 2026-02-22 (Sunday), 24 hours each, then Monday
        warehouse_with(dir, &hourly_payload(day_start(2026, 2, 21), 72, 0.0)).await
    }

    #[tokio::test]
    async fn test_daily_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = loaded_warehouse(dir.path()).await;
        let engine = TransformEngine::new(warehouse.clone());

        let result = engine
            .transform(NaiveDate::from_ymd_opt(2026, 2, 22).unwrap())
            .await
            .unwrap();
        // 2 variables x 2 days; Monday is after as_of
        assert_eq!(result.metric_rows, 4);
        assert_eq!(result.dates_refreshed, 3);

        let metrics = warehouse.metrics_for("sopron").await.unwrap();
        let saturday_temp = metrics
            .iter()
            .find(|m| m.date_key == 20260221 && m.variable_name == "temperature_2m")
            .unwrap();
        assert_eq!(saturday_temp.sample_count, 24);
        assert_eq!(saturday_temp.min_value, Some(0.0));
        assert!((saturday_temp.max_value.unwrap() - 2.3).abs() < 1e-9);
        assert!((saturday_temp.mean_value.unwrap() - 1.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hourly_and_daily_values_are_aggregated_apart() {
        let dir = tempfile::tempdir().unwrap();
        let payload = json!({
            "hourly": {
                "time": hourly_times(day_start(2026, 2, 21), 24),
                "weather_code": vec![1.0; 24],
            },
            "daily": {
                "time": ["2026-02-21"],
                "weather_code": [95.0],
            }
        });
        let warehouse = warehouse_with(dir.path(), &payload).await;

        let result = TransformEngine::new(warehouse.clone())
            .transform(NaiveDate::from_ymd_opt(2026, 2, 21).unwrap())
            .await
            .unwrap();
        assert_eq!(result.metric_rows, 2);

        let metrics = warehouse.metrics_for("sopron").await.unwrap();
        let summary: Vec<_> = metrics
            .iter()
            .map(|m| {
                (
                    m.variable_name.as_str(),
                    m.frequency,
                    m.sample_count,
                    m.min_value,
                    m.max_value,
                    m.mean_value,
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("weather_code", Frequency::Daily, 1, Some(95.0), Some(95.0), Some(95.0)),
                ("weather_code", Frequency::Hourly, 24, Some(1.0), Some(1.0), Some(1.0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_transform_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = loaded_warehouse(dir.path()).await;
        let engine = TransformEngine::new(warehouse.clone());
        let as_of = NaiveDate::from_ymd_opt(2026, 2, 23).unwrap();

        let first = engine.transform(as_of).await.unwrap();
        let first_metrics = warehouse.metrics_for("sopron").await.unwrap();
        let second = engine.transform(as_of).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.metric_rows, 6);
        assert_eq!(warehouse.metrics_for("sopron").await.unwrap(), first_metrics);
        assert_eq!(warehouse.table_count("metric_daily_weather").await.unwrap(), 6);
        assert_eq!(warehouse.table_count("_transform_runs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_weekend_flags_are_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = loaded_warehouse(dir.path()).await;
        TransformEngine::new(warehouse.clone())
            .transform(NaiveDate::from_ymd_opt(2026, 2, 23).unwrap())
            .await
            .unwrap();

        let flags = warehouse
            .run_blocking(|conn| {
                let mut stmt =
                    conn.prepare("SELECT date_key, is_weekend FROM v_dim_date ORDER BY date_key")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, i32>(0)?, row.get::<_, bool>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, crate::warehouse::WarehouseError>(rows)
            })
            .await
            .unwrap();
        assert_eq!(
            flags,
            vec![(20260221, true), (20260222, true), (20260223, false)]
        );
    }
}
