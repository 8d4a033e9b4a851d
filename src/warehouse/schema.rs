//! Warehouse DDL. Every statement is idempotent.
//!
//! Tables:
//!
//! * `dim_location`: one row per configured location, keyed by the natural `location_id`
//!   and carrying a sequence-assigned surrogate `location_key` plus geo enrichment.
//! * `dim_date`: one row per calendar date, `date_key` is `YYYYMMDD`.
//! * `fact_forecast`: valid forecast values keyed by
//!   `(location_key, date_key, forecast_time, frequency, variable_name)`.
//! * `metric_daily_weather`: min/max/mean per location, date, variable and frequency.
//! * `_loaded_batches`, `_transform_runs`: load and transform bookkeeping.
//!
//! The `v_*` views are the stable read interface for dashboards.

use duckdb::Connection;

pub const TABLES: &[&str] = &[
    "dim_location",
    "dim_date",
    "fact_forecast",
    "metric_daily_weather",
    "_loaded_batches",
    "_transform_runs",
];

const TABLE_DDL: &str = "
CREATE SEQUENCE IF NOT EXISTS dim_location_key_seq START 1;

CREATE TABLE IF NOT EXISTS dim_location (
    location_id VARCHAR PRIMARY KEY,
    location_key BIGINT NOT NULL DEFAULT nextval('dim_location_key_seq'),
    name VARCHAR NOT NULL,
    latitude DOUBLE NOT NULL,
    longitude DOUBLE NOT NULL,
    timezone VARCHAR NOT NULL,
    elevation DOUBLE,
    region VARCHAR,
    country VARCHAR,
    reference_name VARCHAR,
    reference_distance_km DOUBLE,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS dim_date (
    date_key INTEGER PRIMARY KEY,
    full_date DATE NOT NULL,
    year INTEGER NOT NULL,
    quarter INTEGER NOT NULL,
    month INTEGER NOT NULL,
    day INTEGER NOT NULL,
    day_of_week INTEGER NOT NULL,
    day_name VARCHAR NOT NULL,
    is_weekend BOOLEAN
);

CREATE TABLE IF NOT EXISTS fact_forecast (
    location_key BIGINT NOT NULL,
    date_key INTEGER NOT NULL,
    forecast_time TIMESTAMP NOT NULL,
    frequency VARCHAR NOT NULL,
    variable_name VARCHAR NOT NULL,
    value DOUBLE NOT NULL,
    ingestion_batch_id VARCHAR NOT NULL,
    fetch_id VARCHAR NOT NULL,
    requested_at TIMESTAMP NOT NULL,
    loaded_at TIMESTAMP NOT NULL,
    PRIMARY KEY (location_key, date_key, forecast_time, frequency, variable_name)
);

CREATE TABLE IF NOT EXISTS metric_daily_weather (
    location_key BIGINT NOT NULL,
    date_key INTEGER NOT NULL,
    variable_name VARCHAR NOT NULL,
    frequency VARCHAR NOT NULL,
    min_value DOUBLE,
    max_value DOUBLE,
    mean_value DOUBLE,
    sample_count BIGINT NOT NULL,
    as_of DATE NOT NULL,
    computed_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS _loaded_batches (
    batch_id VARCHAR PRIMARY KEY,
    location_id VARCHAR NOT NULL,
    requested_at TIMESTAMP NOT NULL,
    fact_rows BIGINT NOT NULL,
    loaded_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS _transform_runs (
    as_of DATE PRIMARY KEY,
    metric_rows BIGINT NOT NULL,
    dates_refreshed BIGINT NOT NULL,
    completed_at TIMESTAMP NOT NULL
);
";

const VIEW_DDL: &str = "
CREATE OR REPLACE VIEW v_dim_location AS
SELECT location_key, location_id, name, latitude, longitude, timezone,
       elevation, region, country, reference_name, reference_distance_km
FROM dim_location;

CREATE OR REPLACE VIEW v_dim_date AS
SELECT date_key, full_date, year, quarter, month, day, day_of_week, day_name, is_weekend
FROM dim_date;

CREATE OR REPLACE VIEW v_forecast AS
SELECT l.location_id, l.name AS location_name, l.country, l.region, l.elevation,
       d.full_date, d.day_name, d.is_weekend,
       f.forecast_time, f.frequency, f.variable_name, f.value,
       f.fetch_id, f.requested_at
FROM fact_forecast f
JOIN dim_location l ON l.location_key = f.location_key
JOIN dim_date d ON d.date_key = f.date_key;

CREATE OR REPLACE VIEW v_daily_metrics AS
SELECT l.location_id, l.name AS location_name, l.country, l.region,
       d.full_date, d.day_name, d.is_weekend,
       m.variable_name, m.frequency, m.min_value, m.max_value, m.mean_value, m.sample_count, m.as_of
FROM metric_daily_weather m
JOIN dim_location l ON l.location_key = m.location_key
JOIN dim_date d ON d.date_key = m.date_key;
";

pub(crate) fn create_schema(conn: &Connection) -> duckdb::Result<()> {
    conn.execute_batch(TABLE_DDL)?;
    conn.execute_batch(VIEW_DDL)?;
    Ok(())
}
