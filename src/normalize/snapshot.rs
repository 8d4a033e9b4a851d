//! Columnar (Parquet) snapshots of normalized forecast records.
//!
//! One file per ingestion batch with the columns
//! `location_id, forecast_time, frequency, variable_name, value, is_valid, validation_notes,
//! ingestion_batch_id, fetch_id, requested_at`. Both timestamps are millisecond datetimes,
//! `requested_at` in UTC.

use crate::normalize::error::ValidationError;
use crate::types::frequency::Frequency;
use crate::types::records::ForecastRecord;
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

/// Writes `records` to `path` atomically. Blocking.
pub(crate) fn write_snapshot(records: &[ForecastRecord], path: &Path) -> Result<(), ValidationError> {
    let mut df =
        to_dataframe(records).map_err(|e| ValidationError::SnapshotWrite(path.to_path_buf(), e))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        NamedTempFile::new_in(dir).map_err(|e| ValidationError::Io(path.to_path_buf(), e))?;
    ParquetWriter::new(tmp.as_file_mut())
        .with_compression(ParquetCompression::Snappy)
        .finish(&mut df)
        .map_err(|e| ValidationError::SnapshotWrite(path.to_path_buf(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| ValidationError::Io(path.to_path_buf(), e))?;
    tmp.persist(path)
        .map_err(|e| ValidationError::Io(path.to_path_buf(), e.error))?;
    Ok(())
}

/// Reads every record of one snapshot. Blocking.
pub fn read_snapshot(path: &Path) -> Result<Vec<ForecastRecord>, ValidationError> {
    let file = std::fs::File::open(path).map_err(|e| ValidationError::Io(path.to_path_buf(), e))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| ValidationError::SnapshotRead(path.to_path_buf(), e))?;
    from_dataframe(&df, path)
}

/// Reads only the valid records of the given snapshots as one frame.
pub fn scan_valid(paths: &[PathBuf]) -> Result<LazyFrame, ValidationError> {
    let frames = paths
        .iter()
        .map(|p| {
            LazyFrame::scan_parquet(p, Default::default())
                .map_err(|e| ValidationError::SnapshotRead(p.clone(), e))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if frames.is_empty() {
        return Ok(DataFrame::empty().lazy());
    }
    let joined = concat(frames, UnionArgs::default()).map_err(|e| {
        ValidationError::SnapshotRead(paths.first().cloned().unwrap_or_default(), e)
    })?;
    Ok(joined.filter(col("is_valid")))
}

fn datetime_ms() -> DataType {
    DataType::Datetime(TimeUnit::Milliseconds, None)
}

fn to_dataframe(records: &[ForecastRecord]) -> PolarsResult<DataFrame> {
    let location_id: Vec<&str> = records.iter().map(|r| r.location_id.as_str()).collect();
    let forecast_time: Vec<Option<i64>> = records
        .iter()
        .map(|r| r.forecast_time.map(|t| t.and_utc().timestamp_millis()))
        .collect();
    let frequency: Vec<&str> = records.iter().map(|r| r.frequency.section_key()).collect();
    let variable_name: Vec<&str> = records.iter().map(|r| r.variable_name.as_str()).collect();
    let value: Vec<Option<f64>> = records.iter().map(|r| r.value).collect();
    let is_valid: Vec<bool> = records.iter().map(|r| r.is_valid).collect();
    let notes: Vec<Option<&str>> = records
        .iter()
        .map(|r| r.validation_notes.as_deref())
        .collect();
    let batch_id: Vec<&str> = records
        .iter()
        .map(|r| r.ingestion_batch_id.as_str())
        .collect();
    let fetch_id: Vec<&str> = records.iter().map(|r| r.fetch_id.as_str()).collect();
    let requested_at: Vec<i64> = records
        .iter()
        .map(|r| r.requested_at.timestamp_millis())
        .collect();

    let columns: Vec<Column> = vec![
        Series::new("location_id".into(), location_id).into(),
        Series::new("forecast_time".into(), forecast_time)
            .cast(&datetime_ms())?
            .into(),
        Series::new("frequency".into(), frequency).into(),
        Series::new("variable_name".into(), variable_name).into(),
        Series::new("value".into(), value).into(),
        Series::new("is_valid".into(), is_valid).into(),
        Series::new("validation_notes".into(), notes).into(),
        Series::new("ingestion_batch_id".into(), batch_id).into(),
        Series::new("fetch_id".into(), fetch_id).into(),
        Series::new("requested_at".into(), requested_at)
            .cast(&datetime_ms())?
            .into(),
    ];
    DataFrame::new(columns)
}

pub(crate) fn from_dataframe(
    df: &DataFrame,
    path: &Path,
) -> Result<Vec<ForecastRecord>, ValidationError> {
    let read = |e: PolarsError| ValidationError::SnapshotRead(path.to_path_buf(), e);
    let schema = |message: String| ValidationError::SnapshotSchema {
        path: path.to_path_buf(),
        message,
    };

    let location_id = df.column("location_id").map_err(read)?.str().map_err(read)?;
    let forecast_time = df
        .column("forecast_time")
        .map_err(read)?
        .cast(&DataType::Int64)
        .map_err(read)?;
    let forecast_time = forecast_time.i64().map_err(read)?;
    let frequency = df.column("frequency").map_err(read)?.str().map_err(read)?;
    let variable_name = df.column("variable_name").map_err(read)?.str().map_err(read)?;
    let value = df.column("value").map_err(read)?.f64().map_err(read)?;
    let is_valid = df.column("is_valid").map_err(read)?.bool().map_err(read)?;
    let notes = df.column("validation_notes").map_err(read)?.str().map_err(read)?;
    let batch_id = df
        .column("ingestion_batch_id")
        .map_err(read)?
        .str()
        .map_err(read)?;
    let fetch_id = df.column("fetch_id").map_err(read)?.str().map_err(read)?;
    let requested_at = df
        .column("requested_at")
        .map_err(read)?
        .cast(&DataType::Int64)
        .map_err(read)?;
    let requested_at = requested_at.i64().map_err(read)?;

    let mut records = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let required = |name: &str, v: Option<&str>| {
            v.map(str::to_string)
                .ok_or_else(|| schema(format!("null {name} at row {i}")))
        };
        let frequency_str = required("frequency", frequency.get(i))?;
        let row_frequency = Frequency::from_str(&frequency_str).map_err(schema)?;
        let requested_ms = requested_at
            .get(i)
            .ok_or_else(|| schema(format!("null requested_at at row {i}")))?;
        let row_requested_at = DateTime::<Utc>::from_timestamp_millis(requested_ms)
            .ok_or_else(|| schema(format!("requested_at out of range at row {i}")))?;

        records.push(ForecastRecord {
            location_id: required("location_id", location_id.get(i))?,
            forecast_time: forecast_time
                .get(i)
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(|t| t.naive_utc()),
            frequency: row_frequency,
            variable_name: required("variable_name", variable_name.get(i))?,
            value: value.get(i),
            ingestion_batch_id: required("ingestion_batch_id", batch_id.get(i))?,
            fetch_id: required("fetch_id", fetch_id.get(i))?,
            requested_at: row_requested_at,
            is_valid: is_valid.get(i).unwrap_or(false),
            validation_notes: notes.get(i).map(str::to_string),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::day_start;
    use chrono::TimeZone;

    fn record(hour: i64, valid: bool) -> ForecastRecord {
        ForecastRecord {
            location_id: "sopron".to_string(),
            forecast_time: Some(day_start(2026, 2, 21) + chrono::Duration::hours(hour)),
            frequency: Frequency::Hourly,
            variable_name: "temperature_2m".to_string(),
            value: if valid { Some(1.5) } else { None },
            ingestion_batch_id: "batch-sopron-20260221T060000000Z".to_string(),
            fetch_id: "sopron@20260221T060000000Z".to_string(),
            requested_at: Utc.with_ymd_and_hms(2026, 2, 21, 6, 0, 0).unwrap(),
            is_valid: valid,
            validation_notes: (!valid).then(|| "missing value".to_string()),
        }
    }

    #[test]
    fn test_snapshot_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.parquet");
        let mut untimed = record(0, false);
        untimed.forecast_time = None;
        let records = vec![record(0, true), record(1, false), untimed];

        write_snapshot(&records, &path).unwrap();
        assert_eq!(read_snapshot(&path).unwrap(), records);
    }

    #[test]
    fn test_scan_valid_filters_rejected_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.parquet");
        write_snapshot(&[record(0, true), record(1, false)], &path).unwrap();

        let df = scan_valid(&[path]).unwrap().collect().unwrap();
        assert_eq!(df.height(), 1);
        assert!(scan_valid(&[]).unwrap().collect().unwrap().is_empty());
    }
}
