use crate::normalize::checks::{is_time_valued, range_violation};
use crate::normalize::error::ValidationError;
use crate::normalize::ledger::BatchLedger;
use crate::normalize::payload::{parse_instant, parse_sections};
use crate::normalize::snapshot::{from_dataframe, scan_valid, write_snapshot};
use crate::types::frequency::Frequency;
use crate::types::records::{ForecastRecord, IngestionBatch, RawFetch};
use crate::utils::ensure_dir_exists;
use chrono::{NaiveDateTime, Utc};
use log::{debug, info, warn};
use polars::prelude::{col, lit};
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::task;

const NOTE_MISSING_TIME: &str = "missing or unparseable forecast_time";
const NOTE_NO_TIME_SLOT: &str = "value has no matching timestamp";
const NOTE_NOT_INCREASING: &str = "timestamp not strictly increasing";
const NOTE_MISSING_VALUE: &str = "missing value";
const NOTE_NOT_NUMERIC: &str = "non-numeric value";
const NOTE_BAD_INSTANT: &str = "unparseable timestamp value";
const NOTE_DUPLICATE: &str = "duplicate (forecast_time, variable_name) in fetch";

/// Turns raw fetches into typed, checked snapshots and records them in the batch ledger.
#[derive(Debug, Clone)]
pub struct Validator {
    normalized_dir: PathBuf,
    ledger: BatchLedger,
}

impl Validator {
    pub fn new(normalized_dir: &Path) -> Self {
        Self {
            normalized_dir: normalized_dir.to_path_buf(),
            ledger: BatchLedger::new(normalized_dir),
        }
    }

    pub fn ledger(&self) -> &BatchLedger {
        &self.ledger
    }

    /// Validates one raw fetch and writes its snapshot and ledger entry.
    ///
    /// Idempotent: a fetch already referenced by the ledger returns the recorded batch
    /// without writing anything. Only a structurally malformed payload fails the batch;
    /// row-level problems are stored inline with `is_valid = false`.
    pub async fn process(&self, fetch: &RawFetch) -> Result<IngestionBatch, ValidationError> {
        let validator = self.clone();
        let fetch = fetch.clone();
        task::spawn_blocking(move || validator.process_blocking(&fetch)).await?
    }

    fn process_blocking(&self, fetch: &RawFetch) -> Result<IngestionBatch, ValidationError> {
        if let Some(existing) = self.ledger.find_by_fetch(&fetch.fetch_id)? {
            info!(
                "Fetch {} already processed in batch {}",
                fetch.fetch_id, existing.batch_id
            );
            return Ok(existing);
        }

        let batch_id = IngestionBatch::batch_id_for(&fetch.fetch_id);
        let records = normalize_records(fetch, &batch_id)?;
        let row_count = records.len();
        let rejected_count = records.iter().filter(|r| !r.is_valid).count();

        ensure_dir_exists(&self.normalized_dir)
            .map_err(|e| ValidationError::Io(self.normalized_dir.clone(), e))?;
        let snapshot_file = self.normalized_dir.join(format!("{batch_id}.parquet"));
        write_snapshot(&records, &snapshot_file)?;

        let batch = IngestionBatch {
            batch_id,
            source_fetch_ids: BTreeSet::from([fetch.fetch_id.clone()]),
            location_id: fetch.location_id.clone(),
            requested_at: fetch.requested_at,
            created_at: Utc::now(),
            row_count,
            rejected_count,
            snapshot_file,
        };
        self.ledger.record(&batch)?;

        if rejected_count > 0 {
            warn!(
                "Batch {}: {} of {} rows rejected",
                batch.batch_id, rejected_count, row_count
            );
        }
        info!(
            "Validated fetch {} into batch {} ({} rows)",
            fetch.fetch_id, batch.batch_id, row_count
        );
        Ok(batch)
    }

    /// Valid records for `location_id` across all snapshots, where each
    /// `(frequency, forecast_time, variable_name)` keeps the value from the fetch with the
    /// latest `requested_at`. Ordered by that key.
    pub async fn resolve_latest(
        &self,
        location_id: &str,
    ) -> Result<Vec<ForecastRecord>, ValidationError> {
        let ledger = self.ledger.clone();
        let origin = self.normalized_dir.clone();
        let location = location_id.to_string();
        let records = task::spawn_blocking(move || {
            let paths: Vec<PathBuf> = ledger
                .batches()?
                .into_iter()
                .filter(|b| b.location_id == location)
                .map(|b| b.snapshot_file)
                .collect();
            if paths.is_empty() {
                return Ok(vec![]);
            }
            let df = scan_valid(&paths)?
                .filter(col("location_id").eq(lit(location)))
                .collect()
                .map_err(|e| ValidationError::SnapshotRead(origin.clone(), e))?;
            from_dataframe(&df, &origin)
        })
        .await??;

        let mut latest: BTreeMap<(Frequency, NaiveDateTime, String), ForecastRecord> =
            BTreeMap::new();
        for record in records {
            let Some(time) = record.forecast_time else {
                continue;
            };
            match latest.entry((record.frequency, time, record.variable_name.clone())) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    if record.requested_at >= slot.get().requested_at {
                        slot.insert(record);
                    }
                }
            }
        }
        Ok(latest.into_values().collect())
    }
}

/// Parses and checks one fetch. Emits one record per `(forecast_time, variable_name)` pair in
/// the payload, rejected rows included.
pub fn normalize_records(
    fetch: &RawFetch,
    batch_id: &str,
) -> Result<Vec<ForecastRecord>, ValidationError> {
    let sections = parse_sections(&fetch.fetch_id, &fetch.payload)?;
    let mut records = Vec::new();
    let mut seen: HashSet<(Frequency, NaiveDateTime, &str)> = HashSet::new();

    for section in &sections {
        let order_notes = ordering_violations(&section.times);

        for column in &section.columns {
            for i in 0..section.row_span(column) {
                let mut notes: Vec<String> = Vec::new();

                let time = section.times.get(i).copied().flatten();
                if time.is_none() {
                    let note = if i < section.times.len() {
                        NOTE_MISSING_TIME
                    } else {
                        NOTE_NO_TIME_SLOT
                    };
                    notes.push(note.to_string());
                }
                if order_notes.get(i).copied().unwrap_or(false) {
                    notes.push(NOTE_NOT_INCREASING.to_string());
                }

                let value = match column.values.get(i) {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::Null) | None => {
                        notes.push(NOTE_MISSING_VALUE.to_string());
                        None
                    }
                    Some(Value::String(s)) if is_time_valued(&column.name) => {
                        match parse_instant(s) {
                            Some(t) => Some(t.and_utc().timestamp() as f64),
                            None => {
                                notes.push(NOTE_BAD_INSTANT.to_string());
                                None
                            }
                        }
                    }
                    Some(_) => {
                        notes.push(NOTE_NOT_NUMERIC.to_string());
                        None
                    }
                };
                if let Some(note) = value.and_then(|v| range_violation(&column.name, v)) {
                    notes.push(note);
                }
                if let Some(t) = time {
                    if !seen.insert((section.frequency, t, column.name.as_str())) {
                        notes.push(NOTE_DUPLICATE.to_string());
                    }
                }

                let is_valid = notes.is_empty();
                if !is_valid {
                    debug!(
                        "{} {}[{}] rejected: {}",
                        fetch.fetch_id,
                        column.name,
                        i,
                        notes.join("; ")
                    );
                }
                records.push(ForecastRecord {
                    location_id: fetch.location_id.clone(),
                    forecast_time: time,
                    frequency: section.frequency,
                    variable_name: column.name.clone(),
                    value,
                    ingestion_batch_id: batch_id.to_string(),
                    fetch_id: fetch.fetch_id.clone(),
                    requested_at: fetch.requested_at,
                    is_valid,
                    validation_notes: (!is_valid).then(|| notes.join("; ")),
                });
            }
        }
    }
    Ok(records)
}

/// Flags every parsed timestamp that is not later than the greatest one before it.
fn ordering_violations(times: &[Option<NaiveDateTime>]) -> Vec<bool> {
    let mut latest: Option<NaiveDateTime> = None;
    times
        .iter()
        .map(|time| match (*time, latest) {
            (Some(t), Some(prev)) if t <= prev => true,
            (Some(t), _) => {
                latest = Some(t);
                false
            }
            (None, _) => false,
        })
        .collect()
}
