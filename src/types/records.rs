//! Records flowing between the layers: raw fetches, normalized forecast rows and the
//! ingestion batches that link the two.

use crate::types::frequency::Frequency;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Timestamp layout used in fetch ids and raw store file names.
pub(crate) const FETCH_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// One provider response, captured verbatim.
///
/// Identified by `(location_id, requested_at)`. Never edited or deleted once written.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFetch {
    pub fetch_id: String,
    pub location_id: String,
    pub requested_at: DateTime<Utc>,
    /// The exact bytes received from the provider.
    pub payload: Vec<u8>,
    pub source_url: String,
}

impl RawFetch {
    pub fn fetch_id_for(location_id: &str, requested_at: DateTime<Utc>) -> String {
        format!(
            "{}@{}",
            location_id,
            requested_at.format(FETCH_STAMP_FORMAT)
        )
    }
}

/// One `(location, forecast_time, variable)` observation parsed from a [`RawFetch`].
///
/// Rows failing a check are kept with `is_valid = false` and the reasons in
/// `validation_notes`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRecord {
    pub location_id: String,
    /// `None` when the payload timestamp was missing or unparseable.
    pub forecast_time: Option<NaiveDateTime>,
    pub frequency: Frequency,
    pub variable_name: String,
    pub value: Option<f64>,
    pub ingestion_batch_id: String,
    pub fetch_id: String,
    pub requested_at: DateTime<Utc>,
    pub is_valid: bool,
    pub validation_notes: Option<String>,
}

/// The ledger entry written by one successful validator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub batch_id: String,
    pub source_fetch_ids: BTreeSet<String>,
    pub location_id: String,
    /// `requested_at` of the newest source fetch; orders loads within a location.
    pub requested_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Total rows in the snapshot, rejected ones included.
    pub row_count: usize,
    pub rejected_count: usize,
    pub snapshot_file: PathBuf,
}

impl IngestionBatch {
    pub fn batch_id_for(fetch_id: &str) -> String {
        format!("batch-{}", fetch_id.replace('@', "-"))
    }

    pub fn valid_count(&self) -> usize {
        self.row_count - self.rejected_count
    }

    pub fn references(&self, fetch_id: &str) -> bool {
        self.source_fetch_ids.contains(fetch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ids_are_deterministic() {
        let requested_at = Utc.with_ymd_and_hms(2026, 2, 21, 6, 30, 0).unwrap();
        let fetch_id = RawFetch::fetch_id_for("sopron", requested_at);
        assert_eq!(fetch_id, "sopron@20260221T063000000Z");
        assert_eq!(
            IngestionBatch::batch_id_for(&fetch_id),
            "batch-sopron-20260221T063000000Z"
        );
    }
}
