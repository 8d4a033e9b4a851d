//! The batch ledger: one JSON manifest per successful validator run under
//! `{data_dir}/normalized/batches/`.
//!
//! A manifest is written only after its snapshot file is complete, so its presence marks the
//! batch as successful and its `source_fetch_ids` as processed.

use crate::normalize::error::ValidationError;
use crate::raw_store::FetchLedger;
use crate::types::records::IngestionBatch;
use crate::utils::write_atomic;
use log::debug;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BatchLedger {
    dir: PathBuf,
}

/// Fetch ids referenced by the ledger at the time it was read.
#[derive(Debug, Default)]
pub struct ProcessedFetches(HashSet<String>);

impl FetchLedger for ProcessedFetches {
    fn is_processed(&self, fetch_id: &str) -> bool {
        self.0.contains(fetch_id)
    }
}

impl BatchLedger {
    pub fn new(normalized_dir: &Path) -> Self {
        Self {
            dir: normalized_dir.join("batches"),
        }
    }

    fn manifest_path(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{batch_id}.json"))
    }

    pub fn get(&self, batch_id: &str) -> Result<Option<IngestionBatch>, ValidationError> {
        let path = self.manifest_path(batch_id);
        if !path.exists() {
            return Ok(None);
        }
        read_manifest(&path).map(Some)
    }

    /// The successful batch whose sources include `fetch_id`, if any.
    ///
    /// Batch ids derive from the fetch id, so this reads at most one manifest. Blocking.
    pub fn find_by_fetch(&self, fetch_id: &str) -> Result<Option<IngestionBatch>, ValidationError> {
        Ok(self
            .get(&IngestionBatch::batch_id_for(fetch_id))?
            .filter(|batch| batch.references(fetch_id)))
    }

    /// Every recorded batch, ordered by `(location_id, requested_at, batch_id)`.
    pub fn batches(&self) -> Result<Vec<IngestionBatch>, ValidationError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| ValidationError::Io(self.dir.clone(), e))?;
        let mut batches = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| ValidationError::Io(self.dir.clone(), e))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                batches.push(read_manifest(&path)?);
            }
        }
        batches.sort_by(|a, b| {
            (&a.location_id, a.requested_at, &a.batch_id).cmp(&(
                &b.location_id,
                b.requested_at,
                &b.batch_id,
            ))
        });
        Ok(batches)
    }

    pub fn processed_fetches(&self) -> Result<ProcessedFetches, ValidationError> {
        Ok(ProcessedFetches(
            self.batches()?
                .into_iter()
                .flat_map(|b| b.source_fetch_ids)
                .collect(),
        ))
    }

    pub(crate) fn record(&self, batch: &IngestionBatch) -> Result<(), ValidationError> {
        let bytes = serde_json::to_vec_pretty(batch)
            .map_err(|e| ValidationError::ManifestEncode(batch.batch_id.clone(), e))?;
        let path = self.manifest_path(&batch.batch_id);
        write_atomic(&path, &bytes).map_err(|e| ValidationError::Io(path.clone(), e))?;
        debug!("Recorded batch {} at {:?}", batch.batch_id, path);
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Result<IngestionBatch, ValidationError> {
    let bytes = std::fs::read(path).map_err(|e| ValidationError::Io(path.to_path_buf(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| ValidationError::ManifestDecode(path.to_path_buf(), e))
}
