//! Immutable, verbatim storage of provider responses.
//!
//! # Layout
//!
//! ```text
//! {data_dir}/raw/{location_id}/{stamp}.meta.json   fetch id, requested_at, source url, size
//! {data_dir}/raw/{location_id}/{stamp}.json        the exact response bytes
//! ```
//!
//! `stamp` is `requested_at` formatted as `%Y%m%dT%H%M%S%3fZ`, so file names sort
//! chronologically. Both files are written atomically, metadata first; a fetch is visible
//! only once its payload file exists. Existing fetches are never overwritten: under
//! [`WritePolicy::Idempotent`] re-persisting identical bytes is a no-op and differing bytes
//! are rejected, under [`WritePolicy::WriteOnce`] every second write is rejected.

pub mod error;

use crate::types::records::{RawFetch, FETCH_STAMP_FORMAT};
use crate::utils::write_atomic;
use chrono::{DateTime, SubsecRound, Utc};
pub use error::RawStoreError;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const META_SUFFIX: &str = ".meta.json";
const PAYLOAD_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Identical re-writes succeed without touching the file; differing content is rejected.
    #[default]
    Idempotent,
    /// Any second write for the same `(location_id, requested_at)` is rejected.
    WriteOnce,
}

/// Lookup into the record of fetches already consumed by a successful validator run.
pub trait FetchLedger {
    fn is_processed(&self, fetch_id: &str) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFetchMeta {
    fetch_id: String,
    location_id: String,
    requested_at: DateTime<Utc>,
    source_url: String,
    byte_len: usize,
}

#[derive(Debug, Clone)]
pub struct RawStore {
    root: PathBuf,
    policy: WritePolicy,
}

impl RawStore {
    pub fn new(root: &Path, policy: WritePolicy) -> Self {
        Self {
            root: root.to_path_buf(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persists one provider response.
    ///
    /// `requested_at` is truncated to milliseconds, the precision of the key.
    pub fn persist(
        &self,
        location_id: &str,
        requested_at: DateTime<Utc>,
        payload: &[u8],
        source_url: &str,
    ) -> Result<RawFetch, RawStoreError> {
        validate_location_id(location_id)?;
        let requested_at = requested_at.trunc_subsecs(3);
        let fetch_id = RawFetch::fetch_id_for(location_id, requested_at);
        let (meta_path, payload_path) = self.paths(location_id, requested_at);

        if payload_path.exists() {
            return match self.policy {
                WritePolicy::WriteOnce => Err(RawStoreError::AlreadyExists { fetch_id }),
                WritePolicy::Idempotent => {
                    let existing = std::fs::read(&payload_path)
                        .map_err(|e| RawStoreError::Io(payload_path.clone(), e))?;
                    if existing == payload {
                        info!("Raw fetch {} already stored with identical content", fetch_id);
                        self.read_fetch(&meta_path)
                    } else {
                        Err(RawStoreError::ContentConflict { fetch_id })
                    }
                }
            };
        }

        let meta = RawFetchMeta {
            fetch_id: fetch_id.clone(),
            location_id: location_id.to_string(),
            requested_at,
            source_url: source_url.to_string(),
            byte_len: payload.len(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| RawStoreError::MetaEncode(fetch_id.clone(), e))?;
        write_atomic(&meta_path, &meta_bytes).map_err(|e| RawStoreError::Io(meta_path, e))?;
        write_atomic(&payload_path, payload)
            .map_err(|e| RawStoreError::Io(payload_path.clone(), e))?;
        info!(
            "Stored raw fetch {} ({} bytes) at {:?}",
            fetch_id,
            payload.len(),
            payload_path
        );

        Ok(RawFetch {
            fetch_id,
            location_id: location_id.to_string(),
            requested_at,
            payload: payload.to_vec(),
            source_url: source_url.to_string(),
        })
    }

    /// Reads a stored fetch by id.
    pub fn get(&self, fetch_id: &str) -> Result<RawFetch, RawStoreError> {
        let (location_id, stamp) = fetch_id
            .split_once('@')
            .ok_or_else(|| RawStoreError::MalformedFetchId(fetch_id.to_string()))?;
        validate_location_id(location_id)
            .map_err(|_| RawStoreError::MalformedFetchId(fetch_id.to_string()))?;
        let meta_path = self
            .root
            .join(location_id)
            .join(format!("{stamp}{META_SUFFIX}"));
        if !payload_path_for(&meta_path).exists() {
            return Err(RawStoreError::NotFound(fetch_id.to_string()));
        }
        self.read_fetch(&meta_path)
    }

    /// Every stored fetch, ordered by `(location_id, requested_at)`.
    pub fn list_all(&self) -> Result<RawFetchIter<'static>, RawStoreError> {
        Ok(RawFetchIter {
            store: self.clone(),
            pending: self.meta_files()?.into_iter(),
            ledger: None,
        })
    }

    /// Fetches not referenced by any successful batch in `ledger`, ordered by
    /// `(location_id, requested_at)`.
    ///
    /// Payloads are read lazily as the iterator advances. Calling this again starts over
    /// from the current ledger state.
    pub fn list_unprocessed<'a>(
        &self,
        ledger: &'a dyn FetchLedger,
    ) -> Result<RawFetchIter<'a>, RawStoreError> {
        Ok(RawFetchIter {
            store: self.clone(),
            pending: self.meta_files()?.into_iter(),
            ledger: Some(ledger),
        })
    }

    fn paths(&self, location_id: &str, requested_at: DateTime<Utc>) -> (PathBuf, PathBuf) {
        let stamp = requested_at.format(FETCH_STAMP_FORMAT).to_string();
        let dir = self.root.join(location_id);
        (
            dir.join(format!("{stamp}{META_SUFFIX}")),
            dir.join(format!("{stamp}{PAYLOAD_SUFFIX}")),
        )
    }

    /// Metadata files whose payload has been written, sorted by location then stamp.
    fn meta_files(&self) -> Result<Vec<PathBuf>, RawStoreError> {
        if !self.root.exists() {
            return Ok(vec![]);
        }
        let mut location_dirs: Vec<PathBuf> = read_dir_paths(&self.root)?
            .into_iter()
            .filter(|p| p.is_dir())
            .collect();
        location_dirs.sort();

        let mut files = Vec::new();
        for dir in location_dirs {
            let mut metas: Vec<PathBuf> = read_dir_paths(&dir)?
                .into_iter()
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(META_SUFFIX))
                })
                .filter(|p| payload_path_for(p).exists())
                .collect();
            metas.sort();
            files.extend(metas);
        }
        Ok(files)
    }

    fn read_meta(&self, meta_path: &Path) -> Result<RawFetchMeta, RawStoreError> {
        let bytes =
            std::fs::read(meta_path).map_err(|e| RawStoreError::Io(meta_path.to_path_buf(), e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RawStoreError::MetaDecode(meta_path.to_path_buf(), e))
    }

    fn read_fetch(&self, meta_path: &Path) -> Result<RawFetch, RawStoreError> {
        let meta = self.read_meta(meta_path)?;
        let payload_path = payload_path_for(meta_path);
        let payload = std::fs::read(&payload_path)
            .map_err(|e| RawStoreError::Io(payload_path.clone(), e))?;
        debug!("Read raw fetch {} from {:?}", meta.fetch_id, payload_path);
        Ok(RawFetch {
            fetch_id: meta.fetch_id,
            location_id: meta.location_id,
            requested_at: meta.requested_at,
            payload,
            source_url: meta.source_url,
        })
    }
}

/// Lazy sequence of stored fetches. See [`RawStore::list_unprocessed`].
pub struct RawFetchIter<'a> {
    store: RawStore,
    pending: std::vec::IntoIter<PathBuf>,
    ledger: Option<&'a dyn FetchLedger>,
}

impl Iterator for RawFetchIter<'_> {
    type Item = Result<RawFetch, RawStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        for meta_path in self.pending.by_ref() {
            let meta = match self.store.read_meta(&meta_path) {
                Ok(meta) => meta,
                Err(e) => return Some(Err(e)),
            };
            if self
                .ledger
                .is_some_and(|ledger| ledger.is_processed(&meta.fetch_id))
            {
                continue;
            }
            return Some(self.store.read_fetch(&meta_path));
        }
        None
    }
}

fn payload_path_for(meta_path: &Path) -> PathBuf {
    let name = meta_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name.strip_suffix(META_SUFFIX).unwrap_or(name);
    meta_path.with_file_name(format!("{stem}{PAYLOAD_SUFFIX}"))
}

fn read_dir_paths(dir: &Path) -> Result<Vec<PathBuf>, RawStoreError> {
    let entries = std::fs::read_dir(dir).map_err(|e| RawStoreError::Io(dir.to_path_buf(), e))?;
    entries
        .map(|entry| {
            entry
                .map(|e| e.path())
                .map_err(|e| RawStoreError::Io(dir.to_path_buf(), e))
        })
        .collect()
}

fn validate_location_id(location_id: &str) -> Result<(), RawStoreError> {
    let usable = !location_id.is_empty()
        && location_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if usable {
        Ok(())
    } else {
        Err(RawStoreError::InvalidLocationId(location_id.to_string()))
    }
}
