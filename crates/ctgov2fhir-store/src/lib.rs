// ctgov2fhir-store - Durable persistence for fetched study records
//
// A keyed bag of ClinicalTrials.gov study records with two interchangeable
// backends behind one trait:
// - SqliteStore: one table in a single database file, migration-tracked
// - FsStore: one JSON file per record under a data directory
//
// The rest of the system only sees `StudyStore`. Batched writes are atomic
// as a unit; `get` never observes a partial record.

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use ctgov2fhir_core::{ClinicalStudy, NctId};
use thiserror::Error;

mod fs;
mod sqlite;

pub use fs::FsStore;
pub use sqlite::SqliteStore;

/// Default cap on a single serialized record: 128 MiB.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 128 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database failure: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("record for {nct_id} is {size} bytes, over the {limit}-byte limit")]
    TooLarge {
        nct_id: NctId,
        size: usize,
        limit: usize,
    },

    #[error("failed to encode study record for {nct_id}: {source}")]
    Encode {
        nct_id: NctId,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode study record for {nct_id}: {source}")]
    Decode {
        nct_id: NctId,
        #[source]
        source: serde_json::Error,
    },

    #[error("store is closed")]
    Closed,
}

/// Creation and modification timestamps for a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStat {
    pub created_at: SystemTime,
    pub last_modified_at: SystemTime,
}

/// Durable, keyed storage for study records.
///
/// `get` returns `Ok(None)` for unknown keys; absence is never an error.
/// `put_batch` makes all of its records visible together or none of them.
#[async_trait]
pub trait StudyStore: Send + Sync + 'static {
    async fn put(&self, nct_id: NctId, study: &ClinicalStudy) -> Result<(), StoreError>;

    async fn put_batch(&self, records: &[(NctId, ClinicalStudy)]) -> Result<(), StoreError>;

    async fn get(&self, nct_id: NctId) -> Result<Option<ClinicalStudy>, StoreError>;

    async fn delete(&self, nct_id: NctId) -> Result<(), StoreError>;

    async fn list_keys(&self) -> Result<Vec<NctId>, StoreError>;

    async fn stat(&self, nct_id: NctId) -> Result<Option<StoreStat>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Serialize a record, enforcing the entry-size cap.
fn encode_record(
    nct_id: NctId,
    study: &ClinicalStudy,
    limit: usize,
) -> Result<String, StoreError> {
    let json = serde_json::to_string(study).map_err(|source| StoreError::Encode {
        nct_id,
        source,
    })?;
    if json.len() > limit {
        return Err(StoreError::TooLarge {
            nct_id,
            size: json.len(),
            limit,
        });
    }
    Ok(json)
}

fn decode_record(nct_id: NctId, json: &str) -> Result<ClinicalStudy, StoreError> {
    serde_json::from_str(json).map_err(|source| StoreError::Decode { nct_id, source })
}
