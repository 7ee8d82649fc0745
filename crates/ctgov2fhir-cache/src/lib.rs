// ctgov2fhir-cache - Concurrent trial cache
//
// Coordinates concurrent enrichment requests over the durable store:
// - CacheEntry: per-NCT pending/ready/failed state machine with shared waits
// - TrialCache: single-flight fetch coordination and the in-memory index
// - Sweeper: periodic expiry of idle entries
//
// One writer mutex serializes store write transactions and every index
// mutation that adds or removes entries; index reads and ready-entry loads
// never block on it.

use std::sync::Arc;

use ctgov2fhir_client::FetchError;
use ctgov2fhir_core::NctId;
use ctgov2fhir_store::StoreError;
use thiserror::Error;

mod cache;
mod entry;
mod sweeper;

pub use cache::TrialCache;
pub use entry::CacheEntry;
pub use sweeper::Sweeper;

/// Errors surfaced by cache coordination.
///
/// Causes are reference-counted so one failed batch can be reported to every
/// waiter as well as to the caller that owned the batch.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("trial fetch failed: {0}")]
    Fetch(Arc<FetchError>),

    #[error("trial store failed: {0}")]
    Store(Arc<StoreError>),

    /// Propagated to awaiters of a pending entry whose batch failed.
    #[error("cached entry for {nct_id} failed: {cause}")]
    EntryFailed { nct_id: NctId, cause: Arc<CacheError> },

    /// The upstream response did not include the requested id.
    #[error("{nct_id} not in bundle")]
    NotInBundle { nct_id: NctId },

    /// The entry disappeared without resolving, e.g. the cache was dropped
    /// mid-flight.
    #[error("cache entry for {nct_id} was invalidated")]
    Invalidated { nct_id: NctId },
}

impl From<FetchError> for CacheError {
    fn from(error: FetchError) -> Self {
        Self::Fetch(Arc::new(error))
    }
}

impl From<StoreError> for CacheError {
    fn from(error: StoreError) -> Self {
        Self::Store(Arc::new(error))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use ctgov2fhir_client::{FetchError, StudyFetcher};
    use ctgov2fhir_core::{ClinicalStudy, NctId};
    use ctgov2fhir_store::{StoreError, StoreStat, StudyStore};
    use parking_lot::Mutex;

    pub(crate) fn nct(raw: &str) -> NctId {
        raw.parse().unwrap()
    }

    pub(crate) fn record(nct_id: NctId) -> ClinicalStudy {
        serde_json::from_value(serde_json::json!({
            "protocolSection": {
                "identificationModule": {"nctId": nct_id.to_string()},
                "descriptionModule": {"briefSummary": format!("summary for {nct_id}")}
            }
        }))
        .unwrap()
    }

    /// In-memory store with injectable write failures.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) records: Mutex<HashMap<NctId, ClinicalStudy>>,
        pub(crate) fail_puts: AtomicBool,
        pub(crate) fail_deletes: AtomicBool,
    }

    impl MemoryStore {
        fn injected_failure(&self, flag: &AtomicBool) -> Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                Err(StoreError::Io {
                    path: "memory".into(),
                    source: std::io::Error::other("injected failure"),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StudyStore for MemoryStore {
        async fn put(&self, nct_id: NctId, study: &ClinicalStudy) -> Result<(), StoreError> {
            self.injected_failure(&self.fail_puts)?;
            self.records.lock().insert(nct_id, study.clone());
            Ok(())
        }

        async fn put_batch(&self, records: &[(NctId, ClinicalStudy)]) -> Result<(), StoreError> {
            self.injected_failure(&self.fail_puts)?;
            let mut guard = self.records.lock();
            for (nct_id, study) in records {
                guard.insert(*nct_id, study.clone());
            }
            Ok(())
        }

        async fn get(&self, nct_id: NctId) -> Result<Option<ClinicalStudy>, StoreError> {
            Ok(self.records.lock().get(&nct_id).cloned())
        }

        async fn delete(&self, nct_id: NctId) -> Result<(), StoreError> {
            self.injected_failure(&self.fail_deletes)?;
            self.records.lock().remove(&nct_id);
            Ok(())
        }

        async fn list_keys(&self) -> Result<Vec<NctId>, StoreError> {
            let mut keys: Vec<NctId> = self.records.lock().keys().copied().collect();
            keys.sort();
            Ok(keys)
        }

        async fn stat(&self, _nct_id: NctId) -> Result<Option<StoreStat>, StoreError> {
            Ok(None)
        }

        async fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Scripted fetcher that records every batch it is asked for.
    pub(crate) struct ScriptedFetcher {
        pub(crate) records: Mutex<HashMap<NctId, ClinicalStudy>>,
        pub(crate) requests: Mutex<Vec<Vec<NctId>>>,
        pub(crate) fail: AtomicBool,
        pub(crate) delay: Mutex<Option<Duration>>,
    }

    impl ScriptedFetcher {
        pub(crate) fn with_records(ids: &[NctId]) -> Arc<Self> {
            let records = ids.iter().map(|id| (*id, record(*id))).collect();
            Arc::new(Self {
                records: Mutex::new(records),
                requests: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                delay: Mutex::new(None),
            })
        }

        pub(crate) fn request_log(&self) -> Vec<Vec<NctId>> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl StudyFetcher for ScriptedFetcher {
        async fn fetch_studies(&self, ids: &[NctId]) -> Result<Vec<ClinicalStudy>, FetchError> {
            self.requests.lock().push(ids.to_vec());
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Status {
                    url: "scripted".into(),
                    status: 500,
                });
            }
            let records = self.records.lock();
            Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
        }
    }
}
