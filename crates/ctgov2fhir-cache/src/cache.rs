//! Single-flight fetch coordination over the durable store.
//!
//! `TrialCache` owns the in-memory index of cache entries and the writer
//! mutex. Pending entries are inserted before any network call goes out, so
//! a concurrent request for the same id finds the entry and awaits it
//! instead of fetching again. Batches are requested serially; each batch's
//! records are persisted in one store transaction before its entries signal
//! ready.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use ctgov2fhir_client::StudyFetcher;
use ctgov2fhir_core::{ClinicalStudy, NctId};
use ctgov2fhir_store::StudyStore;

use crate::entry::CacheEntry;
use crate::CacheError;

pub struct TrialCache {
    store: Arc<dyn StudyStore>,
    fetcher: Arc<dyn StudyFetcher>,
    index: RwLock<HashMap<NctId, Arc<CacheEntry>>>,
    /// Serializes store write transactions and index insertions/removals.
    write_lock: tokio::sync::Mutex<()>,
    max_per_request: usize,
}

impl TrialCache {
    pub fn new(
        store: Arc<dyn StudyStore>,
        fetcher: Arc<dyn StudyFetcher>,
        max_per_request: usize,
    ) -> Self {
        Self {
            store,
            fetcher,
            index: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            max_per_request: max_per_request.max(1),
        }
    }

    /// Rebuild the index from the store's keys. Every persisted key gets a
    /// ready entry; entries already in the index are kept.
    pub async fn restore(&self) -> Result<usize, CacheError> {
        let keys = self.store.list_keys().await.map_err(CacheError::from)?;
        let _writer = self.write_lock.lock().await;
        let mut index = self.index.write();
        let mut restored = 0;
        for nct_id in keys {
            index.entry(nct_id).or_insert_with(|| {
                restored += 1;
                Arc::new(CacheEntry::restored(nct_id, Arc::clone(&self.store)))
            });
        }
        Ok(restored)
    }

    /// The live entry for `nct_id`, if any.
    pub fn entry(&self, nct_id: NctId) -> Option<Arc<CacheEntry>> {
        self.index.read().get(&nct_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Load the record for `nct_id` through its entry, or `None` when the
    /// id has no entry.
    pub async fn get_study(&self, nct_id: NctId) -> Result<Option<ClinicalStudy>, CacheError> {
        match self.entry(nct_id) {
            Some(entry) => entry.load().await,
            None => Ok(None),
        }
    }

    /// Make every upstream-known id in `ids` ready in the cache.
    ///
    /// Ids the upstream does not know about end up with no entry. Duplicate
    /// ids collapse to one fetch; ids that already have an entry are left to
    /// whoever created them.
    pub async fn ensure_trials_available(&self, ids: &[NctId]) -> Result<(), CacheError> {
        let mut seen = HashSet::new();
        let ids: Vec<NctId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Ok(());
        }

        // Probe and insert pending entries atomically so concurrent callers
        // either own an id's fetch or share the existing entry.
        let misses: Vec<NctId> = {
            let _writer = self.write_lock.lock().await;
            let mut index = self.index.write();
            let mut misses = Vec::new();
            for id in ids.iter().copied() {
                if !index.contains_key(&id) {
                    index.insert(
                        id,
                        Arc::new(CacheEntry::pending(id, Arc::clone(&self.store))),
                    );
                    misses.push(id);
                }
            }
            misses
        };
        if misses.is_empty() {
            return Ok(());
        }
        debug!(
            target: "ctgovservice",
            requested = ids.len(),
            misses = misses.len(),
            "fetching uncached trials"
        );

        for batch in misses.chunks(self.max_per_request) {
            match self.fetcher.fetch_studies(batch).await {
                Ok(studies) => self.reconcile_batch(batch, studies).await?,
                Err(error) => {
                    let cause = CacheError::from(error);
                    let _writer = self.write_lock.lock().await;
                    self.fail_and_detach(batch, &cause);
                    return Err(cause);
                }
            }
        }

        // Whatever is still unconfirmed was absent from every response.
        let _writer = self.write_lock.lock().await;
        let mut index = self.index.write();
        for nct_id in &misses {
            let unconfirmed = index.get(nct_id).is_some_and(|e| e.is_unconfirmed());
            if unconfirmed {
                if let Some(entry) = index.remove(nct_id) {
                    debug!(target: "ctgovservice", nct_id = %nct_id, "trial not in bundle");
                    entry.fail(CacheError::NotInBundle { nct_id: *nct_id });
                }
            }
        }
        Ok(())
    }

    /// Persist one batch's records and resolve their entries.
    async fn reconcile_batch(
        &self,
        batch: &[NctId],
        studies: Vec<ClinicalStudy>,
    ) -> Result<(), CacheError> {
        let mut records = Vec::with_capacity(studies.len());
        for study in studies {
            match study.nct_id() {
                Some(nct_id) => records.push((nct_id, study)),
                None => warn!(
                    target: "ctgovservice",
                    "upstream study carries no usable NCT id, skipping"
                ),
            }
        }

        let _writer = self.write_lock.lock().await;
        {
            let index = self.index.read();
            for (nct_id, _) in &records {
                if let Some(entry) = index.get(nct_id) {
                    entry.found();
                }
            }
        }
        if let Err(error) = self.store.put_batch(&records).await {
            let cause = CacheError::from(error);
            self.fail_and_detach(batch, &cause);
            return Err(cause);
        }
        let index = self.index.read();
        for (nct_id, _) in &records {
            if let Some(entry) = index.get(nct_id) {
                entry.ready();
            }
        }
        Ok(())
    }

    /// Fail and drop every still-pending entry in `ids`. The caller must
    /// hold the writer mutex.
    fn fail_and_detach(&self, ids: &[NctId], cause: &CacheError) {
        let mut index = self.index.write();
        for nct_id in ids {
            let pending = index.get(nct_id).is_some_and(|e| e.is_pending());
            if pending {
                if let Some(entry) = index.remove(nct_id) {
                    entry.fail(cause.clone());
                }
            }
        }
    }

    /// One expiry pass: drop every entry idle longer than `expiration` and
    /// delete its stored record. In-flight entries (no `created_at`) never
    /// expire. Removal failures are logged and do not stop the sweep.
    pub async fn sweep_once(&self, expiration: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(expiration) else {
            return 0;
        };
        let snapshot: Vec<(NctId, Arc<CacheEntry>)> = {
            let index = self.index.read();
            index.iter().map(|(id, e)| (*id, Arc::clone(e))).collect()
        };

        let mut removed = 0;
        for (nct_id, entry) in snapshot {
            if entry.created_at().is_none() || !entry.last_accessed_before(cutoff) {
                continue;
            }
            let _writer = self.write_lock.lock().await;
            let detached = {
                let mut index = self.index.write();
                match index.get(&nct_id) {
                    // Re-check under the lock: the entry may have been
                    // touched or replaced since the snapshot.
                    Some(current)
                        if Arc::ptr_eq(current, &entry)
                            && entry.last_accessed_before(cutoff) =>
                    {
                        index.remove(&nct_id)
                    }
                    _ => None,
                }
            };
            let Some(entry) = detached else { continue };
            match entry.remove().await {
                Ok(()) => {
                    debug!(target: "ctgovservice", nct_id = %nct_id, "expired trial removed");
                    removed += 1;
                }
                Err(error) => {
                    warn!(
                        target: "ctgovservice",
                        nct_id = %nct_id,
                        error = %error,
                        "failed to remove expired trial"
                    );
                }
            }
        }
        removed
    }
}

impl std::fmt::Debug for TrialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialCache")
            .field("entries", &self.len())
            .field("max_per_request", &self.max_per_request)
            .finish_non_exhaustive()
    }
}
