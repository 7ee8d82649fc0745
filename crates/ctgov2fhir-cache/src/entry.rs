//! Per-NCT cache entry.
//!
//! An entry is created speculatively (pending, `created_at` unset) by the
//! coordinator before its batch goes out, or restored (ready) from a key the
//! store already holds. Many callers share one entry: a `load()` on a
//! pending entry suspends on a broadcast waiter that `ready()`/`fail()`
//! resolves. The waiter is not allocated until the first `load()` actually
//! needs to suspend, so entries nobody awaits carry no channel.

use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use ctgov2fhir_core::{ClinicalStudy, NctId};
use ctgov2fhir_store::{StoreError, StudyStore};

use crate::CacheError;

type SharedWaiter = Shared<BoxFuture<'static, Result<(), CacheError>>>;

pub struct CacheEntry {
    nct_id: NctId,
    store: Arc<dyn StudyStore>,
    state: Mutex<EntryState>,
}

struct EntryState {
    phase: Phase,
    created_at: Option<Instant>,
    last_accessed: Instant,
    waiter: Option<WaitSlot>,
}

enum Phase {
    Pending,
    Ready,
    Failed(CacheError),
}

struct WaitSlot {
    /// Present until the entry resolves; consumed by `ready()`/`fail()`.
    notify: Option<oneshot::Sender<Result<(), CacheError>>>,
    /// Cloneable receiver every suspended `load()` awaits.
    shared: SharedWaiter,
}

impl EntryState {
    /// The broadcast waiter, allocated on first use.
    fn waiter(&mut self, nct_id: NctId) -> SharedWaiter {
        if let Some(slot) = &self.waiter {
            return slot.shared.clone();
        }
        let (notify, receiver) = oneshot::channel();
        let shared = receiver
            .map(move |outcome| match outcome {
                Ok(resolution) => resolution,
                Err(_) => Err(CacheError::Invalidated { nct_id }),
            })
            .boxed()
            .shared();
        self.waiter = Some(WaitSlot {
            notify: Some(notify),
            shared: shared.clone(),
        });
        shared
    }

    fn resolve(&mut self, outcome: Result<(), CacheError>) {
        if let Some(slot) = self.waiter.as_mut() {
            if let Some(notify) = slot.notify.take() {
                // A dropped receiver just means nobody is waiting any more.
                let _ = notify.send(outcome);
            }
        }
    }
}

impl CacheEntry {
    /// Speculative entry for an id whose data is not yet known.
    pub(crate) fn pending(nct_id: NctId, store: Arc<dyn StudyStore>) -> Self {
        Self {
            nct_id,
            store,
            state: Mutex::new(EntryState {
                phase: Phase::Pending,
                created_at: None,
                last_accessed: Instant::now(),
                waiter: None,
            }),
        }
    }

    /// Entry restored from a key the durable store already holds.
    pub(crate) fn restored(nct_id: NctId, store: Arc<dyn StudyStore>) -> Self {
        Self {
            nct_id,
            store,
            state: Mutex::new(EntryState {
                phase: Phase::Ready,
                created_at: Some(Instant::now()),
                last_accessed: Instant::now(),
                waiter: None,
            }),
        }
    }

    pub fn nct_id(&self) -> NctId {
        self.nct_id
    }

    /// Resolve the entry's record.
    ///
    /// Ready entries read through the store and refresh their last-access
    /// time; pending entries suspend until resolution; failed entries
    /// propagate the recorded cause. A ready entry whose stored record is
    /// missing, unparseable, or keyed differently than the entry resolves
    /// as `None`.
    pub async fn load(&self) -> Result<Option<ClinicalStudy>, CacheError> {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                match &state.phase {
                    Phase::Ready => {
                        state.last_accessed = Instant::now();
                        None
                    }
                    Phase::Failed(cause) => {
                        return Err(CacheError::EntryFailed {
                            nct_id: self.nct_id,
                            cause: Arc::new(cause.clone()),
                        });
                    }
                    Phase::Pending => Some(state.waiter(self.nct_id)),
                }
            };
            match waiter {
                None => return self.read_record().await,
                Some(waiter) => waiter.await?,
            }
        }
    }

    async fn read_record(&self) -> Result<Option<ClinicalStudy>, CacheError> {
        match self.store.get(self.nct_id).await {
            Ok(Some(record)) => {
                if record.nct_id() != Some(self.nct_id) {
                    warn!(
                        target: "ctgovservice",
                        nct_id = %self.nct_id,
                        "stored record does not identify as its key, rejecting"
                    );
                    return Ok(None);
                }
                Ok(Some(record))
            }
            Ok(None) => {
                debug!(
                    target: "ctgovservice",
                    nct_id = %self.nct_id,
                    "ready entry resolved with no stored record"
                );
                Ok(None)
            }
            Err(StoreError::Decode { source, .. }) => {
                warn!(
                    target: "ctgovservice",
                    nct_id = %self.nct_id,
                    error = %source,
                    "stored record is unparseable, rejecting"
                );
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Mark the entry ready and wake every waiter. Idempotent.
    pub fn ready(&self) {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Pending) {
            return;
        }
        state.phase = Phase::Ready;
        state.resolve(Ok(()));
    }

    /// Mark the entry failed and reject every waiter with the cause.
    /// Idempotent; a resolved entry keeps its first resolution.
    pub fn fail(&self, cause: CacheError) {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Pending) {
            return;
        }
        let propagated = CacheError::EntryFailed {
            nct_id: self.nct_id,
            cause: Arc::new(cause.clone()),
        };
        state.phase = Phase::Failed(cause);
        state.resolve(Err(propagated));
    }

    /// Record that upstream knows this id. First call stamps `created_at`;
    /// later calls are no-ops.
    pub fn found(&self) {
        let mut state = self.state.lock();
        if state.created_at.is_none() {
            state.created_at = Some(Instant::now());
        }
    }

    /// Delete the backing record. The caller is responsible for having
    /// detached the entry from the index first.
    pub async fn remove(&self) -> Result<(), CacheError> {
        self.store.delete(self.nct_id).await.map_err(CacheError::from)
    }

    /// Strictly-before comparison on the last access time.
    pub fn last_accessed_before(&self, cutoff: Instant) -> bool {
        self.state.lock().last_accessed < cutoff
    }

    pub(crate) fn created_at(&self) -> Option<Instant> {
        self.state.lock().created_at
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Pending)
    }

    /// Pending and never confirmed by an upstream response.
    pub(crate) fn is_unconfirmed(&self) -> bool {
        let state = self.state.lock();
        matches!(state.phase, Phase::Pending) && state.created_at.is_none()
    }

    #[cfg(test)]
    fn has_waiter(&self) -> bool {
        self.state.lock().waiter.is_some()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        let phase = match &state.phase {
            Phase::Pending => "pending",
            Phase::Ready => "ready",
            Phase::Failed(_) => "failed",
        };
        f.debug_struct("CacheEntry")
            .field("nct_id", &self.nct_id)
            .field("phase", &phase)
            .field("created_at", &state.created_at)
            .finish_non_exhaustive()
    }
}
