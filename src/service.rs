//! Service facade.
//!
//! `CtGovService` owns the store, the cache, and the background sweeper.
//! `init()` opens the configured backend, rebuilds the index from persisted
//! keys, and starts the sweeper; `destroy()` unwinds in reverse. A store or
//! fetcher supplied by the caller is used as-is, and a caller-supplied store
//! is left open on `destroy()`.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use ctgov2fhir_cache::{CacheError, Sweeper, TrialCache};
use ctgov2fhir_client::{CtGovClient, FetchError, StudyFetcher};
use ctgov2fhir_config::{RuntimeConfig, StorageBackend};
use ctgov2fhir_core::{
    extract_nct_id, group_studies_by_nct, merge_clinical_study, ClinicalStudy, NctId,
    ResearchStudy,
};
use ctgov2fhir_store::{FsStore, SqliteStore, StoreError, StudyStore};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is already initialized")]
    AlreadyInitialized,

    #[error("service is not initialized")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub struct CtGovService {
    config: RuntimeConfig,
    store_override: Option<Arc<dyn StudyStore>>,
    fetcher_override: Option<Arc<dyn StudyFetcher>>,
    inner: Mutex<Option<ServiceInner>>,
}

struct ServiceInner {
    cache: Arc<TrialCache>,
    sweeper: Option<Sweeper>,
    store: Arc<dyn StudyStore>,
    owns_store: bool,
}

impl CtGovService {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            store_override: None,
            fetcher_override: None,
            inner: Mutex::new(None),
        }
    }

    /// Use a pre-opened store instead of opening one from the configuration.
    /// The store stays open across `destroy()`.
    pub fn with_store(mut self, store: Arc<dyn StudyStore>) -> Self {
        self.store_override = Some(store);
        self
    }

    /// Use a custom fetcher instead of the ClinicalTrials.gov client.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn StudyFetcher>) -> Self {
        self.fetcher_override = Some(fetcher);
        self
    }

    /// Open the store, restore the cache index from its keys, and start the
    /// expiry sweeper. Fails if called twice.
    pub async fn init(&self) -> Result<(), ServiceError> {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return Err(ServiceError::AlreadyInitialized);
        }
        self.config
            .validate()
            .map_err(|error| ServiceError::Config(error.to_string()))?;

        let max_entry_size = self.config.service.max_entry_size_bytes;
        let (store, owns_store): (Arc<dyn StudyStore>, bool) = match &self.store_override {
            Some(store) => (Arc::clone(store), false),
            None => {
                let store: Arc<dyn StudyStore> = match self.config.storage.backend {
                    StorageBackend::Sqlite => {
                        let sqlite = self.config.storage.sqlite.clone().unwrap_or_default();
                        Arc::new(SqliteStore::open(sqlite.path, max_entry_size).await?)
                    }
                    StorageBackend::Fs => {
                        let fs = self.config.storage.fs.clone().unwrap_or_default();
                        Arc::new(FsStore::open(fs.path, max_entry_size).await?)
                    }
                };
                (store, true)
            }
        };

        let fetcher: Arc<dyn StudyFetcher> = match &self.fetcher_override {
            Some(fetcher) => Arc::clone(fetcher),
            None => Arc::new(CtGovClient::new(self.config.service.endpoint.clone())?),
        };

        let cache = Arc::new(TrialCache::new(
            Arc::clone(&store),
            fetcher,
            self.config.service.trials_per_request(),
        ));
        let restored = cache.restore().await?;

        let sweeper = self.config.cleanup.cleanup_interval().map(|interval| {
            Sweeper::spawn(
                Arc::clone(&cache),
                interval,
                self.config.cleanup.expiration_timeout(),
            )
        });

        info!(target: "ctgovservice", restored, "trial cache service initialized");
        *slot = Some(ServiceInner {
            cache,
            sweeper,
            store,
            owns_store,
        });
        Ok(())
    }

    /// Stop the sweeper (waiting for an in-flight sweep) and close the store
    /// if this facade opened it.
    pub async fn destroy(&self) -> Result<(), ServiceError> {
        let inner = self
            .inner
            .lock()
            .await
            .take()
            .ok_or(ServiceError::NotInitialized)?;
        if let Some(sweeper) = inner.sweeper {
            sweeper.shutdown().await;
        }
        if inner.owns_store {
            inner.store.close().await?;
        }
        info!(target: "ctgovservice", "trial cache service destroyed");
        Ok(())
    }

    async fn cache(&self) -> Result<Arc<TrialCache>, ServiceError> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|inner| Arc::clone(&inner.cache))
            .ok_or(ServiceError::NotInitialized)
    }

    /// Enrich each study object that carries a known NCT id; objects without
    /// one are returned unchanged. Rejects only when a whole fetch batch
    /// fails, never for individual trials the upstream does not know.
    pub async fn update_research_studies(
        &self,
        studies: Vec<ResearchStudy>,
    ) -> Result<Vec<ResearchStudy>, ServiceError> {
        let cache = self.cache().await?;
        let groups = group_studies_by_nct(&studies);
        if groups.is_empty() {
            return Ok(studies);
        }
        let ids: Vec<NctId> = groups.iter().map(|(nct_id, _)| *nct_id).collect();
        cache.ensure_trials_available(&ids).await?;

        let mut studies = studies;
        for (nct_id, positions) in groups {
            let record = match cache.get_study(nct_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(error) => {
                    warn!(
                        target: "ctgovservice",
                        nct_id = %nct_id,
                        error = %error,
                        "leaving study unchanged after load failure"
                    );
                    continue;
                }
            };
            for position in positions {
                merge_clinical_study(&mut studies[position], &record);
            }
        }
        Ok(studies)
    }

    /// Fetch-and-cache the given NCT ids. Malformed ids are dropped
    /// silently; duplicates collapse.
    pub async fn ensure_trials_available<I, S>(&self, ids: I) -> Result<(), ServiceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<NctId> = ids
            .into_iter()
            .filter_map(|raw| raw.as_ref().parse().ok())
            .collect();
        self.cache()
            .await?
            .ensure_trials_available(&ids)
            .await
            .map_err(ServiceError::from)
    }

    /// Fetch-and-cache the trials referenced by the given study objects.
    pub async fn ensure_trials_available_for(
        &self,
        studies: &[ResearchStudy],
    ) -> Result<(), ServiceError> {
        let ids: Vec<NctId> = studies.iter().filter_map(extract_nct_id).collect();
        self.cache()
            .await?
            .ensure_trials_available(&ids)
            .await
            .map_err(ServiceError::from)
    }

    /// The cached record for `nct_id`, or `None` when the id is malformed,
    /// unknown upstream, or not cached.
    pub async fn get_cached_clinical_study(
        &self,
        nct_id: &str,
    ) -> Result<Option<ClinicalStudy>, ServiceError> {
        let Ok(nct_id) = nct_id.parse::<NctId>() else {
            return Ok(None);
        };
        self.cache()
            .await?
            .get_study(nct_id)
            .await
            .map_err(ServiceError::from)
    }

    /// Apply one record to one study object. Exposed so hosts can override
    /// the enrichment step while reusing the rest of the pipeline.
    pub fn update_research_study(
        &self,
        mut study: ResearchStudy,
        record: &ClinicalStudy,
    ) -> ResearchStudy {
        merge_clinical_study(&mut study, record);
        study
    }
}

impl std::fmt::Debug for CtGovService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtGovService")
            .field("endpoint", &self.config.service.endpoint)
            .field("backend", &self.config.storage.backend)
            .finish_non_exhaustive()
    }
}
