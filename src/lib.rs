// ctgov2fhir - Trial-metadata enrichment cache
//
// Fetches protocol metadata for clinical studies from ClinicalTrials.gov,
// keeps it in a durable local cache, and backfills the absent fields of
// FHIR ResearchStudy resources from it. Concurrent requests for the same
// trial share a single upstream fetch.
//
// Layering:
// - ctgov2fhir-core: identifiers, data models, the merge
// - ctgov2fhir-store: durable record storage (SQLite or flat files)
// - ctgov2fhir-client: the ClinicalTrials.gov v2 API client
// - ctgov2fhir-cache: single-flight coordination and expiry
// - this crate: the service facade tying them together

mod service;

pub use service::{CtGovService, ServiceError};

// Re-export the pieces callers interact with directly.
pub use ctgov2fhir_cache::{CacheError, Sweeper, TrialCache};
pub use ctgov2fhir_client::{CtGovClient, FetchError, StudyFetcher, DEFAULT_ENDPOINT};
pub use ctgov2fhir_config::{
    CleanupConfig, FsConfig, RuntimeConfig, ServiceConfig, SqliteConfig, StorageBackend,
    StorageConfig,
};
pub use ctgov2fhir_core::{
    extract_nct_id, group_studies_by_nct, merge_clinical_study, ClinicalStudy, IdentifierError,
    NctId, ResearchStudy,
};
pub use ctgov2fhir_core::{ctgov, fhir};
pub use ctgov2fhir_store::{FsStore, SqliteStore, StoreError, StoreStat, StudyStore};
