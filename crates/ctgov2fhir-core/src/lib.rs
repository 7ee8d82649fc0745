// ctgov2fhir-core - Domain types and pure transformations
//
// This crate holds everything that does not touch I/O:
// - NCT identifier parsing, formatting, and extraction
// - The ClinicalTrials.gov v2 study record model (typed JSON subset)
// - The FHIR ResearchStudy model the caller hands us
// - The non-destructive merge of a study record onto a ResearchStudy
//
// Storage is in: ctgov2fhir-store
// The remote API client is in: ctgov2fhir-client
// Cache coordination is in: ctgov2fhir-cache

pub mod ctgov;
pub mod fhir;
pub mod merge;
pub mod nct;

pub use ctgov::ClinicalStudy;
pub use fhir::ResearchStudy;
pub use merge::merge_clinical_study;
pub use nct::{extract_nct_id, group_studies_by_nct, IdentifierError, NctId};
