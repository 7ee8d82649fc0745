//! NCT identifier utilities.
//!
//! A ClinicalTrials.gov registration is keyed by an 11-character identifier:
//! the literal `NCT` followed by exactly eight decimal digits. The textual
//! form is the canonical external key; internally the serial fits in a `u32`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::fhir::ResearchStudy;

/// Identifier system used by study objects that already carry an NCT id.
pub const CTGOV_IDENTIFIER_SYSTEM: &str = "http://clinicaltrials.gov/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("'{0}' is not a valid NCT identifier")]
    Malformed(String),
    #[error("{0} is out of range for an NCT serial (max {max})", max = NctId::MAX_SERIAL)]
    OutOfRange(u64),
}

/// A validated ClinicalTrials.gov identifier.
///
/// Construction only succeeds for values that render back to the canonical
/// `NCTnnnnnnnn` form, so an `NctId` held anywhere in the system is known
/// valid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NctId(u32);

impl NctId {
    /// Largest serial representable in the 8-digit form.
    pub const MAX_SERIAL: u32 = 99_999_999;

    /// Wrap a raw serial, rejecting values that do not zero-pad to 8 digits.
    pub fn new(serial: u32) -> Result<Self, IdentifierError> {
        if serial > Self::MAX_SERIAL {
            return Err(IdentifierError::OutOfRange(u64::from(serial)));
        }
        Ok(Self(serial))
    }

    /// Whether `s` matches `^NCT[0-9]{8}$` exactly.
    pub fn is_valid(s: &str) -> bool {
        s.len() == 11
            && s.starts_with("NCT")
            && s.as_bytes()[3..].iter().all(u8::is_ascii_digit)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NCT{:08}", self.0)
    }
}

impl fmt::Debug for NctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NctId({})", self)
    }
}

impl FromStr for NctId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_valid(s) {
            return Err(IdentifierError::Malformed(s.to_string()));
        }
        // The 8-digit tail fits a u32 by construction.
        let serial = s[3..]
            .parse::<u32>()
            .map_err(|_| IdentifierError::Malformed(s.to_string()))?;
        Ok(Self(serial))
    }
}

impl Serialize for NctId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NctId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Pull the NCT id off a study object's `identifier` list.
///
/// Two passes: identifiers explicitly marked with the ClinicalTrials.gov
/// system win; otherwise the first value that happens to look like an NCT id
/// is taken. Returns `None` when the object carries neither.
pub fn extract_nct_id(study: &ResearchStudy) -> Option<NctId> {
    for identifier in &study.identifier {
        if identifier.system.as_deref() == Some(CTGOV_IDENTIFIER_SYSTEM) {
            if let Some(id) = identifier.value.as_deref().and_then(|v| v.parse().ok()) {
                return Some(id);
            }
        }
    }
    study
        .identifier
        .iter()
        .find_map(|identifier| identifier.value.as_deref().and_then(|v| v.parse().ok()))
}

/// Group study objects by their NCT id, preserving first-appearance order of
/// the keys and input order of the positions within each key.
///
/// Objects without a recognizable NCT id are absent from the result.
pub fn group_studies_by_nct(studies: &[ResearchStudy]) -> Vec<(NctId, Vec<usize>)> {
    let mut groups: Vec<(NctId, Vec<usize>)> = Vec::new();
    for (position, study) in studies.iter().enumerate() {
        let Some(nct_id) = extract_nct_id(study) else {
            continue;
        };
        match groups.iter_mut().find(|(id, _)| *id == nct_id) {
            Some((_, positions)) => positions.push(position),
            None => groups.push((nct_id, vec![position])),
        }
    }
    groups
}
