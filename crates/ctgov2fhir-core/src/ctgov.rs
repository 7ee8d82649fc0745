//! ClinicalTrials.gov v2 study record model.
//!
//! Typed subset of the JSON `Study` object returned by
//! `GET /api/v2/studies`. Every field is optional: upstream records are
//! frequently partial and the merge does per-field presence checks rather
//! than validating whole records. Module-level `extra` bags preserve fields
//! this layer does not model, so a persisted record re-serializes faithfully.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::nct::NctId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalStudy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_section: Option<ProtocolSection>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClinicalStudy {
    /// The NCT id in the record's identification module, if present and
    /// well-formed.
    pub fn nct_id(&self) -> Option<NctId> {
        self.protocol_section
            .as_ref()?
            .identification_module
            .as_ref()?
            .nct_id
            .as_deref()?
            .parse()
            .ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identification_module: Option<IdentificationModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_module: Option<StatusModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_module: Option<DescriptionModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_module: Option<DesignModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eligibility_module: Option<EligibilityModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions_module: Option<ConditionsModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contacts_locations_module: Option<ContactsLocationsModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arms_interventions_module: Option<ArmsInterventionsModule>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentificationModule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nct_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief_title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusModule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date_struct: Option<DateStruct>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_date_struct: Option<DateStruct>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateStruct {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionModule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief_summary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignModule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_info: Option<DesignInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention_model_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observational_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_perspective: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masking_info: Option<MaskingInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskingInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masking_description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityModule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eligibility_criteria: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionsModule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsLocationsModule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub central_contacts: Vec<Contact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<StudyLocation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<Contact>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmsInterventionsModule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arm_groups: Vec<ArmGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interventions: Vec<Intervention>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arm_group_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_names: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
