//! Non-destructive projection of a study record onto a ResearchStudy.
//!
//! Each field rule fills its target only when the target is currently empty
//! (unset, empty string, or empty collection). Two exceptions: `category` is
//! additive with a label-prefix guard, and a `status` of `"active"` may be
//! overridden by the mapped upstream status. Merging the same record twice
//! yields the same resource as merging it once.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ctgov::{ClinicalStudy, Contact, ProtocolSection};
use crate::fhir::{
    Address, Arm, CodeableConcept, Coding, Contained, ContainedResource, ContactDetail,
    ContactPoint, Group, Location, Period, PlanDefinition, Reference, ResearchStudy,
    RESEARCH_STUDY_PHASE_SYSTEM,
};

/// FHIR `date` primitive: YYYY, YYYY-MM, or YYYY-MM-DD with a non-zero year.
static FHIR_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([0-9]([0-9]([0-9][1-9]|[1-9]0)|[1-9]00)|[1-9]000)(-(0[1-9]|1[0-2])(-(0[1-9]|[1-2][0-9]|3[0-1]))?)?$",
    )
    .expect("FHIR date pattern is valid")
});

/// `design.designInfo` sub-keys surfaced as category text, in output order.
const DESIGN_LABELS: [&str; 6] = [
    "Intervention Model",
    "Primary Purpose",
    "Masking",
    "Allocation",
    "Time Perspective",
    "Observation Model",
];

/// Fill the absent fields of `study` from `record`.
///
/// No-op when the record has no protocol section. Fields already populated
/// on `study` are left exactly as they were.
pub fn merge_clinical_study(study: &mut ResearchStudy, record: &ClinicalStudy) {
    let Some(protocol) = record.protocol_section.as_ref() else {
        return;
    };

    merge_enrollment(study, protocol);
    merge_description(study, protocol);
    merge_phase(study, protocol);
    merge_categories(study, protocol);
    merge_status(study, protocol);
    merge_conditions(study, protocol);
    merge_sites(study, protocol);
    merge_arms(study, protocol);
    merge_protocols(study, protocol);
    merge_contacts(study, protocol);
    merge_period(study, protocol);
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, str::is_empty)
}

fn merge_enrollment(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if !study.enrollment.is_empty() {
        return;
    }
    let Some(criteria) = protocol
        .eligibility_module
        .as_ref()
        .and_then(|m| m.eligibility_criteria.as_deref())
        .filter(|c| !c.is_empty())
    else {
        return;
    };
    let group_id = format!("group{}", study.id.as_deref().unwrap_or(""));
    study
        .contained
        .push(Contained::Resource(ContainedResource::Group(Group {
            id: group_id.clone(),
            type_: Some("person".to_string()),
            actual: Some(false),
        })));
    let mut reference = Reference::contained(&group_id, "Group");
    reference.display = Some(criteria.to_string());
    study.enrollment = vec![reference];
}

fn merge_description(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if !is_blank(study.description.as_deref()) {
        return;
    }
    if let Some(summary) = protocol
        .description_module
        .as_ref()
        .and_then(|m| m.brief_summary.as_deref())
        .filter(|s| !s.is_empty())
    {
        study.description = Some(summary.to_string());
    }
}

fn merge_phase(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if study.phase.as_ref().map_or(false, |p| !p.is_empty()) {
        return;
    }
    let Some(phase) = protocol
        .design_module
        .as_ref()
        .and_then(|m| m.phases.first())
        .filter(|p| !p.is_empty())
    else {
        return;
    };
    let code = phase_code(phase);
    study.phase = Some(CodeableConcept {
        coding: vec![Coding {
            system: Some(RESEARCH_STUDY_PHASE_SYSTEM.to_string()),
            code: Some(code.clone()),
            display: None,
        }],
        text: Some(code),
    });
}

fn merge_categories(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    let Some(design) = protocol.design_module.as_ref() else {
        return;
    };
    let mut pairs: Vec<(&str, &str)> = Vec::new();
    if let Some(study_type) = design.study_type.as_deref().filter(|v| !v.is_empty()) {
        pairs.push(("Study Type", study_type));
    }
    if let Some(info) = design.design_info.as_ref() {
        let masking = info.masking_info.as_ref();
        let values = [
            info.intervention_model
                .as_deref()
                .or(info.intervention_model_description.as_deref()),
            info.primary_purpose.as_deref(),
            masking
                .and_then(|m| m.masking.as_deref())
                .or(masking.and_then(|m| m.masking_description.as_deref())),
            info.allocation.as_deref(),
            info.time_perspective.as_deref(),
            info.observational_model.as_deref(),
        ];
        for (label, value) in DESIGN_LABELS.into_iter().zip(values) {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                pairs.push((label, value));
            }
        }
    }
    for (label, value) in pairs {
        let prefix = format!("{label}:");
        let already_present = study
            .category
            .iter()
            .any(|c| c.text.as_deref().map_or(false, |t| t.starts_with(&prefix)));
        if !already_present {
            study
                .category
                .push(CodeableConcept::text(format!("{label}: {}", title_case(value))));
        }
    }
}

fn merge_status(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    let overridable = match study.status.as_deref() {
        None | Some("") | Some("active") => true,
        Some(_) => false,
    };
    if !overridable {
        return;
    }
    let Some(status_module) = protocol.status_module.as_ref() else {
        return;
    };
    let upstream = status_module
        .last_known_status
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(status_module.overall_status.as_deref())
        .filter(|s| !s.is_empty());
    if let Some(code) = upstream.and_then(research_study_status) {
        study.status = Some(code.to_string());
    }
}

fn merge_conditions(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if !study.condition.is_empty() {
        return;
    }
    if let Some(conditions) = protocol.conditions_module.as_ref() {
        study.condition = conditions
            .conditions
            .iter()
            .map(CodeableConcept::text)
            .collect();
    }
}

fn merge_sites(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if !study.site.is_empty() {
        return;
    }
    let Some(locations) = protocol
        .contacts_locations_module
        .as_ref()
        .map(|m| &m.locations)
        .filter(|l| !l.is_empty())
    else {
        return;
    };
    for (index, location) in locations.iter().enumerate() {
        let id = format!("location-{index}");
        let address = match (location.city.as_deref(), location.country.as_deref()) {
            (Some(city), Some(country)) if !city.is_empty() && !country.is_empty() => {
                Some(Address {
                    use_: Some("work".to_string()),
                    city: Some(city.to_string()),
                    state: location.state.clone(),
                    postal_code: location.zip.clone(),
                    country: Some(country.to_string()),
                })
            }
            _ => None,
        };
        study
            .contained
            .push(Contained::Resource(ContainedResource::Location(Location {
                id: id.clone(),
                name: location.facility.clone(),
                address,
                telecom: work_telecom(&location.contacts),
            })));
        let mut reference = Reference::contained(&id, "Location");
        reference.display = location.facility.clone();
        study.site.push(reference);
    }
}

fn merge_arms(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if !study.arm.is_empty() {
        return;
    }
    let Some(arm_groups) = protocol
        .arms_interventions_module
        .as_ref()
        .map(|m| &m.arm_groups)
    else {
        return;
    };
    study.arm = arm_groups
        .iter()
        .filter_map(|group| {
            let label = group.label.as_deref().filter(|l| !l.is_empty())?;
            Some(Arm {
                name: label.to_string(),
                type_: group.type_.as_deref().map(|t| CodeableConcept {
                    coding: vec![Coding {
                        system: None,
                        code: Some(t.to_lowercase().replace('_', "-")),
                        display: Some(title_case(t)),
                    }],
                    text: Some(title_case(t)),
                }),
                description: group.description.clone(),
            })
        })
        .collect();
}

fn merge_protocols(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if !study.protocol.is_empty() {
        return;
    }
    let Some(interventions) = protocol
        .arms_interventions_module
        .as_ref()
        .map(|m| &m.interventions)
        .filter(|i| !i.is_empty())
    else {
        return;
    };
    let mut index = 0usize;
    for intervention in interventions {
        let subjects: Vec<Option<&str>> = if intervention.arm_group_labels.is_empty() {
            vec![None]
        } else {
            intervention
                .arm_group_labels
                .iter()
                .map(|l| Some(l.as_str()))
                .collect()
        };
        for subject in subjects {
            let id = format!("plan-{index}");
            index += 1;
            study
                .contained
                .push(Contained::Resource(ContainedResource::PlanDefinition(
                    PlanDefinition {
                        id: id.clone(),
                        status: "unknown".to_string(),
                        title: intervention.name.clone(),
                        subtitle: intervention.other_names.first().cloned(),
                        description: intervention.description.clone(),
                        type_: intervention
                            .type_
                            .as_deref()
                            .map(|t| CodeableConcept::text(title_case(t))),
                        subject_codeable_concept: subject.map(CodeableConcept::text),
                    },
                )));
            let mut reference = Reference::contained(&id, "PlanDefinition");
            reference.display = intervention.name.clone();
            study.protocol.push(reference);
        }
    }
}

fn merge_contacts(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if !study.contact.is_empty() {
        return;
    }
    let Some(contacts) = protocol
        .contacts_locations_module
        .as_ref()
        .map(|m| &m.central_contacts)
    else {
        return;
    };
    study.contact = contacts
        .iter()
        .filter_map(|contact| {
            let name = contact.name.as_deref().filter(|n| !n.is_empty())?;
            Some(ContactDetail {
                name: Some(name.to_string()),
                telecom: work_telecom(std::slice::from_ref(contact)),
            })
        })
        .collect();
}

fn merge_period(study: &mut ResearchStudy, protocol: &ProtocolSection) {
    if study.period.is_some() {
        return;
    }
    let Some(status_module) = protocol.status_module.as_ref() else {
        return;
    };
    let start = status_module
        .start_date_struct
        .as_ref()
        .and_then(|d| d.date.as_deref())
        .filter(|d| is_fhir_date(d));
    let end = status_module
        .completion_date_struct
        .as_ref()
        .and_then(|d| d.date.as_deref())
        .filter(|d| is_fhir_date(d));
    if start.is_some() || end.is_some() {
        study.period = Some(Period {
            start: start.map(str::to_string),
            end: end.map(str::to_string),
        });
    }
}

fn work_telecom(contacts: &[Contact]) -> Vec<ContactPoint> {
    let mut telecom = Vec::new();
    for contact in contacts {
        if let Some(email) = contact.email.as_deref().filter(|e| !e.is_empty()) {
            telecom.push(ContactPoint::work("email", email));
        }
        if let Some(phone) = contact.phone.as_deref().filter(|p| !p.is_empty()) {
            telecom.push(ContactPoint::work("phone", phone));
        }
    }
    telecom
}

/// Whether `s` is a valid FHIR `date` (year, year-month, or full date).
pub fn is_fhir_date(s: &str) -> bool {
    FHIR_DATE.is_match(s)
}

/// Map an upstream phase token onto the research-study-phase code system.
///
/// `PHASE1` becomes `phase-1`, `EARLY_PHASE1` becomes `early-phase-1`, and
/// the not-applicable marker `NA` becomes `n-a`.
pub fn phase_code(token: &str) -> String {
    if token == "NA" {
        return "n-a".to_string();
    }
    let mut code = String::with_capacity(token.len() + 2);
    for c in token.chars() {
        match c {
            '_' => code.push('-'),
            c if c.is_ascii_digit() => {
                if code.chars().last().map_or(false, |p| p.is_ascii_alphabetic()) {
                    code.push('-');
                }
                code.push(c);
            }
            c => code.extend(c.to_lowercase()),
        }
    }
    code
}

/// Map an upstream recruitment status onto the ResearchStudy status codes.
///
/// Unknown tokens map to `None`, which leaves the target untouched.
pub fn research_study_status(token: &str) -> Option<&'static str> {
    Some(match token {
        "ACTIVE_NOT_RECRUITING" => "closed-to-accrual",
        "COMPLETED" => "completed",
        "ENROLLING_BY_INVITATION" => "active",
        "NOT_YET_RECRUITING" => "approved",
        "RECRUITING" => "active",
        "SUSPENDED" => "temporarily-closed-to-accrual",
        "TERMINATED" => "administratively-completed",
        "WITHDRAWN" => "withdrawn",
        "AVAILABLE" => "completed",
        "NO_LONGER_AVAILABLE" => "closed-to-accrual",
        "TEMPORARILY_NOT_AVAILABLE" => "temporarily-closed-to-accrual",
        "APPROVED_FOR_MARKETING" => "completed",
        "WITHHELD" => "in-review",
        "UNKNOWN" => "in-review",
        _ => return None,
    })
}

/// Render an upper-snake token for humans: `PARALLEL` becomes `Parallel`,
/// `CASE_CONTROL` becomes `Case Control`. Values that are not upper-snake
/// tokens (free-text descriptions) pass through unchanged.
pub fn title_case(value: &str) -> String {
    let is_token = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !is_token {
        return value.to_string();
    }
    value
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => format!("{}{}", first, chars.as_str().to_lowercase()),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
