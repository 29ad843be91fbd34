pub mod ai;

pub use ai::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handlers::RowRecord;

/// Canonical fields the heuristic mapper can resolve from a header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MappedField {
    FirstName,
    LastName,
    FullName,
    Email,
    Phone,
    Skills,
    Location,
    PreferredLocation,
    ExperienceYears,
    ExperienceText,
    CurrentTitle,
    Designation,
    CurrentCompany,
    Stream,
    Proficiency,
    Description,
    Specialization,
    Qualification,
}

impl MappedField {
    pub const ALL: [MappedField; 18] = [
        MappedField::FirstName,
        MappedField::LastName,
        MappedField::FullName,
        MappedField::Email,
        MappedField::Phone,
        MappedField::Skills,
        MappedField::Location,
        MappedField::PreferredLocation,
        MappedField::ExperienceYears,
        MappedField::ExperienceText,
        MappedField::CurrentTitle,
        MappedField::Designation,
        MappedField::CurrentCompany,
        MappedField::Stream,
        MappedField::Proficiency,
        MappedField::Description,
        MappedField::Specialization,
        MappedField::Qualification,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            MappedField::FirstName => "firstName",
            MappedField::LastName => "lastName",
            MappedField::FullName => "fullName",
            MappedField::Email => "email",
            MappedField::Phone => "phone",
            MappedField::Skills => "skills",
            MappedField::Location => "location",
            MappedField::PreferredLocation => "preferredLocation",
            MappedField::ExperienceYears => "experienceYears",
            MappedField::ExperienceText => "experienceText",
            MappedField::CurrentTitle => "currentTitle",
            MappedField::Designation => "designation",
            MappedField::CurrentCompany => "currentCompany",
            MappedField::Stream => "stream",
            MappedField::Proficiency => "proficiency",
            MappedField::Description => "description",
            MappedField::Specialization => "specialization",
            MappedField::Qualification => "qualification",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.key() == key)
    }

    /// Header phrases in priority order. Matched after `normalize_header_key` on both sides.
    fn phrases(&self) -> &'static [&'static str] {
        match self {
            MappedField::FirstName => &["first name", "firstname", "given name", "candidate first name"],
            MappedField::LastName => &["last name", "lastname", "surname", "family name", "candidate last name"],
            MappedField::FullName => &[
                "name", "full name", "candidate name", "doctor name", "nurse name", "employee name", "resource name",
            ],
            MappedField::Email => &["email", "email id", "e-mail", "mail", "mail id", "email address"],
            MappedField::Phone => &[
                "phone", "phone number", "mobile", "mobile number", "mobile no", "mobile no.", "contact",
                "contact number", "contact no", "contact no.",
            ],
            MappedField::Skills => &[
                "skills", "primary skills", "skill set", "key skills", "special skills", "clinical skills", "skill",
                "key skill",
            ],
            MappedField::Location => &[
                "location", "current location", "city", "current city", "preferred location", "preferred city",
            ],
            MappedField::PreferredLocation => &[
                "preferred location", "preferred locations", "preferred city", "preferred cities",
            ],
            MappedField::ExperienceYears => &[
                "experience", "experience (years)", "total experience", "total exp", "total exp (years)",
                "experience years", "years of experience",
            ],
            MappedField::ExperienceText => &[
                "experience details", "experience summary", "work experience", "experience (text)",
            ],
            MappedField::CurrentTitle => &["current title", "role", "current role", "current position", "position"],
            MappedField::Designation => &[
                "designation", "current designation", "title", "job title", "current title",
                "current company designation",
            ],
            MappedField::CurrentCompany => &[
                "current company", "current company name", "company", "employer", "organization", "hospital",
                "current hospital", "current organisation",
            ],
            MappedField::Stream => &["stream", "functional area", "domain", "category", "specialization stream"],
            MappedField::Proficiency => &["proficiency", "proficiency level", "level", "seniority", "grade"],
            MappedField::Description => &[
                "description", "profile summary", "summary", "about", "bio", "candidate summary", "notes",
            ],
            MappedField::Specialization => &[
                "specialization", "speciality", "department", "speciality/department", "department/speciality",
            ],
            MappedField::Qualification => &[
                "qualification", "education", "highest qualification", "degree", "educational qualification",
            ],
        }
    }
}

impl std::fmt::Display for MappedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Canonical header comparison key: lowercase, punctuation runs to a single space, common
/// abbreviations expanded word-wise.
pub fn normalize_header_key(header: &str) -> String {
    let lowered = header.to_lowercase();
    let mut spaced = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if ch.is_alphanumeric() {
            spaced.push(ch);
        } else {
            spaced.push(' ');
        }
    }
    spaced
        .split_whitespace()
        .map(|word| match word {
            "curr" => "current",
            "exp" => "experience",
            "yrs" => "years",
            "yr" => "year",
            "dept" => "department",
            "loc" => "location",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct SchemaMapperFactory;

impl SchemaMapperFactory {
    /// Resolves column indices for every canonical field. For each field the phrase list is
    /// walked in order and the first header equal to a phrase wins, so equal header rows always
    /// produce equal mappers.
    pub fn create_for_header(header: &Arc<[String]>) -> FieldMapper {
        let keys: Vec<String> = header.iter().map(|h| normalize_header_key(h)).collect();
        let mut indices = BTreeMap::new();
        for field in MappedField::ALL {
            let found = field.phrases().iter().find_map(|phrase| {
                let wanted = normalize_header_key(phrase);
                keys.iter().position(|k| *k == wanted)
            });
            if let Some(idx) = found {
                indices.insert(field, idx);
            }
        }
        FieldMapper { header: header.clone(), indices }
    }
}

/// Column assignment for one sheet's header.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapper {
    header: Arc<[String]>,
    indices: BTreeMap<MappedField, usize>,
}

impl FieldMapper {
    pub fn indices(&self) -> &BTreeMap<MappedField, usize> {
        &self.indices
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn source_header(&self, field: MappedField) -> Option<&str> {
        self.indices.get(&field).and_then(|i| self.header.get(*i)).map(String::as_str)
    }

    /// Overlays a `canonicalField -> sourceHeader` dictionary. Unknown fields or headers are
    /// skipped; returns how many entries took effect.
    pub fn apply_dictionary(&mut self, dictionary: &BTreeMap<String, String>) -> usize {
        let mut applied = 0;
        for (field_key, source) in dictionary {
            let Some(field) = MappedField::from_key(field_key) else {
                tracing::debug!(field = %field_key, "Ignoring unknown canonical field in mapping dictionary");
                continue;
            };
            let idx = self.header.iter().position(|h| h == source).or_else(|| {
                let wanted = normalize_header_key(source);
                self.header.iter().position(|h| normalize_header_key(h) == wanted)
            });
            match idx {
                Some(i) => {
                    self.indices.insert(field, i);
                    applied += 1;
                }
                None => tracing::debug!(field = %field_key, source_header = %source, "Mapping dictionary header not present"),
            }
        }
        applied
    }

    /// True when no identity-bearing column (email, phone or any name part) was resolved.
    pub fn lacks_identity_fields(&self) -> bool {
        ![
            MappedField::Email,
            MappedField::Phone,
            MappedField::FullName,
            MappedField::FirstName,
            MappedField::LastName,
        ]
        .iter()
        .any(|f| self.indices.contains_key(f))
    }

    pub fn map_row(&self, record: &RowRecord) -> MappedRow {
        let mut values = BTreeMap::new();
        for (field, idx) in &self.indices {
            if let Some(v) = record.value_at(*idx) {
                if !v.is_null() {
                    values.insert(*field, v.clone());
                }
            }
        }
        MappedRow { values, raw: record.clone() }
    }
}

/// Canonical-field view of one row, carrying the original record for auditing.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    values: BTreeMap<MappedField, Value>,
    pub raw: RowRecord,
}

impl MappedRow {
    pub fn get(&self, field: MappedField) -> Option<&Value> {
        self.values.get(&field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&MappedField, &Value)> {
        self.values.iter()
    }
}
