use crate::mapping::{MappedField, MappedRow};
use crate::models::*;
use crate::processing::dedupe::{compute_dedupe_key, IdentityFields};
use crate::processing::normalize::{
    cell_text, normalize_email, normalize_name, normalize_phone, normalize_skills, parse_experience_years,
    NormalizeOptions,
};

/// Turns mapped rows into canonical candidates.
#[derive(Debug, Clone, Default)]
pub struct CandidateAssembler {
    options: NormalizeOptions,
}

impl CandidateAssembler {
    pub fn new(options: NormalizeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &NormalizeOptions {
        &self.options
    }

    /// Returns `None` when the row has no usable identity (no email, phone or name).
    pub fn assemble(&self, row: &MappedRow, source: SourceRef) -> Result<Option<Candidate>> {
        let text = |f: MappedField| row.get(f).and_then(cell_text);

        let first_name = text(MappedField::FirstName).and_then(|s| normalize_name(&s));
        let last_name = text(MappedField::LastName).and_then(|s| normalize_name(&s));
        let mut full_name = text(MappedField::FullName).and_then(|s| normalize_name(&s));
        if full_name.is_none() && (first_name.is_some() || last_name.is_some()) {
            let joined = [first_name.as_deref(), last_name.as_deref()]
                .iter()
                .flatten()
                .copied()
                .collect::<Vec<_>>()
                .join(" ");
            full_name = normalize_name(&joined);
        }

        // A lone full name is split so first/last stay searchable.
        let (first_name, last_name) = match (&full_name, first_name, last_name) {
            (Some(full), None, None) => {
                let mut parts = full.splitn(2, ' ');
                let first = parts.next().map(str::to_string);
                let rest = parts.next().map(str::to_string);
                (first, rest)
            }
            (_, f, l) => (f, l),
        };

        let email = text(MappedField::Email).and_then(|s| normalize_email(&s));
        let phone = text(MappedField::Phone).and_then(|s| normalize_phone(&s, &self.options));

        let Some(dedupe_key) = compute_dedupe_key(
            IdentityFields { email: email.as_deref(), phone: phone.as_deref(), full_name: full_name.as_deref() },
            &self.options,
        ) else {
            return Ok(None);
        };

        let designation = text(MappedField::Designation).or_else(|| text(MappedField::CurrentTitle));
        let skills = row.get(MappedField::Skills).map(normalize_skills).unwrap_or_default();

        Ok(Some(Candidate {
            id: None,
            dedupe_key,
            profile: Profile { full_name, first_name, last_name, description: text(MappedField::Description) },
            contacts: Contacts { emails: email.into_iter().collect(), phones: phone.into_iter().collect() },
            professional: Professional {
                designation,
                current_company: text(MappedField::CurrentCompany),
                experience_years: row.get(MappedField::ExperienceYears).and_then(parse_experience_years),
                experience_text: text(MappedField::ExperienceText),
                specialization: text(MappedField::Specialization),
                qualification: text(MappedField::Qualification),
                stream: text(MappedField::Stream),
                proficiency: text(MappedField::Proficiency),
                skills,
                location: text(MappedField::Location),
                preferred_location: text(MappedField::PreferredLocation),
            },
            meta: CandidateMeta { raw: Some(row.raw.to_document()?) },
            sources: vec![source],
            created_at: None,
            updated_at: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::RowRecord;
    use crate::mapping::SchemaMapperFactory;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn assemble(names: &[&str], values: Vec<Value>, options: NormalizeOptions) -> Option<Candidate> {
        let header: Arc<[String]> = names.iter().map(|s| s.to_string()).collect::<Vec<_>>().into();
        let mapper = SchemaMapperFactory::create_for_header(&header);
        let row = mapper.map_row(&RowRecord::new(header, values));
        let src = SourceRef { file_path: "f.xlsx".into(), sheet_name: "Sheet1".into(), row_number: 2 };
        CandidateAssembler::new(options).assemble(&row, src).unwrap()
    }

    #[test]
    fn john_doe_row_normalizes_everything() {
        let c = assemble(
            &["Name", "Email", "Phone"],
            vec![json!("  John   Doe  "), json!("JOHN@X.COM"), json!("(+91) 98765-43210")],
            NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(c.profile.full_name.as_deref(), Some("John Doe"));
        assert_eq!(c.profile.first_name.as_deref(), Some("John"));
        assert_eq!(c.profile.last_name.as_deref(), Some("Doe"));
        assert_eq!(c.contacts.emails, vec!["john@x.com"]);
        assert_eq!(c.contacts.phones, vec!["+919876543210"]);
        assert_eq!(c.dedupe_key, "email:john@x.com");
        assert_eq!(c.sources.len(), 1);
        let raw = c.meta.raw.unwrap();
        assert_eq!(raw.get_str("Name").unwrap(), "  John   Doe  ");
    }

    #[test]
    fn name_parts_build_full_name() {
        let c = assemble(&["First Name", "Surname"], vec![json!("Ann"), json!(" Lee ")], NormalizeOptions::default())
            .unwrap();
        assert_eq!(c.profile.full_name.as_deref(), Some("Ann Lee"));
        assert_eq!(c.dedupe_key, "name:ann lee");
    }

    #[test]
    fn numeric_phone_cell_with_country_code() {
        let opts = NormalizeOptions { default_country_code: Some("91".into()) };
        let c = assemble(&["Mobile"], vec![json!(9876543210.0)], opts).unwrap();
        assert_eq!(c.dedupe_key, "phone:+919876543210");
    }

    #[test]
    fn professional_fields_and_title_fallback() {
        let c = assemble(
            &["Email", "Role", "Company", "Total Exp", "Key Skills", "Preferred City"],
            vec![json!("a@b.c"), json!(" Staff Nurse "), json!("City Hospital"), json!("4.5 yrs"), json!("ICU; Triage"), json!("Pune")],
            NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(c.professional.designation.as_deref(), Some("Staff Nurse"));
        assert_eq!(c.professional.current_company.as_deref(), Some("City Hospital"));
        assert_eq!(c.professional.experience_years, Some(4.5));
        assert_eq!(c.professional.skills, vec!["icu", "triage"]);
        assert_eq!(c.professional.preferred_location.as_deref(), Some("Pune"));
        // "preferred city" is also a location phrase
        assert_eq!(c.professional.location.as_deref(), Some("Pune"));
    }

    #[test]
    fn rows_without_identity_are_dropped() {
        assert!(assemble(&["Email", "Company"], vec![json!("nope"), json!("X")], NormalizeOptions::default()).is_none());
    }
}
