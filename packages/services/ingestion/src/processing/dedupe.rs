use crate::processing::normalize::{normalize_email, normalize_name, normalize_phone, NormalizeOptions};

/// Raw identity signals for one row, before normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFields<'a> {
    pub email: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub full_name: Option<&'a str>,
}

/// Derives the identity key: email beats phone beats name. `None` means the row cannot be
/// identified and must not be persisted.
pub fn compute_dedupe_key(fields: IdentityFields<'_>, options: &NormalizeOptions) -> Option<String> {
    if let Some(email) = fields.email.and_then(normalize_email) {
        return Some(format!("email:{}", email));
    }
    if let Some(phone) = fields.phone.and_then(|p| normalize_phone(p, options)) {
        return Some(format!("phone:{}", phone));
    }
    fields
        .full_name
        .and_then(normalize_name)
        .map(|name| format!("name:{}", name.to_lowercase()))
}
