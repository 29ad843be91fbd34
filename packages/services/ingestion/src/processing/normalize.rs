//! Pure value normalization for candidate fields.
//!
//! Every function here is total: bad input yields `None`/empty, never an error.

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Country calling code (digits, `+` optional) prefixed onto bare 10-digit numbers.
    pub default_country_code: Option<String>,
}

pub fn normalize_email(value: &str) -> Option<String> {
    let s = value.trim().to_lowercase();
    if s.is_empty() || !s.contains('@') || s.starts_with('@') || s.ends_with('@') {
        return None;
    }
    Some(s)
}

pub fn normalize_phone(value: &str, options: &NormalizeOptions) -> Option<String> {
    let kept: String = value.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
    let digits: String = kept.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if kept.starts_with('+') {
        return Some(format!("+{}", digits));
    }
    if digits.len() == 10 {
        let cc: Option<String> = options
            .default_country_code
            .as_deref()
            .map(|c| c.chars().filter(|ch| ch.is_ascii_digit()).collect::<String>())
            .filter(|c| !c.is_empty());
        if let Some(cc) = cc {
            return Some(format!("+{}{}", cc, digits));
        }
    }
    Some(digits)
}

pub fn normalize_name(value: &str) -> Option<String> {
    let s = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if s.is_empty() { None } else { Some(s) }
}

/// Accepts a delimited string or a JSON array of items.
pub fn normalize_skills(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(cell_text)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        other => match cell_text(other) {
            Some(s) => split_skills(&s),
            None => Vec::new(),
        },
    }
}

fn split_skills(s: &str) -> Vec<String> {
    s.split(|c| matches!(c, ',' | ';' | '|' | '\n' | '\t'))
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Renders a cell value as text. Integral floats lose their `.0` so numeric phone cells
/// (`9876543210.0`) survive as digits.
pub fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() { None } else { Some(t.to_string()) }
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 && f.abs() < 1e15 {
                        format!("{}", f as i64)
                    } else {
                        f.to_string()
                    }
                })
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Total years of experience from a number or strings like `"5 yrs"` / `"3.5"`.
pub fn parse_experience_years(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok()?
        }
        _ => return None,
    };
    if n.is_finite() { Some(n) } else { None }
}
