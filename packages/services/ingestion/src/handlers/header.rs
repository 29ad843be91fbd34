use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::processing::normalize::cell_text;

/// Turns raw header cells into unique column names: blanks become `col_<n>` (1-based) and
/// repeats get `__2`, `__3`, ... suffixes.
pub fn normalize_header_row(cells: &[Value]) -> Arc<[String]> {
    let mut used: HashSet<String> = HashSet::new();
    let mut suffixes: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(cells.len());
    for (i, cell) in cells.iter().enumerate() {
        let base = cell_text(cell).unwrap_or_else(|| format!("col_{}", i + 1));
        let mut name = base.clone();
        if used.contains(&name) {
            // a literal "name__2" column can already occupy the next suffix
            let n = suffixes.entry(base.clone()).or_insert(1);
            loop {
                *n += 1;
                name = format!("{}__{}", base, n);
                if !used.contains(&name) {
                    break;
                }
            }
        }
        used.insert(name.clone());
        out.push(name);
    }
    out.into()
}

/// True when at least one cell carries visible content.
pub fn has_content(cells: &[Value]) -> bool {
    cells.iter().any(|c| cell_text(c).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blanks_and_repeats() {
        let h = normalize_header_row(&[json!("name"), json!(""), json!("name"), Value::Null, json!(" name ")]);
        assert_eq!(&*h, &["name", "col_2", "name__2", "col_4", "name__3"]);
    }

    #[test]
    fn repeat_suffix_skips_names_already_taken() {
        let h = normalize_header_row(&[json!("name"), json!("name__2"), json!("name")]);
        assert_eq!(&*h, &["name", "name__2", "name__3"]);

        let h = normalize_header_row(&[json!("a"), json!("a"), json!("a__2"), json!("a__2")]);
        assert_eq!(&*h, &["a", "a__2", "a__2__2", "a__2__3"]);
    }

    #[test]
    fn numeric_header_cells_become_text() {
        let h = normalize_header_row(&[json!(2024.0), json!(true)]);
        assert_eq!(&*h, &["2024", "true"]);
    }

    #[test]
    fn blank_row_has_no_content() {
        assert!(!has_content(&[Value::Null, json!("  ")]));
        assert!(has_content(&[Value::Null, json!(0)]));
    }
}
