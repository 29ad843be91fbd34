//! AI-assisted header mapping: prompt construction, lenient response extraction and strict
//! validation against the input headers and canonical catalogue.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::clients::{ChatClient, ChatRequest};
use crate::models::*;

/// Sample rows included in the prompt.
pub const MAX_SAMPLE_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CanonicalField {
    pub key: &'static str,
    pub description: &'static str,
}

pub const CANONICAL_FIELDS: &[CanonicalField] = &[
    CanonicalField { key: "fullName", description: "Candidate full name (person name)" },
    CanonicalField { key: "email", description: "Primary email address" },
    CanonicalField { key: "phone", description: "Primary phone/mobile number" },
    CanonicalField { key: "designation", description: "Current title/designation/role" },
    CanonicalField { key: "currentCompany", description: "Current employer/company/organization" },
    CanonicalField { key: "experienceYears", description: "Total years of experience as a number (e.g. 3.5)" },
    CanonicalField { key: "skills", description: "Skills or skill set (may be comma-separated in source)" },
    CanonicalField { key: "location", description: "Current location / city" },
];

const SYSTEM_PROMPT: &str = "You are a data ingestion assistant. Your job is to map messy spreadsheet column headers \
to a predefined canonical schema. Return ONLY valid JSON. Do not include markdown, code fences, or explanation text \
outside JSON.";

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMappingPrompt {
    pub system: String,
    pub user: String,
}

pub fn build_header_mapping_prompt(headers: &[String], sample_rows: &[Value]) -> Result<HeaderMappingPrompt> {
    if headers.is_empty() {
        return Err(IngestionError::InvalidInput("headers must be a non-empty list".to_string()));
    }
    let samples: Vec<&Value> = sample_rows.iter().take(MAX_SAMPLE_ROWS).collect();
    let user = json!({
        "task": "Map the given Excel headers to canonical candidate fields.",
        "rules": {
            "outputFormat": "json",
            "requireOnlyJson": true,
            "allowManyToOne": true,
            "allowUnmapped": true,
            "requireConfidence": true,
            "constraints": [
                "Do not hallucinate headers that are not present.",
                "Prefer exact/strong semantic matches (e.g., \"Candidate Name\" -> fullName, \"Mobile no\" -> phone).",
                "If a header is ambiguous, set targetField to null and explain briefly in reason.",
                "If multiple headers map to the same targetField, choose a primary sourceHeader and mark others as aliases."
            ]
        },
        "canonicalFields": CANONICAL_FIELDS,
        "input": { "headers": headers, "sampleRows": samples },
        "outputSchema": {
            "version": "1.0",
            "mappings": [{
                "sourceHeader": "string (must be one of input.headers)",
                "targetField": "string|null (must be one of canonicalFields[].key or null)",
                "confidence": "number 0..1",
                "isPrimary": "boolean",
                "aliases": "string[] (other headers that mean the same thing)",
                "reason": "string (short)"
            }]
        },
        "examples": {
            "headers": ["Candidate Name", "ADRENALIN_NAME", "Mobile no", "Email ID", "Current Company"],
            "expected": {
                "version": "1.0",
                "mappings": [
                    { "sourceHeader": "Candidate Name", "targetField": "fullName", "confidence": 0.95, "isPrimary": true,
                      "aliases": ["ADRENALIN_NAME"], "reason": "Both columns represent the candidate name." },
                    { "sourceHeader": "Mobile no", "targetField": "phone", "confidence": 0.95, "isPrimary": true,
                      "aliases": [], "reason": "Mobile number." },
                    { "sourceHeader": "Email ID", "targetField": "email", "confidence": 0.95, "isPrimary": true,
                      "aliases": [], "reason": "Email address." },
                    { "sourceHeader": "Current Company", "targetField": "currentCompany", "confidence": 0.9,
                      "isPrimary": true, "aliases": [], "reason": "Employer/company." }
                ]
            }
        }
    });
    Ok(HeaderMappingPrompt { system: SYSTEM_PROMPT.to_string(), user: serde_json::to_string_pretty(&user)? })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMapping {
    pub source_header: String,
    pub target_field: Option<String>,
    pub confidence: f64,
    pub is_primary: bool,
    pub aliases: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderMappingResult {
    pub version: String,
    pub mappings: Vec<HeaderMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingErrorCode {
    InvalidJson,
    InvalidAiMapping,
    AiRequestFailed,
}

/// Why an AI mapping was discarded. Carried as a value; callers fall back to heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingError {
    pub code: MappingErrorCode,
    pub message: String,
}

impl MappingError {
    fn invalid(message: impl Into<String>) -> Self {
        Self { code: MappingErrorCode::InvalidAiMapping, message: message.into() }
    }
}

impl std::fmt::Display for MappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Strips code fences and cuts out the outermost `{...}` (or, failing that, `[...]`) span.
fn extract_json_candidate(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let span = |open: char, close: char| {
        let first = trimmed.find(open)?;
        let last = trimmed.rfind(close)?;
        if last > first { Some(&trimmed[first..=last]) } else { None }
    };
    span('{', '}').or_else(|| span('[', ']'))
}

fn unfence(text: &str) -> String {
    let mut out = text.to_string();
    for fence in ["```json", "```JSON", "```Json", "```"] {
        out = out.replace(fence, "");
    }
    out
}

pub fn parse_header_mapping_response(
    text: &str,
    headers: &[String],
) -> std::result::Result<HeaderMappingResult, MappingError> {
    let unfenced = unfence(text);
    let candidate = extract_json_candidate(&unfenced).unwrap_or(unfenced.trim());
    let data: Value = serde_json::from_str(candidate).map_err(|e| MappingError {
        code: MappingErrorCode::InvalidJson,
        message: format!("AI response is not valid JSON: {}", e),
    })?;

    let obj = data
        .as_object()
        .ok_or_else(|| MappingError::invalid("AI response JSON must be an object"))?;
    let items = obj
        .get("mappings")
        .and_then(Value::as_array)
        .ok_or_else(|| MappingError::invalid("AI response JSON must contain mappings: []"))?;

    let header_set: HashSet<&str> = headers.iter().map(String::as_str).collect();
    let canonical: HashSet<&str> = CANONICAL_FIELDS.iter().map(|f| f.key).collect();

    let mut mappings = Vec::with_capacity(items.len());
    for item in items {
        let m = item.as_object().ok_or_else(|| MappingError::invalid("Each mapping must be an object"))?;

        let source_header = m
            .get("sourceHeader")
            .and_then(Value::as_str)
            .filter(|s| header_set.contains(s))
            .ok_or_else(|| MappingError::invalid("mapping.sourceHeader must be one of the provided headers"))?
            .to_string();

        let target_field = match m.get("targetField") {
            Some(Value::Null) => None,
            Some(Value::String(s)) if canonical.contains(s.as_str()) => Some(s.clone()),
            _ => return Err(MappingError::invalid("mapping.targetField must be null or a valid canonical key")),
        };

        let confidence = m
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite() && (0.0..=1.0).contains(c))
            .ok_or_else(|| MappingError::invalid("mapping.confidence must be a number between 0 and 1"))?;

        let aliases = m
            .get("aliases")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .filter(|a| header_set.contains(a) && *a != source_header)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        mappings.push(HeaderMapping {
            source_header,
            target_field,
            confidence,
            is_primary: m.get("isPrimary").map(is_truthy).unwrap_or(false),
            aliases,
            reason: m.get("reason").and_then(Value::as_str).unwrap_or_default().to_string(),
        });
    }

    let version = obj.get("version").and_then(Value::as_str).unwrap_or("1.0").to_string();
    Ok(HeaderMappingResult { version, mappings })
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// `canonicalField -> sourceHeader` for primary mappings with a target. Later entries for the
/// same field overwrite earlier ones.
pub fn mapping_to_dictionary(result: &HeaderMappingResult) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for m in &result.mappings {
        if let (true, Some(target)) = (m.is_primary, m.target_field.as_ref()) {
            out.insert(target.clone(), m.source_header.clone());
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AiHeaderMapping {
    pub raw: Option<HeaderMappingResult>,
    pub dictionary: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MappingError>,
}

impl AiHeaderMapping {
    fn failed(error: MappingError) -> Self {
        Self { raw: None, dictionary: BTreeMap::new(), error: Some(error) }
    }
}

/// Asks the chat model for a header mapping. Never fails: any problem comes back as an empty
/// dictionary plus an error value so ingestion can continue on heuristics alone.
pub async fn map_headers_with_ai(
    client: &dyn ChatClient,
    headers: &[String],
    sample_rows: &[Value],
) -> AiHeaderMapping {
    let prompt = match build_header_mapping_prompt(headers, sample_rows) {
        Ok(p) => p,
        Err(e) => return AiHeaderMapping::failed(MappingError::invalid(e.to_string())),
    };
    tracing::info!(
        header_count = headers.len(),
        sample_rows = sample_rows.len().min(MAX_SAMPLE_ROWS),
        "Requesting AI header mapping"
    );

    let request = ChatRequest { system: prompt.system, user: prompt.user, temperature: 0.0 };
    let response = match client.chat(request).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "AI header mapping request failed");
            return AiHeaderMapping::failed(MappingError {
                code: MappingErrorCode::AiRequestFailed,
                message: e.to_string(),
            });
        }
    };

    match parse_header_mapping_response(&response.text, headers) {
        Ok(result) => {
            let dictionary = mapping_to_dictionary(&result);
            tracing::info!(mapped_fields = dictionary.len(), "AI header mapping accepted");
            AiHeaderMapping { raw: Some(result), dictionary, error: None }
        }
        Err(err) => {
            tracing::warn!(code = ?err.code, message = %err.message, "Failed to parse AI header mapping response");
            AiHeaderMapping::failed(err)
        }
    }
}
