use mongodb::bson::{oid::ObjectId, DateTime as BsonDateTime, Document};
use serde::{Deserialize, Serialize};

/// Canonical candidate document stored in the `candidates` collection.
///
/// Documents are keyed by identity (`dedupe_key` plus the unique contact indexes),
/// never by ingestion event; re-ingesting the same person mutates the same document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub dedupe_key: String,
    pub profile: Profile,
    pub contacts: Contacts,
    pub professional: Professional,
    #[serde(default)]
    pub meta: CandidateMeta,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<BsonDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<BsonDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub full_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Contacts {
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Professional {
    pub designation: Option<String>,
    pub current_company: Option<String>,
    pub experience_years: Option<f64>,
    pub experience_text: Option<String>,
    pub specialization: Option<String>,
    pub qualification: Option<String>,
    pub stream: Option<String>,
    pub proficiency: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub location: Option<String>,
    pub preferred_location: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidateMeta {
    /// The mapped spreadsheet row (header -> cell value) the candidate was built from.
    pub raw: Option<Document>,
}

/// Provenance of one ingested row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub file_path: String,
    pub sheet_name: String,
    pub row_number: i64,
}

impl Candidate {
    pub fn primary_email(&self) -> Option<&str> {
        self.contacts.emails.first().map(String::as_str)
    }

    pub fn primary_phone(&self) -> Option<&str> {
        self.contacts.phones.first().map(String::as_str)
    }

    /// Unions `incoming` into `sources`, keeping first-seen order and skipping exact duplicates.
    pub fn merge_sources(&mut self, incoming: &[SourceRef]) {
        for src in incoming {
            if !self.sources.contains(src) {
                self.sources.push(src.clone());
            }
        }
    }
}

/// Aggregate result of a batch upsert, returned as a value rather than inferred from errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUpsertOutcome {
    pub attempted: u64,
    pub matched: u64,
    pub upserted: u64,
    pub modified: u64,
    /// Elements that hit a unique-index violation on their first write.
    pub conflicts: u64,
}

impl BulkUpsertOutcome {
    pub fn persisted(&self) -> u64 {
        self.upserted + self.modified
    }
}

/// Counters for one imported file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub file_path: String,
    pub processed_rows: u64,
    pub persisted: u64,
    /// Rows without a resolvable dedupe key.
    pub dropped_rows: u64,
    pub batches: u64,
    pub conflicts: u64,
}
