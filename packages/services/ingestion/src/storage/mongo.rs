use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{self, doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};

use crate::models::*;
use crate::storage::{require_dedupe_key, CandidateRepository};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Upper bound on statements per `update` command; larger batches are split.
const MAX_STATEMENTS_PER_COMMAND: usize = 1000;

const SECONDARY_INDEX_FIELDS: &[&str] = &[
    "professional.skills",
    "professional.location",
    "professional.preferredLocation",
    "professional.designation",
    "professional.currentCompany",
    "professional.specialization",
    "professional.experienceYears",
    "professional.stream",
    "professional.proficiency",
];

#[derive(Clone)]
pub struct MongoCandidateRepository {
    db: Database,
    collection_name: String,
    collection: Collection<Candidate>,
}

/// Detects unique-index violations regardless of which driver error shape carries them.
pub fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    let by_code = match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY_CODE,
        ErrorKind::Command(ce) => ce.code == DUPLICATE_KEY_CODE,
        ErrorKind::BulkWrite(bw) => bw
            .write_errors
            .as_ref()
            .map(|errs| errs.iter().any(|e| e.code == DUPLICATE_KEY_CODE))
            .unwrap_or(false),
        _ => false,
    };
    if by_code {
        return true;
    }
    let msg = err.to_string();
    msg.contains("E11000") || msg.to_lowercase().contains("duplicate key")
}

/// Email first, then phone, then the dedupe key.
pub fn identity_filter(candidate: &Candidate) -> Document {
    if let Some(email) = candidate.primary_email() {
        return doc! { "contacts.emails": email };
    }
    if let Some(phone) = candidate.primary_phone() {
        return doc! { "contacts.phones": phone };
    }
    doc! { "dedupeKey": candidate.dedupe_key.as_str() }
}

/// Scalars are last-write-wins; `sources` grows by set union; `createdAt` is set once.
pub fn upsert_update(candidate: &Candidate, now: BsonDateTime) -> Result<Document> {
    let sources = bson::to_bson(&candidate.sources)?;
    Ok(doc! {
        "$set": {
            "dedupeKey": candidate.dedupe_key.as_str(),
            "profile": bson::to_bson(&candidate.profile)?,
            "contacts": bson::to_bson(&candidate.contacts)?,
            "professional": bson::to_bson(&candidate.professional)?,
            "meta": bson::to_bson(&candidate.meta)?,
            "updatedAt": now,
        },
        "$setOnInsert": { "createdAt": now },
        "$addToSet": { "sources": { "$each": sources } },
    })
}

fn count_field(reply: &Document, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) if *n >= 0.0 => *n as u64,
        _ => 0,
    }
}

/// Parsed reply of one `update` command.
#[derive(Debug, Default)]
struct UpdateReply {
    matched: u64,
    upserted: u64,
    modified: u64,
    /// Statement indices (within the command) that hit a duplicate key.
    conflicts: Vec<usize>,
}

fn parse_update_reply(reply: &Document) -> Result<UpdateReply> {
    let n = count_field(reply, "n");
    let upserted = reply.get_array("upserted").map(|a| a.len() as u64).unwrap_or(0);
    let modified = count_field(reply, "nModified");

    let mut conflicts = Vec::new();
    if let Ok(errors) = reply.get_array("writeErrors") {
        for err in errors {
            let Some(err) = err.as_document() else { continue };
            let code = match err.get("code") {
                Some(Bson::Int32(c)) => *c as i64,
                Some(Bson::Int64(c)) => *c,
                _ => 0,
            };
            let index = count_field(err, "index") as usize;
            if code == DUPLICATE_KEY_CODE as i64 {
                conflicts.push(index);
            } else {
                let msg = err.get_str("errmsg").unwrap_or("unknown write error");
                return Err(IngestionError::Persistence(format!(
                    "bulk upsert statement {} failed with code {}: {}",
                    index, code, msg
                )));
            }
        }
    }
    if let Ok(wce) = reply.get_document("writeConcernError") {
        return Err(IngestionError::Persistence(format!("write concern error: {}", wce)));
    }

    Ok(UpdateReply { matched: n.saturating_sub(upserted), upserted, modified, conflicts })
}

impl MongoCandidateRepository {
    pub fn new(db: &Database, collection_name: &str) -> Self {
        Self {
            db: db.clone(),
            collection_name: collection_name.to_string(),
            collection: db.collection(collection_name),
        }
    }

    fn validator() -> Document {
        doc! {
            "$jsonSchema": {
                "bsonType": "object",
                "required": ["dedupeKey", "profile", "contacts", "professional", "createdAt", "updatedAt"],
                "additionalProperties": true,
                "properties": {
                    "dedupeKey": { "bsonType": "string" },
                    "profile": {
                        "bsonType": "object",
                        "properties": { "fullName": { "bsonType": ["string", "null"] } }
                    },
                    "contacts": {
                        "bsonType": "object",
                        "properties": {
                            "emails": { "bsonType": "array", "items": { "bsonType": "string" } },
                            "phones": { "bsonType": "array", "items": { "bsonType": "string" } }
                        }
                    },
                    "professional": {
                        "bsonType": "object",
                        "properties": {
                            "designation": { "bsonType": ["string", "null"] },
                            "currentCompany": { "bsonType": ["string", "null"] },
                            "experienceYears": { "bsonType": ["number", "null"] },
                            "skills": { "bsonType": "array", "items": { "bsonType": "string" } },
                            "location": { "bsonType": ["string", "null"] }
                        }
                    },
                    "sources": {
                        "bsonType": "array",
                        "items": {
                            "bsonType": "object",
                            "properties": {
                                "filePath": { "bsonType": "string" },
                                "sheetName": { "bsonType": "string" },
                                "rowNumber": { "bsonType": "number" }
                            }
                        }
                    },
                    "createdAt": { "bsonType": "date" },
                    "updatedAt": { "bsonType": "date" }
                }
            }
        }
    }

    /// Creates the collection with a moderate JSON-schema validator, or attaches the validator to
    /// an existing collection.
    async fn ensure_collection(&self) -> Result<()> {
        let existing = self
            .db
            .list_collection_names(doc! { "name": self.collection_name.as_str() })
            .await?;
        let command = if existing.is_empty() {
            doc! { "create": self.collection_name.as_str(), "validator": Self::validator(), "validationLevel": "moderate" }
        } else {
            doc! { "collMod": self.collection_name.as_str(), "validator": Self::validator(), "validationLevel": "moderate" }
        };
        self.db.run_command(command, None).await?;
        Ok(())
    }

    async fn find_by_identity(&self, candidate: &Candidate) -> Result<Option<Candidate>> {
        if let Some(email) = candidate.primary_email() {
            if let Some(found) = self.collection.find_one(doc! { "contacts.emails": email }, None).await? {
                return Ok(Some(found));
            }
        }
        if let Some(phone) = candidate.primary_phone() {
            if let Some(found) = self.collection.find_one(doc! { "contacts.phones": phone }, None).await? {
                return Ok(Some(found));
            }
        }
        Ok(self.collection.find_one(doc! { "dedupeKey": candidate.dedupe_key.as_str() }, None).await?)
    }

    /// Returns the stored document and whether this call's update was applied.
    async fn upsert_one_tracked(&self, candidate: &Candidate) -> Result<(Candidate, bool)> {
        require_dedupe_key(candidate)?;
        let filter = identity_filter(candidate);
        let update = upsert_update(candidate, BsonDateTime::now())?;
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        match self.collection.find_one_and_update(filter, update, options).await {
            Ok(Some(stored)) => Ok((stored, true)),
            Ok(None) => Err(IngestionError::Persistence(format!(
                "upsert of {} returned no document",
                candidate.dedupe_key
            ))),
            Err(e) if is_duplicate_key_error(&e) => {
                tracing::warn!(dedupe_key = %candidate.dedupe_key, "Unique index conflict on upsert; re-reading existing candidate");
                match self.find_by_identity(candidate).await? {
                    Some(existing) => Ok((existing, false)),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CandidateRepository for MongoCandidateRepository {
    async fn ensure_indexes(&self) -> Result<()> {
        self.ensure_collection().await?;

        let unique_partial = |keys: Document, partial: Document| {
            IndexModel::builder()
                .keys(keys)
                .options(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(partial)
                        .build(),
                )
                .build()
        };
        self.collection
            .create_index(unique_partial(doc! { "dedupeKey": 1 }, doc! { "dedupeKey": { "$type": "string" } }), None)
            .await?;
        self.collection
            .create_index(
                unique_partial(doc! { "contacts.emails": 1 }, doc! { "contacts.emails.0": { "$exists": true } }),
                None,
            )
            .await?;
        self.collection
            .create_index(
                unique_partial(doc! { "contacts.phones": 1 }, doc! { "contacts.phones.0": { "$exists": true } }),
                None,
            )
            .await?;

        for field in SECONDARY_INDEX_FIELDS {
            let mut keys = Document::new();
            keys.insert(*field, 1);
            self.collection.create_index(IndexModel::builder().keys(keys).build(), None).await?;
        }
        self.collection
            .create_index(IndexModel::builder().keys(doc! { "updatedAt": -1 }).build(), None)
            .await?;

        tracing::info!(collection = %self.collection_name, "Candidate indexes ensured");
        Ok(())
    }

    async fn upsert_one(&self, candidate: &Candidate) -> Result<Candidate> {
        self.upsert_one_tracked(candidate).await.map(|(stored, _)| stored)
    }

    async fn upsert_many(&self, candidates: &[Candidate]) -> Result<BulkUpsertOutcome> {
        let eligible: Vec<&Candidate> = candidates.iter().filter(|c| !c.dedupe_key.trim().is_empty()).collect();
        let mut outcome = BulkUpsertOutcome { attempted: eligible.len() as u64, ..Default::default() };
        if eligible.is_empty() {
            return Ok(outcome);
        }

        let now = BsonDateTime::now();
        let mut conflicted: Vec<&Candidate> = Vec::new();
        for chunk in eligible.chunks(MAX_STATEMENTS_PER_COMMAND) {
            let mut updates = Vec::with_capacity(chunk.len());
            for c in chunk {
                updates.push(Bson::Document(doc! {
                    "q": identity_filter(c),
                    "u": upsert_update(c, now)?,
                    "upsert": true,
                    "multi": false,
                }));
            }
            let command = doc! { "update": self.collection_name.as_str(), "updates": updates, "ordered": false };
            let reply = self.db.run_command(command, None).await?;
            let parsed = parse_update_reply(&reply)?;

            outcome.matched += parsed.matched;
            outcome.upserted += parsed.upserted;
            outcome.modified += parsed.modified;
            for idx in parsed.conflicts {
                if let Some(c) = chunk.get(idx) {
                    conflicted.push(*c);
                }
            }
        }

        outcome.conflicts = conflicted.len() as u64;
        for c in conflicted {
            // one retry: the competing write has committed, so the identity filter now matches
            let (_, applied) = self.upsert_one_tracked(c).await?;
            if applied {
                outcome.modified += 1;
            }
        }

        tracing::info!(
            collection = %self.collection_name,
            attempted = outcome.attempted,
            matched = outcome.matched,
            upserted = outcome.upserted,
            modified = outcome.modified,
            conflicts = outcome.conflicts,
            "Mongo bulk upsert completed"
        );
        Ok(outcome)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Candidate>> {
        let email = email.trim().to_lowercase();
        Ok(self.collection.find_one(doc! { "contacts.emails": email }, None).await?)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.collection.count_documents(doc! {}, None).await?)
    }

    async fn list(&self, skip: u64, limit: i64) -> Result<Vec<Candidate>> {
        let options = FindOptions::builder()
            .sort(doc! { "updatedAt": -1 })
            .skip(skip)
            .limit(limit)
            .build();
        let mut cursor = self.collection.find(doc! {}, options).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.next().await {
            out.push(doc?);
        }
        Ok(out)
    }
}
