use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::options::{IndexOptions, UpdateOptions};
use mongodb::{Collection, Database, IndexModel};

use crate::models::*;
use crate::tracking::{failure_fields, StatusTracker};

/// Status records in the `ingestion_files` collection, one document per file path.
#[derive(Clone)]
pub struct MongoStatusTracker {
    db: Database,
    collection_name: String,
    collection: Collection<Document>,
}

fn chrono_field(doc: &Document, key: &str) -> Option<DateTime<Utc>> {
    doc.get_datetime(key).ok().map(|d| d.to_chrono())
}

fn count_field(doc: &Document, key: &str) -> Option<u64> {
    match doc.get(key) {
        Some(Bson::Int32(n)) => Some((*n).max(0) as u64),
        Some(Bson::Int64(n)) => Some((*n).max(0) as u64),
        Some(Bson::Double(n)) if *n >= 0.0 => Some(*n as u64),
        _ => None,
    }
}

/// Reads a stored status document; unknown status strings are rejected.
pub fn status_from_document(doc: &Document) -> Result<FileIngestionStatus> {
    let file_path = doc
        .get_str("filePath")
        .map_err(|e| IngestionError::Tracker(format!("status document without filePath: {}", e)))?
        .to_string();
    let raw_status = doc.get_str("status").unwrap_or("pending");
    let status = FileStatus::parse(raw_status)
        .ok_or_else(|| IngestionError::Tracker(format!("unknown status {:?} for {}", raw_status, file_path)))?;
    Ok(FileIngestionStatus {
        file_path,
        status,
        attempts: count_field(doc, "attempts").unwrap_or(0) as u32,
        created_at: chrono_field(doc, "createdAt"),
        started_at: chrono_field(doc, "startedAt"),
        finished_at: chrono_field(doc, "finishedAt"),
        updated_at: chrono_field(doc, "updatedAt"),
        processed_rows: count_field(doc, "processedRows"),
        persisted: count_field(doc, "persisted"),
        error_message: doc.get_str("errorMessage").ok().map(str::to_string),
        error_stack: doc.get_str("errorStack").ok().map(str::to_string),
    })
}

impl MongoStatusTracker {
    pub fn new(db: &Database, collection_name: &str) -> Self {
        Self {
            db: db.clone(),
            collection_name: collection_name.to_string(),
            collection: db.collection(collection_name),
        }
    }

    async fn transition(&self, file_path: &str, mut update: Document) -> Result<()> {
        update.insert("$setOnInsert", doc! { "filePath": file_path, "createdAt": BsonDateTime::now() });
        let options = UpdateOptions::builder().upsert(true).build();
        self.collection
            .update_one(doc! { "filePath": file_path }, update, options)
            .await
            .map_err(|e| IngestionError::Tracker(format!("status update for {} failed: {}", file_path, e)))?;
        Ok(())
    }
}

#[async_trait]
impl StatusTracker for MongoStatusTracker {
    async fn ensure_ready(&self) -> Result<()> {
        self.collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "filePath": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;
        self.collection
            .create_index(IndexModel::builder().keys(doc! { "status": 1, "updatedAt": -1 }).build(), None)
            .await?;
        tracing::debug!(collection = %self.collection_name, "Status tracker indexes ensured");
        Ok(())
    }

    async fn seed_pending(&self, file_paths: &[String]) -> Result<()> {
        if file_paths.is_empty() {
            return Ok(());
        }
        let now = BsonDateTime::now();
        let updates: Vec<Bson> = file_paths
            .iter()
            .map(|p| {
                Bson::Document(doc! {
                    "q": { "filePath": p.as_str() },
                    "u": { "$setOnInsert": {
                        "filePath": p.as_str(),
                        "status": FileStatus::Pending.as_str(),
                        "attempts": 0,
                        "createdAt": now,
                        "updatedAt": now,
                    } },
                    "upsert": true,
                    "multi": false,
                })
            })
            .collect();
        let reply = self
            .db
            .run_command(doc! { "update": self.collection_name.as_str(), "updates": updates, "ordered": false }, None)
            .await?;
        if let Ok(errors) = reply.get_array("writeErrors") {
            // concurrent seeders race on the unique filePath index; anything else is fatal
            let fatal = errors
                .iter()
                .filter_map(Bson::as_document)
                .find(|e| !matches!(e.get("code"), Some(Bson::Int32(11000))));
            if let Some(err) = fatal {
                return Err(IngestionError::Tracker(format!("seeding pending files failed: {}", err)));
            }
        }
        Ok(())
    }

    async fn get_status(&self, file_path: &str) -> Result<Option<FileStatus>> {
        let options = mongodb::options::FindOneOptions::builder()
            .projection(doc! { "status": 1 })
            .build();
        let found = self.collection.find_one(doc! { "filePath": file_path }, options).await?;
        Ok(found.and_then(|d| d.get_str("status").ok().and_then(FileStatus::parse)))
    }

    async fn get_record(&self, file_path: &str) -> Result<Option<FileIngestionStatus>> {
        match self.collection.find_one(doc! { "filePath": file_path }, None).await? {
            Some(doc) => Ok(Some(status_from_document(&doc)?)),
            None => Ok(None),
        }
    }

    async fn mark_processing(&self, file_path: &str) -> Result<()> {
        let now = BsonDateTime::now();
        self.transition(
            file_path,
            doc! {
                "$set": { "status": FileStatus::Processing.as_str(), "startedAt": now, "updatedAt": now },
                "$inc": { "attempts": 1 },
            },
        )
        .await
    }

    async fn mark_processed(&self, file_path: &str, processed_rows: u64, persisted: u64) -> Result<()> {
        let now = BsonDateTime::now();
        self.transition(
            file_path,
            doc! {
                "$set": {
                    "status": FileStatus::Processed.as_str(),
                    "processedRows": processed_rows as i64,
                    "persisted": persisted as i64,
                    "finishedAt": now,
                    "updatedAt": now,
                    "errorMessage": Bson::Null,
                    "errorStack": Bson::Null,
                },
            },
        )
        .await
    }

    async fn mark_failed(&self, file_path: &str, error: &IngestionError) -> Result<()> {
        let (message, stack) = failure_fields(error);
        let now = BsonDateTime::now();
        self.transition(
            file_path,
            doc! {
                "$set": {
                    "status": FileStatus::Failed.as_str(),
                    "finishedAt": now,
                    "updatedAt": now,
                    "errorMessage": message,
                    "errorStack": stack,
                },
            },
        )
        .await
    }
}
