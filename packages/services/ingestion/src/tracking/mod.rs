pub mod local;
pub mod mongo;

pub use local::*;
pub use mongo::*;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use mongodb::Database;

use crate::models::*;

/// Durable per-file ingestion state used for resume and retry bookkeeping.
///
/// Transitions on a path that was never seeded create its record.
#[async_trait]
pub trait StatusTracker: Send + Sync {
    async fn ensure_ready(&self) -> Result<()>;

    /// Creates `pending` records for paths not yet known; existing records are untouched.
    async fn seed_pending(&self, file_paths: &[String]) -> Result<()>;

    async fn get_status(&self, file_path: &str) -> Result<Option<FileStatus>>;

    async fn get_record(&self, file_path: &str) -> Result<Option<FileIngestionStatus>>;

    /// Sets `processing` and increments `attempts`.
    async fn mark_processing(&self, file_path: &str) -> Result<()>;

    /// Sets `processed` with the row counters and clears any previous error.
    async fn mark_processed(&self, file_path: &str, processed_rows: u64, persisted: u64) -> Result<()>;

    async fn mark_failed(&self, file_path: &str, error: &IngestionError) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StatusStoreKind {
    #[default]
    None,
    Local,
    Mongo,
}

/// Builds the tracker for `kind`; `None` disables status tracking (and therefore resume).
pub fn create_status_tracker(
    kind: StatusStoreKind,
    status_file: PathBuf,
    db: Option<&Database>,
    collection: &str,
) -> Result<Option<Arc<dyn StatusTracker>>> {
    match kind {
        StatusStoreKind::None => Ok(None),
        StatusStoreKind::Local => Ok(Some(Arc::new(LocalJsonStatusTracker::new(status_file)))),
        StatusStoreKind::Mongo => {
            let db = db.ok_or_else(|| {
                IngestionError::Configuration("the mongo status store needs a database connection".to_string())
            })?;
            Ok(Some(Arc::new(MongoStatusTracker::new(db, collection))))
        }
    }
}

/// Error message and cause chain as stored on failed records.
pub(crate) fn failure_fields(error: &IngestionError) -> (String, Option<String>) {
    (error.to_string(), error.source_chain())
}
