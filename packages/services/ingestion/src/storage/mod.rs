pub mod memory;
pub mod mongo;

pub use memory::*;
pub use mongo::*;

use std::sync::Arc;

use async_trait::async_trait;
use mongodb::Database;

use crate::models::*;

/// Identity-keyed candidate persistence.
#[async_trait]
pub trait CandidateRepository: Send + Sync {
    /// Creates the unique identity indexes and secondary search indexes.
    async fn ensure_indexes(&self) -> Result<()>;

    /// Upserts one candidate and returns the stored document. A unique-index race is resolved by
    /// returning the document that already owns the identity.
    async fn upsert_one(&self, candidate: &Candidate) -> Result<Candidate>;

    /// Unordered batch upsert. Duplicate-key conflicts are reported in the outcome, never as
    /// an error.
    async fn upsert_many(&self, candidates: &[Candidate]) -> Result<BulkUpsertOutcome>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Candidate>>;

    async fn count(&self) -> Result<u64>;

    /// Most recently updated first.
    async fn list(&self, skip: u64, limit: i64) -> Result<Vec<Candidate>>;
}

/// Mongo-backed repository when a database is available, in-memory otherwise (dry runs).
pub fn create_candidate_repository(db: Option<&Database>, collection: &str) -> Arc<dyn CandidateRepository> {
    match db {
        Some(db) => Arc::new(MongoCandidateRepository::new(db, collection)),
        None => Arc::new(InMemoryCandidateRepository::new()),
    }
}

pub(crate) fn require_dedupe_key(candidate: &Candidate) -> Result<()> {
    if candidate.dedupe_key.trim().is_empty() {
        return Err(IngestionError::InvalidInput("candidate.dedupeKey is required".to_string()));
    }
    Ok(())
}
