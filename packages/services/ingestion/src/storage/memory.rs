//! In-memory candidate store mirroring the MongoDB merge rules and unique indexes. Backs dry
//! runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use mongodb::bson::{oid::ObjectId, DateTime as BsonDateTime};

use crate::models::*;
use crate::storage::{require_dedupe_key, CandidateRepository};

#[derive(Default)]
struct State {
    docs: Vec<Candidate>,
    by_key: HashMap<String, usize>,
    by_email: HashMap<String, usize>,
    by_phone: HashMap<String, usize>,
}

enum Applied {
    Inserted(usize),
    Updated(usize),
    /// Another document already owns one of the unique values.
    Conflict,
}

impl State {
    fn locate(&self, candidate: &Candidate) -> Option<usize> {
        if let Some(email) = candidate.primary_email() {
            return self.by_email.get(email).copied();
        }
        if let Some(phone) = candidate.primary_phone() {
            return self.by_phone.get(phone).copied();
        }
        self.by_key.get(&candidate.dedupe_key).copied()
    }

    fn find_existing(&self, candidate: &Candidate) -> Option<usize> {
        candidate
            .primary_email()
            .and_then(|e| self.by_email.get(e).copied())
            .or_else(|| candidate.primary_phone().and_then(|p| self.by_phone.get(p).copied()))
            .or_else(|| self.by_key.get(&candidate.dedupe_key).copied())
    }

    fn owned_by_other(&self, candidate: &Candidate, target: Option<usize>) -> bool {
        let clash = |idx: Option<&usize>| matches!(idx, Some(i) if Some(*i) != target);
        clash(self.by_key.get(&candidate.dedupe_key))
            || candidate.contacts.emails.iter().any(|e| clash(self.by_email.get(e)))
            || candidate.contacts.phones.iter().any(|p| clash(self.by_phone.get(p)))
    }

    fn unindex(&mut self, idx: usize) {
        let doc = &self.docs[idx];
        self.by_key.remove(&doc.dedupe_key);
        for e in &doc.contacts.emails {
            self.by_email.remove(e);
        }
        for p in &doc.contacts.phones {
            self.by_phone.remove(p);
        }
    }

    fn index(&mut self, idx: usize) {
        let doc = &self.docs[idx];
        self.by_key.insert(doc.dedupe_key.clone(), idx);
        for e in &doc.contacts.emails {
            self.by_email.insert(e.clone(), idx);
        }
        for p in &doc.contacts.phones {
            self.by_phone.insert(p.clone(), idx);
        }
    }

    fn apply(&mut self, candidate: &Candidate, now: BsonDateTime) -> Applied {
        let target = self.locate(candidate);
        if self.owned_by_other(candidate, target) {
            return Applied::Conflict;
        }
        match target {
            Some(idx) => {
                self.unindex(idx);
                let doc = &mut self.docs[idx];
                doc.dedupe_key = candidate.dedupe_key.clone();
                doc.profile = candidate.profile.clone();
                doc.contacts = candidate.contacts.clone();
                doc.professional = candidate.professional.clone();
                doc.meta = candidate.meta.clone();
                doc.updated_at = Some(now);
                doc.merge_sources(&candidate.sources);
                self.index(idx);
                Applied::Updated(idx)
            }
            None => {
                let mut doc = candidate.clone();
                doc.id = Some(ObjectId::new());
                doc.sources = Vec::new();
                doc.merge_sources(&candidate.sources);
                doc.created_at = Some(now);
                doc.updated_at = Some(now);
                self.docs.push(doc);
                let idx = self.docs.len() - 1;
                self.index(idx);
                Applied::Inserted(idx)
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryCandidateRepository {
    state: Mutex<State>,
    bulk_calls: AtomicUsize,
}

impl InMemoryCandidateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `upsert_many` invocations so far.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Result<Vec<Candidate>> {
        Ok(self.lock()?.docs.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| IngestionError::Persistence("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CandidateRepository for InMemoryCandidateRepository {
    async fn ensure_indexes(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_one(&self, candidate: &Candidate) -> Result<Candidate> {
        require_dedupe_key(candidate)?;
        let mut state = self.lock()?;
        match state.apply(candidate, BsonDateTime::now()) {
            Applied::Inserted(idx) | Applied::Updated(idx) => Ok(state.docs[idx].clone()),
            Applied::Conflict => match state.find_existing(candidate) {
                Some(idx) => Ok(state.docs[idx].clone()),
                None => Err(IngestionError::Persistence(format!(
                    "E11000 duplicate key for {}",
                    candidate.dedupe_key
                ))),
            },
        }
    }

    async fn upsert_many(&self, candidates: &[Candidate]) -> Result<BulkUpsertOutcome> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let mut outcome = BulkUpsertOutcome::default();
        let mut state = self.lock()?;
        let now = BsonDateTime::now();
        for c in candidates.iter().filter(|c| !c.dedupe_key.trim().is_empty()) {
            outcome.attempted += 1;
            match state.apply(c, now) {
                Applied::Inserted(_) => outcome.upserted += 1,
                Applied::Updated(_) => {
                    outcome.matched += 1;
                    outcome.modified += 1;
                }
                Applied::Conflict => outcome.conflicts += 1,
            }
        }
        tracing::debug!(
            attempted = outcome.attempted,
            upserted = outcome.upserted,
            modified = outcome.modified,
            conflicts = outcome.conflicts,
            "In-memory bulk upsert completed"
        );
        Ok(outcome)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Candidate>> {
        let email = email.trim().to_lowercase();
        let state = self.lock()?;
        Ok(state.by_email.get(&email).map(|i| state.docs[*i].clone()))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.lock()?.docs.len() as u64)
    }

    async fn list(&self, skip: u64, limit: i64) -> Result<Vec<Candidate>> {
        let state = self.lock()?;
        let mut docs: Vec<&Candidate> = state.docs.iter().collect();
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let take = if limit <= 0 { usize::MAX } else { limit as usize };
        Ok(docs.into_iter().skip(skip as usize).take(take).cloned().collect())
    }
}
