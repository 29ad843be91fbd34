use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::handlers::is_supported_spreadsheet;
use crate::models::*;
use crate::storage::CandidateRepository;
use crate::sync::{FileImporter, ImportOptions};
use crate::tracking::StatusTracker;

pub const MIN_RETRY_BASE_MS: u64 = 50;
pub const MAX_BACKOFF_MS: u64 = 60_000;
const MAX_JITTER_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Explicit file paths, processed before anything discovered under `dir`.
    pub files: Vec<String>,
    pub dir: Option<PathBuf>,
    pub import: ImportOptions,
    /// Skip files whose tracked status is already `processed`.
    pub resume: bool,
    pub fail_fast: bool,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            dir: None,
            import: ImportOptions::default(),
            resume: true,
            fail_fast: false,
            max_retries: 2,
            retry_base_ms: 1_000,
        }
    }
}

impl RunOptions {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum FileOutcome {
    Processed { summary: ImportSummary },
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub file_path: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub files: Vec<FileReport>,
}

impl RunReport {
    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| pred(&f.outcome)).count()
    }

    pub fn processed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Processed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed { .. }))
    }

    pub fn persisted(&self) -> u64 {
        self.files
            .iter()
            .filter_map(|f| match &f.outcome {
                FileOutcome::Processed { summary } => Some(summary.persisted),
                _ => None,
            })
            .sum()
    }
}

/// Collects the files for a run: explicit paths first, then supported spreadsheets found under
/// `dir` in lexical order. Duplicates keep their first position.
pub fn discover_files(files: &[String], dir: Option<&Path>) -> Result<Vec<String>> {
    let mut out: Vec<String> = files.iter().filter(|f| !f.trim().is_empty()).cloned().collect();

    if let Some(dir) = dir {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| IngestionError::Input(format!("cannot scan {}: {}", dir.display(), e)))?;
            if entry.file_type().is_file() && is_supported_spreadsheet(entry.path()) {
                out.push(entry.path().to_string_lossy().into_owned());
            }
        }
    }

    let mut seen = HashSet::new();
    out.retain(|f| seen.insert(f.clone()));
    if out.is_empty() {
        return Err(IngestionError::InvalidInput(
            "no input files: pass --file or a --dir containing .xlsx/.csv files".to_string(),
        ));
    }
    Ok(out)
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)` plus up to
/// `min(base, 1s)` of jitter, capped at `max_ms`. `base` is floored at 50 ms.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    backoff_delay_with_jitter(attempt, base_ms, max_ms, rand::random::<f64>())
}

fn backoff_delay_with_jitter(attempt: u32, base_ms: u64, max_ms: u64, unit: f64) -> Duration {
    let base = base_ms.max(MIN_RETRY_BASE_MS);
    let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(32));
    let jitter = (unit.clamp(0.0, 1.0) * base.min(MAX_JITTER_MS) as f64).floor() as u64;
    Duration::from_millis(exp.saturating_add(jitter).min(max_ms))
}

/// Drives a run over many files: discovery, status seeding, resume, bounded retries.
pub struct IngestionOrchestrator {
    importer: Arc<dyn FileImporter>,
    repository: Arc<dyn CandidateRepository>,
    tracker: Option<Arc<dyn StatusTracker>>,
    max_backoff_ms: u64,
}

impl IngestionOrchestrator {
    pub fn new(
        importer: Arc<dyn FileImporter>,
        repository: Arc<dyn CandidateRepository>,
        tracker: Option<Arc<dyn StatusTracker>>,
    ) -> Self {
        Self { importer, repository, tracker, max_backoff_ms: MAX_BACKOFF_MS }
    }

    pub fn with_max_backoff(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    /// Processes every discovered file sequentially. With `fail_fast` the first file that
    /// exhausts its attempts aborts the run with that file's error.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("ingestion_run", run_id = %run_id);
        self.run_inner(run_id.clone(), options).instrument(span).await
    }

    async fn run_inner(&self, run_id: String, options: &RunOptions) -> Result<RunReport> {
        let started = Instant::now();
        let files = discover_files(&options.files, options.dir.as_deref())?;
        tracing::info!(file_count = files.len(), resume = options.resume, fail_fast = options.fail_fast, "Ingestion run started");

        if let Some(tracker) = &self.tracker {
            tracker.ensure_ready().await?;
            tracker.seed_pending(&files).await?;
        }
        self.repository.ensure_indexes().await?;

        let mut report = RunReport { run_id, files: Vec::with_capacity(files.len()) };
        for file_path in files {
            if options.resume && self.already_processed(&file_path).await? {
                tracing::info!(file_path = %file_path, "Skipping already processed file");
                report.files.push(FileReport { file_path, attempts: 0, outcome: FileOutcome::Skipped });
                continue;
            }

            let (attempts, result) = self.process_with_retries(&file_path, options).await;
            match result {
                Ok(summary) => report.files.push(FileReport {
                    file_path,
                    attempts,
                    outcome: FileOutcome::Processed { summary },
                }),
                Err(e) => {
                    tracing::error!(file_path = %file_path, attempts, error = %e, "File failed after all attempts");
                    if options.fail_fast {
                        return Err(e);
                    }
                    report.files.push(FileReport {
                        file_path,
                        attempts,
                        outcome: FileOutcome::Failed { error: e.to_string() },
                    });
                }
            }
        }

        tracing::info!(
            processed = report.processed(),
            skipped = report.skipped(),
            failed = report.failed(),
            persisted = report.persisted(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Ingestion run finished"
        );
        Ok(report)
    }

    async fn already_processed(&self, file_path: &str) -> Result<bool> {
        match &self.tracker {
            Some(t) => Ok(t.get_status(file_path).await? == Some(FileStatus::Processed)),
            None => Ok(false),
        }
    }

    async fn process_with_retries(&self, file_path: &str, options: &RunOptions) -> (u32, Result<ImportSummary>) {
        let max_attempts = options.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_once(file_path, &options.import).await {
                Ok(summary) => return (attempt, Ok(summary)),
                Err(e) => {
                    if let Some(tracker) = &self.tracker {
                        if let Err(te) = tracker.mark_failed(file_path, &e).await {
                            tracing::warn!(file_path = %file_path, error = %te, "Failed to record file failure");
                        }
                    }
                    if attempt >= max_attempts {
                        return (attempt, Err(e));
                    }
                    let delay = backoff_delay(attempt, options.retry_base_ms, self.max_backoff_ms);
                    tracing::warn!(
                        file_path = %file_path,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Import attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt_once(&self, file_path: &str, import: &ImportOptions) -> Result<ImportSummary> {
        if let Some(tracker) = &self.tracker {
            tracker.mark_processing(file_path).await?;
        }
        let summary = self.importer.import_file(file_path, import).await?;
        if let Some(tracker) = &self.tracker {
            tracker.mark_processed(file_path, summary.processed_rows, summary.persisted).await?;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryCandidateRepository;
    use crate::tracking::LocalJsonStatusTracker;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fails each path a configured number of times before succeeding.
    #[derive(Default)]
    struct FlakyImporter {
        failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
    }

    impl FlakyImporter {
        fn failing(path: &str, times: u32) -> Self {
            let me = Self::default();
            me.failures.lock().unwrap().insert(path.to_string(), times);
            me
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FileImporter for FlakyImporter {
        async fn import_file(&self, file_path: &str, _options: &ImportOptions) -> Result<ImportSummary> {
            self.calls.lock().unwrap().push(file_path.to_string());
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(file_path) {
                if *left > 0 {
                    *left -= 1;
                    return Err(IngestionError::Parse(format!("boom in {}", file_path)));
                }
            }
            Ok(ImportSummary { file_path: file_path.to_string(), processed_rows: 3, persisted: 2, ..Default::default() })
        }
    }

    fn options(files: &[&str]) -> RunOptions {
        RunOptions {
            files: files.iter().map(|s| s.to_string()).collect(),
            retry_base_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay_with_jitter(1, 1000, 60_000, 0.0), Duration::from_millis(1000));
        assert_eq!(backoff_delay_with_jitter(2, 1000, 60_000, 0.0), Duration::from_millis(2000));
        assert_eq!(backoff_delay_with_jitter(3, 1000, 60_000, 0.5), Duration::from_millis(4500));
        assert_eq!(backoff_delay_with_jitter(10, 1000, 60_000, 0.9), Duration::from_millis(60_000));
        // base floored at 50ms; jitter bounded by base
        assert_eq!(backoff_delay_with_jitter(1, 0, 60_000, 0.999), Duration::from_millis(99));
        assert!(backoff_delay(40, 5000, 60_000) <= Duration::from_millis(60_000));
    }

    #[test]
    fn discovery_orders_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "a.XLSX", "notes.txt", "c.tsv"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("d.csv"), b"x").unwrap();

        let explicit = dir.path().join("b.csv").to_string_lossy().into_owned();
        let found = discover_files(&[explicit.clone()], Some(dir.path())).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| Path::new(p).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.csv", "a.XLSX", "c.tsv", "d.csv"]);
        assert_eq!(found[0], explicit);
    }

    #[test]
    fn discovery_of_nothing_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(discover_files(&[], Some(dir.path())), Err(IngestionError::InvalidInput(_))));
        assert!(matches!(discover_files(&[], None), Err(IngestionError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn retries_until_success_and_records_status() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(LocalJsonStatusTracker::new(dir.path().join("status.json")));
        let importer = Arc::new(FlakyImporter::failing("a.csv", 1));
        let orch = IngestionOrchestrator::new(importer.clone(), Arc::new(InMemoryCandidateRepository::new()), Some(tracker.clone() as Arc<dyn StatusTracker>));

        let report = orch.run(&options(&["a.csv"])).await.unwrap();
        assert_eq!(report.processed(), 1);
        assert_eq!(report.files[0].attempts, 2);
        let record = tracker.get_record("a.csv").await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Processed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.persisted, Some(2));
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn exhausted_file_is_failed_and_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(LocalJsonStatusTracker::new(dir.path().join("status.json")));
        let importer = Arc::new(FlakyImporter::failing("bad.csv", 10));
        let orch = IngestionOrchestrator::new(importer.clone(), Arc::new(InMemoryCandidateRepository::new()), Some(tracker.clone() as Arc<dyn StatusTracker>));

        let report = orch.run(&options(&["bad.csv", "good.csv"])).await.unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(report.processed(), 1);
        assert_eq!(report.files[0].attempts, 3);
        let record = tracker.get_record("bad.csv").await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.error_message.as_deref().unwrap_or("").contains("boom"));
    }

    #[tokio::test]
    async fn fail_fast_stops_the_run() {
        let importer = Arc::new(FlakyImporter::failing("bad.csv", 10));
        let orch = IngestionOrchestrator::new(importer.clone(), Arc::new(InMemoryCandidateRepository::new()), None);
        let opts = RunOptions { fail_fast: true, max_retries: 0, ..options(&["bad.csv", "good.csv"]) };
        let err = orch.run(&opts).await.unwrap_err();
        assert!(matches!(err, IngestionError::Parse(_)));
        assert_eq!(importer.calls(), vec!["bad.csv"]);
    }

    #[tokio::test]
    async fn resume_skips_processed_files() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(LocalJsonStatusTracker::new(dir.path().join("status.json")));
        let importer = Arc::new(FlakyImporter::default());
        let orch = IngestionOrchestrator::new(importer.clone(), Arc::new(InMemoryCandidateRepository::new()), Some(tracker as Arc<dyn StatusTracker>));

        orch.run(&options(&["a.csv"])).await.unwrap();
        let second = orch.run(&options(&["a.csv", "b.csv"])).await.unwrap();
        assert_eq!(second.skipped(), 1);
        assert_eq!(second.processed(), 1);
        assert_eq!(importer.calls(), vec!["a.csv", "b.csv"]);

        let no_resume = RunOptions { resume: false, ..options(&["a.csv"]) };
        orch.run(&no_resume).await.unwrap();
        assert_eq!(importer.calls().len(), 3);
    }

    #[tokio::test]
    async fn without_tracker_nothing_is_skipped() {
        let importer = Arc::new(FlakyImporter::default());
        let orch = IngestionOrchestrator::new(importer.clone(), Arc::new(InMemoryCandidateRepository::new()), None);
        orch.run(&options(&["a.csv"])).await.unwrap();
        let report = orch.run(&options(&["a.csv"])).await.unwrap();
        assert_eq!(report.skipped(), 0);
        assert_eq!(importer.calls().len(), 2);
    }
}
