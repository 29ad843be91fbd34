use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::models::*;
use crate::tracking::{failure_fields, StatusTracker};

const STATUS_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusFile {
    version: u32,
    #[serde(default)]
    files: BTreeMap<String, FileIngestionStatus>,
}

impl Default for StatusFile {
    fn default() -> Self {
        Self { version: STATUS_FILE_VERSION, files: BTreeMap::new() }
    }
}

/// Status records in one JSON file, rewritten through `<file>.tmp` + rename so a crash never
/// leaves a torn file behind.
pub struct LocalJsonStatusTracker {
    path: PathBuf,
    // serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl LocalJsonStatusTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tracker_err(&self, action: &str, e: impl std::fmt::Display) -> IngestionError {
        IngestionError::Tracker(format!("{} {}: {}", action, self.path.display(), e))
    }

    async fn read(&self) -> Result<StatusFile> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StatusFile::default()),
            Err(e) => return Err(self.tracker_err("cannot read", e)),
        };
        if raw.trim().is_empty() {
            return Ok(StatusFile::default());
        }
        serde_json::from_str(&raw).map_err(|e| self.tracker_err("corrupt status file", e))
    }

    async fn write(&self, data: &StatusFile) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let body = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&tmp, body).await.map_err(|e| self.tracker_err("cannot write", e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.tracker_err("cannot replace", e))?;
        Ok(())
    }

    async fn update<F>(&self, file_path: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut FileIngestionStatus) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut data = self.read().await?;
        let record = data
            .files
            .entry(file_path.to_string())
            .or_insert_with(|| FileIngestionStatus::pending(file_path));
        f(record);
        self.write(&data).await
    }
}

#[async_trait]
impl StatusTracker for LocalJsonStatusTracker {
    async fn ensure_ready(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| self.tracker_err("cannot create directory for", e))?;
        }
        let _guard = self.lock.lock().await;
        if tokio::fs::metadata(&self.path).await.is_err() {
            self.write(&StatusFile::default()).await?;
        }
        Ok(())
    }

    async fn seed_pending(&self, file_paths: &[String]) -> Result<()> {
        if file_paths.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut data = self.read().await?;
        for p in file_paths {
            data.files.entry(p.clone()).or_insert_with(|| FileIngestionStatus::pending(p));
        }
        self.write(&data).await
    }

    async fn get_status(&self, file_path: &str) -> Result<Option<FileStatus>> {
        Ok(self.get_record(file_path).await?.map(|r| r.status))
    }

    async fn get_record(&self, file_path: &str) -> Result<Option<FileIngestionStatus>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.files.remove(file_path))
    }

    async fn mark_processing(&self, file_path: &str) -> Result<()> {
        self.update(file_path, |r| r.begin_attempt()).await
    }

    async fn mark_processed(&self, file_path: &str, processed_rows: u64, persisted: u64) -> Result<()> {
        self.update(file_path, |r| r.complete(processed_rows, persisted)).await
    }

    async fn mark_failed(&self, file_path: &str, error: &IngestionError) -> Result<()> {
        let (message, stack) = failure_fields(error);
        self.update(file_path, move |r| r.fail(message, stack)).await
    }
}
