use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Processed => "processed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "processing" => Some(FileStatus::Processing),
            "processed" => Some(FileStatus::Processed),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resumable per-file ingestion state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileIngestionStatus {
    pub file_path: String,
    pub status: FileStatus,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_rows: Option<u64>,
    #[serde(default)]
    pub persisted: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_stack: Option<String>,
}

impl FileIngestionStatus {
    pub fn pending(file_path: &str) -> Self {
        let now = Utc::now();
        Self {
            file_path: file_path.to_string(),
            status: FileStatus::Pending,
            attempts: 0,
            created_at: Some(now),
            started_at: None,
            finished_at: None,
            updated_at: Some(now),
            processed_rows: None,
            persisted: None,
            error_message: None,
            error_stack: None,
        }
    }

    pub fn begin_attempt(&mut self) {
        let now = Utc::now();
        self.status = FileStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = Some(now);
    }

    pub fn complete(&mut self, processed_rows: u64, persisted: u64) {
        let now = Utc::now();
        self.status = FileStatus::Processed;
        self.processed_rows = Some(processed_rows);
        self.persisted = Some(persisted);
        self.finished_at = Some(now);
        self.updated_at = Some(now);
        self.error_message = None;
        self.error_stack = None;
    }

    pub fn fail(&mut self, message: String, stack: Option<String>) {
        let now = Utc::now();
        self.status = FileStatus::Failed;
        self.finished_at = Some(now);
        self.updated_at = Some(now);
        self.error_message = Some(message);
        self.error_stack = stack;
    }
}
