use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::clients::ChatClient;
use crate::handlers::{RowEvent, RowRecord, SpreadsheetReader};
use crate::mapping::{map_headers_with_ai, FieldMapper, SchemaMapperFactory, MAX_SAMPLE_ROWS};
use crate::models::*;
use crate::processing::CandidateAssembler;
use crate::storage::CandidateRepository;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub sheet_name: Option<String>,
    pub batch_size: usize,
    /// `canonicalField -> sourceHeader` overrides applied on every header.
    pub dictionary: Option<BTreeMap<String, String>>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self { sheet_name: None, batch_size: 1000, dictionary: None }
    }
}

/// Imports one spreadsheet file into the candidate store.
#[async_trait]
pub trait FileImporter: Send + Sync {
    async fn import_file(&self, file_path: &str, options: &ImportOptions) -> Result<ImportSummary>;
}

pub struct CandidateImporter {
    reader: Arc<dyn SpreadsheetReader>,
    repository: Arc<dyn CandidateRepository>,
    assembler: CandidateAssembler,
    chat_client: Option<Arc<dyn ChatClient>>,
}

impl CandidateImporter {
    pub fn new(
        reader: Arc<dyn SpreadsheetReader>,
        repository: Arc<dyn CandidateRepository>,
        assembler: CandidateAssembler,
    ) -> Self {
        Self { reader, repository, assembler, chat_client: None }
    }

    /// Enables AI header mapping for sheets whose header exposes no identity column.
    pub fn with_ai_assist(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.chat_client = Some(client);
        self
    }
}

/// Per-file mutable state while the row stream is consumed.
struct ImportRun<'a> {
    importer: &'a CandidateImporter,
    options: &'a ImportOptions,
    batch_size: usize,
    mapper: Option<FieldMapper>,
    // rows held back until the AI mapping for the current sheet is resolved
    awaiting_ai: bool,
    held: Vec<(String, u32, RowRecord)>,
    buffer: Vec<Candidate>,
    summary: ImportSummary,
}

impl<'a> ImportRun<'a> {
    fn new(importer: &'a CandidateImporter, file_path: &str, options: &'a ImportOptions) -> Self {
        let batch_size = options.batch_size.max(1);
        Self {
            importer,
            options,
            batch_size,
            mapper: None,
            awaiting_ai: false,
            held: Vec::new(),
            buffer: Vec::with_capacity(batch_size.min(10_000)),
            summary: ImportSummary { file_path: file_path.to_string(), ..Default::default() },
        }
    }

    async fn on_header(&mut self, sheet_name: &str, header: &Arc<[String]>) -> Result<()> {
        self.resolve_ai().await?;

        let mut mapper = SchemaMapperFactory::create_for_header(header);
        if let Some(dict) = &self.options.dictionary {
            mapper.apply_dictionary(dict);
        }
        self.awaiting_ai = self.importer.chat_client.is_some() && mapper.lacks_identity_fields();
        tracing::info!(
            file_path = %self.summary.file_path,
            sheet_name = %sheet_name,
            columns = header.len(),
            mapped_fields = mapper.indices().len(),
            ai_assist = self.awaiting_ai,
            "Header detected"
        );
        self.mapper = Some(mapper);
        Ok(())
    }

    async fn on_row(&mut self, sheet_name: String, row_number: u32, record: RowRecord) -> Result<()> {
        if self.mapper.is_none() {
            return Ok(());
        }
        if self.awaiting_ai {
            self.held.push((sheet_name, row_number, record));
            if self.held.len() >= MAX_SAMPLE_ROWS {
                self.resolve_ai().await?;
            }
            return Ok(());
        }
        self.process_row(sheet_name, row_number, &record).await
    }

    /// Runs the AI mapping over the held sample rows (if any is pending) and drains them.
    async fn resolve_ai(&mut self) -> Result<()> {
        if !self.awaiting_ai {
            return Ok(());
        }
        self.awaiting_ai = false;
        if let (Some(client), Some(mapper)) = (self.importer.chat_client.as_ref(), self.mapper.as_mut()) {
            let headers = mapper.header().to_vec();
            let samples: Vec<serde_json::Value> = self.held.iter().map(|(_, _, r)| r.to_json()).collect();
            let mapping = map_headers_with_ai(client.as_ref(), &headers, &samples).await;
            match &mapping.error {
                Some(err) => tracing::warn!(
                    file_path = %self.summary.file_path,
                    code = ?err.code,
                    "AI header mapping unavailable; continuing with heuristic mapping"
                ),
                None => {
                    let applied = mapper.apply_dictionary(&mapping.dictionary);
                    tracing::info!(file_path = %self.summary.file_path, applied, "AI header mapping applied");
                }
            }
        }
        for (sheet_name, row_number, record) in std::mem::take(&mut self.held) {
            self.process_row(sheet_name, row_number, &record).await?;
        }
        Ok(())
    }

    async fn process_row(&mut self, sheet_name: String, row_number: u32, record: &RowRecord) -> Result<()> {
        let Some(mapper) = self.mapper.as_ref() else { return Ok(()) };
        self.summary.processed_rows += 1;
        let mapped = mapper.map_row(record);
        let source = SourceRef { file_path: self.summary.file_path.clone(), sheet_name, row_number: row_number as i64 };
        match self.importer.assembler.assemble(&mapped, source)? {
            Some(candidate) => {
                self.buffer.push(candidate);
                if self.buffer.len() >= self.batch_size {
                    self.flush().await?;
                }
            }
            None => {
                self.summary.dropped_rows += 1;
                tracing::debug!(file_path = %self.summary.file_path, row_number, "Row has no identity; dropped");
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let outcome = self.importer.repository.upsert_many(&self.buffer).await?;
        self.summary.batches += 1;
        self.summary.persisted += outcome.persisted();
        self.summary.conflicts += outcome.conflicts;
        tracing::info!(
            file_path = %self.summary.file_path,
            batch = self.summary.batches,
            size = self.buffer.len(),
            upserted = outcome.upserted,
            modified = outcome.modified,
            conflicts = outcome.conflicts,
            "Batch flushed"
        );
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl FileImporter for CandidateImporter {
    async fn import_file(&self, file_path: &str, options: &ImportOptions) -> Result<ImportSummary> {
        let mut stream = self.reader.open(Path::new(file_path), options.sheet_name.as_deref()).await?;
        let mut run = ImportRun::new(self, file_path, options);

        while let Some(event) = stream.next().await {
            match event? {
                RowEvent::Header { sheet_name, header } => run.on_header(&sheet_name, &header).await?,
                RowEvent::Row { sheet_name, row_number, record } => run.on_row(sheet_name, row_number, record).await?,
            }
        }
        run.resolve_ai().await?;
        run.flush().await?;
        if run.mapper.is_none() {
            return Err(IngestionError::Input(format!("no header row found in {}", file_path)));
        }

        tracing::info!(
            file_path = %run.summary.file_path,
            processed_rows = run.summary.processed_rows,
            persisted = run.summary.persisted,
            dropped_rows = run.summary.dropped_rows,
            batches = run.summary.batches,
            "Import completed"
        );
        Ok(run.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ChatRequest, ChatResponse};
    use crate::handlers::RowStream;
    use crate::processing::NormalizeOptions;
    use crate::storage::InMemoryCandidateRepository;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves a fixed event list for any path.
    struct StaticReader(Mutex<Vec<Vec<Result<RowEvent>>>>);

    impl StaticReader {
        fn once(events: Vec<Result<RowEvent>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(vec![events])))
        }
    }

    #[async_trait]
    impl SpreadsheetReader for StaticReader {
        async fn open(&self, _path: &Path, _sheet: Option<&str>) -> Result<RowStream> {
            let next = self.0.lock().unwrap().pop().unwrap_or_default();
            Ok(RowStream::from_events(next))
        }
    }

    struct CountingChat {
        calls: AtomicUsize,
        reply: String,
    }

    #[async_trait]
    impl ChatClient for CountingChat {
        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let user: Value = serde_json::from_str(&request.user).unwrap();
            assert!(user["input"]["sampleRows"].as_array().unwrap().len() <= MAX_SAMPLE_ROWS);
            Ok(ChatResponse { text: self.reply.clone() })
        }
    }

    fn header(names: &[&str]) -> Arc<[String]> {
        names.iter().map(|s| s.to_string()).collect::<Vec<_>>().into()
    }

    fn row(h: &Arc<[String]>, n: u32, values: Vec<Value>) -> Result<RowEvent> {
        Ok(RowEvent::Row { sheet_name: "S".into(), row_number: n, record: RowRecord::new(h.clone(), values) })
    }

    fn importer(reader: Arc<dyn SpreadsheetReader>, repo: Arc<InMemoryCandidateRepository>) -> CandidateImporter {
        CandidateImporter::new(reader, repo, CandidateAssembler::new(NormalizeOptions::default()))
    }

    #[tokio::test]
    async fn counts_dropped_rows_and_ignores_rows_before_header() {
        let h = header(&["Name", "Email"]);
        let events = vec![
            row(&h, 1, vec![json!("Early"), json!("early@x.io")]),
            Ok(RowEvent::Header { sheet_name: "S".into(), header: h.clone() }),
            row(&h, 2, vec![json!("Ann"), json!("ann@x.io")]),
            row(&h, 3, vec![Value::Null, json!("bad-email")]),
            row(&h, 4, vec![json!("Bob"), Value::Null]),
        ];
        let repo = Arc::new(InMemoryCandidateRepository::new());
        let summary = importer(StaticReader::once(events), repo.clone())
            .import_file("f.csv", &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.processed_rows, 3);
        assert_eq!(summary.dropped_rows, 1);
        assert_eq!(summary.persisted, 2);
        assert_eq!(summary.batches, 1);
        assert!(repo.find_by_email("early@x.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batches_flush_at_size_and_at_end() {
        let h = header(&["Email"]);
        let mut events = vec![Ok(RowEvent::Header { sheet_name: "S".into(), header: h.clone() })];
        for i in 0..7 {
            events.push(row(&h, i + 2, vec![json!(format!("u{}@x.io", i))]));
        }
        let repo = Arc::new(InMemoryCandidateRepository::new());
        let opts = ImportOptions { batch_size: 3, ..Default::default() };
        let summary = importer(StaticReader::once(events), repo.clone()).import_file("f.csv", &opts).await.unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(repo.bulk_calls(), 3);
        assert_eq!(summary.persisted, 7);
    }

    #[tokio::test]
    async fn ai_assist_maps_unknown_identity_column() {
        let h = header(&["Reach At", "Who"]);
        let mut events = vec![Ok(RowEvent::Header { sheet_name: "S".into(), header: h.clone() })];
        for i in 0..7 {
            events.push(row(&h, i + 2, vec![json!(format!("p{}@x.io", i)), json!(format!("Person {}", i))]));
        }
        let chat = Arc::new(CountingChat {
            calls: AtomicUsize::new(0),
            reply: r#"{"mappings":[
                {"sourceHeader":"Reach At","targetField":"email","confidence":0.9,"isPrimary":true},
                {"sourceHeader":"Who","targetField":"fullName","confidence":0.8,"isPrimary":true}
            ]}"#
            .to_string(),
        });
        let repo = Arc::new(InMemoryCandidateRepository::new());
        let summary = importer(StaticReader::once(events), repo.clone())
            .with_ai_assist(chat.clone())
            .import_file("f.xlsx", &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.processed_rows, 7);
        assert_eq!(summary.dropped_rows, 0);
        let c = repo.find_by_email("p0@x.io").await.unwrap().unwrap();
        assert_eq!(c.profile.full_name.as_deref(), Some("Person 0"));
        assert_eq!(c.sources[0].row_number, 2);
    }

    #[tokio::test]
    async fn ai_failure_falls_back_to_heuristics() {
        let h = header(&["Reach At"]);
        let events = vec![
            Ok(RowEvent::Header { sheet_name: "S".into(), header: h.clone() }),
            row(&h, 2, vec![json!("x@y.z")]),
        ];
        let chat = Arc::new(CountingChat { calls: AtomicUsize::new(0), reply: "no idea".into() });
        let repo = Arc::new(InMemoryCandidateRepository::new());
        let summary = importer(StaticReader::once(events), repo)
            .with_ai_assist(chat.clone())
            .import_file("f.xlsx", &ImportOptions::default())
            .await
            .unwrap();
        // fewer rows than the sample size: resolved at end of stream
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.processed_rows, 1);
        assert_eq!(summary.dropped_rows, 1);
    }

    #[tokio::test]
    async fn configured_dictionary_is_applied() {
        let h = header(&["Reach At"]);
        let events = vec![
            Ok(RowEvent::Header { sheet_name: "S".into(), header: h.clone() }),
            row(&h, 2, vec![json!("X@Y.Z")]),
        ];
        let mut dict = BTreeMap::new();
        dict.insert("email".to_string(), "Reach At".to_string());
        let opts = ImportOptions { dictionary: Some(dict), ..Default::default() };
        let repo = Arc::new(InMemoryCandidateRepository::new());
        let summary = importer(StaticReader::once(events), repo.clone()).import_file("f.csv", &opts).await.unwrap();
        assert_eq!(summary.persisted, 1);
        assert!(repo.find_by_email("x@y.z").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn file_without_header_is_an_input_error() {
        let repo = Arc::new(InMemoryCandidateRepository::new());
        let err = importer(StaticReader::once(Vec::new()), repo.clone())
            .import_file("empty.csv", &ImportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Input(ref m) if m.contains("no header row")));
        assert_eq!(repo.bulk_calls(), 0);
    }

    #[tokio::test]
    async fn mid_stream_error_aborts_the_file() {
        let h = header(&["Email"]);
        let events = vec![
            Ok(RowEvent::Header { sheet_name: "S".into(), header: h.clone() }),
            row(&h, 2, vec![json!("a@b.c")]),
            Err(IngestionError::Parse("corrupt".into())),
        ];
        let repo = Arc::new(InMemoryCandidateRepository::new());
        let err = importer(StaticReader::once(events), repo.clone())
            .import_file("f.csv", &ImportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Parse(_)));
        assert_eq!(repo.bulk_calls(), 0);
    }
}
