pub mod csv;
pub mod header;
pub mod xlsx;

pub use header::*;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::*;

/// Events buffered between the blocking parser and the async consumer.
pub const ROW_CHANNEL_CAPACITY: usize = 256;

/// Spreadsheet extensions picked up by directory discovery.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "csv", "tsv"];

#[derive(Debug, Clone, PartialEq)]
pub enum RowEvent {
    Header {
        sheet_name: String,
        header: Arc<[String]>,
    },
    Row {
        sheet_name: String,
        row_number: u32,
        record: RowRecord,
    },
}

/// One data row keyed by the (de-duplicated) header of its sheet, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    header: Arc<[String]>,
    values: Vec<Value>,
}

impl RowRecord {
    /// Pads or truncates `values` to the header width.
    pub fn new(header: Arc<[String]>, mut values: Vec<Value>) -> Self {
        values.resize(header.len(), Value::Null);
        Self { header, values }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.header.iter().position(|h| h == name).and_then(|i| self.values.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.header.iter().map(String::as_str).zip(self.values.iter())
    }

    pub fn to_json(&self) -> Value {
        let map: serde_json::Map<String, Value> =
            self.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        Value::Object(map)
    }

    /// Ordered BSON rendering used for `meta.raw`.
    pub fn to_document(&self) -> Result<bson::Document> {
        let mut doc = bson::Document::new();
        for (k, v) in self.iter() {
            doc.insert(k, bson::to_bson(v)?);
        }
        Ok(doc)
    }
}

/// Lazy, single-pass sequence of header/row events for one opened file.
///
/// A producer (usually a blocking parser task) feeds a bounded channel; dropping the stream
/// stops the producer at its next send. Re-reading requires opening the file again.
pub struct RowStream {
    rx: mpsc::Receiver<Result<RowEvent>>,
}

/// Producer half of a [`RowStream`].
#[derive(Clone)]
pub struct RowSender {
    tx: mpsc::Sender<Result<RowEvent>>,
}

impl RowSender {
    /// Blocks until there is room in the channel. Returns `false` once the consumer is gone.
    pub fn send_blocking(&self, item: Result<RowEvent>) -> bool {
        self.tx.blocking_send(item).is_ok()
    }

    pub async fn send(&self, item: Result<RowEvent>) -> bool {
        self.tx.send(item).await.is_ok()
    }
}

impl RowStream {
    pub fn channel(capacity: usize) -> (RowSender, RowStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (RowSender { tx }, RowStream { rx })
    }

    /// Stream over pre-built events; mostly useful for tests and previews.
    pub fn from_events(events: Vec<Result<RowEvent>>) -> RowStream {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for ev in events {
            // capacity equals the event count, so try_send cannot fail on space
            let _ = tx.try_send(ev);
        }
        RowStream { rx }
    }

    pub async fn next_event(&mut self) -> Option<Result<RowEvent>> {
        self.rx.recv().await
    }
}

impl Stream for RowStream {
    type Item = Result<RowEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Runs a blocking parser that feeds `tx`. If the parser panics or is cancelled, the consumer
/// receives a `Parse` error instead of a silently truncated stream.
pub(crate) fn spawn_producer<F>(tx: RowSender, file_label: String, produce: F)
where
    F: FnOnce(&RowSender) + Send + 'static,
{
    let failure_tx = tx.clone();
    let handle = tokio::task::spawn_blocking(move || produce(&tx));
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            tracing::error!(file_path = %file_label, error = %e, "Row producer aborted");
            failure_tx
                .send(Err(IngestionError::Parse(format!("reading {} aborted: {}", file_label, e))))
                .await;
        }
    });
}

/// Opens spreadsheet files as row streams.
#[async_trait]
pub trait SpreadsheetReader: Send + Sync {
    /// Fails before yielding anything when the file is missing, unreadable, of an unsupported
    /// format, or has no sheet named `sheet_name`.
    async fn open(&self, path: &Path, sheet_name: Option<&str>) -> Result<RowStream>;
}

/// Dispatches on file extension to the streaming xlsx or csv/tsv parser.
#[derive(Debug, Clone, Default)]
pub struct FileSpreadsheetReader;

impl FileSpreadsheetReader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SpreadsheetReader for FileSpreadsheetReader {
    async fn open(&self, path: &Path, sheet_name: Option<&str>) -> Result<RowStream> {
        match extension_of(path).as_deref() {
            Some("xlsx") | Some("xlsm") => xlsx::open(path, sheet_name).await,
            Some("csv") => csv::open(path, b',').await,
            Some("tsv") => csv::open(path, b'\t').await,
            other => Err(IngestionError::Input(format!(
                "unsupported spreadsheet format {:?} for {}",
                other.unwrap_or(""),
                path.display()
            ))),
        }
    }
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_supported_spreadsheet(path: &Path) -> bool {
    extension_of(path)
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn header(names: &[&str]) -> Arc<[String]> {
        names.iter().map(|s| s.to_string()).collect::<Vec<_>>().into()
    }

    #[test]
    fn record_pads_and_truncates_to_header() {
        let h = header(&["a", "b", "c"]);
        let short = RowRecord::new(h.clone(), vec![json!(1)]);
        assert_eq!(short.len(), 3);
        assert_eq!(short.get("c"), Some(&Value::Null));
        let long = RowRecord::new(h, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(long.len(), 3);
        assert_eq!(long.to_json(), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn record_document_keeps_column_order() {
        let rec = RowRecord::new(header(&["z", "a"]), vec![json!("x"), json!(2)]);
        let doc = rec.to_document().unwrap();
        let keys: Vec<&String> = doc.keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[tokio::test]
    async fn from_events_yields_in_order_then_ends() {
        let h = header(&["a"]);
        let mut stream = RowStream::from_events(vec![
            Ok(RowEvent::Header { sheet_name: "S".into(), header: h.clone() }),
            Ok(RowEvent::Row { sheet_name: "S".into(), row_number: 2, record: RowRecord::new(h, vec![json!(1)]) }),
        ]);
        assert!(matches!(stream.next().await, Some(Ok(RowEvent::Header { .. }))));
        assert!(matches!(stream.next().await, Some(Ok(RowEvent::Row { row_number: 2, .. }))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn producer_panic_ends_the_stream_with_an_error() {
        let (tx, stream) = RowStream::channel(4);
        spawn_producer(tx, "broken.xlsx".into(), |tx| {
            let h = header(&["a"]);
            tx.send_blocking(Ok(RowEvent::Header { sheet_name: "S".into(), header: h }));
            panic!("parser bug");
        });
        let events: Vec<Result<RowEvent>> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(RowEvent::Header { .. })));
        assert!(matches!(&events[1], Err(IngestionError::Parse(m)) if m.contains("broken.xlsx")));
    }

    #[tokio::test]
    async fn finished_producer_closes_the_stream_cleanly() {
        let (tx, stream) = RowStream::channel(4);
        spawn_producer(tx, "ok.csv".into(), |_| {});
        let events: Vec<Result<RowEvent>> = stream.collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn unsupported_extension_is_rejected_up_front() {
        let err = FileSpreadsheetReader::new()
            .open(Path::new("/tmp/candidates.pdf"), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IngestionError::Input(_)));
    }

    #[test]
    fn discovery_extensions_are_case_insensitive() {
        assert!(is_supported_spreadsheet(Path::new("a/B.XLSX")));
        assert!(is_supported_spreadsheet(Path::new("x.tsv")));
        assert!(!is_supported_spreadsheet(Path::new("x.xls")));
        assert!(!is_supported_spreadsheet(Path::new("noext")));
    }
}
