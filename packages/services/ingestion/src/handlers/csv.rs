use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::ReaderBuilder;
use serde_json::Value;

use crate::handlers::{
    has_content, normalize_header_row, spawn_producer, RowEvent, RowRecord, RowSender, RowStream, ROW_CHANNEL_CAPACITY,
};
use crate::models::*;

/// Sheet name reported for delimited text files, which have exactly one table.
pub const CSV_SHEET_NAME: &str = "csv";

/// Streams a delimited text file. The file is opened eagerly so a missing path fails before
/// anything is yielded; parsing happens on a blocking task feeding a bounded channel.
pub async fn open(path: &Path, delimiter: u8) -> Result<RowStream> {
    let owned: PathBuf = path.to_path_buf();
    let reader = tokio::task::spawn_blocking(move || {
        ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_path(&owned)
            .map_err(|e| IngestionError::Input(format!("cannot open {}: {}", owned.display(), e)))
    })
    .await
    .map_err(|e| IngestionError::Input(format!("reader task failed: {}", e)))??;

    let (tx, stream) = RowStream::channel(ROW_CHANNEL_CAPACITY);
    let file_label = path.display().to_string();
    spawn_producer(tx, file_label.clone(), move |tx| {
        produce(reader, tx);
        tracing::debug!(file_path = %file_label, "CSV producer finished");
    });
    Ok(stream)
}

fn produce<R: std::io::Read>(mut reader: csv::Reader<R>, tx: &RowSender) {
    let mut header: Option<Arc<[String]>> = None;
    for result in reader.records() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                tx.send_blocking(Err(e.into()));
                return;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(0) as u32;
        let cells: Vec<Value> = record
            .iter()
            .map(|field| {
                let t = field.trim();
                if t.is_empty() { Value::Null } else { Value::String(t.to_string()) }
            })
            .collect();
        if !has_content(&cells) {
            continue;
        }

        let event = match &header {
            None => {
                let h = normalize_header_row(&cells);
                header = Some(h.clone());
                RowEvent::Header { sheet_name: CSV_SHEET_NAME.to_string(), header: h }
            }
            Some(h) => RowEvent::Row {
                sheet_name: CSV_SHEET_NAME.to_string(),
                row_number: line,
                record: RowRecord::new(h.clone(), cells),
            },
        };
        if !tx.send_blocking(Ok(event)) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::io::Write;

    async fn collect(path: &Path, delimiter: u8) -> Vec<RowEvent> {
        let stream = open(path, delimiter).await.unwrap();
        stream.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn header_then_rows_with_line_numbers() {
        let mut f = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(f, ",,").unwrap();
        writeln!(f, "Name,Email,Name").unwrap();
        writeln!(f, " Ann , ann@x.io ,A2").unwrap();
        writeln!(f, ",,").unwrap();
        writeln!(f, "Bob,,").unwrap();
        f.flush().unwrap();

        let events = collect(f.path(), b',').await;
        assert_eq!(events.len(), 3);
        match &events[0] {
            RowEvent::Header { header, sheet_name } => {
                assert_eq!(&**header, &["Name", "Email", "Name__2"]);
                assert_eq!(sheet_name, CSV_SHEET_NAME);
            }
            other => panic!("expected header, got {:?}", other),
        }
        match &events[1] {
            RowEvent::Row { row_number, record, .. } => {
                assert_eq!(*row_number, 3);
                assert_eq!(record.get("Name"), Some(&json!("Ann")));
                assert_eq!(record.get("Email"), Some(&json!("ann@x.io")));
            }
            other => panic!("expected row, got {:?}", other),
        }
        match &events[2] {
            RowEvent::Row { row_number, record, .. } => {
                assert_eq!(*row_number, 5);
                assert_eq!(record.get("Email"), Some(&Value::Null));
            }
            other => panic!("expected row, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tab_delimited() {
        let mut f = tempfile::Builder::new().suffix(".tsv").tempfile().unwrap();
        writeln!(f, "a\tb").unwrap();
        writeln!(f, "1\t2").unwrap();
        f.flush().unwrap();
        let events = collect(f.path(), b'\t').await;
        match &events[1] {
            RowEvent::Row { record, .. } => assert_eq!(record.to_json(), json!({"a": "1", "b": "2"})),
            other => panic!("expected row, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_file_fails_before_streaming() {
        let err = open(Path::new("/definitely/not/here.csv"), b',').await.err().unwrap();
        assert!(matches!(err, IngestionError::Input(_)));
    }
}
