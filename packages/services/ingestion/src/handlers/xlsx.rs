//! Streaming reader for OOXML workbooks (`.xlsx` / `.xlsm`).
//!
//! The workbook layout (sheet names, relationships, shared strings, date styles) is read up
//! front so that structural problems fail before any event is produced. Worksheet XML is then
//! parsed event-by-event on a blocking task; rows are handed to the consumer through a bounded
//! channel and never accumulated.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, SecondsFormat};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use zip::ZipArchive;

use crate::handlers::{
    has_content, normalize_header_row, spawn_producer, RowEvent, RowRecord, RowSender, RowStream, ROW_CHANNEL_CAPACITY,
};
use crate::models::*;

/// Cap on decompressed bytes for the metadata parts read into memory (zip-bomb guard).
const MAX_METADATA_BYTES: u64 = 64 * 1024 * 1024;

/// Excel's worksheet width (`A` through `XFD`).
pub const MAX_COLUMNS: usize = 16_384;

#[derive(Debug, Clone, PartialEq)]
pub struct SheetEntry {
    pub name: String,
    pub part: String,
}

/// Everything needed to decode cells, loaded before streaming starts.
#[derive(Debug, Default)]
pub struct WorkbookLayout {
    pub sheets: Vec<SheetEntry>,
    pub shared_strings: Vec<String>,
    /// Indices into `cellXfs` whose number format renders a date.
    pub date_styles: HashSet<usize>,
    pub date1904: bool,
}

pub async fn open(path: &Path, sheet_name: Option<&str>) -> Result<RowStream> {
    let owned: PathBuf = path.to_path_buf();
    let wanted = sheet_name.map(str::to_string);
    let (archive, layout) = tokio::task::spawn_blocking(move || prepare(&owned, wanted.as_deref()))
        .await
        .map_err(|e| IngestionError::Input(format!("workbook task failed: {}", e)))??;

    let (tx, stream) = RowStream::channel(ROW_CHANNEL_CAPACITY);
    let file_label = path.display().to_string();
    spawn_producer(tx, file_label.clone(), move |tx| {
        let mut archive = archive;
        for sheet in &layout.sheets {
            match stream_sheet(&mut archive, sheet, &layout, tx) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tx.send_blocking(Err(e));
                    return;
                }
            }
        }
        tracing::debug!(file_path = %file_label, sheets = layout.sheets.len(), "Workbook producer finished");
    });
    Ok(stream)
}

fn prepare(path: &Path, sheet_name: Option<&str>) -> Result<(ZipArchive<File>, WorkbookLayout)> {
    let file = File::open(path)
        .map_err(|e| IngestionError::Input(format!("cannot open {}: {}", path.display(), e)))?;
    let mut archive = ZipArchive::new(file).map_err(|e| {
        IngestionError::Input(format!("{} is not a valid xlsx workbook: {}", path.display(), e))
    })?;

    let workbook_xml = read_part(&mut archive, "xl/workbook.xml")?.ok_or_else(|| {
        IngestionError::Input(format!("{} has no xl/workbook.xml", path.display()))
    })?;
    let (declared, date1904) = parse_workbook(&workbook_xml)?;
    let rels = match read_part(&mut archive, "xl/_rels/workbook.xml.rels")? {
        Some(xml) => parse_relationships(&xml)?,
        None => HashMap::new(),
    };

    let mut sheets = Vec::with_capacity(declared.len());
    for (i, (name, rel_id)) in declared.into_iter().enumerate() {
        let part = rel_id
            .and_then(|id| rels.get(&id).cloned())
            .map(|target| resolve_target(&target))
            .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", i + 1));
        sheets.push(SheetEntry { name, part });
    }

    if let Some(wanted) = sheet_name {
        sheets.retain(|s| s.name == wanted);
        if sheets.is_empty() {
            return Err(IngestionError::Input(format!(
                "no sheet named {:?} in {}",
                wanted,
                path.display()
            )));
        }
    }
    if sheets.is_empty() {
        return Err(IngestionError::Input(format!("{} contains no worksheets", path.display())));
    }

    let shared_strings = match read_part(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let date_styles = match read_part(&mut archive, "xl/styles.xml")? {
        Some(xml) => parse_date_styles(&xml)?,
        None => HashSet::new(),
    };

    Ok((archive, WorkbookLayout { sheets, shared_strings, date_styles, date1904 }))
}

fn read_part(archive: &mut ZipArchive<File>, name: &str) -> Result<Option<Vec<u8>>> {
    let entry = match archive.by_name(name) {
        Ok(e) => e,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::new();
    entry.take(MAX_METADATA_BYTES).read_to_end(&mut buf)?;
    Ok(Some(buf))
}

fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(abs) => abs.to_string(),
        None => format!("xl/{}", target.trim_start_matches("./")),
    }
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|err| IngestionError::Parse(format!("XML attribute: {}", err)))?;
        if a.key.local_name().as_ref() == local {
            return Ok(Some(a.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Returns `(sheet name, relationship id)` in workbook order and the 1904 date-system flag.
fn parse_workbook(xml: &[u8]) -> Result<(Vec<(String, Option<String>)>, bool)> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    let mut date1904 = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"sheet" => {
                    let name = attr(&e, b"name")?.unwrap_or_default();
                    let rel = attr(&e, b"id")?;
                    sheets.push((name, rel));
                }
                b"workbookPr" => {
                    date1904 = matches!(attr(&e, b"date1904")?.as_deref(), Some("1") | Some("true"));
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok((sheets, date1904))
}

fn parse_relationships(xml: &[u8]) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id")?, attr(&e, b"Target")?) {
                    out.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Shared string table; rich-text runs are concatenated, phonetic runs (`rPh`) skipped.
fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut in_phonetic = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"rPh" => in_phonetic = true,
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => out.push(String::new()),
            Event::Text(t) if in_t && !in_phonetic => current.push_str(&t.unescape()?),
            Event::CData(t) if in_t && !in_phonetic => {
                current.push_str(&String::from_utf8_lossy(&t.into_inner()))
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    out.push(std::mem::take(&mut current));
                }
                b"rPh" => in_phonetic = false,
                b"t" => in_t = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn is_builtin_date_format(id: u32) -> bool {
    matches!(id, 14..=22 | 27..=36 | 45..=47 | 50..=58)
}

fn is_date_format_code(code: &str) -> bool {
    let mut cleaned = String::new();
    let mut in_quote = false;
    let mut in_bracket = false;
    let mut escaped = false;
    for ch in code.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_quote = !in_quote,
            '[' if !in_quote => in_bracket = true,
            ']' if !in_quote => in_bracket = false,
            _ if in_quote || in_bracket => {}
            _ => cleaned.push(ch.to_ascii_lowercase()),
        }
    }
    if cleaned.contains("general") {
        return false;
    }
    cleaned.chars().any(|c| matches!(c, 'd' | 'm' | 'y' | 'h' | 's'))
}

/// Indices of `cellXfs` entries whose number format is a date/time format.
fn parse_date_styles(xml: &[u8]) -> Result<HashSet<usize>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut custom: HashMap<u32, bool> = HashMap::new();
    let mut out = HashSet::new();
    let mut in_cell_xfs = false;
    let mut xf_index = 0usize;
    loop {
        let ev = reader.read_event_into(&mut buf)?;
        let is_empty = matches!(ev, Event::Empty(_));
        match ev {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"numFmt" => {
                    let id = attr(&e, b"numFmtId")?.and_then(|s| s.parse::<u32>().ok());
                    let code = attr(&e, b"formatCode")?.unwrap_or_default();
                    if let Some(id) = id {
                        custom.insert(id, is_date_format_code(&code));
                    }
                }
                b"cellXfs" if !is_empty => in_cell_xfs = true,
                b"xf" if in_cell_xfs => {
                    let id = attr(&e, b"numFmtId")?.and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
                    let is_date = custom.get(&id).copied().unwrap_or_else(|| is_builtin_date_format(id));
                    if is_date {
                        out.insert(xf_index);
                    }
                    xf_index += 1;
                }
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"cellXfs" => in_cell_xfs = false,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// `"AB12"` -> column index 27. `None` when the reference has no column letters; an error when
/// the column lies beyond `XFD`.
fn column_index(reference: &str) -> Result<Option<usize>> {
    let mut idx = 0usize;
    let mut seen = false;
    for ch in reference.chars() {
        if !ch.is_ascii_alphabetic() {
            break;
        }
        idx = idx * 26 + (ch.to_ascii_uppercase() as usize - 'A' as usize + 1);
        seen = true;
        if idx > MAX_COLUMNS {
            return Err(IngestionError::Parse(format!("cell reference {:?} is beyond column XFD", reference)));
        }
    }
    Ok(if seen { Some(idx - 1) } else { None })
}

/// Converts an Excel serial date to an ISO-8601 UTC timestamp.
pub fn serial_to_iso(serial: f64, date1904: bool) -> Option<String> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let base = if date1904 {
        NaiveDate::from_ymd_opt(1904, 1, 1)?
    } else if serial < 61.0 {
        // serials before the phantom 1900-02-29 are offset by one day
        NaiveDate::from_ymd_opt(1899, 12, 31)?
    } else {
        NaiveDate::from_ymd_opt(1899, 12, 30)?
    };
    let days = serial.trunc() as i64;
    let millis = ((serial - serial.trunc()) * 86_400_000.0).round() as i64;
    let dt = base.and_hms_opt(0, 0, 0)?
        + Duration::days(days)
        + Duration::milliseconds(millis);
    Some(dt.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct CellState {
    column: usize,
    kind: Option<String>,
    style: Option<usize>,
    value: String,
    inline: String,
}

fn decode_cell(cell: &CellState, layout: &WorkbookLayout) -> Value {
    let text_or_null = |s: &str| {
        let t = s.trim();
        if t.is_empty() { Value::Null } else { Value::String(t.to_string()) }
    };
    match cell.kind.as_deref() {
        Some("s") => cell
            .value
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| layout.shared_strings.get(i))
            .map(|s| text_or_null(s))
            .unwrap_or(Value::Null),
        Some("inlineStr") => text_or_null(&cell.inline),
        Some("str") | Some("d") => text_or_null(&cell.value),
        Some("b") => match cell.value.trim() {
            "1" | "true" => Value::Bool(true),
            "0" | "false" => Value::Bool(false),
            _ => Value::Null,
        },
        Some("e") => Value::Null,
        _ => {
            let raw = cell.value.trim();
            if raw.is_empty() {
                return Value::Null;
            }
            match raw.parse::<f64>() {
                Ok(n) => {
                    let is_date = cell.style.map(|s| layout.date_styles.contains(&s)).unwrap_or(false);
                    if is_date {
                        serial_to_iso(n, layout.date1904).map(Value::String).unwrap_or_else(|| number_value(n))
                    } else {
                        number_value(n)
                    }
                }
                Err(_) => text_or_null(raw),
            }
        }
    }
}

/// Streams one worksheet. Returns `Ok(false)` when the consumer hung up.
fn stream_sheet(
    archive: &mut ZipArchive<File>,
    sheet: &SheetEntry,
    layout: &WorkbookLayout,
    tx: &RowSender,
) -> Result<bool> {
    let entry = archive.by_name(&sheet.part).map_err(|e| {
        IngestionError::Parse(format!("worksheet {:?} ({}) unreadable: {}", sheet.name, sheet.part, e))
    })?;
    let mut reader = Reader::from_reader(BufReader::new(entry));
    let mut buf = Vec::new();

    let mut header: Option<Arc<[String]>> = None;
    let mut cells: Vec<Value> = Vec::new();
    let mut row_number = 0u32;
    let mut next_column = 0usize;
    let mut cell: Option<CellState> = None;
    let mut in_v = false;
    let mut in_inline_t = false;

    loop {
        let ev = reader
            .read_event_into(&mut buf)
            .map_err(|e| IngestionError::Parse(format!("worksheet {:?}: {}", sheet.name, e)))?;
        match ev {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => {
                    row_number = attr(&e, b"r")?.and_then(|r| r.parse().ok()).unwrap_or(row_number + 1);
                    cells.clear();
                    next_column = 0;
                }
                b"c" => cell = Some(open_cell(&e, next_column)?),
                b"v" => in_v = true,
                b"t" if cell.is_some() => in_inline_t = true,
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"row" => {
                    row_number = attr(&e, b"r")?.and_then(|r| r.parse().ok()).unwrap_or(row_number + 1);
                }
                b"c" => {
                    let c = open_cell(&e, next_column)?;
                    next_column = c.column + 1;
                }
                _ => {}
            },
            Event::Text(t) => {
                if in_v || in_inline_t {
                    let text = t.unescape()?;
                    if let Some(c) = cell.as_mut() {
                        if in_v { c.value.push_str(&text) } else { c.inline.push_str(&text) }
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"t" => in_inline_t = false,
                b"c" => {
                    if let Some(c) = cell.take() {
                        let col = c.column;
                        let value = decode_cell(&c, layout);
                        if cells.len() <= col {
                            cells.resize(col + 1, Value::Null);
                        }
                        cells[col] = value;
                        next_column = col + 1;
                    }
                }
                b"row" if has_content(&cells) => {
                    let event = match &header {
                        None => {
                            let h = normalize_header_row(&cells);
                            header = Some(h.clone());
                            RowEvent::Header { sheet_name: sheet.name.clone(), header: h }
                        }
                        Some(h) => RowEvent::Row {
                            sheet_name: sheet.name.clone(),
                            row_number,
                            record: RowRecord::new(h.clone(), std::mem::take(&mut cells)),
                        },
                    };
                    if !tx.send_blocking(Ok(event)) {
                        return Ok(false);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(true)
}

fn open_cell(e: &BytesStart<'_>, fallback_column: usize) -> Result<CellState> {
    let column = match attr(e, b"r")? {
        Some(r) => column_index(&r)?.unwrap_or(fallback_column),
        None => fallback_column,
    };
    if column >= MAX_COLUMNS {
        return Err(IngestionError::Parse(format!("row has more than {} cells", MAX_COLUMNS)));
    }
    Ok(CellState {
        column,
        kind: attr(e, b"t")?,
        style: attr(e, b"s")?.and_then(|s| s.parse().ok()),
        value: String::new(),
        inline: String::new(),
    })
}
