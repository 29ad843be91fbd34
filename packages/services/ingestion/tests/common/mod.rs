use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::ZipWriter;

pub enum Cell {
    Text(&'static str),
    Number(f64),
    /// Excel serial rendered with a date number format.
    Date(f64),
    /// Literal `<c>` element, written as-is.
    Raw(&'static str),
    Empty,
}

pub fn write_csv(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
    path
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn column_letter(mut idx: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push((b'A' + (idx % 26) as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    out.iter().rev().collect()
}

/// Minimal OOXML workbook: shared strings for text, style 1 is a date format.
pub fn write_xlsx(dir: &Path, name: &str, sheets: &[(&str, Vec<Vec<Cell>>)]) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut zip = ZipWriter::new(file);
    let opts = FileOptions::default();

    let mut shared: Vec<String> = Vec::new();
    let mut sheet_xml = Vec::new();
    for (_, rows) in sheets {
        let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#);
        for (r, row) in rows.iter().enumerate() {
            xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
            for (c, cell) in row.iter().enumerate() {
                let reference = format!("{}{}", column_letter(c), r + 1);
                match cell {
                    Cell::Text(s) => {
                        shared.push(s.to_string());
                        xml.push_str(&format!(r#"<c r="{}" t="s"><v>{}</v></c>"#, reference, shared.len() - 1));
                    }
                    Cell::Number(n) => xml.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, reference, n)),
                    Cell::Date(n) => xml.push_str(&format!(r#"<c r="{}" s="1"><v>{}</v></c>"#, reference, n)),
                    Cell::Raw(element) => xml.push_str(element),
                    Cell::Empty => {}
                }
            }
            xml.push_str("</row>");
        }
        xml.push_str("</sheetData></worksheet>");
        sheet_xml.push(xml);
    }

    let mut workbook = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#);
    let mut rels = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#);
    for (i, (sheet_name, _)) in sheets.iter().enumerate() {
        workbook.push_str(&format!(r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#, escape(sheet_name), i + 1, i + 1));
        rels.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{}.xml"/>"#,
            i + 1,
            i + 1
        ));
    }
    workbook.push_str("</sheets></workbook>");
    rels.push_str("</Relationships>");

    let mut sst = format!(r#"<?xml version="1.0" encoding="UTF-8"?><sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="{0}" uniqueCount="{0}">"#, shared.len());
    for s in &shared {
        sst.push_str(&format!("<si><t>{}</t></si>", escape(s)));
    }
    sst.push_str("</sst>");

    let styles = r#"<?xml version="1.0" encoding="UTF-8"?><styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><cellXfs count="2"><xf numFmtId="0"/><xf numFmtId="14" applyNumberFormat="1"/></cellXfs></styleSheet>"#;

    zip.start_file("xl/workbook.xml", opts).unwrap();
    zip.write_all(workbook.as_bytes()).unwrap();
    zip.start_file("xl/_rels/workbook.xml.rels", opts).unwrap();
    zip.write_all(rels.as_bytes()).unwrap();
    zip.start_file("xl/sharedStrings.xml", opts).unwrap();
    zip.write_all(sst.as_bytes()).unwrap();
    zip.start_file("xl/styles.xml", opts).unwrap();
    zip.write_all(styles.as_bytes()).unwrap();
    for (i, xml) in sheet_xml.iter().enumerate() {
        zip.start_file(format!("xl/worksheets/sheet{}.xml", i + 1), opts).unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
    path
}
