//! Student roster spreadsheets: reading `.xlsx`/`.csv` uploads into rows keyed
//! by field name, and writing the Persian-headed `.xlsx` export.
//!
//! Only the first worksheet of an `.xlsx` upload (in workbook order) is read.
//! Cells come back as strings; field validation happens later, per row.

use std::io::{Cursor, Read};

use anyhow::{anyhow, bail, Context};
use rust_xlsxwriter::{Format, Workbook};
use serde_json::{Map, Value};
use zip::ZipArchive;

use crate::model::{ACADEMIC_STATUS, EVALUATION_RESULT, MARITAL_STATUS, RESIDENCE_STATUS};

pub const MAX_ROSTER_BYTES: usize = 10 * 1024 * 1024;
/// Excel's last column is `XFD`.
const MAX_COLUMNS: usize = 16_384;
pub const SHEET_NAME: &str = "دانش‌آموزان";

/// Field name and Persian header, in export order.
pub const COLUMNS: &[(&str, &str)] = &[
    ("first_name", "نام"),
    ("last_name", "نام خانوادگی"),
    ("father_name", "نام پدر"),
    ("mother_name", "نام مادر"),
    ("national_code", "کد ملی"),
    ("birth_date", "تاریخ تولد"),
    ("birth_certificate_number", "شماره شناسنامه"),
    ("student_phone", "تلفن دانش‌آموز"),
    ("father_phone", "تلفن پدر"),
    ("father_job", "شغل پدر"),
    ("mother_phone", "تلفن مادر"),
    ("academic_year", "سال تحصیلی"),
    ("education_level", "مقطع تحصیلی"),
    ("mother_job", "شغل مادر"),
    ("grade", "پایه تحصیلی"),
    ("emergency_phone", "تلفن اضطراری"),
    ("marital_status", "وضعیت تاهل"),
    ("guardian", "ولی"),
    ("previous_school_address", "آدرس مدرسه قبلی"),
    ("home_address", "آدرس منزل"),
    ("residence_status", "وضعیت سکونت"),
    ("postal_code", "کد پستی"),
    ("home_phone", "تلفن منزل"),
    ("appearance_neat", "ظاهر مرتب"),
    ("polite_behavior", "رفتار مودبانه"),
    ("family_involvement", "مشارکت خانواده"),
    ("student_goal", "هدف دانش‌آموز"),
    ("academic_status", "وضعیت تحصیلی"),
    ("commitment", "تعهد"),
    ("evaluation_result", "نتیجه ارزیابی"),
];

const REQUIRED_HEADERS: &[&str] = &["first_name", "last_name", "national_code"];

/// Maps a header cell to its field name. Persian headers, field names and
/// the zero-width-joiner-free spelling of Persian headers are all accepted.
pub fn header_key(header: &str) -> Option<&'static str> {
    let h = header.trim().trim_start_matches('\u{feff}');
    let loose = h.replace('\u{200c}', " ");
    COLUMNS.iter().find_map(|(key, fa)| {
        (h.eq_ignore_ascii_case(key) || h == *fa || loose == fa.replace('\u{200c}', " "))
            .then_some(*key)
    })
}

#[derive(Debug, Clone)]
pub struct RosterRow {
    /// 1-based sheet row, header included.
    pub line: usize,
    pub values: Map<String, Value>,
}

pub fn read_roster(file_name: &str, bytes: &[u8]) -> anyhow::Result<Vec<RosterRow>> {
    let lower = file_name.to_ascii_lowercase();
    let grid = if lower.ends_with(".xlsx") {
        read_xlsx_grid(bytes)?
    } else if lower.ends_with(".csv") {
        read_csv_grid(bytes)?
    } else {
        bail!("Only .xlsx and .csv files are allowed");
    };
    rows_from_grid(grid)
}

fn rows_from_grid(grid: Vec<(usize, Vec<String>)>) -> anyhow::Result<Vec<RosterRow>> {
    let mut it = grid.into_iter();
    let Some((_, header_cells)) = it.next() else {
        bail!("The file has no header row");
    };
    let keys: Vec<Option<&'static str>> = header_cells.iter().map(|h| header_key(h)).collect();
    let missing: Vec<&str> = REQUIRED_HEADERS
        .iter()
        .copied()
        .filter(|req| !keys.contains(&Some(*req)))
        .map(|req| {
            COLUMNS
                .iter()
                .find(|(k, _)| *k == req)
                .map_or(req, |(_, fa)| *fa)
        })
        .collect();
    if !missing.is_empty() {
        bail!("Required columns are missing: {}", missing.join(", "));
    }

    let mut rows = Vec::new();
    for (line, cells) in it {
        let mut values = Map::new();
        for (key, cell) in keys.iter().zip(cells) {
            let Some(key) = key else { continue };
            let cell = cell.trim();
            if !cell.is_empty() {
                values.insert(key.to_string(), Value::String(cell.to_string()));
            }
        }
        if !values.is_empty() {
            rows.push(RosterRow { line, values });
        }
    }
    Ok(rows)
}

fn read_csv_grid(bytes: &[u8]) -> anyhow::Result<Vec<(usize, Vec<String>)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut grid = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("invalid CSV at row {}", i + 1))?;
        grid.push((i + 1, rec.iter().map(str::to_string).collect()));
    }
    Ok(grid)
}

fn zip_text(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> anyhow::Result<Option<String>> {
    let mut entry = match archive.by_name(name) {
        Ok(e) => e,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to open {name}")),
    };
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .with_context(|| format!("failed to read {name}"))?;
    Ok(Some(text))
}

fn read_xlsx_grid(bytes: &[u8]) -> anyhow::Result<Vec<(usize, Vec<String>)>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("invalid xlsx archive")?;

    let shared: Vec<String> = match zip_text(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => elements(&xml, "si")
            .into_iter()
            .map(|(_, inner)| text_runs(inner.unwrap_or("")))
            .collect(),
        None => Vec::new(),
    };

    let sheet_name = first_sheet_entry(&mut archive)?;
    let sheet = zip_text(&mut archive, &sheet_name)?
        .ok_or_else(|| anyhow!("xlsx has no worksheet"))?;

    let mut grid = Vec::new();
    for (idx, (row_tag, row_inner)) in elements(&sheet, "row").into_iter().enumerate() {
        let line = attr(row_tag, "r")
            .and_then(|r| r.parse::<usize>().ok())
            .unwrap_or(idx + 1);
        let mut cells: Vec<String> = Vec::new();
        for (pos, (cell_tag, cell_inner)) in elements(row_inner.unwrap_or(""), "c")
            .into_iter()
            .enumerate()
        {
            let col = match attr(cell_tag, "r") {
                Some(cell_ref) => match column_index(cell_ref) {
                    Some(col) => col,
                    None => continue,
                },
                None => pos,
            };
            let value = cell_value(cell_tag, cell_inner.unwrap_or(""), &shared);
            if cells.len() <= col {
                cells.resize(col + 1, String::new());
            }
            cells[col] = value;
        }
        grid.push((line, cells));
    }
    Ok(grid)
}

/// The first sheet listed in `xl/workbook.xml`, resolved through its
/// relationship. Falls back to the lowest-numbered `sheetN.xml`.
fn first_sheet_entry(archive: &mut ZipArchive<Cursor<&[u8]>>) -> anyhow::Result<String> {
    if let Some(path) = workbook_first_sheet(archive)? {
        if archive.file_names().any(|n| n == path) {
            return Ok(path);
        }
    }
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|n| {
        n.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("xlsx has no worksheet"))
}

fn workbook_first_sheet(archive: &mut ZipArchive<Cursor<&[u8]>>) -> anyhow::Result<Option<String>> {
    let Some(workbook) = zip_text(archive, "xl/workbook.xml")? else {
        return Ok(None);
    };
    let Some(rel_id) = elements(&workbook, "sheet")
        .first()
        .and_then(|(tag, _)| attr(tag, "r:id"))
        .map(str::to_string)
    else {
        return Ok(None);
    };
    let Some(rels) = zip_text(archive, "xl/_rels/workbook.xml.rels")? else {
        return Ok(None);
    };
    let target = elements(&rels, "Relationship")
        .into_iter()
        .find(|(tag, _)| attr(tag, "Id") == Some(rel_id.as_str()))
        .and_then(|(tag, _)| attr(tag, "Target"));
    Ok(target.map(|t| match t.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{t}"),
    }))
}

fn cell_value(tag: &str, inner: &str, shared: &[String]) -> String {
    let v = || {
        elements(inner, "v")
            .first()
            .and_then(|(_, t)| *t)
            .map(unescape)
            .unwrap_or_default()
    };
    match attr(tag, "t") {
        Some("s") => v()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i).cloned())
            .unwrap_or_default(),
        Some("inlineStr") => elements(inner, "is")
            .first()
            .map(|(_, t)| text_runs(t.unwrap_or("")))
            .unwrap_or_default(),
        Some("b") => if v() == "1" { "true" } else { "false" }.to_string(),
        _ => v(),
    }
}

/// Every `<name ...>` element in `xml`: its open tag and, unless
/// self-closing, its inner text.
fn elements<'a>(xml: &'a str, name: &str) -> Vec<(&'a str, Option<&'a str>)> {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.chars().next() {
            Some(' ' | '>' | '/' | '\t' | '\r' | '\n') => {}
            _ => {
                rest = after;
                continue;
            }
        }
        let Some(tag_end) = after.find('>') else { break };
        let tag = &after[..tag_end];
        let body = &after[tag_end + 1..];
        if tag.ends_with('/') {
            out.push((tag, None));
            rest = body;
            continue;
        }
        let Some(inner_end) = body.find(&close) else { break };
        out.push((tag, Some(&body[..inner_end])));
        rest = &body[inner_end + close.len()..];
    }
    out
}

fn text_runs(xml: &str) -> String {
    elements(xml, "t")
        .into_iter()
        .filter_map(|(_, t)| t.map(unescape))
        .collect()
}

fn attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!(" {name}=\"");
    let start = tag.find(&needle)? + needle.len();
    let len = tag[start..].find('"')?;
    Some(&tag[start..start + len])
}

/// `"C7"` -> 2. `None` past column `XFD`.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters = cell_ref.bytes().take_while(u8::is_ascii_alphabetic);
    let mut n = 0usize;
    for b in letters {
        n = n
            .checked_mul(26)?
            .checked_add((b.to_ascii_uppercase() - b'A' + 1) as usize)?;
        if n > MAX_COLUMNS {
            return None;
        }
    }
    n.checked_sub(1)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|h| u32::from_str_radix(h, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn export_cell(key: &str, v: &Value) -> String {
    let choice_label = |s: &str| -> String {
        match key {
            "marital_status" => MARITAL_STATUS.label(s).to_string(),
            "residence_status" => RESIDENCE_STATUS.label(s).to_string(),
            "academic_status" => ACADEMIC_STATUS.label(s).to_string(),
            "evaluation_result" => EVALUATION_RESULT.label(s).to_string(),
            _ => s.to_string(),
        }
    };
    match v {
        Value::Null => String::new(),
        Value::Bool(true) => "بله".to_string(),
        Value::Bool(false) => "خیر".to_string(),
        Value::String(s) => choice_label(s),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Writes one sheet of students, one row each, in [`COLUMNS`] order.
pub fn write_roster(students: &[Value]) -> anyhow::Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;
    sheet.set_right_to_left(true);

    for (col, (_, fa)) in COLUMNS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *fa, &header_format)?;
    }
    for (i, student) in students.iter().enumerate() {
        let row = (i + 1) as u32;
        for (col, (key, _)) in COLUMNS.iter().enumerate() {
            let v = student.get(*key).unwrap_or(&Value::Null);
            match v {
                Value::Number(n) if *key == "grade" => {
                    sheet.write_number(row, col as u16, n.as_f64().unwrap_or_default())?;
                }
                _ => {
                    let text = export_cell(key, v);
                    if !text.is_empty() {
                        sheet.write_string(row, col as u16, &text)?;
                    }
                }
            }
        }
    }
    workbook
        .save_to_buffer()
        .context("failed to render roster workbook")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn headers_accept_persian_and_english() {
        assert_eq!(header_key("کد ملی"), Some("national_code"));
        assert_eq!(header_key(" National_Code "), Some("national_code"));
        assert_eq!(header_key("تلفن دانش آموز"), Some("student_phone"));
        assert_eq!(header_key("\u{feff}نام"), Some("first_name"));
        assert_eq!(header_key("unknown"), None);
    }

    #[test]
    fn csv_rows_are_keyed_by_field() {
        let csv = "نام,نام خانوادگی,کد ملی,extra\nSara,Ahmadi,0012345678,x\n,,,\nAli,,0011111111,\n";
        let rows = read_roster("roster.CSV", csv.as_bytes()).expect("csv");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line, 2);
        assert_eq!(rows[0].values["national_code"], "0012345678");
        assert!(!rows[0].values.contains_key("extra"));
        assert_eq!(rows[1].line, 4);
        assert!(!rows[1].values.contains_key("last_name"));
    }

    #[test]
    fn missing_required_header_is_rejected() {
        let err = read_roster("r.csv", b"first_name,last_name\nA,B\n").unwrap_err();
        assert!(err.to_string().contains("کد ملی"));
        assert!(read_roster("r.txt", b"x").is_err());
    }

    #[test]
    fn exported_workbook_reads_back_with_labels() {
        let students = vec![json!({
            "first_name": "Sara & Co",
            "last_name": "Ahmadi",
            "national_code": "0012345678",
            "marital_status": "single",
            "grade": 18.5,
            "polite_behavior": true,
            "commitment": { "discipline": true, "rules": false },
        })];
        let bytes = write_roster(&students).expect("export");
        let rows = read_roster("students.xlsx", &bytes).expect("import");
        assert_eq!(rows.len(), 1);
        let v = &rows[0].values;
        assert_eq!(v["first_name"], "Sara & Co");
        assert_eq!(v["national_code"], "0012345678");
        assert_eq!(v["marital_status"], "مجرد");
        assert_eq!(v["polite_behavior"], "بله");
        assert_eq!(v["grade"], "18.5");
        assert!(v["commitment"].as_str().unwrap().contains("discipline"));
    }

    fn hand_built_xlsx(entries: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            zip.start_file(*name, zip::write::FileOptions::default())
                .expect("start entry");
            zip.write_all(body.as_bytes()).expect("write entry");
        }
        zip.finish().expect("finish zip").into_inner()
    }

    fn inline_sheet(cells: &[(&str, &str)]) -> String {
        let mut rows = std::collections::BTreeMap::<String, String>::new();
        for (cell_ref, text) in cells {
            let line: String = cell_ref.chars().filter(char::is_ascii_digit).collect();
            rows.entry(line).or_default().push_str(&format!(
                r#"<c r="{cell_ref}" t="inlineStr"><is><t>{text}</t></is></c>"#
            ));
        }
        let body: String = rows
            .into_iter()
            .map(|(line, cells)| format!(r#"<row r="{line}">{cells}</row>"#))
            .collect();
        format!("<worksheet><sheetData>{body}</sheetData></worksheet>")
    }

    #[test]
    fn oversized_cell_references_are_skipped() {
        let sheet = inline_sheet(&[
            ("A1", "کد ملی"),
            ("B1", "نام"),
            ("C1", "نام خانوادگی"),
            ("A2", "0012345678"),
            ("ZZZZZZ2", "far away"),
            ("ZZZZZZZZZZZZZZ2", "overflow"),
        ]);
        let bytes = hand_built_xlsx(&[("xl/worksheets/sheet1.xml", &sheet)]);
        let rows = read_roster("roster.xlsx", &bytes).expect("import");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values["national_code"], "0012345678");
        assert_eq!(rows[0].values.len(), 1);
    }

    #[test]
    fn first_sheet_follows_workbook_order() {
        let workbook = r#"<workbook><sheets><sheet name="Roster" sheetId="2" r:id="rId7"/><sheet name="Notes" sheetId="1" r:id="rId1"/></sheets></workbook>"#;
        let rels = r#"<Relationships><Relationship Id="rId1" Target="worksheets/sheet1.xml"/><Relationship Id="rId7" Target="/xl/worksheets/sheet2.xml"/></Relationships>"#;
        let notes = inline_sheet(&[("A1", "just notes")]);
        let roster = inline_sheet(&[
            ("A1", "کد ملی"),
            ("B1", "نام"),
            ("C1", "نام خانوادگی"),
            ("A2", "0011111111"),
        ]);
        let bytes = hand_built_xlsx(&[
            ("xl/workbook.xml", workbook),
            ("xl/_rels/workbook.xml.rels", rels),
            ("xl/worksheets/sheet1.xml", &notes),
            ("xl/worksheets/sheet2.xml", &roster),
        ]);
        let rows = read_roster("roster.xlsx", &bytes).expect("import");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values["national_code"], "0011111111");
    }

    #[test]
    fn xml_helpers() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("AB12"), Some(27));
        assert_eq!(column_index("XFD1"), Some(16_383));
        assert_eq!(column_index("XFE1"), None);
        assert_eq!(column_index("ZZZZZZZZZZZZZZ1"), None);
        assert_eq!(column_index("12"), None);
        assert_eq!(unescape("a &lt;b&gt; &#1587; &amp;&"), "a <b> س &&");
        let xml = r#"<row r="3"><c r="B3" t="inlineStr"><is><t>hi</t></is></c><c r="C3"/></row>"#;
        let rows = elements(xml, "row");
        assert_eq!(attr(rows[0].0, "r"), Some("3"));
        let cells = elements(rows[0].1.unwrap(), "c");
        assert_eq!(cells.len(), 2);
        assert_eq!(cell_value(cells[0].0, cells[0].1.unwrap(), &[]), "hi");
    }
}
