//! Readers for the zipped XML office formats.
//!
//! Every reader walks the raw part XML with `quick-xml` and emits the same
//! page shape as the PDF path. Tables become `[TABLE]` pages whose rows are
//! joined with ` | `.

use crate::error::IngestError;
use crate::extractor::{detect_language, fix_bidi_text, table_page, DocumentExtractor};
use crate::models::{Page, PageId};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::result::ZipError;
use zip::ZipArchive;

/// Upper bound on one decompressed XML part.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const MAX_CELLS_PER_SHEET: usize = 100_000;
const OLE_SIGNATURE: [u8; 4] = [0xD0, 0xCF, 0x11, 0xE0];

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, IngestError> {
    Ok(ZipArchive::new(Cursor::new(bytes))?)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Option<Vec<u8>>, IngestError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(IngestError::Ooxml(format!(
            "zip entry {name} exceeds {MAX_XML_ENTRY_BYTES} bytes"
        )));
    }
    Ok(Some(out))
}

fn require_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, IngestError> {
    read_entry(archive, name)?.ok_or_else(|| IngestError::Ooxml(format!("{name} not found")))
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, IngestError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|error| IngestError::Ooxml(error.to_string()))?;
        if attr.key.local_name().as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Numbered part names (`slide3.xml`) in numeric order.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with(prefix) && name.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Row/cell accumulator shared by the word and slide table markup.
#[derive(Default)]
struct TableCollector {
    depth: usize,
    rows: Vec<String>,
    row: Vec<String>,
    cell: String,
}

impl TableCollector {
    fn active(&self) -> bool {
        self.depth > 0
    }

    fn start(&mut self, local: &[u8]) {
        match local {
            b"tbl" => self.depth += 1,
            b"tr" if self.depth == 1 => self.row.clear(),
            b"tc" if self.depth == 1 => self.cell.clear(),
            _ => {}
        }
    }

    /// Returns the finished rows when the outermost table closes.
    fn end(&mut self, local: &[u8]) -> Option<Vec<String>> {
        match local {
            b"tbl" => {
                self.depth = self.depth.saturating_sub(1);
                if self.depth == 0 {
                    return Some(std::mem::take(&mut self.rows));
                }
            }
            b"tr" if self.depth == 1 => {
                let row = std::mem::take(&mut self.row);
                self.rows.push(row.join(" | "));
            }
            b"tc" if self.depth == 1 => {
                self.row.push(self.cell.trim().to_string());
            }
            b"p" => self.cell.push(' '),
            _ => {}
        }
        None
    }

    fn text(&mut self, text: &str) {
        self.cell.push_str(text);
    }
}

fn push_text_page(pages: &mut Vec<Page>, number: u32, text: &str) {
    let text = fix_bidi_text(text.trim());
    if text.is_empty() {
        return;
    }
    let language = detect_language(&text);
    pages.push(Page::text(PageId::Number(number), text, language));
}

#[derive(Default)]
pub struct DocxExtractor;

impl DocumentExtractor for DocxExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<Page>, IngestError> {
        let bytes = std::fs::read(path)?;
        let mut archive = open_archive(&bytes)?;
        let xml = require_entry(&mut archive, "word/document.xml")?;
        docx_pages(&xml)
    }
}

/// Body paragraphs accumulate into one page until a table interrupts them.
fn docx_pages(xml: &[u8]) -> Result<Vec<Page>, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut pages = Vec::new();
    let mut page_counter = 1u32;
    let mut buffer = String::new();
    let mut table = TableCollector::default();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => {
                let local = element.local_name();
                match local.as_ref() {
                    b"tbl" if !table.active() => {
                        if !buffer.trim().is_empty() {
                            push_text_page(&mut pages, page_counter, &buffer);
                            page_counter += 1;
                        }
                        buffer.clear();
                        table.start(b"tbl");
                    }
                    b"t" => in_text = true,
                    other => table.start(other),
                }
            }
            Event::Empty(element) => match element.local_name().as_ref() {
                b"tab" if table.active() => table.text(" "),
                b"tab" => buffer.push('\t'),
                b"br" if table.active() => table.text(" "),
                b"br" => buffer.push('\n'),
                _ => {}
            },
            Event::Text(text) if in_text => {
                let text = text.unescape()?;
                if table.active() {
                    table.text(&text);
                } else {
                    buffer.push_str(&text);
                }
            }
            Event::End(element) => {
                let local = element.local_name();
                match local.as_ref() {
                    b"t" => in_text = false,
                    b"p" if !table.active() => buffer.push('\n'),
                    other => {
                        if let Some(rows) = table.end(other) {
                            if let Some(page) = table_page(PageId::Number(page_counter), &rows) {
                                pages.push(page);
                                page_counter += 1;
                            }
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    push_text_page(&mut pages, page_counter, &buffer);
    Ok(pages)
}

#[derive(Default)]
pub struct PptxExtractor;

impl DocumentExtractor for PptxExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<Page>, IngestError> {
        let bytes = std::fs::read(path)?;
        let mut archive = open_archive(&bytes)?;
        let mut pages = Vec::new();

        for (index, name) in numbered_parts(&archive, "ppt/slides/slide")
            .into_iter()
            .enumerate()
        {
            let xml = require_entry(&mut archive, &name)?;
            let text = slide_text(&xml)?;
            push_text_page(&mut pages, index as u32 + 1, &text);
        }

        Ok(pages)
    }
}

/// Shape paragraphs first, then each table as an inline `[TABLE]` block.
fn slide_text(xml: &[u8]) -> Result<String, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut tables: Vec<Vec<String>> = Vec::new();
    let mut table = TableCollector::default();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"t" => in_text = true,
                other => table.start(other),
            },
            Event::Empty(element) if element.local_name().as_ref() == b"br" => {
                if table.active() {
                    table.text(" ");
                } else {
                    line.push('\n');
                }
            }
            Event::Text(text) if in_text => {
                let text = text.unescape()?;
                if table.active() {
                    table.text(&text);
                } else {
                    line.push_str(&text);
                }
            }
            Event::End(element) => {
                let local = element.local_name();
                match local.as_ref() {
                    b"t" => in_text = false,
                    b"p" if !table.active() => {
                        if !line.trim().is_empty() {
                            lines.push(line.trim().to_string());
                        }
                        line.clear();
                    }
                    other => {
                        if let Some(rows) = table.end(other) {
                            tables.push(rows);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    for rows in tables {
        let body = rows
            .into_iter()
            .filter(|row| !row.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if !body.is_empty() {
            lines.push(format!("[TABLE]\n{body}"));
        }
    }

    Ok(lines.join("\n"))
}

#[derive(Default)]
pub struct SpreadsheetExtractor;

impl DocumentExtractor for SpreadsheetExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<Page>, IngestError> {
        let bytes = std::fs::read(path)?;
        let is_xls = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xls"));
        if is_xls || bytes.starts_with(&OLE_SIGNATURE) {
            return Err(IngestError::LegacyWorkbook(path.display().to_string()));
        }

        let mut archive = open_archive(&bytes)?;
        let shared = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
            Some(xml) => shared_strings(&xml)?,
            None => Vec::new(),
        };

        let mut pages = Vec::new();
        for (index, sheet) in workbook_sheets(&mut archive)?.into_iter().enumerate() {
            let Some(xml) = read_entry(&mut archive, &sheet.part)? else {
                continue;
            };
            let cells = sheet_cells(&xml, &shared)?;
            if cells.is_empty() {
                continue;
            }

            let title = sheet
                .name
                .unwrap_or_else(|| format!("Sheet{}", index + 1));
            let text = cells
                .iter()
                .map(SheetCell::line)
                .collect::<Vec<_>>()
                .join("\n");
            let text = fix_bidi_text(&text);

            pages.push(Page {
                page: PageId::Name(title.clone()),
                language: detect_language(&text),
                text,
                sheet_title: Some(title),
                total_cells: Some(cells.len() as u64),
            });
        }

        Ok(pages)
    }
}

struct SheetRef {
    name: Option<String>,
    part: String,
}

/// Sheet names in workbook order, resolved to their worksheet parts.
fn workbook_sheets(archive: &mut Archive<'_>) -> Result<Vec<SheetRef>, IngestError> {
    let targets = match read_entry(archive, "xl/_rels/workbook.xml.rels")? {
        Some(xml) => relationship_targets(&xml)?,
        None => HashMap::new(),
    };

    let Some(workbook) = read_entry(archive, "xl/workbook.xml")? else {
        return Ok(numbered_parts(archive, "xl/worksheets/sheet")
            .into_iter()
            .map(|part| SheetRef { name: None, part })
            .collect());
    };

    let mut reader = Reader::from_reader(workbook.as_slice());
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) | Event::Empty(element)
                if element.local_name().as_ref() == b"sheet" =>
            {
                let name = attribute(&element, b"name")?;
                let position = sheets.len() + 1;
                let part = attribute(&element, b"id")?
                    .and_then(|id| targets.get(&id).cloned())
                    .unwrap_or_else(|| format!("xl/worksheets/sheet{position}.xml"));
                sheets.push(SheetRef { name, part });
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

fn relationship_targets(xml: &[u8]) -> Result<HashMap<String, String>, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut targets = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) | Event::Empty(element)
                if element.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) =
                    (attribute(&element, b"Id")?, attribute(&element, b"Target")?)
                {
                    let part = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("xl/{target}"),
                    };
                    targets.insert(id, part);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(targets)
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Event::Text(text) if in_text => current.push_str(&text.unescape()?),
            Event::End(element) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

struct SheetCell {
    coordinate: String,
    value: String,
    formula: Option<String>,
}

impl SheetCell {
    fn line(&self) -> String {
        match &self.formula {
            Some(formula) => format!("{}: {}  (formula: {})", self.coordinate, self.value, formula),
            None => format!("{}: {}", self.coordinate, self.value),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum CellField {
    None,
    Value,
    Formula,
    Inline,
}

/// `(row, column)` from an A1-style reference, both one-based. Unparseable references sort last.
fn cell_position(coordinate: &str) -> (u64, u64) {
    let split = coordinate
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(coordinate.len());
    let (letters, digits) = coordinate.split_at(split);
    let column = letters
        .chars()
        .filter(char::is_ascii_alphabetic)
        .fold(0u64, |acc, c| {
            acc.saturating_mul(26)
                .saturating_add(u64::from(c.to_ascii_uppercase() as u8 - b'A' + 1))
        });
    let row = digits.parse::<u64>().unwrap_or(u64::MAX);
    (row, if column == 0 { u64::MAX } else { column })
}

/// Non-empty cells sorted by row then column, shared strings resolved.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<Vec<SheetCell>, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cells = Vec::new();

    let mut coordinate = String::new();
    let mut cell_type: Option<String> = None;
    let mut raw_value = String::new();
    let mut formula = String::new();
    let mut field = CellField::None;

    loop {
        if cells.len() >= MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"c" => {
                    coordinate = attribute(&element, b"r")?.unwrap_or_default();
                    cell_type = attribute(&element, b"t")?;
                    raw_value.clear();
                    formula.clear();
                }
                b"v" => field = CellField::Value,
                b"f" => field = CellField::Formula,
                b"t" if cell_type.as_deref() == Some("inlineStr") => field = CellField::Inline,
                _ => {}
            },
            Event::Text(text) => match field {
                CellField::Value | CellField::Inline => raw_value.push_str(&text.unescape()?),
                CellField::Formula => formula.push_str(&text.unescape()?),
                CellField::None => {}
            },
            Event::End(element) => match element.local_name().as_ref() {
                b"v" | b"f" | b"t" => field = CellField::None,
                b"c" => {
                    let value = match cell_type.as_deref() {
                        Some("s") => raw_value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|index| shared.get(index).cloned())
                            .unwrap_or_default(),
                        _ => raw_value.trim().to_string(),
                    };
                    if !value.trim().is_empty() {
                        cells.push(SheetCell {
                            coordinate: coordinate.clone(),
                            value,
                            formula: (!formula.trim().is_empty())
                                .then(|| formula.trim().to_string()),
                        });
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    cells.sort_by_cached_key(|cell| cell_position(&cell.coordinate));
    Ok(cells)
}
