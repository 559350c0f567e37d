use crate::error::IngestError;
use crate::models::{FileType, Language, Page, PageId};
use crate::ooxml::{DocxExtractor, PptxExtractor, SpreadsheetExtractor};
use lopdf::Document;
use std::path::Path;

/// Turns one source file into the uniform page list.
pub trait DocumentExtractor: Sync {
    fn extract_pages(&self, path: &Path) -> Result<Vec<Page>, IngestError>;
}

#[derive(Default)]
pub struct PdfExtractor;

impl DocumentExtractor for PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<Page>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                let text = fix_bidi_text(&text);
                let language = detect_language(&text);
                pages.push(Page::text(PageId::Number(page_no), text, language));
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

static PDF: PdfExtractor = PdfExtractor;
static DOCX: DocxExtractor = DocxExtractor;
static PPTX: PptxExtractor = PptxExtractor;
static SPREADSHEET: SpreadsheetExtractor = SpreadsheetExtractor;

pub fn extractor_for(file_type: FileType) -> &'static dyn DocumentExtractor {
    match file_type {
        FileType::Pdf => &PDF,
        FileType::Docx => &DOCX,
        FileType::Pptx => &PPTX,
        FileType::Spreadsheet => &SPREADSHEET,
    }
}

/// Picks the extractor registered for the file's lower-cased suffix.
pub fn extract_file(path: &Path) -> Result<Vec<Page>, IngestError> {
    let file_type = FileType::from_path(path).ok_or_else(|| {
        let suffix = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        IngestError::UnsupportedType(suffix)
    })?;

    extractor_for(file_type).extract_pages(path)
}

/// `ar` when more than 50 Arabic characters appear in the first 500 characters.
pub fn detect_language(text: &str) -> Language {
    let arabic = text
        .chars()
        .take(500)
        .filter(|ch| ('\u{0600}'..='\u{06FF}').contains(ch))
        .count();
    if arabic > 50 {
        Language::Ar
    } else {
        Language::En
    }
}

fn is_rtl_char(ch: char) -> bool {
    matches!(ch,
        '\u{0590}'..='\u{05FF}'
        | '\u{0600}'..='\u{06FF}'
        | '\u{0750}'..='\u{077F}'
        | '\u{08A0}'..='\u{08FF}')
}

/// Reorders right-to-left runs line by line for display order.
///
/// Text without Hebrew or Arabic characters is returned untouched, and so is
/// everything when the `bidi` feature is disabled.
pub fn fix_bidi_text(text: &str) -> String {
    if text.is_empty() || !text.chars().any(is_rtl_char) {
        return text.to_string();
    }

    text.split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                line.to_string()
            } else {
                reorder_line(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(feature = "bidi")]
fn reorder_line(line: &str) -> String {
    use unicode_bidi::BidiInfo;

    let info = BidiInfo::new(line, None);
    let mut display = String::with_capacity(line.len());
    for paragraph in &info.paragraphs {
        display.push_str(&info.reorder_line(paragraph, paragraph.range.clone()));
    }
    display
}

#[cfg(not(feature = "bidi"))]
fn reorder_line(line: &str) -> String {
    line.to_string()
}

/// Prefixes table text with the `[TABLE]` marker used by every extractor.
pub fn table_page(page: PageId, rows: &[String]) -> Option<Page> {
    let body = rows
        .iter()
        .filter(|row| !row.trim().is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    if body.trim().is_empty() {
        return None;
    }
    Some(Page::text(
        page,
        format!("[TABLE]\n{}", fix_bidi_text(&body)),
        Language::Table,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn unknown_suffix_is_rejected_with_typed_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.TXT");
        fs::write(&path, "plain text")?;

        match extract_file(&path) {
            Err(IngestError::UnsupportedType(suffix)) => assert_eq!(suffix, ".txt"),
            other => panic!("expected unsupported type, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn corrupt_pdf_fails_that_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        assert!(matches!(extract_file(&path), Err(IngestError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn language_heuristic_needs_many_arabic_characters() {
        assert_eq!(detect_language("maintenance procedure"), Language::En);
        let arabic = "إجراء السلامة ".repeat(10);
        assert_eq!(detect_language(&arabic), Language::Ar);
        assert_eq!(detect_language("إجراء"), Language::En);
    }

    #[test]
    fn latin_text_is_not_reordered() {
        let text = "Line one\n\nLine two";
        assert_eq!(fix_bidi_text(text), text);
    }

    #[test]
    fn bidi_pass_keeps_line_structure() {
        let text = "مرحبا بالعالم\n\nsecond line";
        let fixed = fix_bidi_text(text);
        assert_eq!(fixed.split('\n').count(), 3);
        assert_eq!(fixed.chars().count(), text.chars().count());
    }

    #[test]
    fn table_page_is_marked_and_skips_blank_rows() {
        let rows = vec!["a | b".to_string(), "   ".to_string(), "c | d".to_string()];
        let page = table_page(PageId::Number(2), &rows).expect("table has content");
        assert_eq!(page.language, Language::Table);
        assert_eq!(page.text, "[TABLE]\na | b\nc | d");
        assert!(table_page(PageId::Number(3), &[" ".to_string()]).is_none());
    }
}
