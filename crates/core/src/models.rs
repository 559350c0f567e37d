use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Identifier of a page inside its source document.
///
/// Paged formats (PDF, DOCX runs, slides) number their pages; spreadsheets name
/// them after the sheet, so consumers have to handle both shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageId {
    Number(u32),
    Name(String),
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageId::Number(number) => write!(f, "{number}"),
            PageId::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Ar,
    Table,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Ar => "ar",
            Language::Table => "table",
        }
    }
}

/// Closed registry of supported source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Pptx,
    Spreadsheet,
}

impl FileType {
    pub const SUFFIXES: [(&'static str, FileType); 6] = [
        ("pdf", FileType::Pdf),
        ("docx", FileType::Docx),
        ("pptx", FileType::Pptx),
        ("xlsx", FileType::Spreadsheet),
        ("xlsm", FileType::Spreadsheet),
        ("xls", FileType::Spreadsheet),
    ];

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
        Self::SUFFIXES
            .iter()
            .find(|(known, _)| *known == suffix)
            .map(|(_, file_type)| *file_type)
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_suffix)
    }
}

/// One logical unit of a source document, the uniform output of every extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub page: PageId,
    pub text: String,
    pub language: Language,
    pub sheet_title: Option<String>,
    pub total_cells: Option<u64>,
}

impl Page {
    pub fn text(page: PageId, text: String, language: Language) -> Self {
        Self {
            page,
            text,
            language,
            sheet_title: None,
            total_cells: None,
        }
    }
}

/// Metadata stored alongside every chunk in both indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub filename: String,
    pub page: PageId,
    pub chunk: u32,
    pub total_pages: u32,
    pub language: Language,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub patterns: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cells: Option<u64>,
    pub file_type: String,
    pub file_size: u64,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persons: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orgs: Option<String>,
}

impl ChunkRecord {
    /// Storage identity, unique within one rebuild.
    pub fn record_id(&self) -> String {
        format!("{}_{}_{}", self.filename, self.page, self.chunk)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub text: String,
    pub metadata: ChunkRecord,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchDocumentsResult {
    pub results: Vec<SearchResult>,
    pub total_found: usize,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub filename: String,
    pub total_pages: u32,
    pub indexed_pages: usize,
    pub chunks: usize,
    pub language: Language,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
    pub sheet_titles: Vec<String>,
    pub file_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarySummary {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListDocumentsResult {
    pub documents: Vec<DocumentSummary>,
    pub summary: LibrarySummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Regex patterns whose matches are copied into chunk metadata.
pub const DEFAULT_PATTERNS: [(&str, &str); 4] = [
    ("jac_reg", r"JAC\s+REG\s+\d+-\d+"),
    ("jac_sgl", r"JAC\s+SGL\s+\d+-\d+\.\d+"),
    ("sop", r"\bSOP\b"),
    ("procedure", r"\b(?:Procedure|إجراء)\b"),
];

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub workers: usize,
    pub patterns: Vec<(String, String)>,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 100,
            workers: crate::ingest::default_worker_count(),
            patterns: DEFAULT_PATTERNS
                .iter()
                .map(|(name, pattern)| (name.to_string(), pattern.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub embed_batch_size: usize,
    pub write_batch_size: usize,
    pub passage_max_chars: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            embed_batch_size: 64,
            write_batch_size: 100,
            passage_max_chars: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub semantic_weight: f64,
    pub enable_semantic: bool,
    pub enable_lexical: bool,
    pub dedupe_prefix_chars: usize,
    pub rerank_floor: usize,
    pub rerank_max_chars: usize,
    pub max_results: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            semantic_weight: 0.7,
            enable_semantic: true,
            enable_lexical: true,
            dedupe_prefix_chars: 100,
            rerank_floor: 25,
            rerank_max_chars: 512,
            max_results: 25,
        }
    }
}
