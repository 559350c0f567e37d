use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("office document parse error: {0}")]
    Ooxml(String),

    #[error("legacy binary workbook is not readable: {0}")]
    LegacyWorkbook(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("document produced no chunks: {0}")]
    EmptyDocument(String),

    #[error("index storage failed: {0}")]
    Storage(#[from] SearchError),
}

impl From<zip::result::ZipError> for IngestError {
    fn from(error: zip::result::ZipError) -> Self {
        IngestError::Ooxml(error.to_string())
    }
}

impl From<quick_xml::Error> for IngestError {
    fn from(error: quick_xml::Error) -> Self {
        IngestError::Ooxml(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("store not available yet: {0}")]
    NotReady(String),
}

/// Rejections of the upload/delete surface.
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("file operations are locked while ingestion is running")]
    Locked,

    #[error("file type not allowed: {0}")]
    UnsupportedType(String),

    #[error("file is {size} bytes, limit is {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FileOpError {
    pub fn outcome_code(&self) -> &'static str {
        match self {
            FileOpError::Locked => "locked",
            FileOpError::UnsupportedType(_) => "unsupported_type",
            FileOpError::TooLarge { .. } => "too_large",
            FileOpError::AlreadyExists(_) => "already_exists",
            FileOpError::NotFound(_) => "not_found",
            FileOpError::InvalidName(_) => "invalid_name",
            FileOpError::Io(_) => "io_error",
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
