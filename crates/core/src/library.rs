use crate::error::FileOpError;
use crate::process::IngestionManager;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryOptions {
    /// Lower-cased suffixes including the dot, e.g. `.pdf`.
    pub allowed_types: Vec<String>,
    pub max_upload_bytes: u64,
}

impl Default for LibraryOptions {
    fn default() -> Self {
        Self {
            allowed_types: [".pdf", ".docx", ".pptx", ".xlsx", ".xls"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub filename: String,
    pub size: u64,
}

/// Upload and delete over the document root, refused while ingestion holds the lock.
pub struct DocumentLibrary {
    root: PathBuf,
    options: LibraryOptions,
    manager: Arc<IngestionManager>,
}

impl DocumentLibrary {
    pub fn new(root: impl Into<PathBuf>, manager: Arc<IngestionManager>) -> Self {
        Self {
            root: root.into(),
            options: LibraryOptions::default(),
            manager,
        }
    }

    pub fn with_options(mut self, options: LibraryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upload(&self, filename: &str, bytes: &[u8]) -> Result<StoredDocument, FileOpError> {
        self.manager.with_file_operations(|| {
            let (relative, path) = self.resolve(filename)?;
            self.check_type(&relative)?;

            let size = bytes.len() as u64;
            if size > self.options.max_upload_bytes {
                return Err(FileOpError::TooLarge {
                    size,
                    max: self.options.max_upload_bytes,
                });
            }

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(FileOpError::AlreadyExists(relative));
                }
                Err(error) => return Err(error.into()),
            };
            if let Err(error) = file.write_all(bytes).and_then(|_| file.sync_all()) {
                drop(file);
                if let Err(cleanup) = fs::remove_file(&path) {
                    warn!(file = %relative, error = %cleanup, "failed to remove partial upload");
                }
                return Err(error.into());
            }

            info!(file = %relative, size, "document uploaded");
            Ok(StoredDocument {
                filename: relative,
                size,
            })
        })
    }

    pub fn delete(&self, filename: &str) -> Result<(), FileOpError> {
        self.manager.with_file_operations(|| {
            let (relative, path) = self.resolve(filename)?;
            if !path.is_file() {
                return Err(FileOpError::NotFound(relative));
            }
            fs::remove_file(&path)?;
            info!(file = %relative, "document deleted");
            Ok(())
        })
    }

    /// Normalizes separators and confines the name to the document root.
    fn resolve(&self, filename: &str) -> Result<(String, PathBuf), FileOpError> {
        let normalized = filename.trim().replace('\\', "/");
        let relative = Path::new(&normalized);
        let confined = !normalized.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !confined {
            return Err(FileOpError::InvalidName(filename.to_string()));
        }
        Ok((normalized.clone(), self.root.join(relative)))
    }

    fn check_type(&self, relative: &str) -> Result<(), FileOpError> {
        let suffix = Path::new(relative)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
            .unwrap_or_default();
        if self.options.allowed_types.iter().any(|allowed| *allowed == suffix) {
            Ok(())
        } else {
            Err(FileOpError::UnsupportedType(suffix))
        }
    }
}
