use crate::error::IngestError;
use crate::models::{ChunkRecord, Page};
use crate::traits::EntityRecognizer;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

const MAX_PATTERN_MATCHES: usize = 5;
const MAX_ENTITIES_PER_KIND: usize = 3;
const ENTITY_MIN_CHUNK_CHARS: usize = 100;
const ENTITY_INPUT_CHARS: usize = 500;

/// Named, case-insensitive patterns copied into chunk metadata.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<(String, Regex)>,
}

impl PatternSet {
    pub fn compile(patterns: &[(String, String)]) -> Result<Self, IngestError> {
        let patterns = patterns
            .iter()
            .map(|(name, pattern)| {
                let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
                Ok((name.clone(), regex))
            })
            .collect::<Result<Vec<_>, IngestError>>()?;
        Ok(Self { patterns })
    }

    /// Up to five distinct matches per pattern, first-seen order, joined by `, `.
    pub fn matches(&self, text: &str) -> BTreeMap<String, String> {
        let mut found = BTreeMap::new();
        for (name, regex) in &self.patterns {
            let mut distinct: Vec<&str> = Vec::new();
            for hit in regex.find_iter(text) {
                if !distinct.contains(&hit.as_str()) {
                    distinct.push(hit.as_str());
                }
                if distinct.len() == MAX_PATTERN_MATCHES {
                    break;
                }
            }
            if !distinct.is_empty() {
                found.insert(name.clone(), distinct.join(", "));
            }
        }
        found
    }
}

/// Filesystem facts shared by every chunk of one file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileFacts {
    pub file_type: String,
    pub file_size: u64,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
}

impl FileFacts {
    pub fn read(path: &Path) -> Result<Self, IngestError> {
        let metadata = std::fs::metadata(path)?;
        let file_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        Ok(Self {
            file_type,
            file_size: metadata.len(),
            // Not every filesystem records a birth time.
            created_at: metadata.created().ok().map(iso_timestamp),
            modified_at: metadata.modified().ok().map(iso_timestamp),
        })
    }
}

pub fn iso_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Per-document values every chunk record repeats.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub filename: String,
    pub total_pages: u32,
    pub facts: FileFacts,
}

/// One chunk about to become a record.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSlot<'a> {
    pub text: &'a str,
    /// Position of the chunk in the file's sequence for this page id.
    pub chunk: u32,
    /// Position of the chunk within the page it was cut from.
    pub index_in_page: usize,
}

#[derive(Clone, Default)]
pub struct MetadataEnricher {
    patterns: PatternSet,
    entities: Option<Arc<dyn EntityRecognizer>>,
}

impl fmt::Debug for MetadataEnricher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataEnricher")
            .field("patterns", &self.patterns)
            .field("entities", &self.entities.is_some())
            .finish()
    }
}

impl MetadataEnricher {
    pub fn new(patterns: PatternSet) -> Self {
        Self {
            patterns,
            entities: None,
        }
    }

    pub fn with_entities(mut self, recognizer: Arc<dyn EntityRecognizer>) -> Self {
        self.entities = Some(recognizer);
        self
    }

    pub fn enrich(&self, document: &DocumentContext, page: &Page, slot: ChunkSlot<'_>) -> ChunkRecord {
        let (persons, orgs) = self.entity_fields(slot);

        ChunkRecord {
            filename: document.filename.clone(),
            page: page.page.clone(),
            chunk: slot.chunk,
            total_pages: document.total_pages,
            language: page.language,
            patterns: self.patterns.matches(slot.text),
            sheet_title: page.sheet_title.clone(),
            total_cells: page.total_cells,
            file_type: document.facts.file_type.clone(),
            file_size: document.facts.file_size,
            created_at: document.facts.created_at.clone(),
            modified_at: document.facts.modified_at.clone(),
            persons,
            orgs,
        }
    }

    /// Entity lookup runs for the first chunk of a page only and never fails the chunk.
    fn entity_fields(&self, slot: ChunkSlot<'_>) -> (Option<String>, Option<String>) {
        let Some(recognizer) = &self.entities else {
            return (None, None);
        };
        if slot.index_in_page != 0 || slot.text.chars().count() <= ENTITY_MIN_CHUNK_CHARS {
            return (None, None);
        }

        let input: String = slot.text.chars().take(ENTITY_INPUT_CHARS).collect();
        match recognizer.recognize(&input) {
            Ok(entities) => {
                let pick = |label: &str| {
                    let mut names: Vec<&str> = Vec::new();
                    for entity in entities.iter().filter(|entity| entity.label == label) {
                        if !names.contains(&entity.text.as_str()) {
                            names.push(&entity.text);
                        }
                        if names.len() == MAX_ENTITIES_PER_KIND {
                            break;
                        }
                    }
                    (!names.is_empty()).then(|| names.join(", "))
                };
                (pick("PER"), pick("ORG"))
            }
            Err(error) => {
                debug!(error = %error, "entity recognition failed; storing chunk without entities");
                (None, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Language, PageId, DEFAULT_PATTERNS};
    use crate::traits::Entity;
    use crate::SearchError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn default_patterns() -> PatternSet {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .map(|(name, pattern)| (name.to_string(), pattern.to_string()))
            .collect::<Vec<_>>();
        PatternSet::compile(&patterns).expect("default patterns compile")
    }

    fn context() -> DocumentContext {
        DocumentContext {
            filename: "hr/policy.docx".to_string(),
            total_pages: 3,
            facts: FileFacts {
                file_type: "docx".to_string(),
                file_size: 2048,
                created_at: Some("2024-01-02T03:04:05+00:00".to_string()),
                modified_at: None,
            },
        }
    }

    struct ScriptedRecognizer {
        calls: AtomicUsize,
        fail: bool,
    }

    impl EntityRecognizer for ScriptedRecognizer {
        fn recognize(&self, _text: &str) -> Result<Vec<Entity>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SearchError::Request("service down".to_string()));
            }
            let entity = |label: &str, text: &str| Entity {
                label: label.to_string(),
                text: text.to_string(),
            };
            Ok(vec![
                entity("PER", "Layla"),
                entity("PER", "Omar"),
                entity("PER", "Layla"),
                entity("PER", "Sami"),
                entity("PER", "Noor"),
                entity("ORG", "Aramco"),
                entity("LOC", "Riyadh"),
            ])
        }
    }

    #[test]
    fn patterns_are_case_insensitive_distinct_and_capped() {
        let text = "sop SOP Sop per JAC REG 12-3 and jac reg 12-3 and JAC SGL 4-5.6";
        let found = default_patterns().matches(text);

        assert_eq!(found.get("sop").map(String::as_str), Some("sop, SOP, Sop"));
        assert_eq!(
            found.get("jac_reg").map(String::as_str),
            Some("JAC REG 12-3, jac reg 12-3")
        );
        assert_eq!(found.get("jac_sgl").map(String::as_str), Some("JAC SGL 4-5.6"));
        assert!(!found.contains_key("procedure"));

        let many = (1..=8).map(|n| format!("JAC REG {n}-1")).collect::<Vec<_>>().join(" ");
        let capped = default_patterns().matches(&many);
        assert_eq!(capped["jac_reg"].split(", ").count(), 5);
    }

    #[test]
    fn record_carries_page_and_file_facts() {
        let page = Page {
            page: PageId::Name("Budget".to_string()),
            text: String::new(),
            language: Language::En,
            sheet_title: Some("Budget".to_string()),
            total_cells: Some(12),
        };
        let record = MetadataEnricher::new(default_patterns()).enrich(
            &context(),
            &page,
            ChunkSlot {
                text: "Follow the SOP.",
                chunk: 1,
                index_in_page: 1,
            },
        );

        assert_eq!(record.record_id(), "hr/policy.docx_Budget_1");
        assert_eq!(record.total_pages, 3);
        assert_eq!(record.sheet_title.as_deref(), Some("Budget"));
        assert_eq!(record.total_cells, Some(12));
        assert_eq!(record.file_size, 2048);
        assert_eq!(record.patterns.get("sop").map(String::as_str), Some("SOP"));
        assert!(record.persons.is_none());
    }

    #[test]
    fn entities_only_for_long_first_chunks() {
        let recognizer = Arc::new(ScriptedRecognizer {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let enricher = MetadataEnricher::new(PatternSet::default()).with_entities(recognizer.clone());
        let page = Page::text(PageId::Number(1), String::new(), Language::En);
        let long = "x".repeat(150);

        let first = enricher.enrich(
            &context(),
            &page,
            ChunkSlot {
                text: &long,
                chunk: 0,
                index_in_page: 0,
            },
        );
        assert_eq!(first.persons.as_deref(), Some("Layla, Omar, Sami"));
        assert_eq!(first.orgs.as_deref(), Some("Aramco"));

        enricher.enrich(
            &context(),
            &page,
            ChunkSlot {
                text: &long,
                chunk: 1,
                index_in_page: 1,
            },
        );
        enricher.enrich(
            &context(),
            &page,
            ChunkSlot {
                text: "short first chunk",
                chunk: 2,
                index_in_page: 0,
            },
        );
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entity_failure_degrades_to_missing_fields() {
        let enricher = MetadataEnricher::new(PatternSet::default()).with_entities(Arc::new(
            ScriptedRecognizer {
                calls: AtomicUsize::new(0),
                fail: true,
            },
        ));
        let page = Page::text(PageId::Number(1), String::new(), Language::En);
        let long = "y".repeat(150);

        let record = enricher.enrich(
            &context(),
            &page,
            ChunkSlot {
                text: &long,
                chunk: 0,
                index_in_page: 0,
            },
        );

        assert!(record.persons.is_none());
        assert!(record.orgs.is_none());
    }

    #[test]
    fn file_facts_read_size_type_and_timestamps() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("Report.PDF");
        std::fs::write(&path, b"12345")?;

        let facts = FileFacts::read(&path)?;

        assert_eq!(facts.file_type, "pdf");
        assert_eq!(facts.file_size, 5);
        let modified = facts.modified_at.expect("mtime is available");
        assert!(modified.ends_with("+00:00"), "{modified}");
        Ok(())
    }
}
