use crate::error::IngestError;
use crate::models::IngestionOptions;
use regex::Regex;

/// Pages with less trimmed text than this produce no chunks.
pub const MIN_CHUNKABLE_CHARS: usize = 50;

const PARAGRAPH_SEPARATOR: &str = "\n\n";
const SPLIT_PATTERN: &str = r"\n\s*\n|[.!?؟।]\s+";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            overlap: 100,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, IngestError> {
        if chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be positive".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {overlap} must be smaller than chunk size {chunk_size}"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }
}

impl TryFrom<&IngestionOptions> for ChunkingConfig {
    type Error = IngestError;

    fn try_from(value: &IngestionOptions) -> Result<Self, Self::Error> {
        Self::new(value.chunk_size, value.chunk_overlap)
    }
}

/// Paragraph-accumulating splitter with word-aligned trailing overlap.
///
/// Sizes are counted in characters. A chunk only exceeds `chunk_size` when it
/// is a single paragraph that is longer than `chunk_size` on its own.
#[derive(Debug, Clone)]
pub struct TextChunker {
    config: ChunkingConfig,
    splitter: Regex,
}

impl TextChunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        Ok(Self {
            config,
            splitter: Regex::new(SPLIT_PATTERN)?,
        })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.chars().count() < MIN_CHUNKABLE_CHARS {
            return Vec::new();
        }

        let Some(paragraphs) = self.split_paragraphs(text) else {
            return truncate_head(text, self.config.chunk_size)
                .map(|head| vec![head.to_string()])
                .unwrap_or_default();
        };

        let size = self.config.chunk_size;
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for paragraph in paragraphs {
            let paragraph_len = paragraph.chars().count();

            if current_len + paragraph_len < size {
                current.push_str(paragraph);
                current.push_str(PARAGRAPH_SEPARATOR);
                current_len += paragraph_len + PARAGRAPH_SEPARATOR.len();
                continue;
            }

            let closed = current.trim();
            let mut next = String::new();
            if !closed.is_empty() {
                // Leave room for the paragraph so the seeded chunk stays in bounds.
                let budget = self
                    .config
                    .overlap
                    .min(size.saturating_sub(paragraph_len + 2 * PARAGRAPH_SEPARATOR.len()));
                let overlap = tail_at_word_boundary(closed, budget);
                if !overlap.is_empty() {
                    next.push_str(overlap);
                    next.push_str(PARAGRAPH_SEPARATOR);
                }
                chunks.push(closed.to_string());
            }

            next.push_str(paragraph);
            next.push_str(PARAGRAPH_SEPARATOR);
            current_len = next.chars().count();
            current = next;
        }

        let tail = current.trim();
        if !tail.is_empty() {
            chunks.push(tail.to_string());
        }

        chunks
    }

    /// `None` when the text contains no paragraph or sentence boundary.
    fn split_paragraphs<'t>(&self, text: &'t str) -> Option<Vec<&'t str>> {
        let mut paragraphs = Vec::new();
        let mut start = 0usize;
        let mut found = false;

        for boundary in self.splitter.find_iter(text) {
            found = true;
            // Sentence terminators stay with their sentence; blank lines are dropped.
            let end = match boundary.as_str().chars().next() {
                Some(first) if !first.is_whitespace() => boundary.start() + first.len_utf8(),
                _ => boundary.start(),
            };
            push_trimmed(&mut paragraphs, &text[start..end]);
            start = boundary.end();
        }

        if !found {
            return None;
        }
        push_trimmed(&mut paragraphs, &text[start..]);
        Some(paragraphs)
    }
}

fn push_trimmed<'t>(paragraphs: &mut Vec<&'t str>, piece: &'t str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        paragraphs.push(piece);
    }
}

fn byte_offset_of_char(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len())
}

/// Last `max_chars` characters of `text`, moved forward to the next word start.
pub fn tail_at_word_boundary(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text.trim_start();
    }
    if max_chars == 0 {
        return "";
    }

    let start = byte_offset_of_char(text, total - max_chars);
    let tail = &text[start..];
    let starts_on_boundary = text[..start]
        .chars()
        .next_back()
        .is_some_and(char::is_whitespace);
    if starts_on_boundary {
        return tail.trim_start();
    }

    match tail.find(char::is_whitespace) {
        Some(position) => tail[position..].trim_start(),
        None => "",
    }
}

/// First `max_chars` characters of `text`, cut back to the previous word end.
///
/// Text without any whitespace in range is cut hard, since no boundary exists.
pub fn truncate_head(text: &str, max_chars: usize) -> Option<&str> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.chars().count() <= max_chars {
        return Some(text);
    }

    let end = byte_offset_of_char(text, max_chars);
    let next_is_boundary = text[end..].chars().next().is_some_and(char::is_whitespace);
    let head = &text[..end];
    if next_is_boundary {
        return Some(head.trim_end());
    }

    match head.rfind(char::is_whitespace) {
        Some(position) if !head[..position].trim().is_empty() => Some(head[..position].trim_end()),
        _ => Some(head),
    }
}
