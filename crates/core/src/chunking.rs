use crate::error::IngestError;
use crate::models::{ChunkMetadata, ContentType, Document, IngestionOptions, PdfChunk};
use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;

/// Paragraph, line, sentence, word, then character boundaries.
pub const DEFAULT_SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            chunk_overlap: value.chunk_overlap,
        }
    }
}

/// Collapses space/tab runs to one space and 3+ newlines to a paragraph break.
pub fn normalize_whitespace(text: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static NEWLINES: OnceLock<Regex> = OnceLock::new();

    let spaces = SPACES.get_or_init(|| Regex::new(r"[ \t\u{00A0}]+").expect("static regex"));
    let newlines = NEWLINES.get_or_init(|| Regex::new(r"\n{3,}").expect("static regex"));

    let collapsed = spaces.replace_all(text, " ");
    newlines.replace_all(&collapsed, "\n\n").trim().to_string()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Recursive character splitter. Pieces keep their trailing separator, so
/// joining adjacent pieces reproduces the source text exactly.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl RecursiveSplitter {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        if config.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                config.chunk_overlap, config.chunk_size
            )));
        }

        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut separator = separators.last().cloned().unwrap_or_default();
        let mut remaining: &[String] = &[];

        for (position, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                separator = String::new();
                break;
            }
            if text.contains(candidate.as_str()) {
                separator = candidate.clone();
                remaining = &separators[position + 1..];
                break;
            }
        }

        let mut final_chunks = Vec::new();
        let mut fitting = Vec::new();

        for piece in split_keep_separator(text, &separator) {
            if char_len(&piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                final_chunks.extend(self.merge_pieces(&fitting));
                fitting.clear();
            }

            if remaining.is_empty() {
                final_chunks.push(piece.trim().to_string());
            } else {
                final_chunks.extend(self.split_recursive(&piece, remaining));
            }
        }

        if !fitting.is_empty() {
            final_chunks.extend(self.merge_pieces(&fitting));
        }

        final_chunks.retain(|chunk| !chunk.is_empty());
        final_chunks
    }

    /// Greedily packs pieces up to `chunk_size`, then drops pieces from the
    /// front until at most `chunk_overlap` characters carry into the next chunk.
    fn merge_pieces(&self, pieces: &[String]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let length = char_len(piece);

            if total + length > self.chunk_size && !window.is_empty() {
                push_joined(&mut chunks, &window);

                while total > self.chunk_overlap
                    || (total + length > self.chunk_size && total > 0)
                {
                    match window.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }

            window.push_back(piece);
            total += length;
        }

        push_joined(&mut chunks, &window);
        chunks
    }
}

fn push_joined(chunks: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined = window.iter().copied().collect::<String>();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn split_keep_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }

    text.split_inclusive(separator)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits one page into tagged chunks. Fragments shorter than `min_chunk_chars`
/// after trimming are dropped; `chunk_index` stays the splitter position.
pub fn build_chunks(
    document: &Document,
    page_number: u32,
    page_text: &str,
    splitter: &RecursiveSplitter,
    options: &IngestionOptions,
) -> Vec<PdfChunk> {
    let min_chars = options.min_chunk_chars;
    let content_type = ContentType::from_file_name(&document.source_name);

    splitter
        .split_text(page_text)
        .into_iter()
        .enumerate()
        .filter_map(|(chunk_index, raw)| {
            let text = raw.trim();
            if char_len(text) < min_chars {
                return None;
            }

            Some(PdfChunk {
                chunk_id: PdfChunk::make_id(&document.document_id, page_number, chunk_index),
                text: text.to_string(),
                metadata: ChunkMetadata {
                    document_id: document.document_id.clone(),
                    source: document.source_name.clone(),
                    source_path: document.source_path.clone(),
                    page_number,
                    chunk_index,
                    document_type: options.document_type.clone(),
                    subject: options.subject.clone(),
                    upload_date: document.upload_date,
                    content_type,
                },
            })
        })
        .collect()
}
