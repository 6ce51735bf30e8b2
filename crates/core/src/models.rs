use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DOCUMENT_TYPE: &str = "Academic Document";
pub const DEFAULT_SUBJECT: &str = "General";

/// One source PDF for the duration of an ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub document_id: String,
    pub source_name: String,
    pub source_path: String,
    pub upload_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    LectureNotes,
    Textbook,
    ResearchPaper,
    General,
}

impl ContentType {
    /// First keyword hit on the lowercased file name wins.
    pub fn from_file_name(name: &str) -> Self {
        const RULES: [(&str, ContentType); 3] = [
            ("lecture", ContentType::LectureNotes),
            ("textbook", ContentType::Textbook),
            ("paper", ContentType::ResearchPaper),
        ];

        let lowered = name.to_lowercase();
        RULES
            .iter()
            .find(|(keyword, _)| lowered.contains(keyword))
            .map(|(_, kind)| *kind)
            .unwrap_or(ContentType::General)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::LectureNotes => "lecture_notes",
            ContentType::Textbook => "textbook",
            ContentType::ResearchPaper => "research_paper",
            ContentType::General => "general",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub source: String,
    pub source_path: String,
    pub page_number: u32,
    pub chunk_index: usize,
    pub document_type: String,
    pub subject: String,
    pub upload_date: NaiveDate,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PdfChunk {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl PdfChunk {
    pub fn make_id(document_id: &str, page_number: u32, chunk_index: usize) -> String {
        format!("{document_id}-p{page_number}-c{chunk_index}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSignal {
    Sparse,
    Dense,
    Fused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: PdfChunk,
    pub score: f64,
    pub signal: RetrievalSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionStrategy {
    /// `Σ weight / (rrf_k + rank)` with 1-based ranks.
    ReciprocalRank,
    /// Per-list min-max normalised raw scores summed by weight.
    WeightedScore,
}

impl FromStr for FusionStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "rrf" | "reciprocal-rank" | "reciprocal_rank" => Ok(Self::ReciprocalRank),
            "weighted" | "weighted-score" | "weighted_score" => Ok(Self::WeightedScore),
            other => Err(format!("unknown fusion strategy `{other}` (expected rrf|weighted)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub sparse_weight: f64,
    pub dense_weight: f64,
    pub fusion: FusionStrategy,
    pub rrf_k: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            sparse_weight: 0.5,
            dense_weight: 0.5,
            fusion: FusionStrategy::ReciprocalRank,
            rrf_k: 60.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_chars: usize,
    pub min_page_text_chars: usize,
    pub render_dpi: u32,
    pub max_workers: usize,
    pub recursive: bool,
    pub document_type: String,
    pub subject: String,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
            min_chunk_chars: 30,
            min_page_text_chars: 25,
            render_dpi: 220,
            max_workers: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(4),
            recursive: false,
            document_type: DEFAULT_DOCUMENT_TYPE.to_string(),
            subject: DEFAULT_SUBJECT.to_string(),
        }
    }
}
