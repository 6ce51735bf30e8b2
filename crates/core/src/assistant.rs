use crate::generation::Generator;
use crate::models::{ContentType, RetrievalConfig};
use crate::rerank::{RerankedChunk, Reranker};
use crate::retriever::{validate_query, HybridRetriever};
use crate::traits::DenseIndex;
use crate::SearchError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

const SOURCE_LIMIT: usize = 3;

/// Result of probing the dense index once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The index location does not exist.
    Missing,
    Empty,
    Ready { chunks: usize },
}

impl Readiness {
    pub async fn probe(dense: &dyn DenseIndex) -> Result<Self, SearchError> {
        Ok(match dense.count().await? {
            0 => Readiness::Empty,
            chunks => Readiness::Ready { chunks },
        })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    pub fn require_ready(self) -> Result<usize, SearchError> {
        match self {
            Readiness::Ready { chunks } => Ok(chunks),
            other => Err(SearchError::IndexNotReady(other.to_string())),
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Missing => f.write_str("academic database not found, run ingestion first"),
            Readiness::Empty => f.write_str("no documents have been indexed yet"),
            Readiness::Ready { chunks } => write!(f, "ready ({chunks} chunks indexed)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub source: String,
    pub page: u32,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
}

pub fn personalize(question: &str, student_name: Option<&str>) -> String {
    match student_name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => format!("Hi! I'm {name}. {question}"),
        None => question.to_string(),
    }
}

pub fn build_prompt(question: &str, passages: &[RerankedChunk]) -> String {
    let context = passages
        .iter()
        .map(|passage| {
            let metadata = &passage.retrieved.chunk.metadata;
            format!(
                "[{} p.{}] {}",
                metadata.source, metadata.page_number, passage.retrieved.chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are an academic assistant helping university students. Answer using ONLY the \
course material below.\n\
\n\
Guidelines:\n\
- Explain clearly, at a level suitable for students\n\
- Cite the supporting passage in square brackets, e.g. [lecture.pdf p.3]\n\
- If the material does not fully cover the question, say what it does cover and suggest \
consulting further resources\n\
- Use a short example when it makes a concept easier to follow\n\
\n\
Course material:\n\
{context}\n\
\n\
Question:\n\
{question}\n\
\n\
Answer:\n"
    )
}

/// Retrieval, re-ranking and generation for one question at a time.
pub struct StudyAssistant {
    retriever: HybridRetriever,
    reranker: Reranker,
    generator: Arc<dyn Generator>,
}

impl StudyAssistant {
    /// Refuses to start unless the dense index holds at least one chunk.
    pub async fn build(
        dense: Arc<dyn DenseIndex>,
        config: RetrievalConfig,
        reranker: Reranker,
        generator: Arc<dyn Generator>,
    ) -> Result<Self, SearchError> {
        let chunks = Readiness::probe(dense.as_ref()).await?.require_ready()?;
        info!(chunks, "found indexed chunks");

        let retriever = HybridRetriever::build(dense, config).await?;
        info!(
            reranker = reranker.model_id(),
            generator = generator.model_id(),
            "study assistant initialized"
        );
        Ok(Self::new(retriever, reranker, generator))
    }

    pub fn new(
        retriever: HybridRetriever,
        reranker: Reranker,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            retriever,
            reranker,
            generator,
        }
    }

    pub async fn ask(
        &self,
        question: &str,
        student_name: Option<&str>,
    ) -> Result<Answer, SearchError> {
        let question = validate_query(question)?;

        let candidates = self.retriever.retrieve(question).await?;
        let passages = self.reranker.rerank(question, candidates).await?;
        debug!(passages = passages.len(), "built context");

        let prompt = build_prompt(&personalize(question, student_name), &passages);
        let text = self.generator.complete(&prompt).await?;

        let sources = passages
            .iter()
            .take(SOURCE_LIMIT)
            .map(|passage| {
                let chunk = &passage.retrieved.chunk;
                SourceRef {
                    chunk_id: chunk.chunk_id.clone(),
                    source: chunk.metadata.source.clone(),
                    page: chunk.metadata.page_number,
                    content_type: chunk.metadata.content_type,
                }
            })
            .collect();

        Ok(Answer { text, sources })
    }
}
