pub mod assistant;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod fusion;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod ocr;
pub mod rerank;
pub mod retriever;
pub mod sparse;
pub mod stores;
pub mod traits;

pub use assistant::{Answer, Readiness, SourceRef, StudyAssistant};
pub use chunking::{build_chunks, normalize_whitespace, ChunkingConfig, RecursiveSplitter};
pub use embeddings::{
    CachedEmbedder, CharacterNgramEmbedder, Embedder, ModelCache, OllamaEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, SearchError};
pub use extractor::{LayeredExtractor, PageText, PdfExtractor, PdftoppmRasterizer};
pub use generation::{
    construct_generator, GenerationConfig, GenerationProvider, Generator, ModelProfile,
};
pub use ingest::{
    discover_pdf_files, document_for_path, IngestOutcome, IngestionCoordinator, SkippedPdf,
};
pub use models::{
    ChunkMetadata, ContentType, Document, FusionStrategy, IngestionOptions, PdfChunk,
    RetrievalConfig, RetrievalSignal, RetrievedChunk,
};
pub use ocr::{OcrAdapter, OcrBackendKind, OcrConfig};
pub use rerank::{
    CrossEncoder, HttpCrossEncoder, RerankedChunk, Reranker, TermOverlapScorer,
    DEFAULT_CROSS_ENCODER,
};
pub use retriever::HybridRetriever;
pub use sparse::Bm25Index;
pub use stores::{LocalVectorStore, QdrantStore};
pub use traits::{DenseIndex, SparseIndex};
