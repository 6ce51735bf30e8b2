use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    /// A single page or file could not be read. Never fatal for a run.
    #[error("extraction failed for {path} page {page:?}: {reason}")]
    Extraction {
        path: String,
        page: Option<u32>,
        reason: String,
    },

    #[error("page render failed: {0}")]
    Rasterize(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("ingestion task failed: {0}")]
    Task(String),

    #[error("index commit failed: {0}")]
    Index(#[from] SearchError),
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

    #[error("system not ready: {0}")]
    IndexNotReady(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },
}

impl SearchError {
    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::IndexNotReady(_))
    }
}
