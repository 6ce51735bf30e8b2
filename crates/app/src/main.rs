use anyhow::Context;
use chrono::Utc;
use clap::{builder::BoolishValueParser, ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use study_assistant_core::{
    construct_generator, Answer, CachedEmbedder, CharacterNgramEmbedder, CrossEncoder,
    DenseIndex, Embedder, FusionStrategy, GenerationConfig, GenerationProvider, HttpCrossEncoder,
    IngestionCoordinator, IngestionOptions, LayeredExtractor, LocalVectorStore, ModelCache,
    ModelProfile, OcrAdapter, OcrBackendKind, OcrConfig, OllamaEmbedder, QdrantStore, Readiness,
    Reranker, RetrievalConfig, SearchError, StudyAssistant, TermOverlapScorer,
    DEFAULT_CROSS_ENCODER, DEFAULT_EMBEDDING_DIMENSIONS,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "study-assistant", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Folder that holds the course PDFs.
    #[arg(long, env = "PDF_DIR", default_value = "university_documents")]
    documents: PathBuf,

    /// Index storage location.
    #[arg(long, env = "INDEX_DIR", default_value = "./academic_db")]
    index_dir: PathBuf,

    /// Collection name inside the index.
    #[arg(long, default_value = "academic_docs")]
    collection: String,

    #[arg(long, value_enum, default_value_t = DenseBackend::Local)]
    dense_backend: DenseBackend,

    /// Qdrant base URL, used with `--dense-backend qdrant`.
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Model profile for generation.
    #[arg(long, default_value = "general")]
    mode: ModelProfile,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    ocr: OcrArgs,

    #[command(flatten)]
    retrieval: RetrievalArgs,

    #[command(flatten)]
    generation: GenerationArgs,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DenseBackend {
    Local,
    Qdrant,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedderKind {
    CharTrigram,
    Ollama,
}

#[derive(Args)]
struct EmbeddingArgs {
    #[arg(long, env = "EMBEDDING_BACKEND", value_enum, default_value_t = EmbedderKind::CharTrigram)]
    embedder: EmbedderKind,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "nomic-embed-text")]
    embedding_model: String,

    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,
}

#[derive(Args)]
struct OcrArgs {
    /// Primary OCR engine; the other one is the fallback.
    #[arg(long, env = "OCR_BACKEND", default_value = "tesseract")]
    ocr_backend: OcrBackendKind,

    #[arg(long, env = "OCR_DPI", default_value_t = 220)]
    ocr_dpi: u32,

    #[arg(long, env = "OCR_LANG", default_value = "eng")]
    ocr_lang: String,

    #[arg(long, env = "PADDLE_LANG", default_value = "en")]
    paddle_lang: String,

    #[arg(
        long,
        env = "PADDLE_USE_ANGLE",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    paddle_use_angle: bool,

    /// PaddleOCR serving endpoint. Paddle is unavailable without it.
    #[arg(long, env = "PADDLE_URL")]
    paddle_url: Option<String>,
}

#[derive(Args)]
struct RetrievalArgs {
    #[arg(long, default_value_t = 3)]
    top_k: usize,

    #[arg(long, default_value = "rrf")]
    fusion: FusionStrategy,

    /// text-embeddings-inference base URL for the cross-encoder. Without it
    /// passages are re-ranked by query term overlap.
    #[arg(long, env = "RERANKER_URL")]
    reranker_url: Option<String>,

    #[arg(long, env = "RERANKER_MODEL", default_value = DEFAULT_CROSS_ENCODER)]
    reranker_model: String,
}

#[derive(Args)]
struct GenerationArgs {
    #[arg(long, env = "LLM_PROVIDER", default_value = "ollama")]
    llm_provider: GenerationProvider,

    #[arg(long, env = "OLLAMA_BASE_URL", default_value = "http://localhost:11434")]
    ollama_base_url: String,

    #[arg(long, env = "OLLAMA_MODEL", default_value = "llama3.1:8b")]
    ollama_model: String,

    #[arg(long, env = "OLLAMA_MODEL_MATH", default_value = "qwen-4b-math")]
    ollama_model_math: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    openai_model: String,

    #[arg(long, default_value_t = 30)]
    llm_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Extract, chunk and index every PDF in the documents folder.
    Ingest {
        /// Descend into subfolders.
        #[arg(long, default_value_t = false)]
        recursive: bool,
        /// Files processed in parallel. Defaults to the CPU count.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Answer one question and print its sources.
    Ask {
        #[arg(long)]
        question: String,
        #[arg(long)]
        student_name: Option<String>,
    },
    /// Interactive question loop. `exit`, `quit` or `q` ends it.
    Chat {
        #[arg(long)]
        student_name: Option<String>,
    },
    /// Report whether the index is ready for questions.
    Health,
}

impl Cli {
    fn index_missing(&self) -> bool {
        self.dense_backend == DenseBackend::Local
            && !LocalVectorStore::exists(&self.index_dir, &self.collection)
    }

    fn embedder(&self, models: &ModelCache) -> Result<Arc<dyn Embedder>, SearchError> {
        let args = &self.embedding;
        match args.embedder {
            EmbedderKind::CharTrigram => {
                let local: Arc<dyn Embedder> =
                    Arc::new(CharacterNgramEmbedder::new(args.embedding_dimensions));
                let model_id = local.model_id().to_string();
                models.get_or_try_init(&model_id, move || Ok(local))
            }
            EmbedderKind::Ollama => models.get_or_try_init(&args.embedding_model, || {
                let remote = OllamaEmbedder::new(
                    &self.generation.ollama_base_url,
                    &args.embedding_model,
                    args.embedding_dimensions,
                    Duration::from_secs(120),
                )?;
                let cached: Arc<dyn Embedder> = Arc::new(CachedEmbedder::open(
                    Arc::new(remote),
                    &self.index_dir.join("embeddings"),
                )?);
                Ok(cached)
            }),
        }
    }

    fn dense(&self, embedder: Arc<dyn Embedder>) -> Result<Arc<dyn DenseIndex>, SearchError> {
        let dense: Arc<dyn DenseIndex> = match self.dense_backend {
            DenseBackend::Local => Arc::new(LocalVectorStore::open(
                &self.index_dir,
                &self.collection,
                embedder,
            )?),
            DenseBackend::Qdrant => {
                Arc::new(QdrantStore::new(&self.qdrant_url, &self.collection, embedder))
            }
        };
        Ok(dense)
    }

    fn ocr_config(&self) -> OcrConfig {
        OcrConfig {
            primary: self.ocr.ocr_backend,
            tesseract_language: self.ocr.ocr_lang.clone(),
            paddle_endpoint: self.ocr.paddle_url.clone(),
            paddle_language: self.ocr.paddle_lang.clone(),
            paddle_use_angle: self.ocr.paddle_use_angle,
            ..OcrConfig::default()
        }
    }

    fn retrieval_config(&self) -> RetrievalConfig {
        RetrievalConfig {
            top_k: self.retrieval.top_k,
            fusion: self.retrieval.fusion,
            ..RetrievalConfig::default()
        }
    }

    fn generation_config(&self) -> GenerationConfig {
        let args = &self.generation;
        GenerationConfig {
            provider: args.llm_provider,
            ollama_base_url: args.ollama_base_url.clone(),
            ollama_model: args.ollama_model.clone(),
            ollama_math_model: args.ollama_model_math.clone(),
            openai_api_key: args.openai_api_key.clone(),
            openai_model: args.openai_model.clone(),
            timeout: Duration::from_secs(args.llm_timeout_secs),
            ..GenerationConfig::default()
        }
    }

    fn reranker(&self) -> Result<Reranker, SearchError> {
        let model: Arc<dyn CrossEncoder> = match &self.retrieval.reranker_url {
            Some(url) => Arc::new(HttpCrossEncoder::new(
                url,
                &self.retrieval.reranker_model,
                Duration::from_secs(30),
            )?),
            None => {
                info!("no cross-encoder endpoint configured; re-ranking by term overlap");
                Arc::new(TermOverlapScorer)
            }
        };
        Ok(Reranker::new(model))
    }

    async fn assistant(&self, models: &ModelCache) -> anyhow::Result<StudyAssistant> {
        if self.index_missing() {
            return Err(SearchError::IndexNotReady(Readiness::Missing.to_string()).into());
        }

        let generator = construct_generator(&self.generation_config(), self.mode)?;
        let dense = self.dense(self.embedder(models)?)?;
        let assistant =
            StudyAssistant::build(dense, self.retrieval_config(), self.reranker()?, generator)
                .await?;
        Ok(assistant)
    }
}

fn print_answer(answer: &Answer) {
    println!("\nAnswer:\n{}", answer.text);
    if answer.sources.is_empty() {
        return;
    }
    println!("\nSources:");
    for (position, source) in answer.sources.iter().enumerate() {
        println!(
            "{}. {} (Page {}) - {}",
            position + 1,
            source.source,
            source.page,
            source.content_type
        );
    }
}

async fn run_ingest(
    cli: &Cli,
    models: &ModelCache,
    recursive: bool,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let mut options = IngestionOptions {
        render_dpi: cli.ocr.ocr_dpi,
        recursive,
        ..IngestionOptions::default()
    };
    if let Some(workers) = workers {
        options.max_workers = workers;
    }

    let extractor = LayeredExtractor::with_lopdf(OcrAdapter::from_config(&cli.ocr_config()))
        .with_dpi(options.render_dpi)
        .with_min_text_chars(options.min_page_text_chars);
    let coordinator = IngestionCoordinator::new(Arc::new(extractor), options)?;

    let embedder = cli.embedder(models)?;
    if cli.dense_backend == DenseBackend::Qdrant {
        QdrantStore::new(&cli.qdrant_url, &cli.collection, embedder.clone())
            .ensure_collection()
            .await?;
    }
    let dense = cli.dense(embedder)?;

    let outcome = coordinator
        .ingest(&cli.documents, dense.as_ref())
        .await
        .with_context(|| format!("ingesting {}", cli.documents.display()))?;

    for skipped in &outcome.skipped {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
    }
    println!(
        "{} chunks committed from {} files ({} skipped)",
        outcome.chunks_committed,
        outcome.files_found,
        outcome.skipped.len()
    );
    Ok(())
}

async fn run_chat(assistant: &StudyAssistant, student_name: Option<&str>) -> anyhow::Result<()> {
    info!("study assistant ready, type 'exit' to quit");
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(b"\nEnter your question: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if matches!(question.to_lowercase().as_str(), "exit" | "quit" | "q") {
            break;
        }
        if question.is_empty() {
            continue;
        }

        match assistant.ask(question, student_name).await {
            Ok(answer) => print_answer(&answer),
            Err(error) => error!(%error, "question failed"),
        }
    }
    Ok(())
}

async fn run_health(cli: &Cli, models: &ModelCache) -> anyhow::Result<()> {
    let readiness = if cli.index_missing() {
        Readiness::Missing
    } else {
        let dense = cli.dense(cli.embedder(models)?)?;
        Readiness::probe(dense.as_ref()).await?
    };

    println!("{readiness}");
    readiness.require_ready()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let models = ModelCache::new();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "study-assistant boot"
    );

    match &cli.command {
        Command::Ingest { recursive, workers } => {
            run_ingest(&cli, &models, *recursive, *workers).await?
        }
        Command::Ask {
            question,
            student_name,
        } => {
            let assistant = cli.assistant(&models).await?;
            let answer = assistant.ask(question, student_name.as_deref()).await?;
            print_answer(&answer);
        }
        Command::Chat { student_name } => {
            let assistant = cli.assistant(&models).await?;
            run_chat(&assistant, student_name.as_deref()).await?;
        }
        Command::Health => run_health(&cli, &models).await?,
    }

    Ok(())
}
