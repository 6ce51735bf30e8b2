use crate::chunking::{build_chunks, ChunkingConfig, RecursiveSplitter};
use crate::extractor::PdfExtractor;
use crate::models::{Document, IngestionOptions, PdfChunk};
use crate::traits::DenseIndex;
use crate::IngestError;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

/// PDFs directly under `folder` (or below it when `recursive`), sorted.
pub fn discover_pdf_files(folder: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(folder);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort_unstable();
    files
}

/// UUIDv5 of the canonical path's file URI. Same path, same id; content is ignored.
pub fn document_id_for(canonical: &Path) -> String {
    let key = Url::from_file_path(canonical)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| canonical.to_string_lossy().to_string());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
        .simple()
        .to_string()
}

pub fn document_for_path(path: &Path) -> Result<Document, IngestError> {
    let canonical = path.canonicalize()?;
    let source_name = canonical
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(canonical.display().to_string()))?
        .to_string();

    Ok(Document {
        document_id: document_id_for(&canonical),
        source_name,
        source_path: canonical.to_string_lossy().to_string(),
        upload_date: Utc::now().date_naive(),
    })
}

#[derive(Debug)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub files_found: usize,
    pub chunks_committed: usize,
    pub skipped: Vec<SkippedPdf>,
}

/// Chunks from every file in file-list order, plus the files that produced none.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub files_found: usize,
    pub chunks: Vec<PdfChunk>,
    pub skipped: Vec<SkippedPdf>,
}

pub struct IngestionCoordinator {
    extractor: Arc<dyn PdfExtractor>,
    splitter: Arc<RecursiveSplitter>,
    options: Arc<IngestionOptions>,
}

impl IngestionCoordinator {
    pub fn new(
        extractor: Arc<dyn PdfExtractor>,
        options: IngestionOptions,
    ) -> Result<Self, IngestError> {
        let splitter = RecursiveSplitter::new(ChunkingConfig::from(&options))?;
        Ok(Self {
            extractor,
            splitter: Arc::new(splitter),
            options: Arc::new(options),
        })
    }

    /// Fans extraction and chunking out over a bounded pool of blocking
    /// tasks, one per file, then joins them in file-list order.
    pub async fn prepare(&self, folder: &Path) -> Result<PreparedBatch, IngestError> {
        if !folder.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "directory '{}' does not exist",
                folder.display()
            )));
        }

        let files = discover_pdf_files(folder, self.options.recursive);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }
        info!(files = files.len(), folder = %folder.display(), "found pdf files to process");

        let permits = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let mut handles = Vec::with_capacity(files.len());

        for path in &files {
            let permits = permits.clone();
            let extractor = self.extractor.clone();
            let splitter = self.splitter.clone();
            let options = self.options.clone();
            let path = path.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|error| IngestError::Task(error.to_string()))?;
                tokio::task::spawn_blocking(move || {
                    process_file(extractor.as_ref(), &splitter, &options, &path)
                })
                .await
                .map_err(|error| IngestError::Task(error.to_string()))?
            }));
        }

        let mut batch = PreparedBatch {
            files_found: files.len(),
            ..PreparedBatch::default()
        };

        for (path, handle) in files.into_iter().zip(handles) {
            let result = handle
                .await
                .map_err(|error| IngestError::Task(error.to_string()))
                .and_then(|inner| inner);

            match result {
                Ok(chunks) if chunks.is_empty() => {
                    warn!(path = %path.display(), "skipping empty pdf (no extractable text)");
                    batch.skipped.push(SkippedPdf {
                        path,
                        reason: "no extractable text".to_string(),
                    });
                }
                Ok(chunks) => {
                    info!(path = %path.display(), chunk_count = chunks.len(), "prepared chunks");
                    batch.chunks.extend(chunks);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable pdf");
                    batch.skipped.push(SkippedPdf {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(batch)
    }

    /// Prepares every file and commits all chunks to `dense` in one batch.
    pub async fn ingest(
        &self,
        folder: &Path,
        dense: &dyn DenseIndex,
    ) -> Result<IngestOutcome, IngestError> {
        let batch = self.prepare(folder).await?;
        let mut outcome = IngestOutcome {
            files_found: batch.files_found,
            chunks_committed: 0,
            skipped: batch.skipped,
        };

        if batch.chunks.is_empty() {
            info!("no chunks to add");
            return Ok(outcome);
        }

        info!(chunk_count = batch.chunks.len(), "adding chunks to the dense index");
        dense.add_chunks(&batch.chunks).await?;
        outcome.chunks_committed = batch.chunks.len();

        let total = dense.count().await?;
        info!(total, "finished processing");
        Ok(outcome)
    }
}

fn process_file(
    extractor: &dyn PdfExtractor,
    splitter: &RecursiveSplitter,
    options: &IngestionOptions,
    path: &Path,
) -> Result<Vec<PdfChunk>, IngestError> {
    let document = document_for_path(path)?;
    let pages = extractor.extract_pages(path);

    Ok(pages
        .iter()
        .flat_map(|page| build_chunks(&document, page.number, &page.text, splitter, options))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::extractor::tests::{CountingRasterizer, FakeTextLayer};
    use crate::extractor::LayeredExtractor;
    use crate::ocr::tests::FixedRecognizer;
    use crate::ocr::OcrAdapter;
    use crate::extractor::PageText;
    use crate::stores::LocalVectorStore;
    use std::fs;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    fn lecture_page() -> String {
        "Cells are the basic structural unit of living organisms. ".repeat(9)
    }

    fn store() -> LocalVectorStore {
        LocalVectorStore::in_memory(Arc::new(CharacterNgramEmbedder::default()))
    }

    fn coordinator(layer: FakeTextLayer, ocr_text: &str) -> IngestionCoordinator {
        let ocr = OcrAdapter::new(Some(FixedRecognizer::new("fake", ocr_text)), None);
        let extractor = LayeredExtractor::new(
            Arc::new(layer),
            Arc::new(CountingRasterizer::default()),
            ocr,
        );
        IngestionCoordinator::new(Arc::new(extractor), IngestionOptions::default()).unwrap()
    }

    #[test]
    fn discovery_is_flat_unless_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("b.PDF"), b"%PDF")?;
        fs::write(dir.path().join("a.pdf"), b"%PDF")?;
        fs::write(dir.path().join("notes.txt"), b"x")?;
        fs::write(nested.join("c.pdf"), b"%PDF")?;

        let flat = discover_pdf_files(dir.path(), false);
        assert_eq!(flat, vec![dir.path().join("a.pdf"), dir.path().join("b.PDF")]);
        assert_eq!(discover_pdf_files(dir.path(), true).len(), 3);
        Ok(())
    }

    #[test]
    fn same_path_gives_same_document_id() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("lecture-01.pdf");
        fs::write(&path, b"first")?;
        let first = document_for_path(&path)?;

        fs::write(&path, b"changed content")?;
        let dotted = dir.path().join(".").join("lecture-01.pdf");
        let second = document_for_path(&dotted)?;

        assert_eq!(first.document_id, second.document_id);
        assert_eq!(first.document_id.len(), 32);
        assert_eq!(second.source_name, "lecture-01.pdf");
        Ok(())
    }

    #[tokio::test]
    async fn two_page_scan_keeps_page_one_and_drops_short_ocr_page(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("biology-lecture.pdf");
        fs::write(&path, b"%PDF")?;

        let mut layer = FakeTextLayer::default();
        layer.files.insert(
            path.clone(),
            vec![(1, Some(lecture_page())), (2, Some(String::new()))],
        );

        let batch = coordinator(layer, "Figure 1 caption").prepare(dir.path()).await?;

        assert_eq!(batch.chunks.len(), 1);
        assert_eq!(batch.chunks[0].metadata.page_number, 1);
        assert!(batch.chunks.iter().all(|chunk| chunk.text.trim().chars().count() >= 30));
        Ok(())
    }

    #[tokio::test]
    async fn reruns_produce_identical_ids_in_identical_order(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut layer = FakeTextLayer::default();
        for name in ["a-textbook.pdf", "b-paper.pdf", "c-notes.pdf"] {
            let path = dir.path().join(name);
            fs::write(&path, b"%PDF")?;
            let body = "Enzymes speed up reactions.\n\n".repeat(60);
            let text = format!("{name} discusses enzymes. {body}");
            layer.files.insert(path, vec![(1, Some(text))]);
        }
        let coordinator = coordinator(layer, "");

        let first: Vec<String> = coordinator
            .prepare(dir.path())
            .await?
            .chunks
            .into_iter()
            .map(|chunk| chunk.chunk_id)
            .collect();
        let second: Vec<String> = coordinator
            .prepare(dir.path())
            .await?
            .chunks
            .into_iter()
            .map(|chunk| chunk.chunk_id)
            .collect();

        assert!(first.len() > 3);
        assert_eq!(first, second);
        Ok(())
    }

    #[derive(Default)]
    struct SlowFirstExtractor {
        finished: Mutex<Vec<String>>,
    }

    impl PdfExtractor for SlowFirstExtractor {
        fn extract_pages(&self, path: &Path) -> Vec<PageText> {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name == "a.pdf" {
                std::thread::sleep(Duration::from_millis(400));
            }
            self.finished.lock().unwrap().push(name);
            vec![PageText {
                number: 1,
                text: lecture_page(),
            }]
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn chunks_follow_file_order_not_completion_order(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        for name in ["a.pdf", "b.pdf", "c.pdf"] {
            fs::write(dir.path().join(name), b"%PDF")?;
        }
        let extractor = Arc::new(SlowFirstExtractor::default());
        let options = IngestionOptions {
            max_workers: 4,
            ..IngestionOptions::default()
        };
        let coordinator = IngestionCoordinator::new(extractor.clone(), options)?;

        let batch = coordinator.prepare(dir.path()).await?;

        let sources: Vec<&str> = batch
            .chunks
            .iter()
            .map(|chunk| chunk.metadata.source.as_str())
            .collect();
        assert_eq!(sources, vec!["a.pdf", "b.pdf", "c.pdf"]);
        let finished = extractor.finished.lock().unwrap();
        assert_eq!(finished.last().map(String::as_str), Some("a.pdf"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_files_are_skipped_and_the_rest_committed(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let good = dir.path().join("good.pdf");
        let blank = dir.path().join("blank.pdf");
        fs::write(&good, b"%PDF")?;
        fs::write(&blank, b"%PDF")?;

        let mut layer = FakeTextLayer::default();
        layer.files.insert(good.clone(), vec![(1, Some(lecture_page()))]);
        layer.files.insert(blank.clone(), vec![(1, Some(String::new()))]);

        let dense = store();
        let outcome = coordinator(layer, "").ingest(dir.path(), &dense).await?;

        assert_eq!(outcome.files_found, 2);
        assert_eq!(outcome.chunks_committed, 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].path, blank);
        assert_eq!(dense.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn reingesting_upserts_by_chunk_id() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("good.pdf");
        fs::write(&path, b"%PDF")?;
        let mut layer = FakeTextLayer::default();
        layer.files.insert(path, vec![(1, Some(lecture_page()))]);

        let coordinator = coordinator(layer, "");
        let dense = store();
        coordinator.ingest(dir.path(), &dense).await?;
        coordinator.ingest(dir.path(), &dense).await?;

        assert_eq!(dense.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_empty_directory_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = coordinator(FakeTextLayer::default(), "");

        let empty = coordinator.prepare(dir.path()).await;
        assert!(matches!(empty, Err(IngestError::InvalidArgument(_))));

        let missing = coordinator.prepare(&dir.path().join("absent")).await;
        assert!(matches!(missing, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }
}
