use crate::error::IngestError;
use crate::ocr::OcrAdapter;
use lopdf::Document;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Embedded text of one page, or why it could not be read.
#[derive(Debug)]
pub struct RawPage {
    pub number: u32,
    pub text: Result<String, IngestError>,
}

pub trait TextLayer: Send + Sync {
    /// Fails only when the file itself cannot be opened.
    fn read_pages(&self, path: &Path) -> Result<Vec<RawPage>, IngestError>;
}

pub trait PageRasterizer: Send + Sync {
    fn render_png(&self, path: &Path, page: u32, dpi: u32) -> Result<Vec<u8>, IngestError>;
}

pub trait PdfExtractor: Send + Sync {
    /// Ordered non-empty pages. Unreadable files yield an empty list.
    fn extract_pages(&self, path: &Path) -> Vec<PageText>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfTextLayer;

impl TextLayer for LopdfTextLayer {
    fn read_pages(&self, path: &Path) -> Result<Vec<RawPage>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        Ok(document
            .get_pages()
            .into_keys()
            .map(|number| RawPage {
                number,
                text: document
                    .extract_text(&[number])
                    .map_err(|error| IngestError::Extraction {
                        path: path.display().to_string(),
                        page: Some(number),
                        reason: error.to_string(),
                    }),
            })
            .collect())
    }
}

/// Renders through poppler's `pdftoppm`, reading the PNG from stdout.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    binary: PathBuf,
}

impl PdftoppmRasterizer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self::new("pdftoppm")
    }
}

impl PageRasterizer for PdftoppmRasterizer {
    fn render_png(&self, path: &Path, page: u32, dpi: u32) -> Result<Vec<u8>, IngestError> {
        let page_arg = page.to_string();
        let output = Command::new(&self.binary)
            .args(["-f", &page_arg, "-l", &page_arg])
            .args(["-r", &dpi.to_string()])
            .args(["-png", "-singlefile"])
            .arg(path)
            .output()
            .map_err(|error| {
                IngestError::Rasterize(format!("{}: {error}", self.binary.display()))
            })?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(IngestError::Rasterize(format!(
                "pdftoppm exited with {} for page {page}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }
}

/// Embedded text first, OCR for pages whose text layer looks scanned.
#[derive(Clone)]
pub struct LayeredExtractor {
    text_layer: Arc<dyn TextLayer>,
    rasterizer: Arc<dyn PageRasterizer>,
    ocr: OcrAdapter,
    min_text_chars: usize,
    dpi: u32,
}

impl LayeredExtractor {
    pub fn new(
        text_layer: Arc<dyn TextLayer>,
        rasterizer: Arc<dyn PageRasterizer>,
        ocr: OcrAdapter,
    ) -> Self {
        Self {
            text_layer,
            rasterizer,
            ocr,
            min_text_chars: 25,
            dpi: 220,
        }
    }

    pub fn with_lopdf(ocr: OcrAdapter) -> Self {
        Self::new(
            Arc::new(LopdfTextLayer),
            Arc::new(PdftoppmRasterizer::default()),
            ocr,
        )
    }

    pub fn with_min_text_chars(mut self, min_text_chars: usize) -> Self {
        self.min_text_chars = min_text_chars;
        self
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    fn ocr_page(&self, path: &Path, page: u32, direct: String) -> String {
        if !self.ocr.is_available() {
            debug!(
                path = %path.display(),
                page,
                "page looks scanned but no OCR backend is available"
            );
            return direct;
        }

        match self.rasterizer.render_png(path, page, self.dpi) {
            Ok(png) => {
                let recognized = self.ocr.recognize(&png);
                if recognized.chars().count() > direct.chars().count() {
                    debug!(
                        path = %path.display(),
                        page,
                        chars = recognized.len(),
                        "using OCR text"
                    );
                    recognized
                } else {
                    direct
                }
            }
            Err(error) => {
                warn!(path = %path.display(), page, %error, "OCR fallback failed");
                direct
            }
        }
    }
}

impl PdfExtractor for LayeredExtractor {
    fn extract_pages(&self, path: &Path) -> Vec<PageText> {
        let raw_pages = match self.text_layer.read_pages(path) {
            Ok(pages) => pages,
            Err(error) => {
                error!(path = %path.display(), %error, "error extracting text from pdf");
                return Vec::new();
            }
        };

        let mut pages = Vec::with_capacity(raw_pages.len());
        for raw in raw_pages {
            let direct = match raw.text {
                Ok(text) => text.trim().to_string(),
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        page = raw.number,
                        %error,
                        "skipping unreadable page"
                    );
                    continue;
                }
            };

            let text = if direct.chars().count() < self.min_text_chars {
                self.ocr_page(path, raw.number, direct)
            } else {
                direct
            };

            if !text.is_empty() {
                pages.push(PageText {
                    number: raw.number,
                    text,
                });
            }
        }

        pages
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ocr::tests::FixedRecognizer;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct FakeTextLayer {
        pub files: HashMap<PathBuf, Vec<(u32, Option<String>)>>,
    }

    impl TextLayer for FakeTextLayer {
        fn read_pages(&self, path: &Path) -> Result<Vec<RawPage>, IngestError> {
            let pages = self
                .files
                .get(path)
                .ok_or_else(|| IngestError::PdfParse(format!("cannot open {}", path.display())))?;

            Ok(pages
                .iter()
                .map(|(number, text)| RawPage {
                    number: *number,
                    text: text.clone().ok_or_else(|| IngestError::Extraction {
                        path: path.display().to_string(),
                        page: Some(*number),
                        reason: "broken content stream".to_string(),
                    }),
                })
                .collect())
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingRasterizer {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl PageRasterizer for CountingRasterizer {
        fn render_png(&self, _path: &Path, _page: u32, _dpi: u32) -> Result<Vec<u8>, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(IngestError::Rasterize("renderer missing".to_string()))
            } else {
                Ok(b"\x89PNG".to_vec())
            }
        }
    }

    fn extractor(
        layer: FakeTextLayer,
        rasterizer: Arc<CountingRasterizer>,
        ocr_text: &str,
    ) -> LayeredExtractor {
        let ocr = OcrAdapter::new(Some(FixedRecognizer::new("fake", ocr_text)), None);
        LayeredExtractor::new(Arc::new(layer), rasterizer, ocr)
    }

    #[test]
    fn pages_with_enough_text_never_invoke_ocr() {
        let path = PathBuf::from("/docs/notes.pdf");
        let mut layer = FakeTextLayer::default();
        layer.files.insert(
            path.clone(),
            vec![
                (1, Some("This page has plenty of embedded text.".to_string())),
                (2, Some("And so does this second page here.".to_string())),
            ],
        );
        let rasterizer = Arc::new(CountingRasterizer::default());

        let pages = extractor(layer, rasterizer.clone(), "ocr").extract_pages(&path);

        assert_eq!(pages.len(), 2);
        assert_eq!(rasterizer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn scanned_page_uses_longer_ocr_text() {
        let path = PathBuf::from("/docs/scan.pdf");
        let mut layer = FakeTextLayer::default();
        layer
            .files
            .insert(path.clone(), vec![(1, Some("   ".to_string())), (2, Some("p2".to_string()))]);
        let rasterizer = Arc::new(CountingRasterizer::default());

        let pages = extractor(layer, rasterizer.clone(), "Figure 1 caption").extract_pages(&path);

        assert_eq!(rasterizer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            pages,
            vec![
                PageText {
                    number: 1,
                    text: "Figure 1 caption".to_string()
                },
                PageText {
                    number: 2,
                    text: "Figure 1 caption".to_string()
                }
            ]
        );
    }

    #[test]
    fn shorter_ocr_text_keeps_direct_text() {
        let path = PathBuf::from("/docs/short.pdf");
        let mut layer = FakeTextLayer::default();
        layer
            .files
            .insert(path.clone(), vec![(1, Some("Table of contents".to_string()))]);
        let rasterizer = Arc::new(CountingRasterizer::default());

        let pages = extractor(layer, rasterizer, "ToC").extract_pages(&path);
        assert_eq!(pages[0].text, "Table of contents");
    }

    #[test]
    fn render_failure_keeps_page_text_and_blank_pages_are_dropped() {
        let path = PathBuf::from("/docs/mixed.pdf");
        let mut layer = FakeTextLayer::default();
        layer.files.insert(
            path.clone(),
            vec![(1, Some("Intro".to_string())), (2, Some(String::new()))],
        );
        let rasterizer = Arc::new(CountingRasterizer {
            calls: AtomicUsize::new(0),
            fail: true,
        });

        let pages = extractor(layer, rasterizer, "ignored").extract_pages(&path);
        assert_eq!(
            pages,
            vec![PageText {
                number: 1,
                text: "Intro".to_string()
            }]
        );
    }

    #[test]
    fn unreadable_page_is_omitted_even_when_ocr_works() {
        let path = PathBuf::from("/docs/damaged.pdf");
        let mut layer = FakeTextLayer::default();
        layer.files.insert(
            path.clone(),
            vec![
                (1, None),
                (2, Some("Second page still has its embedded text.".to_string())),
                (3, None),
            ],
        );
        let rasterizer = Arc::new(CountingRasterizer::default());

        let ocr_text = "OCR text recovered from a broken page";
        let pages = extractor(layer, rasterizer.clone(), ocr_text).extract_pages(&path);

        assert_eq!(rasterizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            pages,
            vec![PageText {
                number: 2,
                text: "Second page still has its embedded text.".to_string()
            }]
        );
    }

    #[test]
    fn embedded_text_keeps_its_layout() {
        let path = PathBuf::from("/docs/layout.pdf");
        let mut layer = FakeTextLayer::default();
        layer.files.insert(
            path.clone(),
            vec![(1, Some("  Heading\n\n\n\nBody   text with  gaps  \n".to_string()))],
        );
        let rasterizer = Arc::new(CountingRasterizer::default());

        let pages = extractor(layer, rasterizer, "ocr").extract_pages(&path);
        assert_eq!(pages[0].text, "Heading\n\n\n\nBody   text with  gaps");
    }

    #[test]
    fn unreadable_file_yields_no_pages() {
        let rasterizer = Arc::new(CountingRasterizer::default());
        let pages = extractor(FakeTextLayer::default(), rasterizer, "x")
            .extract_pages(Path::new("/docs/missing.pdf"));
        assert!(pages.is_empty());
    }

    #[test]
    fn lopdf_layer_rejects_garbage() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%broken")?;

        let extractor = LayeredExtractor::with_lopdf(OcrAdapter::default());
        assert!(extractor.extract_pages(&path).is_empty());
        Ok(())
    }
}
