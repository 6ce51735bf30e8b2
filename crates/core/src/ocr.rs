//! Page image recognizers and the primary/secondary fallback adapter.
//!
//! Recognizers never fail towards the caller: any engine error is logged and
//! reported as empty text, which the adapter treats as "try the next engine".

use crate::chunking::normalize_whitespace;
use crate::error::SearchError;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;

    /// Returns normalised text, or an empty string when nothing was recognised.
    fn recognize(&self, png: &[u8]) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrBackendKind {
    Tesseract,
    Paddle,
}

impl OcrBackendKind {
    pub fn other(&self) -> Self {
        match self {
            OcrBackendKind::Tesseract => OcrBackendKind::Paddle,
            OcrBackendKind::Paddle => OcrBackendKind::Tesseract,
        }
    }
}

impl fmt::Display for OcrBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrBackendKind::Tesseract => f.write_str("tesseract"),
            OcrBackendKind::Paddle => f.write_str("paddle"),
        }
    }
}

impl FromStr for OcrBackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "tesseract" => Ok(Self::Tesseract),
            "paddle" | "paddleocr" => Ok(Self::Paddle),
            other => Err(format!("unknown OCR backend `{other}` (expected tesseract|paddle)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub primary: OcrBackendKind,
    pub tesseract_binary: PathBuf,
    pub tesseract_language: String,
    pub paddle_endpoint: Option<String>,
    pub paddle_language: String,
    pub paddle_use_angle: bool,
    pub timeout: Duration,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            primary: OcrBackendKind::Tesseract,
            tesseract_binary: PathBuf::from("tesseract"),
            tesseract_language: "eng".to_string(),
            paddle_endpoint: None,
            paddle_language: "en".to_string(),
            paddle_use_angle: true,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Builds one recognizer; an unusable engine is a construction error.
pub fn construct_recognizer(
    kind: OcrBackendKind,
    config: &OcrConfig,
) -> Result<Arc<dyn Recognizer>, SearchError> {
    match kind {
        OcrBackendKind::Tesseract => Ok(Arc::new(TesseractRecognizer::probe(
            config.tesseract_binary.clone(),
            config.tesseract_language.clone(),
        )?)),
        OcrBackendKind::Paddle => Ok(Arc::new(PaddleRecognizer::new(config)?)),
    }
}

pub struct TesseractRecognizer {
    binary: PathBuf,
    language: String,
}

impl TesseractRecognizer {
    pub fn probe(binary: PathBuf, language: String) -> Result<Self, SearchError> {
        let status = Command::new(&binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|error| {
                SearchError::unavailable("tesseract", format!("{}: {error}", binary.display()))
            })?;

        if !status.success() {
            return Err(SearchError::unavailable(
                "tesseract",
                format!("`{} --version` exited with {status}", binary.display()),
            ));
        }

        Ok(Self { binary, language })
    }

    fn run(&self, png: &[u8]) -> std::io::Result<String> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.language])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(png)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Recognizer for TesseractRecognizer {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&self, png: &[u8]) -> String {
        match self.run(png) {
            Ok(text) => normalize_whitespace(&text),
            Err(error) => {
                warn!(%error, "tesseract OCR failed");
                String::new()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PaddleRequest<'a> {
    images: Vec<String>,
    lang: &'a str,
    use_angle_cls: bool,
}

/// Client for a PaddleOCR serving endpoint.
pub struct PaddleRecognizer {
    endpoint: String,
    language: String,
    use_angle: bool,
    timeout: Duration,
}

impl PaddleRecognizer {
    pub fn new(config: &OcrConfig) -> Result<Self, SearchError> {
        let endpoint = config
            .paddle_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SearchError::unavailable("paddle", "no PaddleOCR endpoint configured"))?;

        url::Url::parse(endpoint)?;

        info!(
            lang = %config.paddle_language,
            angle_cls = config.paddle_use_angle,
            "initializing PaddleOCR client"
        );

        Ok(Self {
            endpoint: endpoint.to_string(),
            language: config.paddle_language.clone(),
            use_angle: config.paddle_use_angle,
            timeout: config.timeout,
        })
    }

    fn run(&self, png: &[u8]) -> Result<String, SearchError> {
        let payload = PaddleRequest {
            images: vec![STANDARD.encode(png)],
            lang: &self.language,
            use_angle_cls: self.use_angle,
        };

        let client = Client::builder().timeout(self.timeout).build()?;
        let response = client.post(&self.endpoint).json(&payload).send()?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "paddle".to_string(),
                details: response.status().to_string(),
            });
        }

        let body: Value = response.json()?;
        Ok(paddle_lines(&body).join("\n"))
    }
}

/// Accepts `{"results": [[{"text": ..}, ..]]}` or a flat `{"text": ..}`.
fn paddle_lines(body: &Value) -> Vec<String> {
    if let Some(text) = body.get("text").and_then(Value::as_str) {
        return vec![text.to_string()];
    }

    body.get("results")
        .and_then(Value::as_array)
        .map(|pages| {
            pages
                .iter()
                .filter_map(Value::as_array)
                .flatten()
                .filter_map(|line| line.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Recognizer for PaddleRecognizer {
    fn name(&self) -> &str {
        "paddle"
    }

    fn recognize(&self, png: &[u8]) -> String {
        match self.run(png) {
            Ok(text) => normalize_whitespace(&text),
            Err(error) => {
                warn!(%error, "PaddleOCR failed");
                String::new()
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct OcrAdapter {
    primary: Option<Arc<dyn Recognizer>>,
    secondary: Option<Arc<dyn Recognizer>>,
}

impl OcrAdapter {
    pub fn new(
        primary: Option<Arc<dyn Recognizer>>,
        secondary: Option<Arc<dyn Recognizer>>,
    ) -> Self {
        Self { primary, secondary }
    }

    /// Probes both engines once. Unavailable engines are left out.
    pub fn from_config(config: &OcrConfig) -> Self {
        let build = |kind: OcrBackendKind| match construct_recognizer(kind, config) {
            Ok(recognizer) => Some(recognizer),
            Err(error) => {
                info!(backend = %kind, %error, "OCR backend not available");
                None
            }
        };

        let primary = build(config.primary);
        let secondary = build(config.primary.other());
        if primary.is_none() && secondary.is_none() {
            warn!("no OCR backend available; scanned pages will be skipped");
        }

        Self::new(primary, secondary)
    }

    pub fn is_available(&self) -> bool {
        self.primary.is_some() || self.secondary.is_some()
    }

    pub fn recognize(&self, png: &[u8]) -> String {
        for recognizer in [&self.primary, &self.secondary].into_iter().flatten() {
            let text = recognizer.recognize(png);
            if !text.is_empty() {
                return text;
            }
            debug!(backend = recognizer.name(), "OCR returned no text");
        }
        String::new()
    }
}
