use crate::error::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;

    /// One vector per input, same order. Identical input gives identical output.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError>;
}

/// Hashed character-trigram embedding; needs no model download.
#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    dimensions: usize,
    model_id: String,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("char-trigram-{dimensions}"),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Calls `POST /api/embed` on an Ollama server.
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        url::Url::parse(&base_url)?;

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url,
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "ollama".to_string(),
                details: response.status().to_string(),
            });
        }

        let body: Value = response.json().await?;
        let vectors = parse_embeddings(&body)?;
        if vectors.len() != texts.len() {
            return Err(SearchError::BackendResponse {
                backend: "ollama".to_string(),
                details: format!("{} embeddings for {} inputs", vectors.len(), texts.len()),
            });
        }
        if let Some(wrong) = vectors.iter().find(|vector| vector.len() != self.dimensions) {
            return Err(SearchError::BackendResponse {
                backend: "ollama".to_string(),
                details: format!("embedding dimension {} != {}", wrong.len(), self.dimensions),
            });
        }

        Ok(vectors)
    }
}

fn parse_embeddings(body: &Value) -> Result<Vec<Vec<f32>>, SearchError> {
    let rows = body
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| SearchError::BackendResponse {
            backend: "ollama".to_string(),
            details: "missing embeddings array".to_string(),
        })?;

    Ok(rows
        .iter()
        .map(|row| {
            row.as_array()
                .map(|values| {
                    values
                        .iter()
                        .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect())
}

/// Persists vectors on disk keyed by sha256 of the input, one file per model.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    path: PathBuf,
    entries: Mutex<HashMap<String, Vec<f32>>>,
}

impl CachedEmbedder {
    pub fn open(inner: Arc<dyn Embedder>, cache_dir: &Path) -> Result<Self, SearchError> {
        std::fs::create_dir_all(cache_dir)?;
        let file_name = format!("{}.json", sanitize_model_id(inner.model_id()));
        let path = cache_dir.join(file_name);

        let entries = if path.exists() {
            let raw = std::fs::read(&path)?;
            let entries: HashMap<String, Vec<f32>> = serde_json::from_slice(&raw)?;
            info!(path = %path.display(), entries = entries.len(), "loaded cached embeddings");
            entries
        } else {
            info!(model = inner.model_id(), "initializing new embedding cache");
            HashMap::new()
        };

        Ok(Self {
            inner,
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn cached_len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<f32>>>, SearchError> {
        self.entries
            .lock()
            .map_err(|_| SearchError::Request("embedding cache lock poisoned".to_string()))
    }

    async fn persist(&self) -> Result<(), SearchError> {
        let serialized = {
            let entries = self.lock()?;
            serde_json::to_vec(&*entries)?
        };
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, serialized).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

fn sanitize_model_id(model_id: &str) -> String {
    model_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

fn text_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl Embedder for CachedEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        let keys: Vec<String> = texts.iter().map(|text| text_key(text)).collect();

        let (missing_keys, missing_texts): (Vec<String>, Vec<String>) = {
            let entries = self.lock()?;
            let mut seen = std::collections::HashSet::new();
            keys.iter()
                .zip(texts)
                .filter(|(key, _)| !entries.contains_key(*key) && seen.insert((*key).clone()))
                .map(|(key, text)| (key.clone(), text.clone()))
                .unzip()
        };

        if !missing_texts.is_empty() {
            debug!(
                misses = missing_texts.len(),
                hits = texts.len() - missing_texts.len(),
                "embedding cache"
            );
            let vectors = self.inner.embed(&missing_texts).await?;
            {
                let mut entries = self.lock()?;
                for (key, vector) in missing_keys.into_iter().zip(vectors) {
                    entries.insert(key, vector);
                }
            }
            self.persist().await?;
        }

        let entries = self.lock()?;
        keys.iter()
            .map(|key| {
                entries.get(key).cloned().ok_or_else(|| {
                    SearchError::Request("embedding missing after computation".to_string())
                })
            })
            .collect()
    }
}

/// Construct-once registry of shared embedders keyed by model id.
#[derive(Default)]
pub struct ModelCache {
    embedders: Mutex<HashMap<String, Arc<dyn Embedder>>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_try_init<F>(
        &self,
        model_id: &str,
        build: F,
    ) -> Result<Arc<dyn Embedder>, SearchError>
    where
        F: FnOnce() -> Result<Arc<dyn Embedder>, SearchError>,
    {
        let mut embedders = self
            .embedders
            .lock()
            .map_err(|_| SearchError::Request("model cache lock poisoned".to_string()))?;

        if let Some(existing) = embedders.get(model_id) {
            return Ok(existing.clone());
        }

        let built = build()?;
        embedders.insert(model_id.to_string(), built.clone());
        Ok(built)
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|a| a * a).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|b| b * b).sum::<f32>().sqrt();
    if left_norm < f32::EPSILON || right_norm < f32::EPSILON {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}
