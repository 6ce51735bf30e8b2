use crate::embeddings::{cosine_similarity, Embedder};
use crate::models::{ChunkMetadata, PdfChunk, RetrievalSignal, RetrievedChunk};
use crate::traits::{check_batch, DenseIndex};
use crate::SearchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    chunk_id: String,
    text: String,
    metadata: ChunkMetadata,
    vector: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    model_id: String,
    dimensions: usize,
    records: Vec<StoredRecord>,
}

/// Brute-force cosine store, optionally persisted as one JSON file per collection.
pub struct LocalVectorStore {
    path: Option<PathBuf>,
    embedder: Arc<dyn Embedder>,
    collection: RwLock<Collection>,
}

impl LocalVectorStore {
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            path: None,
            collection: RwLock::new(Collection {
                model_id: embedder.model_id().to_string(),
                dimensions: embedder.dimensions(),
                records: Vec::new(),
            }),
            embedder,
        }
    }

    pub fn collection_path(directory: &Path, collection: &str) -> PathBuf {
        directory.join(format!("{collection}.json"))
    }

    pub fn exists(directory: &Path, collection: &str) -> bool {
        Self::collection_path(directory, collection).is_file()
    }

    pub fn open(
        directory: &Path,
        collection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, SearchError> {
        std::fs::create_dir_all(directory)?;
        let path = Self::collection_path(directory, collection);

        let stored = if path.is_file() {
            let stored: Collection = serde_json::from_slice(&std::fs::read(&path)?)?;
            if stored.model_id != embedder.model_id() {
                return Err(SearchError::Request(format!(
                    "collection {} was embedded with `{}`, not `{}`",
                    path.display(),
                    stored.model_id,
                    embedder.model_id()
                )));
            }
            info!(
                path = %path.display(),
                records = stored.records.len(),
                "opened vector collection"
            );
            stored
        } else {
            Collection {
                model_id: embedder.model_id().to_string(),
                dimensions: embedder.dimensions(),
                records: Vec::new(),
            }
        };

        Ok(Self {
            path: Some(path),
            embedder,
            collection: RwLock::new(stored),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Collection>, SearchError> {
        self.collection
            .read()
            .map_err(|_| SearchError::Request("vector store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Collection>, SearchError> {
        self.collection
            .write()
            .map_err(|_| SearchError::Request("vector store lock poisoned".to_string()))
    }

    async fn persist(&self) -> Result<(), SearchError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let serialized = serde_json::to_vec(&*self.read()?)?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serialized).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

#[async_trait]
impl DenseIndex for LocalVectorStore {
    async fn add(
        &self,
        texts: &[String],
        metadatas: &[ChunkMetadata],
        ids: &[String],
    ) -> Result<(), SearchError> {
        check_batch(texts.len(), metadatas.len(), ids.len())?;
        if texts.is_empty() {
            return Ok(());
        }

        let vectors = self.embedder.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(SearchError::Request(format!(
                "embedding count {} doesn't match chunk count {}",
                vectors.len(),
                texts.len()
            )));
        }

        {
            let mut collection = self.write()?;
            let mut positions: HashMap<String, usize> = collection
                .records
                .iter()
                .enumerate()
                .map(|(position, record)| (record.chunk_id.clone(), position))
                .collect();

            for (((text, metadata), id), vector) in
                texts.iter().zip(metadatas).zip(ids).zip(vectors)
            {
                let record = StoredRecord {
                    chunk_id: id.clone(),
                    text: text.clone(),
                    metadata: metadata.clone(),
                    vector,
                };
                match positions.get(id) {
                    Some(&position) => collection.records[position] = record,
                    None => {
                        positions.insert(id.clone(), collection.records.len());
                        collection.records.push(record);
                    }
                }
            }
        }

        self.persist().await
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let collection = self.read()?;
        let mut scored: Vec<(f32, &StoredRecord)> = collection
            .records
            .iter()
            .map(|record| (cosine_similarity(&query_vector, &record.vector), record))
            .collect();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, record)| RetrievedChunk {
                chunk: PdfChunk {
                    chunk_id: record.chunk_id.clone(),
                    text: record.text.clone(),
                    metadata: record.metadata.clone(),
                },
                score: score as f64,
                signal: RetrievalSignal::Dense,
            })
            .collect())
    }

    async fn count(&self) -> Result<usize, SearchError> {
        Ok(self.read()?.records.len())
    }

    async fn all_chunks(&self) -> Result<Vec<PdfChunk>, SearchError> {
        Ok(self
            .read()?
            .records
            .iter()
            .map(|record| PdfChunk {
                chunk_id: record.chunk_id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
            })
            .collect())
    }
}
