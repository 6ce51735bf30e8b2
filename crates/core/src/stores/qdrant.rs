use crate::embeddings::Embedder;
use crate::models::{ChunkMetadata, PdfChunk, RetrievalSignal, RetrievedChunk};
use crate::traits::{check_batch, DenseIndex};
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const SCROLL_PAGE: usize = 256;

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    embedder: Arc<dyn Embedder>,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            embedder,
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    /// Qdrant point ids must be integers or UUIDs.
    pub fn point_id(chunk_id: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes())
    }

    pub async fn ensure_collection(&self) -> Result<(), SearchError> {
        let response = self.client.get(self.collection_url()).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }

        let response = self
            .client
            .put(self.collection_url())
            .json(&json!({
                "vectors": {
                    "size": self.embedder.dimensions(),
                    "distance": "Cosine"
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::Request(format!(
                "qdrant collection setup failed with {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn backend_error(status: StatusCode) -> SearchError {
    SearchError::BackendResponse {
        backend: "qdrant".to_string(),
        details: status.to_string(),
    }
}

fn chunk_from_payload(payload: &Value) -> Result<PdfChunk, SearchError> {
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: format!("point payload missing `{name}`"),
            })
    };

    let metadata: ChunkMetadata = serde_json::from_value(
        payload.get("metadata").cloned().unwrap_or(Value::Null),
    )?;

    Ok(PdfChunk {
        chunk_id: field("chunk_id")?,
        text: field("text")?,
        metadata,
    })
}

#[async_trait]
impl DenseIndex for QdrantStore {
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

        let embeddings = self.embedder.embed(texts).await?;
        let vector_size = self.embedder.dimensions();

        let points = texts
            .iter()
            .zip(metadatas)
            .zip(ids)
            .zip(embeddings.iter())
            .map(|(((text, metadata), id), embedding)| {
                if embedding.len() != vector_size {
                    return Err(SearchError::Request(format!(
                        "embedding dimension {} != {}",
                        embedding.len(),
                        vector_size
                    )));
                }

                Ok(json!({
                    "id": Self::point_id(id).to_string(),
                    "vector": embedding,
                    "payload": {
                        "chunk_id": id,
                        "text": text,
                        "metadata": metadata,
                    },
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&json!({
                "vector": query_vector,
                "limit": k,
                "with_payload": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let parsed: Value = response.json().await?;
        parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|hit| {
                Ok(RetrievedChunk {
                    chunk: chunk_from_payload(hit.get("payload").unwrap_or(&Value::Null))?,
                    score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0),
                    signal: RetrievalSignal::Dense,
                })
            })
            .collect()
    }

    async fn count(&self) -> Result<usize, SearchError> {
        let response = self
            .client
            .post(format!("{}/points/count", self.collection_url()))
            .json(&json!({ "exact": true }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let parsed: Value = response.json().await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn all_chunks(&self) -> Result<Vec<PdfChunk>, SearchError> {
        let mut chunks = Vec::new();
        let mut offset = Value::Null;

        loop {
            let mut body = json!({
                "limit": SCROLL_PAGE,
                "with_payload": true,
                "with_vector": false,
            });
            if !offset.is_null() {
                body["offset"] = offset.clone();
            }

            let response = self
                .client
                .post(format!("{}/points/scroll", self.collection_url()))
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(backend_error(response.status()));
            }

            let parsed: Value = response.json().await?;
            for point in parsed
                .pointer("/result/points")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                chunks.push(chunk_from_payload(point.get("payload").unwrap_or(&Value::Null))?);
            }

            offset = parsed
                .pointer("/result/next_page_offset")
                .cloned()
                .unwrap_or(Value::Null);
            if offset.is_null() {
                break;
            }
        }

        Ok(chunks)
    }
}
