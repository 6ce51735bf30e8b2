use crate::models::RetrievedChunk;
use crate::sparse::tokenize;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CROSS_ENCODER: &str = "cross-encoder/ms-marco-MiniLM-L-6-v2";

/// Pairwise (query, passage) relevance model.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    fn model_id(&self) -> &str;

    /// One score per passage, same order, higher is more relevant.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, SearchError>;
}

#[derive(Debug, Clone)]
pub struct RerankedChunk {
    pub retrieved: RetrievedChunk,
    pub relevance: f32,
}

/// Stateless post-retrieval ordering. Equal scores keep their input order.
#[derive(Clone)]
pub struct Reranker {
    model: Arc<dyn CrossEncoder>,
}

impl Reranker {
    pub fn new(model: Arc<dyn CrossEncoder>) -> Self {
        Self { model }
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievedChunk>,
    ) -> Result<Vec<RerankedChunk>, SearchError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let passages: Vec<String> = candidates.iter().map(|hit| hit.chunk.text.clone()).collect();
        let scores = self.model.score(query, &passages).await?;
        if scores.len() != candidates.len() {
            return Err(SearchError::BackendResponse {
                backend: self.model.model_id().to_string(),
                details: format!("{} scores for {} passages", scores.len(), candidates.len()),
            });
        }

        let mut reranked: Vec<RerankedChunk> = candidates
            .into_iter()
            .zip(scores)
            .map(|(retrieved, relevance)| RerankedChunk {
                retrieved,
                relevance,
            })
            .collect();
        reranked.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));

        debug!(model = self.model.model_id(), candidates = reranked.len(), "re-ranked candidates");
        Ok(reranked)
    }
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
    truncate: bool,
}

#[derive(Debug, Deserialize)]
struct RerankScore {
    index: usize,
    score: f32,
}

/// Cross-encoder served over a text-embeddings-inference `/rerank` endpoint.
pub struct HttpCrossEncoder {
    client: Client,
    endpoint: String,
    model: String,
}

impl HttpCrossEncoder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        url::Url::parse(&endpoint)
            .map_err(|error| SearchError::unavailable("cross-encoder", error.to_string()))?;

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint,
            model: model.into(),
        })
    }
}

fn scores_by_index(rows: Vec<RerankScore>, expected: usize) -> Result<Vec<f32>, SearchError> {
    let mut scores = vec![None; expected];
    for row in rows {
        if let Some(slot) = scores.get_mut(row.index) {
            *slot = Some(row.score);
        }
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(index, score)| {
            score.ok_or_else(|| SearchError::BackendResponse {
                backend: "cross-encoder".to_string(),
                details: format!("no score for passage {index}"),
            })
        })
        .collect()
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, SearchError> {
        let response = self
            .client
            .post(format!("{}/rerank", self.endpoint))
            .json(&RerankRequest {
                query,
                texts: passages,
                raw_scores: false,
                truncate: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "cross-encoder".to_string(),
                details: response.status().to_string(),
            });
        }

        let rows: Vec<RerankScore> = response.json().await?;
        scores_by_index(rows, passages.len())
    }
}

/// Share of distinct query terms present in the passage.
#[derive(Debug, Default, Clone)]
pub struct TermOverlapScorer;

#[async_trait]
impl CrossEncoder for TermOverlapScorer {
    fn model_id(&self) -> &str {
        "term-overlap"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, SearchError> {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }

        Ok(passages
            .iter()
            .map(|passage| {
                let passage_terms: HashSet<String> = tokenize(passage).into_iter().collect();
                let shared = query_terms.intersection(&passage_terms).count();
                shared as f32 / query_terms.len() as f32
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrievalSignal;
    use crate::stores::local::tests::chunk;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEncoder {
        calls: AtomicUsize,
        scores: Vec<f32>,
    }

    #[async_trait]
    impl CrossEncoder for CountingEncoder {
        fn model_id(&self) -> &str {
            "counting"
        }

        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores.clone())
        }
    }

    fn candidates(ids: &[&str]) -> Vec<RetrievedChunk> {
        ids.iter()
            .map(|id| RetrievedChunk {
                chunk: chunk(id, &format!("passage {id}")),
                score: 0.1,
                signal: RetrievalSignal::Fused,
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_candidates_skip_the_model() -> Result<(), SearchError> {
        let encoder = Arc::new(CountingEncoder {
            calls: AtomicUsize::new(0),
            scores: Vec::new(),
        });
        let reranker = Reranker::new(encoder.clone());

        assert!(reranker.rerank("anything", Vec::new()).await?.is_empty());
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn sorts_descending_and_keeps_input_order_on_ties() -> Result<(), SearchError> {
        let encoder = Arc::new(CountingEncoder {
            calls: AtomicUsize::new(0),
            scores: vec![0.2, 0.9, 0.2, 0.5],
        });
        let reranker = Reranker::new(encoder);

        let ordered: Vec<String> = reranker
            .rerank("q", candidates(&["a", "b", "c", "d"]))
            .await?
            .into_iter()
            .map(|hit| hit.retrieved.chunk.chunk_id)
            .collect();
        assert_eq!(ordered, vec!["b", "d", "a", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn score_count_mismatch_is_an_error() {
        let encoder = Arc::new(CountingEncoder {
            calls: AtomicUsize::new(0),
            scores: vec![1.0],
        });
        let result = Reranker::new(encoder).rerank("q", candidates(&["a", "b"])).await;
        assert!(matches!(result, Err(SearchError::BackendResponse { .. })));
    }

    #[tokio::test]
    async fn term_overlap_prefers_matching_passage() -> Result<(), SearchError> {
        let mut hits = candidates(&["x", "y"]);
        hits[1].chunk.text = "Photosynthesis takes place in chloroplasts.".to_string();

        let reranked = Reranker::new(Arc::new(TermOverlapScorer))
            .rerank("photosynthesis", hits)
            .await?;
        assert_eq!(reranked[0].retrieved.chunk.chunk_id, "y");
        assert_eq!(reranked[0].relevance, 1.0);
        Ok(())
    }

    #[test]
    fn http_scores_are_placed_by_index() {
        let row = |index, score| RerankScore { index, score };
        let rows = vec![row(1, 0.3), row(0, 0.8)];
        assert_eq!(scores_by_index(rows, 2).unwrap(), vec![0.8, 0.3]);
        assert!(scores_by_index(vec![row(0, 0.1)], 2).is_err());
    }

    #[test]
    fn http_encoder_rejects_bad_endpoint() {
        let result =
            HttpCrossEncoder::new("not a url", DEFAULT_CROSS_ENCODER, Duration::from_secs(5));
        assert!(matches!(result, Err(SearchError::BackendUnavailable { .. })));
    }
}
