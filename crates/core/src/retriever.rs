use crate::fusion::{fuse, WeightedList};
use crate::models::{RetrievalConfig, RetrievedChunk};
use crate::sparse::Bm25Index;
use crate::traits::{DenseIndex, SparseIndex};
use crate::SearchError;
use std::sync::Arc;
use tracing::{debug, info};

pub fn validate_query(query: &str) -> Result<&str, SearchError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(SearchError::InvalidInput("query is empty".to_string()));
    }
    Ok(trimmed)
}

pub struct HybridRetriever {
    sparse: Arc<dyn SparseIndex>,
    dense: Arc<dyn DenseIndex>,
    /// Dense chunk count seen at build time.
    indexed: usize,
    config: RetrievalConfig,
}

impl HybridRetriever {
    /// Loads the dense corpus once to build the keyword index. An empty
    /// dense index is reported as not ready.
    pub async fn build(
        dense: Arc<dyn DenseIndex>,
        config: RetrievalConfig,
    ) -> Result<Self, SearchError> {
        let count = dense.count().await?;
        if count == 0 {
            return Err(SearchError::IndexNotReady(
                "no documents have been indexed yet".to_string(),
            ));
        }

        info!(count, "loading documents for keyword search");
        let sparse = Bm25Index::from_chunks(dense.all_chunks().await?);
        if sparse.is_empty() {
            return Err(SearchError::IndexNotReady(
                "could not load any documents for keyword search".to_string(),
            ));
        }
        debug!(documents = sparse.len(), "keyword index built");

        Self::new(Arc::new(sparse), dense, count, config)
    }

    pub fn new(
        sparse: Arc<dyn SparseIndex>,
        dense: Arc<dyn DenseIndex>,
        indexed: usize,
        config: RetrievalConfig,
    ) -> Result<Self, SearchError> {
        let weights_valid = config.sparse_weight >= 0.0
            && config.dense_weight >= 0.0
            && config.sparse_weight + config.dense_weight > 0.0;
        if !weights_valid {
            return Err(SearchError::Request(format!(
                "fusion weights must be non-negative and not both zero (sparse {}, dense {})",
                config.sparse_weight, config.dense_weight
            )));
        }

        Ok(Self {
            sparse,
            dense,
            indexed,
            config,
        })
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>, SearchError> {
        self.retrieve_k(query, self.config.top_k).await
    }

    /// Queries both indices concurrently, each for up to `k` hits, and returns
    /// the fused union.
    pub async fn retrieve_k(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        let query = validate_query(query)?;

        if self.indexed == 0 {
            return Err(SearchError::IndexNotReady(
                "dense index is empty".to_string(),
            ));
        }

        let sparse = self.sparse.clone();
        let owned_query = query.to_string();
        let sparse_task = tokio::task::spawn_blocking(move || sparse.retrieve(&owned_query, k));

        let (sparse_hits, dense_hits) =
            tokio::join!(sparse_task, self.dense.similarity_search(query, k));
        let sparse_hits = sparse_hits
            .map_err(|error| SearchError::Request(format!("keyword search task failed: {error}")))?;
        let dense_hits = dense_hits?;

        debug!(
            sparse = sparse_hits.len(),
            dense = dense_hits.len(),
            "fusing ranked lists"
        );

        Ok(fuse(
            &[
                WeightedList {
                    hits: &sparse_hits,
                    weight: self.config.sparse_weight,
                },
                WeightedList {
                    hits: &dense_hits,
                    weight: self.config.dense_weight,
                },
            ],
            self.config.fusion,
            self.config.rrf_k,
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{ChunkMetadata, PdfChunk, RetrievalSignal};
    use crate::stores::local::tests::chunk;
    use crate::stores::LocalVectorStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingIndex {
        inner: Arc<LocalVectorStore>,
        count_calls: AtomicUsize,
    }

    #[async_trait]
    impl DenseIndex for CountingIndex {
        async fn add(
            &self,
            texts: &[String],
            metadatas: &[ChunkMetadata],
            ids: &[String],
        ) -> Result<(), SearchError> {
            self.inner.add(texts, metadatas, ids).await
        }

        async fn similarity_search(
            &self,
            query: &str,
            k: usize,
        ) -> Result<Vec<RetrievedChunk>, SearchError> {
            self.inner.similarity_search(query, k).await
        }

        async fn count(&self) -> Result<usize, SearchError> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.count().await
        }

        async fn all_chunks(&self) -> Result<Vec<PdfChunk>, SearchError> {
            self.inner.all_chunks().await
        }
    }

    pub(crate) async fn biology_store() -> Arc<LocalVectorStore> {
        let store = Arc::new(LocalVectorStore::in_memory(Arc::new(
            CharacterNgramEmbedder::default(),
        )));
        let mut chunks = vec![chunk(
            "bio-p1-c0",
            "Photosynthesis is how green plants turn sunlight, water and carbon dioxide into glucose.",
        )];
        let unrelated = [
            "The Treaty of Westphalia ended the Thirty Years War in 1648.",
            "Supply and demand curves determine equilibrium market prices.",
            "Newton's second law states that force equals mass times acceleration.",
            "A sonnet is a fourteen line poem written in iambic pentameter.",
            "Binary search runs in logarithmic time on sorted arrays.",
            "The Pythagorean theorem relates the sides of a right triangle.",
            "Plate tectonics explains earthquakes and mountain formation.",
            "Keynes argued that aggregate demand drives short run output.",
            "The French Revolution abolished feudal privileges in 1789.",
        ];
        for (position, text) in unrelated.iter().enumerate() {
            chunks.push(chunk(&format!("other-p1-c{position}"), text));
        }
        store.add_chunks(&chunks).await.unwrap();
        store
    }

    #[tokio::test]
    async fn relevant_chunk_is_in_candidates() -> Result<(), SearchError> {
        let retriever =
            HybridRetriever::build(biology_store().await, RetrievalConfig::default()).await?;
        let hits = retriever.retrieve("photosynthesis").await?;

        assert!(hits.iter().any(|hit| hit.chunk.chunk_id == "bio-p1-c0"));
        assert!(hits.len() <= 2 * retriever.config().top_k);
        Ok(())
    }

    #[tokio::test]
    async fn chunk_found_by_both_signals_is_marked_fused() -> Result<(), SearchError> {
        let retriever =
            HybridRetriever::build(biology_store().await, RetrievalConfig::default()).await?;
        let hits = retriever.retrieve("photosynthesis green plants sunlight").await?;

        assert_eq!(hits[0].chunk.chunk_id, "bio-p1-c0");
        assert_eq!(hits[0].signal, RetrievalSignal::Fused);
        Ok(())
    }

    #[tokio::test]
    async fn empty_index_is_not_ready() {
        let store = Arc::new(LocalVectorStore::in_memory(Arc::new(
            CharacterNgramEmbedder::default(),
        )));
        let result = HybridRetriever::build(store, RetrievalConfig::default()).await;
        assert!(matches!(result, Err(SearchError::IndexNotReady(_))));
    }

    #[tokio::test]
    async fn blank_query_is_rejected() -> Result<(), SearchError> {
        let retriever =
            HybridRetriever::build(biology_store().await, RetrievalConfig::default()).await?;
        let result = retriever.retrieve("   \t").await;
        assert!(matches!(result, Err(SearchError::InvalidInput(_))));
        Ok(())
    }

    #[tokio::test]
    async fn queries_reuse_the_count_taken_at_build() -> Result<(), SearchError> {
        let dense = Arc::new(CountingIndex {
            inner: biology_store().await,
            count_calls: AtomicUsize::new(0),
        });
        let retriever = HybridRetriever::build(dense.clone(), RetrievalConfig::default()).await?;

        retriever.retrieve("photosynthesis").await?;
        retriever.retrieve("market prices").await?;
        assert_eq!(dense.count_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn retriever_over_an_empty_index_refuses_queries() -> Result<(), SearchError> {
        let dense = Arc::new(LocalVectorStore::in_memory(Arc::new(
            CharacterNgramEmbedder::default(),
        )));
        let sparse = Arc::new(Bm25Index::from_chunks(Vec::new()));
        let retriever = HybridRetriever::new(sparse, dense, 0, RetrievalConfig::default())?;

        let result = retriever.retrieve("photosynthesis").await;
        assert!(matches!(result, Err(SearchError::IndexNotReady(_))));
        Ok(())
    }

    #[tokio::test]
    async fn negative_weights_are_rejected() {
        let store = biology_store().await;
        let config = RetrievalConfig {
            sparse_weight: -0.5,
            ..RetrievalConfig::default()
        };
        assert!(HybridRetriever::build(store, config).await.is_err());
    }
}
