use crate::models::{ChunkMetadata, PdfChunk, RetrievedChunk};
use crate::SearchError;
use async_trait::async_trait;

#[async_trait]
pub trait DenseIndex: Send + Sync {
    /// Embeds and stores the batch. Matching ids are upserted.
    async fn add(
        &self,
        texts: &[String],
        metadatas: &[ChunkMetadata],
        ids: &[String],
    ) -> Result<(), SearchError>;

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError>;

    async fn count(&self) -> Result<usize, SearchError>;

    /// Every stored chunk, used to build the sparse index.
    async fn all_chunks(&self) -> Result<Vec<PdfChunk>, SearchError>;

    async fn add_chunks(&self, chunks: &[PdfChunk]) -> Result<(), SearchError> {
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let metadatas: Vec<ChunkMetadata> =
            chunks.iter().map(|chunk| chunk.metadata.clone()).collect();
        let ids: Vec<String> = chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect();
        self.add(&texts, &metadatas, &ids).await
    }
}

pub trait SparseIndex: Send + Sync {
    fn retrieve(&self, query: &str, k: usize) -> Vec<RetrievedChunk>;
}

pub(crate) fn check_batch(
    texts: usize,
    metadatas: usize,
    ids: usize,
) -> Result<(), SearchError> {
    if texts != metadatas || texts != ids {
        return Err(SearchError::Request(format!(
            "batch length mismatch: {texts} texts, {metadatas} metadatas, {ids} ids"
        )));
    }
    Ok(())
}
