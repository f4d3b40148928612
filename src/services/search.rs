//! Synchronous search path: query embedding plus hybrid vector search.
//!
//! Read-only against the store; never blocks on pipeline writers.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use super::embeddings::EmbeddingClient;
use crate::repository::{SearchFilters, SearchHit, SearchStats, Store};

/// Semantic search over grant embeddings.
pub struct VectorSearcher {
    store: Arc<Store>,
    embeddings: EmbeddingClient,
}

impl VectorSearcher {
    pub fn new(store: Arc<Store>, embeddings: EmbeddingClient) -> Self {
        Self { store, embeddings }
    }

    /// Natural-language search: embed the query with the RETRIEVAL_QUERY
    /// task type, then run the filtered similarity search.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f64,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        info!(
            "Searching: '{}' (limit {}, min similarity {})",
            query, limit, min_similarity
        );
        let query_vector = self.embeddings.embed_query(query).await?;
        let hits = self
            .store
            .vector_search(&query_vector, limit, min_similarity, filters)?;
        info!("Found {} hits", hits.len());
        Ok(hits)
    }

    /// Grants similar to a reference grant, the reference itself excluded.
    pub fn find_similar(
        &self,
        grant_id: i64,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<SearchHit>> {
        Ok(self.store.find_similar(grant_id, limit, min_similarity)?)
    }

    /// Vector index readiness.
    pub fn stats(&self) -> Result<SearchStats> {
        Ok(self.store.search_stats()?)
    }
}
