//! Text embeddings for memory recall
//!
//! Thin client over an OpenAI-compatible embeddings endpoint with an LRU+TTL
//! cache for query vectors. A failed embedding call is an explicit error;
//! callers decide whether to retry or skip the write. A zero vector standing
//! in for a real embedding would silently pollute every similarity ranking.

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Embedding client configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,
    /// API key
    pub api_key: String,
    /// Embedding model name
    pub model: String,
    /// Embedding dimension (depends on model)
    pub dimension: usize,
    /// Request timeout
    pub timeout: Duration,
}

/// Get embedding dimension for known models
fn model_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        _ => 1536,
    }
}

impl EmbeddingConfig {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension: model_dimension(model),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Seam between the memory store and the embedding endpoint, so tests can
/// substitute a deterministic embedder.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Embedding generator backed by the OpenAI embeddings API
pub struct EmbeddingClient {
    config: EmbeddingConfig,
    client: reqwest::Client,
    /// LRU cache for query embeddings (max 1000 entries, 1 hour TTL)
    cache: Cache<String, Vec<f32>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Embedding(e.to_string()))?;

        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Ok(Self {
            config,
            client,
            cache,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Get cache statistics (hits, misses)
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    async fn embed_uncached(&self, text: &str) -> CoreResult<Vec<f32>> {
        let url = format!("{}/embeddings", self.config.base_url);

        // The endpoint rejects very long inputs; truncate at a char boundary
        let input: String = text.chars().take(8000).collect();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "model": self.config.model,
                "input": input,
            }))
            .send()
            .await
            .map_err(|e| CoreError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Embedding(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Embedding(e.to_string()))?;

        let embedding = result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| CoreError::Embedding("empty data array".to_string()))?;

        if embedding.len() != self.config.dimension {
            return Err(CoreError::Embedding(format!(
                "dimension mismatch: expected {}, got {}",
                self.config.dimension,
                embedding.len()
            )));
        }

        Ok(embedding)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let cache_key = text.trim().to_string();

        if let Some(cached) = self.cache.get(&cache_key).await {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let embedding = self.embed_uncached(text).await?;
        self.cache.insert(cache_key, embedding.clone()).await;

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

/// Cosine similarity in [-1, 1]. A zero or mismatched vector scores 0 rather
/// than NaN so broken inputs never float to the top of a ranking.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Serialize embedding to bytes for SQLite BLOB storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize embedding from bytes
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        let a = vec![0.0, 0.0, 0.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&b, &a), 0.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_embedding_serialization() {
        let embedding = vec![1.0, 2.5, -3.0, 0.0];
        let bytes = embedding_to_bytes(&embedding);
        let restored = embedding_from_bytes(&bytes);

        assert_eq!(embedding.len(), restored.len());
        for (a, b) in embedding.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 0.0001);
        }
    }

    #[test]
    fn test_known_model_dimensions() {
        let config = EmbeddingConfig::new("https://api.openai.com/v1", "k", "text-embedding-3-small");
        assert_eq!(config.dimension, 1536);
    }
}
