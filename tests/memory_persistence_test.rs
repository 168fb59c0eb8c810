//! Memory store persistence across restarts

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;

use counselbot::{CoreResult, Embedder, MemoryScope, MemoryStore, RetentionPolicy};

/// Deterministic embedder: each axis counts one keyword
struct KeywordEmbedder;

const AXES: [&str; 3] = ["contract", "invoice", "court"];

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let lower = text.to_lowercase();
        Ok(AXES
            .iter()
            .map(|axis| lower.matches(axis).count() as f32)
            .collect())
    }

    fn dimension(&self) -> usize {
        AXES.len()
    }
}

fn embedder() -> Arc<dyn Embedder> {
    Arc::new(KeywordEmbedder)
}

#[tokio::test]
async fn test_chunks_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("memory.db");

    {
        let store = MemoryStore::open(&db_path, embedder(), RetentionPolicy::KeepAll).unwrap();
        store
            .add(
                1,
                MemoryScope::Semantic,
                "Contract analysis: supply agreement with penalty clause",
                Value::Null,
            )
            .await
            .unwrap();
        store
            .add(1, MemoryScope::Profile, "prefers contract summaries in tables", Value::Null)
            .await
            .unwrap();
    }

    // Fresh handle over the same file
    let store = MemoryStore::open(&db_path, embedder(), RetentionPolicy::KeepAll).unwrap();

    let stats = store.stats(1).unwrap();
    assert_eq!(stats.semantic, 1);
    assert_eq!(stats.profile, 1);

    let results = store
        .search(1, MemoryScope::Semantic, "contract", 5)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].chunk.content.contains("penalty clause"));
    assert!(results[0].similarity > 0.9);
}

#[tokio::test]
async fn test_enrich_merges_scopes_after_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("memory.db");

    {
        let store = MemoryStore::open(&db_path, embedder(), RetentionPolicy::KeepAll).unwrap();
        store
            .add(2, MemoryScope::Episodic, "User: check this contract\nBot: done", Value::Null)
            .await
            .unwrap();
        store
            .add(2, MemoryScope::Semantic, "Contract analysis: lease agreement", Value::Null)
            .await
            .unwrap();
        store
            .add(2, MemoryScope::Profile, "works with contract law", Value::Null)
            .await
            .unwrap();
    }

    let store = MemoryStore::open(&db_path, embedder(), RetentionPolicy::KeepAll).unwrap();
    let merged = store.enrich(2, "contract question", 6).await.unwrap();

    assert_eq!(merged.len(), 3);
    let scopes: Vec<MemoryScope> = merged.iter().map(|s| s.chunk.scope).collect();
    assert!(scopes.contains(&MemoryScope::Episodic));
    assert!(scopes.contains(&MemoryScope::Semantic));
    assert!(scopes.contains(&MemoryScope::Profile));
}

#[tokio::test]
async fn test_delete_user_is_durable() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("memory.db");

    {
        let store = MemoryStore::open(&db_path, embedder(), RetentionPolicy::KeepAll).unwrap();
        store
            .add(3, MemoryScope::Episodic, "contract note", Value::Null)
            .await
            .unwrap();
        assert_eq!(store.delete_user(3).unwrap(), 1);
    }

    let store = MemoryStore::open(&db_path, embedder(), RetentionPolicy::KeepAll).unwrap();
    assert_eq!(store.stats(3).unwrap().total(), 0);
}
