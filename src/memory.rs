//! Scoped vector memory
//!
//! Embedding-tagged chunks per user and scope with SQLite persistence.
//! Three scopes: `episodic` (raw turn history), `semantic` (durable extracted
//! facts), `profile` (user preferences and attributes). Chunks are append-only
//! and never shared across users.
//!
//! Search is a full cosine scan over a user's chunks in one scope. O(N) per
//! query by design: no index is worth maintaining while N stays in the
//! hundreds.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embeddings::{cosine_similarity, embedding_from_bytes, embedding_to_bytes, Embedder};
use crate::error::{CoreError, CoreResult};

/// Memory scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryScope {
    Episodic,
    Semantic,
    Profile,
}

impl MemoryScope {
    pub const ALL: [MemoryScope; 3] = [
        MemoryScope::Episodic,
        MemoryScope::Semantic,
        MemoryScope::Profile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::Episodic => "episodic",
            MemoryScope::Semantic => "semantic",
            MemoryScope::Profile => "profile",
        }
    }
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "episodic" => Ok(MemoryScope::Episodic),
            "semantic" => Ok(MemoryScope::Semantic),
            "profile" => Ok(MemoryScope::Profile),
            other => Err(format!("unknown memory scope: {other}")),
        }
    }
}

/// A single memory chunk
#[derive(Debug, Clone)]
pub struct MemoryChunk {
    pub id: String,
    pub user_id: i64,
    pub scope: MemoryScope,
    pub content: String,
    pub metadata: Value,
    pub embedding: Vec<f32>,
    /// Unix millis
    pub created_at: i64,
}

/// Chunk with its similarity to a query
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: MemoryChunk,
    pub similarity: f32,
}

/// Per-scope chunk counts for a user
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub episodic: usize,
    pub semantic: usize,
    pub profile: usize,
}

impl MemoryStats {
    pub fn total(&self) -> usize {
        self.episodic + self.semantic + self.profile
    }
}

/// What to do with old episodic chunks. Semantic and profile chunks are kept
/// regardless: they are few and long-lived by definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    KeepAll,
    /// Keep the newest N episodic chunks per user
    MaxPerUser(usize),
    /// Drop episodic chunks older than N days
    MaxAgeDays(i64),
}

impl RetentionPolicy {
    /// Parse from `MEMORY_RETENTION`: `keep_all`, `max_chunks:<n>`,
    /// or `max_age_days:<n>`. Unset or unparsable means keep everything.
    pub fn from_env() -> Self {
        let raw = match std::env::var("MEMORY_RETENTION") {
            Ok(v) => v,
            Err(_) => return RetentionPolicy::KeepAll,
        };

        if raw == "keep_all" {
            return RetentionPolicy::KeepAll;
        }
        if let Some(n) = raw.strip_prefix("max_chunks:") {
            if let Ok(n) = n.parse() {
                return RetentionPolicy::MaxPerUser(n);
            }
        }
        if let Some(n) = raw.strip_prefix("max_age_days:") {
            if let Ok(n) = n.parse() {
                return RetentionPolicy::MaxAgeDays(n);
            }
        }

        warn!("Unparsable MEMORY_RETENTION value '{}', keeping all", raw);
        RetentionPolicy::KeepAll
    }
}

/// Flags describing what an interaction was about, set by the orchestrator
/// after handling an event. Drives the episodic/semantic split in
/// [`MemoryStore::record_interaction`].
#[derive(Debug, Clone, Default)]
pub struct InteractionContext {
    pub document_analyzed: bool,
    pub document_type: Option<String>,
    pub contract_analyzed: bool,
    pub counterparty_checked: bool,
    pub inn: Option<String>,
}

/// Memory store with SQLite backend and an injected embedder
pub struct MemoryStore {
    conn: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
    retention: RetentionPolicy,
}

impl MemoryStore {
    /// Open or create the memory database
    pub fn open(
        path: &Path,
        embedder: Arc<dyn Embedder>,
        retention: RetentionPolicy,
    ) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            embedder,
            retention,
        };
        store.init_schema()?;

        info!("Memory store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database, for tests
    pub fn open_in_memory(embedder: Arc<dyn Embedder>, retention: RetentionPolicy) -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            embedder,
            retention,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> CoreResult<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memory_chunks (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                scope TEXT NOT NULL CHECK(scope IN ('episodic', 'semantic', 'profile')),
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_user_scope
                ON memory_chunks(user_id, scope);
            CREATE INDEX IF NOT EXISTS idx_chunks_created
                ON memory_chunks(user_id, created_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// Embed and store a chunk. Fails loudly if the embedding call fails:
    /// the caller decides whether to retry or drop the write.
    pub async fn add(
        &self,
        user_id: i64,
        scope: MemoryScope,
        content: &str,
        metadata: Value,
    ) -> CoreResult<String> {
        let embedding = self.embedder.embed(content).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().timestamp_millis();
        let bytes = embedding_to_bytes(&embedding);
        let meta_json = metadata.to_string();

        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO memory_chunks (id, user_id, scope, content, metadata, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, user_id, scope.as_str(), content, meta_json, bytes, created_at],
            )?;
        }

        self.apply_retention(user_id)?;

        debug!("Stored {} chunk {} for user {}", scope, &id[..8], user_id);
        Ok(id)
    }

    /// Top-k chunks for one user and scope, by descending cosine similarity.
    /// Ties break most-recent-first.
    pub async fn search(
        &self,
        user_id: i64,
        scope: MemoryScope,
        query: &str,
        k: usize,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let query_vec = self.embedder.embed(query).await?;
        self.scan_scope(user_id, scope, &query_vec, k)
    }

    /// Merge relevant chunks from all three scopes for prompt composition.
    ///
    /// Each scope gets a ceil(k/3) quota before the merged re-sort, so a
    /// handful of profile or semantic facts cannot be crowded out by a large
    /// episodic log.
    pub async fn enrich(&self, user_id: i64, task_text: &str, k: usize) -> CoreResult<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(vec![]);
        }

        let query_vec = self.embedder.embed(task_text).await?;
        let per_scope = k.div_ceil(3);

        let mut merged = Vec::new();
        for scope in MemoryScope::ALL {
            merged.extend(self.scan_scope(user_id, scope, &query_vec, per_scope)?);
        }

        sort_scored(&mut merged);
        merged.truncate(k);
        Ok(merged)
    }

    /// Record a completed interaction: always one episodic chunk, plus a
    /// semantic chunk when the turn produced a durable fact (document,
    /// contract, or counterparty analysis).
    pub async fn record_interaction(
        &self,
        user_id: i64,
        input: &str,
        output: &str,
        ctx: &InteractionContext,
    ) -> CoreResult<()> {
        let turn = format!("User: {}\nBot: {}", input, output);
        self.add(
            user_id,
            MemoryScope::Episodic,
            &turn,
            serde_json::json!({ "type": "conversation" }),
        )
        .await?;

        let summary: String = output.chars().take(500).collect();

        if ctx.document_analyzed {
            let doc_type = ctx.document_type.as_deref().unwrap_or("unknown");
            self.add(
                user_id,
                MemoryScope::Semantic,
                &format!("Document analysis: {} - {}", doc_type, summary),
                serde_json::json!({ "type": "document_analysis", "document_type": doc_type }),
            )
            .await?;
        }

        if ctx.contract_analyzed {
            self.add(
                user_id,
                MemoryScope::Semantic,
                &format!("Contract analysis: {}", summary),
                serde_json::json!({ "type": "contract_analysis" }),
            )
            .await?;
        }

        if ctx.counterparty_checked {
            let inn = ctx.inn.as_deref().unwrap_or("");
            self.add(
                user_id,
                MemoryScope::Semantic,
                &format!("Counterparty check: {} - {}", inn, summary),
                serde_json::json!({ "type": "counterparty_check", "inn": inn }),
            )
            .await?;
        }

        Ok(())
    }

    /// Store a user preference as a profile chunk
    pub async fn update_profile(
        &self,
        user_id: i64,
        preference: &str,
        metadata: Value,
    ) -> CoreResult<String> {
        self.add(user_id, MemoryScope::Profile, preference, metadata)
            .await
    }

    /// Most recent chunks for a user and scope
    pub fn get_recent(
        &self,
        user_id: i64,
        scope: MemoryScope,
        limit: usize,
    ) -> CoreResult<Vec<MemoryChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, scope, content, metadata, embedding, created_at
             FROM memory_chunks
             WHERE user_id = ?1 AND scope = ?2
             ORDER BY created_at DESC
             LIMIT ?3",
        )?;

        let chunks = stmt
            .query_map(params![user_id, scope.as_str(), limit], row_to_chunk)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(chunks)
    }

    /// Remove every chunk a user owns. Pairs with session deletion for
    /// data-removal requests.
    pub fn delete_user(&self, user_id: i64) -> CoreResult<usize> {
        let rows = self.conn.lock().execute(
            "DELETE FROM memory_chunks WHERE user_id = ?1",
            params![user_id],
        )?;
        info!("Deleted {} memory chunks for user {}", rows, user_id);
        Ok(rows)
    }

    /// Per-scope chunk counts for a user
    pub fn stats(&self, user_id: i64) -> CoreResult<MemoryStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT scope, COUNT(*) FROM memory_chunks WHERE user_id = ?1 GROUP BY scope",
        )?;

        let mut stats = MemoryStats::default();
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            match row.0.as_str() {
                "episodic" => stats.episodic = row.1,
                "semantic" => stats.semantic = row.1,
                "profile" => stats.profile = row.1,
                _ => {}
            }
        }

        Ok(stats)
    }

    fn scan_scope(
        &self,
        user_id: i64,
        scope: MemoryScope,
        query_vec: &[f32],
        k: usize,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, scope, content, metadata, embedding, created_at
             FROM memory_chunks
             WHERE user_id = ?1 AND scope = ?2",
        )?;

        let mut scored: Vec<ScoredChunk> = stmt
            .query_map(params![user_id, scope.as_str()], row_to_chunk)?
            .filter_map(|r| r.ok())
            .map(|chunk| {
                let similarity = cosine_similarity(query_vec, &chunk.embedding);
                ScoredChunk { chunk, similarity }
            })
            .collect();

        sort_scored(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    fn apply_retention(&self, user_id: i64) -> CoreResult<()> {
        match self.retention {
            RetentionPolicy::KeepAll => Ok(()),
            RetentionPolicy::MaxPerUser(n) => {
                let rows = self.conn.lock().execute(
                    "DELETE FROM memory_chunks
                     WHERE user_id = ?1 AND scope = 'episodic' AND id NOT IN (
                         SELECT id FROM memory_chunks
                         WHERE user_id = ?1 AND scope = 'episodic'
                         ORDER BY created_at DESC
                         LIMIT ?2
                     )",
                    params![user_id, n],
                )?;
                if rows > 0 {
                    debug!("Retention dropped {} episodic chunks for user {}", rows, user_id);
                }
                Ok(())
            }
            RetentionPolicy::MaxAgeDays(days) => {
                let cutoff = chrono::Utc::now().timestamp_millis() - days * 24 * 60 * 60 * 1000;
                let rows = self.conn.lock().execute(
                    "DELETE FROM memory_chunks
                     WHERE user_id = ?1 AND scope = 'episodic' AND created_at < ?2",
                    params![user_id, cutoff],
                )?;
                if rows > 0 {
                    debug!("Retention dropped {} stale chunks for user {}", rows, user_id);
                }
                Ok(())
            }
        }
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryChunk> {
    let scope_str: String = row.get(2)?;
    let scope = MemoryScope::from_str(&scope_str).unwrap_or(MemoryScope::Episodic);
    let metadata: String = row.get(4)?;
    let embedding_bytes: Vec<u8> = row.get(5)?;

    Ok(MemoryChunk {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scope,
        content: row.get(3)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        embedding: embedding_from_bytes(&embedding_bytes),
        created_at: row.get(6)?,
    })
}

/// Similarity descending, most recent first on equal similarity
fn sort_scored(scored: &mut [ScoredChunk]) {
    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
    });
}

/// Format enriched chunks as a prompt context block
pub fn format_for_prompt(chunks: &[ScoredChunk]) -> String {
    if chunks.is_empty() {
        return String::new();
    }

    let lines: Vec<String> = chunks
        .iter()
        .map(|s| format!("- [{}] {}", s.chunk.scope, s.chunk.content))
        .collect();

    format!("[Relevant context]\n{}\n", lines.join("\n"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;

    /// Deterministic embedder: axes count occurrences of fixed keywords, so
    /// tests control similarity precisely without any network.
    pub struct KeywordEmbedder;

    pub const AXES: [&str; 3] = ["contract", "invoice", "court"];

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
            let lower = text.to_lowercase();
            let vec: Vec<f32> = AXES
                .iter()
                .map(|axis| lower.matches(axis).count() as f32)
                .collect();
            Ok(vec)
        }

        fn dimension(&self) -> usize {
            AXES.len()
        }
    }

    /// Embedder that always fails, for failure-path tests
    pub struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> CoreResult<Vec<f32>> {
            Err(CoreError::Embedding("stub failure".to_string()))
        }

        fn dimension(&self) -> usize {
            3
        }
    }
}
