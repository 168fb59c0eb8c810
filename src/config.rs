//! Configuration management

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::memory::RetentionPolicy;

/// Bot configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token (TELOXIDE_TOKEN)
    pub telegram_token: Option<String>,

    /// OpenAI API key (embeddings + completions)
    pub openai_api_key: String,

    /// OpenAI-compatible API base URL
    pub openai_base_url: String,

    /// Chat completion model
    pub chat_model: String,

    /// Embedding model
    pub embedding_model: String,

    /// Redis URL for the shared ticket backend (optional; in-memory if unset)
    pub redis_url: Option<String>,

    /// SQLite database path for memory chunks
    pub db_path: PathBuf,

    /// One-time ticket TTL
    pub ticket_ttl: Duration,

    /// Session idle timeout (soft reset)
    pub session_idle_timeout: Duration,

    /// Per-flow-type history cap
    pub history_cap: usize,

    /// Menu navigation history cap
    pub menu_history_cap: usize,

    /// Episodic memory retention policy
    pub retention: RetentionPolicy,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let telegram_token = std::env::var("TELOXIDE_TOKEN").ok();

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is required"))?;

        let openai_base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let chat_model = std::env::var("CHAT_MODEL")
            .unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let embedding_model = std::env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        let redis_url = std::env::var("REDIS_URL").ok();

        let db_path = std::env::var("COUNSELBOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/memory.db"));

        let ticket_ttl = env_secs("TICKET_TTL_SECS", 300);
        let session_idle_timeout = env_secs("SESSION_IDLE_SECS", 30 * 60);

        let history_cap = env_usize("HISTORY_CAP", 20);
        let menu_history_cap = env_usize("MENU_HISTORY_CAP", 10);

        let retention = RetentionPolicy::from_env();

        Ok(Self {
            telegram_token,
            openai_api_key,
            openai_base_url,
            chat_model,
            embedding_model,
            redis_url,
            db_path,
            ticket_ttl,
            session_idle_timeout,
            history_cap,
            menu_history_cap,
            retention,
        })
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
