//! CounselBot - Entry Point
//!
//! Telegram legal assistant bot. Requires TELOXIDE_TOKEN and OPENAI_API_KEY;
//! everything else has defaults.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use counselbot::tickets::{InMemoryTickets, RedisTickets, TicketBackend, TicketStore, SWEEP_INTERVAL};
use counselbot::{
    ActionRegistry, ChatClient, Config, EmbeddingClient, EmbeddingConfig, MemoryStore,
    Orchestrator, SessionManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("CounselBot v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let token = config
        .telegram_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TELOXIDE_TOKEN is required"))?;

    // Ticket backend: Redis when configured, process-local otherwise
    let backend: Arc<dyn TicketBackend> = match &config.redis_url {
        Some(url) => {
            info!("Using Redis ticket backend");
            Arc::new(RedisTickets::connect(url).await?)
        }
        None => {
            info!("Using in-memory ticket backend");
            Arc::new(InMemoryTickets::new())
        }
    };
    let tickets = Arc::new(TicketStore::new(backend, config.ticket_ttl));

    let sessions = Arc::new(SessionManager::new(
        config.session_idle_timeout,
        config.history_cap,
        config.menu_history_cap,
    ));

    let embedder = Arc::new(EmbeddingClient::new(EmbeddingConfig::new(
        &config.openai_base_url,
        &config.openai_api_key,
        &config.embedding_model,
    ))?);
    let memory = Arc::new(MemoryStore::open(
        &config.db_path,
        embedder,
        config.retention,
    )?);

    let model = Arc::new(ChatClient::new(
        &config.openai_base_url,
        &config.openai_api_key,
        &config.chat_model,
    )?);

    // One periodic sweep per store, not one timer per entity
    tickets.spawn_sweeper(SWEEP_INTERVAL);
    sessions.spawn_sweeper(Duration::from_secs(60));

    let orchestrator = Orchestrator::new(
        Arc::clone(&sessions),
        Arc::clone(&tickets),
        ActionRegistry::with_defaults(),
        memory,
        model,
    );

    counselbot::telegram::run_bot(&token, orchestrator).await
}
