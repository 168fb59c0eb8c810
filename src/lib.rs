//! CounselBot - legal assistant bot core
//!
//! Session and memory orchestration for a Telegram legal assistant aimed at
//! small businesses: contract review, counterparty checks, legal opinions.
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► Orchestrator ──► OpenAI-compatible API
//!                  │
//!                  ├── Tickets  (one-time tokens for inline buttons)
//!                  ├── Actions  (name -> handler registry)
//!                  ├── Flows    (one table of multi-step dialogs)
//!                  ├── Sessions (per-user state, soft idle reset)
//!                  └── Memory   (scoped vectors in SQLite)
//! ```

pub mod actions;
pub mod completion;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod flows;
pub mod memory;
pub mod orchestrator;
pub mod session;
pub mod telegram;
pub mod tickets;

pub use actions::{ActionContext, ActionHandler, ActionOutcome, ActionRegistry, Params};
pub use completion::{ChatClient, ChatMessage, ChatModel};
pub use config::Config;
pub use embeddings::{
    cosine_similarity, embedding_from_bytes, embedding_to_bytes, Embedder, EmbeddingClient,
    EmbeddingConfig,
};
pub use error::{CoreError, CoreResult};
pub use flows::{FlowEngine, Transition, UserInput};
pub use memory::{
    InteractionContext, MemoryChunk, MemoryScope, MemoryStats, MemoryStore, RetentionPolicy,
    ScoredChunk,
};
pub use orchestrator::{Event, Orchestrator, Reply};
pub use session::{GlobalStats, HistoryEntry, Preferences, SessionManager, SessionRecord};
pub use tickets::{InMemoryTickets, RedisTickets, Ticket, TicketBackend, TicketStore};
