//! Core error taxonomy
//!
//! Collaborator failures (embedding, completion, storage) are typed so the
//! orchestrator can tell them apart and show a fallback message. Expected
//! outcomes (expired ticket, validation failure, empty search) are ordinary
//! return values, never errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Embedding endpoint failed or returned garbage. Never replaced by a
    /// zero vector: callers must retry or skip the write.
    #[error("embedding request failed: {0}")]
    Embedding(String),

    /// Chat completion endpoint failed.
    #[error("completion request failed: {0}")]
    Completion(String),

    /// SQLite-level failure in the memory store.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Redis-level failure in the shared ticket backend.
    #[error("ticket backend error: {0}")]
    TicketBackend(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
