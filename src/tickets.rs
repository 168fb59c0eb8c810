//! One-time action tickets
//!
//! Inline-button payloads are limited to 64 bytes, so buttons carry an opaque
//! short-lived token instead of full action parameters. A ticket resolves at
//! most once: removal-on-read is the consumption mechanism, and a missing,
//! already-used, or expired token all answer the same way so a caller cannot
//! tell which case occurred.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::actions::{ActionContext, ActionOutcome, ActionRegistry, Params};
use crate::error::{CoreError, CoreResult};

/// Default ticket lifetime
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(5 * 60);

/// Sweep interval for expired-but-never-clicked tickets
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// An action bound to a parameter bag, waiting for its button to be pressed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub action: String,
    pub params: Params,
    /// Unix millis at mint time
    pub minted_at: i64,
}

/// Storage seam so a multi-instance deployment can share tickets through
/// Redis while tests and single-instance deployments stay in memory.
#[async_trait]
pub trait TicketBackend: Send + Sync {
    async fn put(&self, token: &str, ticket: Ticket, ttl: Duration) -> CoreResult<()>;

    /// Atomically remove and return the ticket. At most one concurrent caller
    /// ever receives `Some` for a given token.
    async fn take(&self, token: &str) -> CoreResult<Option<Ticket>>;

    /// Drop expired entries; returns how many were removed.
    async fn sweep(&self) -> CoreResult<usize>;
}

struct StoredTicket {
    ticket: Ticket,
    expires_at: Instant,
}

/// Process-local backend: a map guarded by a mutex held only for the duration
/// of a single insert/remove.
#[derive(Default)]
pub struct InMemoryTickets {
    tickets: Mutex<HashMap<String, StoredTicket>>,
}

impl InMemoryTickets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.lock().is_empty()
    }
}

#[async_trait]
impl TicketBackend for InMemoryTickets {
    async fn put(&self, token: &str, ticket: Ticket, ttl: Duration) -> CoreResult<()> {
        let stored = StoredTicket {
            ticket,
            expires_at: Instant::now() + ttl,
        };
        self.tickets.lock().insert(token.to_string(), stored);
        Ok(())
    }

    async fn take(&self, token: &str) -> CoreResult<Option<Ticket>> {
        // Remove first, then check expiry: an expired ticket must not be
        // handed out, and the removal itself is what makes consumption
        // at-most-once.
        let removed = self.tickets.lock().remove(token);
        match removed {
            Some(stored) if stored.expires_at > Instant::now() => Ok(Some(stored.ticket)),
            _ => Ok(None),
        }
    }

    async fn sweep(&self) -> CoreResult<usize> {
        let now = Instant::now();
        let mut tickets = self.tickets.lock();
        let before = tickets.len();
        tickets.retain(|_, stored| stored.expires_at > now);
        Ok(before - tickets.len())
    }
}

/// Redis backend for deployments where webhook traffic may land on any
/// instance. Expiry is delegated to Redis (`SET ... EX`), consumption to
/// `GETDEL`, which is atomic server-side.
pub struct RedisTickets {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisTickets {
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| CoreError::TicketBackend(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::TicketBackend(e.to_string()))?;
        Ok(Self {
            conn,
            key_prefix: "ticket:".to_string(),
        })
    }

    fn key(&self, token: &str) -> String {
        format!("{}{}", self.key_prefix, token)
    }
}

#[async_trait]
impl TicketBackend for RedisTickets {
    async fn put(&self, token: &str, ticket: Ticket, ttl: Duration) -> CoreResult<()> {
        let payload = serde_json::to_string(&ticket)
            .map_err(|e| CoreError::TicketBackend(e.to_string()))?;
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.key(token))
            .arg(payload)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CoreError::TicketBackend(e.to_string()))?;
        Ok(())
    }

    async fn take(&self, token: &str) -> CoreResult<Option<Ticket>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = redis::cmd("GETDEL")
            .arg(self.key(token))
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::TicketBackend(e.to_string()))?;

        match payload {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CoreError::TicketBackend(e.to_string())),
            None => Ok(None),
        }
    }

    async fn sweep(&self) -> CoreResult<usize> {
        // Redis expires keys on its own
        Ok(0)
    }
}

/// Mints and consumes one-time tickets
pub struct TicketStore {
    backend: Arc<dyn TicketBackend>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(backend: Arc<dyn TicketBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// In-memory store with the default 5-minute TTL
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTickets::new()), DEFAULT_TICKET_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Generate a token and store the ticket under it.
    ///
    /// 8 random bytes (64 bits) base64url-encoded: unguessable enough that
    /// enumeration within the TTL window is not practical.
    pub async fn mint(&self, action: &str, params: Params) -> CoreResult<String> {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let ticket = Ticket {
            action: action.to_string(),
            params,
            minted_at: chrono::Utc::now().timestamp_millis(),
        };

        self.backend.put(&token, ticket, self.ttl).await?;
        debug!("Minted ticket {} for action {}", token, action);
        Ok(token)
    }

    /// Atomically consume the ticket. `None` covers missing, already-used,
    /// and expired alike.
    pub async fn resolve(&self, token: &str) -> CoreResult<Option<Ticket>> {
        self.backend.take(token).await
    }

    /// Consume the ticket and run its action.
    ///
    /// An expired or unknown token is a normal outcome, not an error. Handler
    /// failures are logged and collapsed into a generic message so one broken
    /// action cannot take down the event loop.
    pub async fn execute(
        &self,
        token: &str,
        registry: &ActionRegistry,
        ctx: &ActionContext,
    ) -> ActionOutcome {
        let ticket = match self.resolve(token).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => {
                debug!("Ticket {} expired or already used", token);
                return ActionOutcome::SendText {
                    text: "⏳ Кнопка устарела. Откройте меню заново и повторите действие."
                        .to_string(),
                };
            }
            Err(e) => {
                warn!("Ticket backend failure on {}: {}", token, e);
                return generic_failure();
            }
        };

        let handler = match registry.lookup(&ticket.action) {
            Some(handler) => handler,
            None => {
                error!("No handler registered for action {}", ticket.action);
                return generic_failure();
            }
        };

        match handler.handle(&ticket.params, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Action {} failed: {}", ticket.action, e);
                generic_failure()
            }
        }
    }

    /// Background sweep so minted-but-never-clicked tickets do not accumulate
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match store.backend.sweep().await {
                    Ok(0) => {}
                    Ok(n) => debug!("Swept {} expired tickets", n),
                    Err(e) => warn!("Ticket sweep failed: {}", e),
                }
            }
        })
    }
}

fn generic_failure() -> ActionOutcome {
    ActionOutcome::SendText {
        text: "⚠️ Не получилось выполнить действие. Вернитесь в главное меню и попробуйте ещё раз."
            .to_string(),
    }
}
