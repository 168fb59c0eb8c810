//! Per-user session state
//!
//! One authoritative record per user: active flow, scratch data, bounded
//! histories, preferences, statistics. Records are mutated only through this
//! manager. Idle expiry is a soft reset driven by a single periodic sweep
//! over `last_activity` rather than one timer per session; it clears the
//! transient fields and never the record itself, so an event handler racing
//! the sweep sees a consistent (if stale) record.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default idle timeout before a session is soft-reset
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default cap per flow-type history bucket
pub const DEFAULT_HISTORY_CAP: usize = 20;

/// Default cap on menu navigation history
pub const DEFAULT_MENU_HISTORY_CAP: usize = 10;

/// Fallback when there is no previous menu action to go back to
pub const HOME_MENU: &str = "home";

/// A completed flow result, kept in a bounded per-flow-type bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub id: String,
    pub data: Value,
    /// Unix millis
    pub completed_at: i64,
}

/// Usage counters, preserved across idle resets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_queries: u64,
    pub total_documents: u64,
    pub total_inn_checks: u64,
    pub session_count: u64,
    pub total_time_spent_ms: i64,
    pub feature_usage: HashMap<String, u64>,
    pub flows_started: HashMap<String, u64>,
    pub flows_completed: HashMap<String, u64>,
}

/// Persisted user settings, preserved across idle resets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    pub language: String,
    pub expertise_level: String,
    pub response_format: String,
    pub timezone: String,
    pub reminders_enabled: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            language: "ru".to_string(),
            expertise_level: "general".to_string(),
            response_format: "structured".to_string(),
            timezone: "Europe/Moscow".to_string(),
            reminders_enabled: true,
        }
    }
}

/// Transient scratch data, cleared on idle reset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scratch {
    /// Extracted text of the most recently uploaded document
    pub current_document: Option<String>,
    /// Most recently entered counterparty tax id
    pub last_inn: Option<String>,
    pub uploaded_files: Vec<String>,
    pub pending_actions: Vec<String>,
}

/// The per-user record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: i64,
    /// Active flow name, `None` outside any flow
    pub flow: Option<String>,
    /// Current step inside the active flow
    pub step: Option<String>,
    /// Values collected by the active flow
    pub flow_data: serde_json::Map<String, Value>,
    /// Completed flow results, bucketed by flow type, bounded
    pub history: HashMap<String, VecDeque<HistoryEntry>>,
    /// Recent navigation actions, bounded
    pub menu_history: VecDeque<String>,
    pub statistics: SessionStats,
    pub temporary: Scratch,
    pub preferences: Preferences,
    /// Unix millis
    pub created_at: i64,
    /// Start of the current (post-reset) session, unix millis
    pub session_started_at: i64,
    /// Unix millis
    pub last_activity: i64,
}

impl SessionRecord {
    fn new(user_id: i64, now: i64) -> Self {
        Self {
            user_id,
            flow: None,
            step: None,
            flow_data: serde_json::Map::new(),
            history: HashMap::new(),
            menu_history: VecDeque::new(),
            statistics: SessionStats {
                session_count: 1,
                ..Default::default()
            },
            temporary: Scratch::default(),
            preferences: Preferences::default(),
            created_at: now,
            session_started_at: now,
            last_activity: now,
        }
    }

    /// Clear the transient half of the record, keep the durable half
    fn soft_reset(&mut self, now: i64) {
        self.statistics.total_time_spent_ms += now - self.session_started_at;
        self.statistics.session_count += 1;
        self.flow = None;
        self.step = None;
        self.flow_data = serde_json::Map::new();
        self.menu_history.clear();
        self.temporary = Scratch::default();
        self.session_started_at = now;
    }
}

/// Aggregate numbers across all resident sessions
#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    pub total_users: usize,
    pub active_users: usize,
    pub total_queries: u64,
    pub total_documents: u64,
}

/// Owner of all session records
pub struct SessionManager {
    sessions: Mutex<HashMap<i64, SessionRecord>>,
    idle_timeout: Duration,
    history_cap: usize,
    menu_history_cap: usize,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(
            DEFAULT_IDLE_TIMEOUT,
            DEFAULT_HISTORY_CAP,
            DEFAULT_MENU_HISTORY_CAP,
        )
    }
}

impl SessionManager {
    pub fn new(idle_timeout: Duration, history_cap: usize, menu_history_cap: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
            history_cap,
            menu_history_cap,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Run `f` against the user's record, creating it first if needed.
    /// Every access refreshes `last_activity`.
    fn with_session<R>(&self, user_id: i64, f: impl FnOnce(&mut SessionRecord) -> R) -> R {
        let now = Self::now_ms();
        let mut sessions = self.sessions.lock();
        let record = sessions
            .entry(user_id)
            .or_insert_with(|| SessionRecord::new(user_id, now));
        record.last_activity = now;
        f(record)
    }

    /// Snapshot of the user's record, created if absent
    pub fn get_or_create(&self, user_id: i64) -> SessionRecord {
        self.with_session(user_id, |record| record.clone())
    }

    /// Refresh activity without other effects
    pub fn touch(&self, user_id: i64) {
        self.with_session(user_id, |_| ());
    }

    // ============ Flow transitions ============

    pub fn start_flow(&self, user_id: i64, flow_type: &str, initial_data: serde_json::Map<String, Value>) {
        self.with_session(user_id, |record| {
            record.flow = Some(flow_type.to_string());
            record.step = Some("start".to_string());
            record.flow_data = initial_data;
            *record
                .statistics
                .flows_started
                .entry(flow_type.to_string())
                .or_insert(0) += 1;
        });
        debug!("User {} started flow {}", user_id, flow_type);
    }

    pub fn next_step(&self, user_id: i64, step_name: &str, step_data: serde_json::Map<String, Value>) {
        self.with_session(user_id, |record| {
            if record.flow.is_some() {
                record.step = Some(step_name.to_string());
                record.flow_data.extend(step_data);
            }
        });
    }

    /// Finish the active flow and append its result to the history bucket for
    /// that flow type. This is the single point where a flow becomes durable
    /// history. An empty result is a valid way to abandon a flow.
    pub fn complete_flow(&self, user_id: i64, result: Value) -> Option<HistoryEntry> {
        self.with_session(user_id, |record| {
            let flow_type = record.flow.take()?;
            record.step = None;

            let mut data = serde_json::Map::new();
            data.extend(std::mem::take(&mut record.flow_data));
            if let Value::Object(result_map) = result {
                data.extend(result_map);
            }

            let entry = HistoryEntry {
                id: uuid::Uuid::new_v4().to_string(),
                data: Value::Object(data),
                completed_at: Self::now_ms(),
            };

            let bucket = record
                .history
                .entry(history_bucket(&flow_type).to_string())
                .or_default();
            bucket.push_back(entry.clone());
            while bucket.len() > self.history_cap {
                bucket.pop_front();
            }

            *record
                .statistics
                .flows_completed
                .entry(flow_type)
                .or_insert(0) += 1;

            Some(entry)
        })
    }

    // ============ Menu navigation ============

    pub fn add_to_menu_history(&self, user_id: i64, action: &str) {
        self.with_session(user_id, |record| {
            record.menu_history.push_back(action.to_string());
            while record.menu_history.len() > self.menu_history_cap {
                record.menu_history.pop_front();
            }
        });
    }

    /// The action before the current one; "home" when there is nothing to go
    /// back to.
    pub fn get_previous_menu_action(&self, user_id: i64) -> String {
        self.with_session(user_id, |record| {
            let len = record.menu_history.len();
            if len >= 2 {
                record.menu_history[len - 2].clone()
            } else {
                HOME_MENU.to_string()
            }
        })
    }

    // ============ Scratch and preferences ============

    pub fn set_current_document(&self, user_id: i64, text: &str, file_name: &str) {
        self.with_session(user_id, |record| {
            record.temporary.current_document = Some(text.to_string());
            record.temporary.uploaded_files.push(file_name.to_string());
            record.statistics.total_documents += 1;
        });
    }

    pub fn set_last_inn(&self, user_id: i64, inn: &str) {
        self.with_session(user_id, |record| {
            record.temporary.last_inn = Some(inn.to_string());
            record.statistics.total_inn_checks += 1;
        });
    }

    /// Remember that an action asked for free-text input; the next plain
    /// message outside a flow is routed back to it.
    pub fn push_pending_action(&self, user_id: i64, action: &str) {
        self.with_session(user_id, |record| {
            record.temporary.pending_actions.push(action.to_string());
        });
    }

    /// Take the most recently requested pending action, if any
    pub fn pop_pending_action(&self, user_id: i64) -> Option<String> {
        self.with_session(user_id, |record| record.temporary.pending_actions.pop())
    }

    pub fn record_query(&self, user_id: i64) {
        self.with_session(user_id, |record| {
            record.statistics.total_queries += 1;
        });
    }

    pub fn record_feature(&self, user_id: i64, feature: &str) {
        self.with_session(user_id, |record| {
            *record
                .statistics
                .feature_usage
                .entry(feature.to_string())
                .or_insert(0) += 1;
        });
    }

    pub fn update_preferences(&self, user_id: i64, f: impl FnOnce(&mut Preferences)) {
        self.with_session(user_id, |record| f(&mut record.preferences));
    }

    // ============ Lifecycle ============

    /// Soft-reset the user's transient state now (used by /reset and by
    /// `ClearSession` outcomes).
    pub fn clear_session(&self, user_id: i64) {
        let now = Self::now_ms();
        self.with_session(user_id, |record| record.soft_reset(now));
        debug!("Cleared session for user {}", user_id);
    }

    /// Soft-reset every session idle longer than the timeout. Returns the
    /// affected user ids.
    pub fn expire_idle(&self) -> Vec<i64> {
        let now = Self::now_ms();
        let cutoff = now - self.idle_timeout.as_millis() as i64;

        let mut sessions = self.sessions.lock();
        let mut expired = Vec::new();
        for (user_id, record) in sessions.iter_mut() {
            // Only already-reset-clean sessions are skipped; the reset itself
            // must not touch last_activity or it would fire repeatedly.
            if record.last_activity < cutoff && (record.flow.is_some() || !is_scratch_empty(record))
            {
                record.soft_reset(now);
                expired.push(*user_id);
            }
        }
        if !expired.is_empty() {
            debug!("Idle-expired {} sessions", expired.len());
        }
        expired
    }

    pub fn is_active(&self, user_id: i64) -> bool {
        let cutoff = Self::now_ms() - self.idle_timeout.as_millis() as i64;
        self.sessions
            .lock()
            .get(&user_id)
            .map(|r| r.last_activity >= cutoff)
            .unwrap_or(false)
    }

    /// Hard delete: drop the record entirely. The only irreversible
    /// operation here; used for data-removal requests.
    pub fn delete_user_data(&self, user_id: i64) -> bool {
        let removed = self.sessions.lock().remove(&user_id).is_some();
        if removed {
            info!("Deleted session data for user {}", user_id);
        }
        removed
    }

    /// Everything we hold about a user, for data-export requests
    pub fn export_user_data(&self, user_id: i64) -> Value {
        self.with_session(user_id, |record| {
            serde_json::json!({
                "user_id": record.user_id,
                "preferences": record.preferences,
                "statistics": record.statistics,
                "history": record.history,
                "exported_at": Self::now_ms(),
            })
        })
    }

    pub fn global_stats(&self) -> GlobalStats {
        let cutoff = Self::now_ms() - self.idle_timeout.as_millis() as i64;
        let sessions = self.sessions.lock();

        let mut stats = GlobalStats {
            total_users: sessions.len(),
            ..Default::default()
        };
        for record in sessions.values() {
            if record.last_activity >= cutoff {
                stats.active_users += 1;
            }
            stats.total_queries += record.statistics.total_queries;
            stats.total_documents += record.statistics.total_documents;
        }
        stats
    }

    /// Background sweep replacing a timer per session
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.expire_idle();
            }
        })
    }
}

/// Fixed history category for a flow type. Unknown flow types land in the
/// general queries bucket.
pub fn history_bucket(flow_type: &str) -> &'static str {
    match flow_type {
        "contract_review" => "contracts_reviewed",
        "counterparty_check" | "inn_check" => "inn_checks",
        "document_upload" => "documents",
        _ => "queries",
    }
}

fn is_scratch_empty(record: &SessionRecord) -> bool {
    record.temporary.current_document.is_none()
        && record.temporary.last_inn.is_none()
        && record.temporary.uploaded_files.is_empty()
        && record.temporary.pending_actions.is_empty()
        && record.menu_history.is_empty()
}
