//! Action Registry
//!
//! Maps action names to handlers that receive resolved ticket parameters plus
//! a caller-supplied context and return a UI directive. The registry is built
//! once at startup and treated as read-only afterwards; lookups from concurrent
//! handlers never mutate it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Parameter bag carried by a ticket
pub type Params = serde_json::Map<String, Value>;

/// UI directive returned by action handlers
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Navigate to a menu section
    ShowMenu { section: String },
    /// Send a plain text reply
    SendText { text: String },
    /// Ask the user for input and route the answer to another action
    RequestInput { prompt: String, expected_action: String },
    /// Run a model prompt with the given data
    RunPrompt { prompt_id: String, data: Value },
    /// Soft-reset the user's session
    ClearSession,
}

/// Snapshot of session state an action may need, owned so handlers hold no
/// locks while running.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub user_id: i64,
    pub chat_id: i64,
    /// Extracted text of the most recently uploaded document, if any
    pub last_document: Option<String>,
    /// Most recently checked counterparty tax id, if any
    pub last_inn: Option<String>,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, params: &Params, ctx: &ActionContext) -> anyhow::Result<ActionOutcome>;
}

/// Name -> handler table, built once at process start
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the stock bot actions
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ui.back_home", Arc::new(BackHome));
        registry.register("ui.back", Arc::new(Back));
        registry.register("contracts.risks_table", Arc::new(RisksTable));
        registry.register("contracts.suggest_edits", Arc::new(SuggestEdits));
        registry.register("contracts.protocol_of_disagreements", Arc::new(ProtocolDraft));
        registry.register("kyc.full_scoring", Arc::new(CounterpartyScoring));
        registry.register("utils.legal_opinion", Arc::new(LegalOpinion));
        registry.register("session.clear", Arc::new(ClearSession));
        registry
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn ActionHandler>) {
        debug!("Registered action: {}", name);
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ============ Stock actions ============

struct BackHome;

#[async_trait]
impl ActionHandler for BackHome {
    async fn handle(&self, _params: &Params, _ctx: &ActionContext) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::ShowMenu {
            section: "home".to_string(),
        })
    }
}

struct Back;

#[async_trait]
impl ActionHandler for Back {
    async fn handle(&self, _params: &Params, _ctx: &ActionContext) -> anyhow::Result<ActionOutcome> {
        // The orchestrator resolves "back" against the user's menu history
        Ok(ActionOutcome::ShowMenu {
            section: "back".to_string(),
        })
    }
}

struct ClearSession;

#[async_trait]
impl ActionHandler for ClearSession {
    async fn handle(&self, _params: &Params, _ctx: &ActionContext) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::ClearSession)
    }
}

struct RisksTable;

#[async_trait]
impl ActionHandler for RisksTable {
    async fn handle(&self, params: &Params, ctx: &ActionContext) -> anyhow::Result<ActionOutcome> {
        let document = params
            .get("document")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| ctx.last_document.clone());

        match document {
            Some(doc) => Ok(ActionOutcome::RunPrompt {
                prompt_id: "contract_risks".to_string(),
                data: serde_json::json!({ "document": doc, "mode": "table" }),
            }),
            None => Ok(ActionOutcome::SendText {
                text: "⚠️ Сначала загрузите документ для анализа рисков.".to_string(),
            }),
        }
    }
}

struct SuggestEdits;

#[async_trait]
impl ActionHandler for SuggestEdits {
    async fn handle(&self, _params: &Params, ctx: &ActionContext) -> anyhow::Result<ActionOutcome> {
        match &ctx.last_document {
            Some(doc) => Ok(ActionOutcome::RunPrompt {
                prompt_id: "contract_edits".to_string(),
                data: serde_json::json!({ "document": doc }),
            }),
            None => Ok(ActionOutcome::SendText {
                text: "⚠️ Сначала загрузите договор для предложения правок.".to_string(),
            }),
        }
    }
}

struct ProtocolDraft;

#[async_trait]
impl ActionHandler for ProtocolDraft {
    async fn handle(&self, params: &Params, ctx: &ActionContext) -> anyhow::Result<ActionOutcome> {
        let side = params
            .get("side")
            .and_then(Value::as_str)
            .unwrap_or("client");

        match &ctx.last_document {
            Some(doc) => Ok(ActionOutcome::RunPrompt {
                prompt_id: "protocol_draft".to_string(),
                data: serde_json::json!({ "document": doc, "side": side }),
            }),
            None => Ok(ActionOutcome::SendText {
                text: "⚠️ Сначала загрузите договор для создания протокола разногласий."
                    .to_string(),
            }),
        }
    }
}

struct CounterpartyScoring;

impl CounterpartyScoring {
    fn ask_for_inn(prefix: Option<&str>) -> ActionOutcome {
        let prompt = "🔎 Введите ИНН контрагента (10 или 12 цифр).";
        ActionOutcome::RequestInput {
            prompt: match prefix {
                Some(error) => format!("{} {}", error, prompt),
                None => prompt.to_string(),
            },
            expected_action: "kyc.full_scoring".to_string(),
        }
    }
}

#[async_trait]
impl ActionHandler for CounterpartyScoring {
    async fn handle(&self, params: &Params, ctx: &ActionContext) -> anyhow::Result<ActionOutcome> {
        // The tax id arrives as a ticket parameter, as a routed input answer,
        // or falls back to the last one seen in the session
        let raw = params
            .get("inn")
            .or_else(|| params.get("input"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| ctx.last_inn.clone());

        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(Self::ask_for_inn(None)),
        };

        match crate::flows::validate_inn(&raw) {
            Ok(inn) => Ok(ActionOutcome::RunPrompt {
                prompt_id: "counterparty_scoring".to_string(),
                data: serde_json::json!({ "inn": inn, "mode": "full" }),
            }),
            Err(error) => Ok(Self::ask_for_inn(Some(&error))),
        }
    }
}

struct LegalOpinion;

#[async_trait]
impl ActionHandler for LegalOpinion {
    async fn handle(&self, params: &Params, _ctx: &ActionContext) -> anyhow::Result<ActionOutcome> {
        let topic = params
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or("общий юридический вопрос");

        Ok(ActionOutcome::RunPrompt {
            prompt_id: "legal_opinion".to_string(),
            data: serde_json::json!({ "topic": topic }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_back_home() {
        let registry = ActionRegistry::with_defaults();
        let handler = registry.lookup("ui.back_home").unwrap();

        let outcome = handler
            .handle(&Params::new(), &ActionContext::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::ShowMenu {
                section: "home".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_risks_table_requires_document() {
        let registry = ActionRegistry::with_defaults();
        let handler = registry.lookup("contracts.risks_table").unwrap();

        // No document anywhere -> guard message
        let outcome = handler
            .handle(&Params::new(), &ActionContext::default())
            .await
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::SendText { .. }));

        // Document in session context -> prompt
        let ctx = ActionContext {
            last_document: Some("Договор поставки №1".to_string()),
            ..Default::default()
        };
        let outcome = handler.handle(&Params::new(), &ctx).await.unwrap();
        assert!(matches!(outcome, ActionOutcome::RunPrompt { .. }));
    }

    #[tokio::test]
    async fn test_counterparty_scoring_requests_input_then_runs() {
        let registry = ActionRegistry::with_defaults();
        let handler = registry.lookup("kyc.full_scoring").unwrap();
        let ctx = ActionContext::default();

        // No tax id anywhere: ask for one, routed back to this action
        let outcome = handler.handle(&Params::new(), &ctx).await.unwrap();
        match outcome {
            ActionOutcome::RequestInput { expected_action, .. } => {
                assert_eq!(expected_action, "kyc.full_scoring");
            }
            other => panic!("expected RequestInput, got {:?}", other),
        }

        // Routed answer with separators: normalized and run
        let mut params = Params::new();
        params.insert("input".to_string(), serde_json::json!("7707 083893"));
        let outcome = handler.handle(&params, &ctx).await.unwrap();
        match outcome {
            ActionOutcome::RunPrompt { prompt_id, data } => {
                assert_eq!(prompt_id, "counterparty_scoring");
                assert_eq!(data["inn"], "7707083893");
            }
            other => panic!("expected RunPrompt, got {:?}", other),
        }

        // Garbage answer: asked again with the validation error attached
        let mut params = Params::new();
        params.insert("input".to_string(), serde_json::json!("not a number"));
        let outcome = handler.handle(&params, &ctx).await.unwrap();
        match outcome {
            ActionOutcome::RequestInput { prompt, .. } => {
                assert!(prompt.contains("10 или 12"));
            }
            other => panic!("expected RequestInput, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = ActionRegistry::with_defaults();
        assert!(registry.lookup("nope.missing").is_none());
        assert!(!registry.is_empty());
    }
}
