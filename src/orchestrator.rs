//! Event orchestrator
//!
//! The single routing point between transport events and the stores. Every
//! incoming event lands here as either a callback token, a text message, or a
//! document; the orchestrator consults the active flow, the ticket store, and
//! memory, and returns one reply for the transport layer to render.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::actions::{ActionContext, ActionOutcome, ActionRegistry};
use crate::completion::{ChatMessage, ChatModel};
use crate::error::CoreResult;
use crate::flows::{FlowDef, FlowEngine, Transition, UserInput};
use crate::memory::{format_for_prompt, InteractionContext, MemoryStore};
use crate::session::SessionManager;
use crate::tickets::TicketStore;

/// How many memory chunks to pull into each prompt
const ENRICH_K: usize = 6;

const GENERIC_FAILURE: &str =
    "⚠️ Не получилось выполнить действие. Вернитесь в главное меню и попробуйте ещё раз.";

const SYSTEM_PROMPT: &str = "Ты — юридический ассистент для малого бизнеса в России. \
Отвечай по существу, со ссылками на нормы права, где это уместно. \
Не выдумывай реквизиты и судебную практику.";

/// An incoming event, already stripped of transport details
#[derive(Debug)]
pub enum Event<'a> {
    /// Inline-button press carrying a ticket token
    Callback { token: &'a str },
    /// Plain text message
    Text(&'a str),
    /// Uploaded document with its extracted text
    Document {
        file_name: &'a str,
        file_size: u64,
        text: &'a str,
    },
}

/// What the transport layer should render
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Menu { section: String },
}

pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    flows: FlowEngine,
    tickets: Arc<TicketStore>,
    actions: ActionRegistry,
    memory: Arc<MemoryStore>,
    model: Arc<dyn ChatModel>,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        tickets: Arc<TicketStore>,
        actions: ActionRegistry,
        memory: Arc<MemoryStore>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        let flows = FlowEngine::new(Arc::clone(&sessions));
        Self {
            sessions,
            flows,
            tickets,
            actions,
            memory,
            model,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tickets(&self) -> &Arc<TicketStore> {
        &self.tickets
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Begin a flow and return the prompt of its first step
    pub fn start_flow(&self, user_id: i64, flow_name: &str) -> Option<Reply> {
        let first = self.flows.start(user_id, flow_name)?;
        self.sessions.record_feature(user_id, flow_name);
        Some(Reply::Text(first.prompt.to_string()))
    }

    /// Route one event to a reply
    pub async fn handle(&self, user_id: i64, chat_id: i64, event: Event<'_>) -> CoreResult<Reply> {
        match event {
            Event::Callback { token } => self.handle_callback(user_id, chat_id, token).await,
            Event::Text(text) => self.handle_text(user_id, chat_id, text).await,
            Event::Document {
                file_name,
                file_size,
                text,
            } => self.handle_document(user_id, file_name, file_size, text).await,
        }
    }

    async fn handle_callback(&self, user_id: i64, chat_id: i64, token: &str) -> CoreResult<Reply> {
        let record = self.sessions.get_or_create(user_id);
        let ctx = ActionContext {
            user_id,
            chat_id,
            last_document: record.temporary.current_document,
            last_inn: record.temporary.last_inn,
        };

        let outcome = self.tickets.execute(token, &self.actions, &ctx).await;
        self.apply_outcome(user_id, outcome).await
    }

    async fn handle_text(&self, user_id: i64, chat_id: i64, text: &str) -> CoreResult<Reply> {
        self.sessions.record_query(user_id);

        // "назад" inside a flow steps back instead of being treated as input
        if text.trim().to_lowercase() == "назад" {
            if let Some(step) = self.flows.prev_step(user_id) {
                return Ok(Reply::Text(step.prompt.to_string()));
            }
        }

        match self.flows.transition(user_id, &UserInput::Text(text)) {
            Transition::NoFlow => {
                if let Some(action) = self.sessions.pop_pending_action(user_id) {
                    return self.dispatch_action(user_id, chat_id, &action, text).await;
                }
                self.free_text(user_id, text).await
            }
            Transition::Stay { error, .. } => Ok(Reply::Text(error)),
            Transition::Advanced { step } => Ok(Reply::Text(step.prompt.to_string())),
            Transition::ReadyToProcess { flow, data } => {
                self.process_flow(user_id, flow, data).await
            }
        }
    }

    /// Route the answer to an earlier input request back to its action
    async fn dispatch_action(
        &self,
        user_id: i64,
        chat_id: i64,
        action: &str,
        input: &str,
    ) -> CoreResult<Reply> {
        let record = self.sessions.get_or_create(user_id);
        let ctx = ActionContext {
            user_id,
            chat_id,
            last_document: record.temporary.current_document,
            last_inn: record.temporary.last_inn,
        };

        let handler = match self.actions.lookup(action) {
            Some(handler) => handler,
            None => {
                tracing::error!("Pending action {} has no registered handler", action);
                return Ok(Reply::Text(GENERIC_FAILURE.to_string()));
            }
        };

        let mut params = serde_json::Map::new();
        params.insert("input".to_string(), Value::String(input.to_string()));

        match handler.handle(&params, &ctx).await {
            Ok(outcome) => self.apply_outcome(user_id, outcome).await,
            Err(e) => {
                warn!("Routed action {} failed for user {}: {}", action, user_id, e);
                Ok(Reply::Text(GENERIC_FAILURE.to_string()))
            }
        }
    }

    async fn handle_document(
        &self,
        user_id: i64,
        file_name: &str,
        file_size: u64,
        text: &str,
    ) -> CoreResult<Reply> {
        let input = UserInput::Document {
            file_name,
            file_size,
        };

        match self.flows.transition(user_id, &input) {
            Transition::NoFlow => {
                // Upload outside any flow: keep it in scratch for later actions
                self.sessions.set_current_document(user_id, text, file_name);
                Ok(Reply::Text(format!(
                    "📄 Файл «{}» получен. Выберите действие в меню или задайте вопрос по документу.",
                    file_name
                )))
            }
            Transition::Stay { error, .. } => Ok(Reply::Text(error)),
            Transition::Advanced { step } => {
                self.sessions.set_current_document(user_id, text, file_name);
                Ok(Reply::Text(step.prompt.to_string()))
            }
            Transition::ReadyToProcess { flow, data } => {
                self.sessions.set_current_document(user_id, text, file_name);
                self.process_flow(user_id, flow, data).await
            }
        }
    }

    async fn apply_outcome(&self, user_id: i64, outcome: ActionOutcome) -> CoreResult<Reply> {
        match outcome {
            ActionOutcome::ShowMenu { section } => {
                // "back" is virtual: it resolves against menu history and is
                // never recorded itself
                let section = if section == "back" {
                    self.sessions.get_previous_menu_action(user_id)
                } else {
                    self.sessions.add_to_menu_history(user_id, &section);
                    section
                };
                Ok(Reply::Menu { section })
            }
            ActionOutcome::SendText { text } => Ok(Reply::Text(text)),
            ActionOutcome::RequestInput {
                prompt,
                expected_action,
            } => {
                self.sessions.push_pending_action(user_id, &expected_action);
                Ok(Reply::Text(prompt))
            }
            ActionOutcome::RunPrompt { prompt_id, data } => {
                self.run_prompt(user_id, &prompt_id, &data).await
            }
            ActionOutcome::ClearSession => {
                self.sessions.clear_session(user_id);
                Ok(Reply::Text(
                    "🧹 Сессия очищена. История и настройки сохранены.".to_string(),
                ))
            }
        }
    }

    /// Free-form question: enrich with memory, ask the model, remember the turn
    async fn free_text(&self, user_id: i64, text: &str) -> CoreResult<Reply> {
        let context = self.recall(user_id, text).await;

        let mut system = SYSTEM_PROMPT.to_string();
        if !context.is_empty() {
            system.push_str("\n\n");
            system.push_str(&context);
        }

        let messages = [ChatMessage::system(system), ChatMessage::user(text)];
        let answer = self.model.complete(&messages).await?;

        self.remember(user_id, text, &answer, &InteractionContext::default())
            .await;

        Ok(Reply::Text(answer))
    }

    /// A flow reached its processing step: run its prompt over collected data
    async fn process_flow(
        &self,
        user_id: i64,
        flow: &'static FlowDef,
        data: serde_json::Map<String, Value>,
    ) -> CoreResult<Reply> {
        debug!("User {} flow {} ready, running {}", user_id, flow.name, flow.prompt_id);

        let record = self.sessions.get_or_create(user_id);
        let mut data = data;
        if let Some(document) = record.temporary.current_document {
            data.insert("document".to_string(), Value::String(document));
        }

        let reply = self.run_prompt(user_id, flow.prompt_id, &Value::Object(data)).await;

        // The flow is done either way; a failed model call should not leave
        // the user stuck at the processing step.
        match &reply {
            Ok(_) => {
                self.sessions.complete_flow(user_id, Value::Null);
            }
            Err(e) => {
                warn!("Flow {} prompt failed for user {}: {}", flow.name, user_id, e);
                self.sessions.complete_flow(user_id, Value::Null);
            }
        }
        reply
    }

    async fn run_prompt(&self, user_id: i64, prompt_id: &str, data: &Value) -> CoreResult<Reply> {
        if prompt_id == "counterparty_scoring" {
            if let Some(inn) = data.get("inn").and_then(Value::as_str) {
                self.sessions.set_last_inn(user_id, inn);
            }
        }

        let instruction = prompt_instruction(prompt_id);
        let task = render_task(prompt_id, data);

        let context = self.recall(user_id, &task).await;
        let mut system = format!("{}\n\n{}", SYSTEM_PROMPT, instruction);
        if !context.is_empty() {
            system.push_str("\n\n");
            system.push_str(&context);
        }

        let messages = [ChatMessage::system(system), ChatMessage::user(task.clone())];
        let answer = self.model.complete(&messages).await?;

        self.remember(user_id, &task, &answer, &interaction_flags(prompt_id, data))
            .await;

        Ok(Reply::Text(answer))
    }

    /// Memory recall degrades to no context on failure; a broken embedding
    /// endpoint must not make the bot mute.
    async fn recall(&self, user_id: i64, text: &str) -> String {
        match self.memory.enrich(user_id, text, ENRICH_K).await {
            Ok(chunks) => format_for_prompt(&chunks),
            Err(e) => {
                warn!("Memory recall failed for user {}: {}", user_id, e);
                String::new()
            }
        }
    }

    /// Memory writes are best-effort once the reply exists
    async fn remember(&self, user_id: i64, input: &str, output: &str, ctx: &InteractionContext) {
        if let Err(e) = self.memory.record_interaction(user_id, input, output, ctx).await {
            warn!("Failed to record interaction for user {}: {}", user_id, e);
        }
    }
}

fn prompt_instruction(prompt_id: &str) -> &'static str {
    match prompt_id {
        "contract_risks" => {
            "Проанализируй договор со стороны, указанной в данных. \
             Составь таблицу рисков: пункт договора, риск, рекомендация."
        }
        "contract_edits" => {
            "Предложи конкретные правки к договору: формулировка была / формулировка стала, \
             с коротким обоснованием каждой правки."
        }
        "protocol_draft" => {
            "Составь протокол разногласий к договору от имени указанной стороны."
        }
        "counterparty_scoring" => {
            "Оцени надёжность контрагента по ИНН из данных. Перечисли, какие признаки \
             стоит проверить по открытым реестрам, и дай итоговую рекомендацию."
        }
        "legal_opinion" => {
            "Подготовь юридическое заключение: вопрос, применимые нормы, анализ, вывод."
        }
        _ => "Выполни задачу по данным ниже.",
    }
}

fn render_task(prompt_id: &str, data: &Value) -> String {
    format!("Задача: {}\nДанные: {}", prompt_id, data)
}

fn interaction_flags(prompt_id: &str, data: &Value) -> InteractionContext {
    match prompt_id {
        "contract_risks" | "contract_edits" | "protocol_draft" => InteractionContext {
            document_analyzed: true,
            document_type: Some("contract".to_string()),
            contract_analyzed: true,
            ..Default::default()
        },
        "counterparty_scoring" => InteractionContext {
            counterparty_checked: true,
            inn: data
                .get("inn")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..Default::default()
        },
        _ => InteractionContext::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Params;
    use crate::error::CoreError;
    use crate::memory::test_support::KeywordEmbedder;
    use crate::memory::{MemoryScope, RetentionPolicy};
    use async_trait::async_trait;

    struct StubModel {
        reply: String,
    }

    #[async_trait]
    impl ChatModel for StubModel {
        async fn complete(&self, _messages: &[ChatMessage]) -> CoreResult<String> {
            Ok(self.reply.clone())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        async fn complete(&self, _messages: &[ChatMessage]) -> CoreResult<String> {
            Err(CoreError::Completion("stub outage".to_string()))
        }
    }

    fn orchestrator_with_model(model: Arc<dyn ChatModel>) -> Orchestrator {
        let sessions = Arc::new(SessionManager::default());
        let tickets = Arc::new(TicketStore::in_memory());
        let memory = Arc::new(
            MemoryStore::open_in_memory(Arc::new(KeywordEmbedder), RetentionPolicy::KeepAll)
                .unwrap(),
        );
        Orchestrator::new(
            sessions,
            tickets,
            ActionRegistry::with_defaults(),
            memory,
            model,
        )
    }

    fn orchestrator(reply: &str) -> Orchestrator {
        orchestrator_with_model(Arc::new(StubModel {
            reply: reply.to_string(),
        }))
    }

    #[tokio::test]
    async fn test_free_text_answers_and_remembers() {
        let orch = orchestrator("Срок исковой давности — три года.");
        let user = 1;

        let reply = orch
            .handle(user, user, Event::Text("какой срок исковой давности?"))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Text("Срок исковой давности — три года.".to_string()));

        // The turn was stored as episodic memory
        let stats = orch.memory().stats(user).unwrap();
        assert_eq!(stats.episodic, 1);
        assert_eq!(stats.semantic, 0);

        assert_eq!(orch.sessions().get_or_create(user).statistics.total_queries, 1);
    }

    #[tokio::test]
    async fn test_counterparty_flow_end_to_end() {
        let orch = orchestrator("Контрагент выглядит надёжным.");
        let user = 2;

        let reply = orch.start_flow(user, "counterparty_check").unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("ИНН")));

        // Invalid tax id stays on the same step
        let reply = orch.handle(user, user, Event::Text("12")).await.unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("10 или 12")));

        // Valid tax id runs the prompt and finishes the flow
        let reply = orch
            .handle(user, user, Event::Text("7707083893"))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Text("Контрагент выглядит надёжным.".to_string()));

        let record = orch.sessions().get_or_create(user);
        assert!(record.flow.is_none());
        assert_eq!(record.temporary.last_inn.as_deref(), Some("7707083893"));
        assert_eq!(record.history["inn_checks"].len(), 1);

        // The check produced a semantic fact alongside the episodic turn
        let stats = orch.memory().stats(user).unwrap();
        assert_eq!(stats.semantic, 1);
        let semantic = orch
            .memory()
            .get_recent(user, MemoryScope::Semantic, 1)
            .unwrap();
        assert!(semantic[0].content.contains("7707083893"));
    }

    #[tokio::test]
    async fn test_contract_flow_with_document() {
        let orch = orchestrator("| Пункт | Риск | Рекомендация |");
        let user = 3;

        orch.start_flow(user, "contract_review").unwrap();

        let reply = orch
            .handle(
                user,
                user,
                Event::Document {
                    file_name: "dogovor.pdf",
                    file_size: 10_000,
                    text: "Договор поставки ...",
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("сторону")));

        let reply = orch
            .handle(user, user, Event::Text("поставщик"))
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("Риск")));

        let record = orch.sessions().get_or_create(user);
        assert!(record.flow.is_none());
        assert_eq!(record.statistics.total_documents, 1);
    }

    #[tokio::test]
    async fn test_document_outside_flow_goes_to_scratch() {
        let orch = orchestrator("ok");
        let user = 4;

        let reply = orch
            .handle(
                user,
                user,
                Event::Document {
                    file_name: "act.docx",
                    file_size: 500,
                    text: "Акт выполненных работ",
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("act.docx")));

        let record = orch.sessions().get_or_create(user);
        assert_eq!(
            record.temporary.current_document.as_deref(),
            Some("Акт выполненных работ")
        );
    }

    #[tokio::test]
    async fn test_callback_back_home() {
        let orch = orchestrator("ok");
        let user = 5;

        let token = orch
            .tickets()
            .mint("ui.back_home", Params::new())
            .await
            .unwrap();

        let reply = orch
            .handle(user, user, Event::Callback { token: &token })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Menu {
                section: "home".to_string()
            }
        );
        assert_eq!(orch.sessions().get_or_create(user).menu_history.len(), 1);

        // Replay answers with the expired-button message, not the menu
        let reply = orch
            .handle(user, user, Event::Callback { token: &token })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("устарела")));
    }

    #[tokio::test]
    async fn test_callback_back_uses_menu_history() {
        let orch = orchestrator("ok");
        let user = 8;

        orch.sessions().add_to_menu_history(user, "contracts");
        orch.sessions().add_to_menu_history(user, "kyc");

        let token = orch.tickets().mint("ui.back", Params::new()).await.unwrap();
        let reply = orch
            .handle(user, user, Event::Callback { token: &token })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Menu {
                section: "contracts".to_string()
            }
        );
        // "back" itself never lands in the history
        assert_eq!(orch.sessions().get_or_create(user).menu_history.len(), 2);
    }

    #[tokio::test]
    async fn test_callback_clear_session() {
        let orch = orchestrator("ok");
        let user = 6;

        orch.start_flow(user, "legal_opinion").unwrap();
        let token = orch
            .tickets()
            .mint("session.clear", Params::new())
            .await
            .unwrap();

        let reply = orch
            .handle(user, user, Event::Callback { token: &token })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("очищена")));
        assert!(orch.sessions().get_or_create(user).flow.is_none());
    }

    #[tokio::test]
    async fn test_nazad_steps_back_inside_flow() {
        let orch = orchestrator("готово");
        let user = 9;

        orch.start_flow(user, "contract_review").unwrap();
        orch.handle(
            user,
            user,
            Event::Document {
                file_name: "dogovor.docx",
                file_size: 1000,
                text: "Договор",
            },
        )
        .await
        .unwrap();

        let reply = orch.handle(user, user, Event::Text("назад")).await.unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("файл")));
        assert_eq!(
            orch.sessions().get_or_create(user).step.as_deref(),
            Some("awaiting_file")
        );

        // Outside a flow the same word is just a question for the model
        let reply = orch.handle(10, 10, Event::Text("назад")).await.unwrap();
        assert_eq!(reply, Reply::Text("готово".to_string()));
    }

    #[tokio::test]
    async fn test_request_input_routes_answer_back() {
        let orch = orchestrator("Контрагент проверен.");
        let user = 11;

        // Button pressed with no tax id in sight: the action asks for one
        let token = orch
            .tickets()
            .mint("kyc.full_scoring", Params::new())
            .await
            .unwrap();
        let reply = orch
            .handle(user, user, Event::Callback { token: &token })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("ИНН")));

        // A bad answer is re-asked, not sent to the model
        let reply = orch.handle(user, user, Event::Text("пятьдесят")).await.unwrap();
        assert!(matches!(reply, Reply::Text(t) if t.contains("10 или 12")));

        // A valid answer runs the scoring prompt
        let reply = orch
            .handle(user, user, Event::Text("7707 083893"))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Text("Контрагент проверен.".to_string()));

        let record = orch.sessions().get_or_create(user);
        assert_eq!(record.temporary.last_inn.as_deref(), Some("7707083893"));
        assert!(record.temporary.pending_actions.is_empty());
        assert_eq!(record.statistics.total_inn_checks, 1);
    }

    #[tokio::test]
    async fn test_model_failure_does_not_strand_flow() {
        let orch = orchestrator_with_model(Arc::new(FailingModel));
        let user = 7;

        orch.start_flow(user, "counterparty_check").unwrap();
        let result = orch.handle(user, user, Event::Text("7707083893")).await;
        assert!(result.is_err());

        // The flow was closed; the next message is handled as free text
        assert!(orch.sessions().get_or_create(user).flow.is_none());
    }
}
