//! Conversation flows
//!
//! One table of flow definitions shared by every entry point: ordered steps,
//! the input each step awaits, and its validator. Validation failure re-enters
//! the same step with an error message attached; the flow never resets to the
//! start because of bad input.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::session::SessionManager;

/// Upload limit for documents
pub const MAX_FILE_BYTES: u64 = 15 * 1024 * 1024;

const ALLOWED_EXTENSIONS: [&str; 2] = ["docx", "pdf"];

/// A selectable option: stored value plus the label users may type
#[derive(Debug, Clone, Copy)]
pub struct ChoiceOption {
    pub value: &'static str,
    pub label: &'static str,
}

/// What a step expects from the user
#[derive(Debug, Clone, Copy)]
pub enum InputKind {
    /// A .docx/.pdf upload within the size limit
    Document,
    /// A 10- or 12-digit tax id (ИНН)
    TaxId,
    /// Free text within length bounds
    Text { min: usize, max: usize },
    /// One of a fixed set of options
    Choice(&'static [ChoiceOption]),
}

/// One step of a flow. `input: None` marks a processing step: the flow is
/// ready for the model once the preceding step is filled.
#[derive(Debug)]
pub struct StepDef {
    pub name: &'static str,
    /// Key the collected value is stored under in flow data
    pub data_key: &'static str,
    /// Message shown when this step is entered
    pub prompt: &'static str,
    pub input: Option<InputKind>,
}

#[derive(Debug)]
pub struct FlowDef {
    pub name: &'static str,
    /// Prompt run when the flow reaches its processing step
    pub prompt_id: &'static str,
    pub steps: &'static [StepDef],
}

const CONTRACT_SIDES: [ChoiceOption; 2] = [
    ChoiceOption {
        value: "customer",
        label: "заказчик",
    },
    ChoiceOption {
        value: "supplier",
        label: "поставщик",
    },
];

/// All flows the bot knows. Every entry point reads this table; there is no
/// second copy of any state list.
pub static FLOWS: &[FlowDef] = &[
    FlowDef {
        name: "contract_review",
        prompt_id: "contract_risks",
        steps: &[
            StepDef {
                name: "awaiting_file",
                data_key: "file",
                prompt: "📄 Пришлите файл договора (.docx или .pdf, до 15 МБ).",
                input: Some(InputKind::Document),
            },
            StepDef {
                name: "awaiting_side",
                data_key: "side",
                prompt: "Чью сторону вы представляете — заказчик или поставщик?",
                input: Some(InputKind::Choice(&CONTRACT_SIDES)),
            },
            StepDef {
                name: "processing",
                data_key: "",
                prompt: "🔍 Анализирую договор, это займёт меньше минуты...",
                input: None,
            },
        ],
    },
    FlowDef {
        name: "counterparty_check",
        prompt_id: "counterparty_scoring",
        steps: &[
            StepDef {
                name: "awaiting_inn",
                data_key: "inn",
                prompt: "🔎 Введите ИНН контрагента (10 или 12 цифр).",
                input: Some(InputKind::TaxId),
            },
            StepDef {
                name: "processing",
                data_key: "",
                prompt: "🔍 Проверяю контрагента...",
                input: None,
            },
        ],
    },
    FlowDef {
        name: "legal_opinion",
        prompt_id: "legal_opinion",
        steps: &[
            StepDef {
                name: "awaiting_topic",
                data_key: "topic",
                prompt: "⚖️ Опишите тему заключения (от 10 символов).",
                input: Some(InputKind::Text { min: 10, max: 2000 }),
            },
            StepDef {
                name: "awaiting_facts",
                data_key: "facts",
                prompt: "Изложите фактические обстоятельства.",
                input: Some(InputKind::Text { min: 10, max: 4000 }),
            },
            StepDef {
                name: "processing",
                data_key: "",
                prompt: "⚖️ Готовлю заключение...",
                input: None,
            },
        ],
    },
];

/// Look up a flow by name
pub fn definition(name: &str) -> Option<&'static FlowDef> {
    FLOWS.iter().find(|f| f.name == name)
}

/// User input as seen by the FSM
#[derive(Debug, Clone)]
pub enum UserInput<'a> {
    Text(&'a str),
    Document { file_name: &'a str, file_size: u64 },
}

/// Result of feeding input into the active flow
#[derive(Debug)]
pub enum Transition {
    /// No flow is active; treat the input as free-form
    NoFlow,
    /// Input rejected; same step re-entered with an error to show
    Stay { step: &'static str, error: String },
    /// Input accepted; the flow moved to the given step
    Advanced { step: &'static StepDef },
    /// All inputs collected; run the flow's prompt with this data
    ReadyToProcess {
        flow: &'static FlowDef,
        data: serde_json::Map<String, Value>,
    },
}

/// Drives flow state stored in the session manager
pub struct FlowEngine {
    sessions: Arc<SessionManager>,
}

impl FlowEngine {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Start a flow and return its first step (for its prompt).
    /// `None` if the flow name is unknown.
    pub fn start(&self, user_id: i64, flow_name: &str) -> Option<&'static StepDef> {
        let flow = definition(flow_name)?;
        let first = flow.steps.first()?;

        self.sessions
            .start_flow(user_id, flow_name, serde_json::Map::new());
        self.sessions
            .next_step(user_id, first.name, serde_json::Map::new());
        Some(first)
    }

    /// Step back to the previous input step, staying at the first step when
    /// there is nothing earlier. Collected values are kept; re-entering a
    /// step overwrites its value. `None` when no flow is active.
    pub fn prev_step(&self, user_id: i64) -> Option<&'static StepDef> {
        let record = self.sessions.get_or_create(user_id);
        let flow = definition(record.flow.as_deref()?)?;

        let step_idx = record
            .step
            .as_deref()
            .and_then(|name| flow.steps.iter().position(|s| s.name == name))
            .unwrap_or(0);
        let target = &flow.steps[step_idx.saturating_sub(1)];

        self.sessions
            .next_step(user_id, target.name, serde_json::Map::new());
        Some(target)
    }

    /// Validate input against the current step and advance on success
    pub fn transition(&self, user_id: i64, input: &UserInput<'_>) -> Transition {
        let record = self.sessions.get_or_create(user_id);

        let flow_name = match record.flow.as_deref() {
            Some(name) => name,
            None => return Transition::NoFlow,
        };
        let flow = match definition(flow_name) {
            Some(flow) => flow,
            None => {
                // A flow name with no definition is a programming error;
                // recover by dropping the broken flow.
                tracing::error!("Undefined flow '{}' in session of user {}", flow_name, user_id);
                self.sessions.complete_flow(user_id, Value::Null);
                return Transition::NoFlow;
            }
        };

        let step_idx = record
            .step
            .as_deref()
            .and_then(|name| flow.steps.iter().position(|s| s.name == name))
            .unwrap_or(0);
        let step = &flow.steps[step_idx];

        let kind = match step.input {
            Some(kind) => kind,
            None => {
                return Transition::Stay {
                    step: step.name,
                    error: "⏳ Подождите, предыдущий запрос ещё обрабатывается.".to_string(),
                }
            }
        };

        let value = match validate(kind, input) {
            Ok(value) => value,
            Err(error) => {
                debug!(
                    "User {} input rejected at {}/{}: {}",
                    user_id, flow.name, step.name, error
                );
                return Transition::Stay {
                    step: step.name,
                    error,
                };
            }
        };

        let mut step_data = serde_json::Map::new();
        step_data.insert(step.data_key.to_string(), value);

        let next = &flow.steps[step_idx + 1];
        self.sessions.next_step(user_id, next.name, step_data);

        if next.input.is_none() {
            let data = self.sessions.get_or_create(user_id).flow_data;
            Transition::ReadyToProcess { flow, data }
        } else {
            Transition::Advanced { step: next }
        }
    }
}

fn validate(kind: InputKind, input: &UserInput<'_>) -> Result<Value, String> {
    match (kind, input) {
        (InputKind::Document, UserInput::Document { file_name, file_size }) => {
            validate_document(file_name, *file_size)
        }
        (InputKind::Document, UserInput::Text(_)) => {
            Err("Пришлите файл документом (.docx или .pdf).".to_string())
        }
        (InputKind::TaxId, UserInput::Text(text)) => validate_inn(text),
        (InputKind::Text { min, max }, UserInput::Text(text)) => validate_text(text, min, max),
        (InputKind::Choice(options), UserInput::Text(text)) => validate_choice(options, text),
        (_, UserInput::Document { .. }) => {
            Err("Сейчас ожидается текстовый ответ, а не файл.".to_string())
        }
    }
}

fn validate_document(file_name: &str, file_size: u64) -> Result<Value, String> {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_lowercase();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err("Поддерживаются только файлы .docx и .pdf.".to_string());
    }
    if file_size > MAX_FILE_BYTES {
        return Err("Размер файла не должен превышать 15 МБ.".to_string());
    }
    Ok(Value::String(file_name.to_string()))
}

/// Tax ids are 10 digits (companies) or 12 (individuals); everything else
/// in the input is stripped first so "7707 083893" passes.
pub fn validate_inn(text: &str) -> Result<Value, String> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 || digits.len() == 12 {
        Ok(Value::String(digits))
    } else {
        Err("ИНН должен содержать 10 или 12 цифр.".to_string())
    }
}

fn validate_text(text: &str, min: usize, max: usize) -> Result<Value, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("Текст не может быть пустым.".to_string());
    }
    let len = trimmed.chars().count();
    if len < min {
        return Err(format!("Минимальная длина текста: {} символов.", min));
    }
    if len > max {
        return Err(format!("Максимальная длина текста: {} символов.", max));
    }
    Ok(Value::String(trimmed.to_string()))
}

fn validate_choice(options: &[ChoiceOption], text: &str) -> Result<Value, String> {
    let normalized = text.trim().to_lowercase();
    for option in options {
        if normalized == option.value || normalized == option.label {
            return Ok(Value::String(option.value.to_string()));
        }
    }
    let labels: Vec<&str> = options.iter().map(|o| o.label).collect();
    Err(format!("Выберите один из вариантов: {}.", labels.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> (Arc<SessionManager>, FlowEngine) {
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(1800), 20, 10));
        let engine = FlowEngine::new(Arc::clone(&sessions));
        (sessions, engine)
    }

    #[test]
    fn test_flow_table_is_well_formed() {
        for flow in FLOWS {
            assert!(!flow.steps.is_empty(), "{} has no steps", flow.name);
            let last = flow.steps.last().unwrap();
            assert!(last.input.is_none(), "{} must end in a processing step", flow.name);
            for step in &flow.steps[..flow.steps.len() - 1] {
                assert!(step.input.is_some(), "{}/{} awaits nothing", flow.name, step.name);
                assert!(!step.data_key.is_empty());
            }
        }
    }

    #[test]
    fn test_contract_review_happy_path() {
        let (sessions, engine) = engine();
        let user = 1;

        let first = engine.start(user, "contract_review").unwrap();
        assert_eq!(first.name, "awaiting_file");

        let t = engine.transition(
            user,
            &UserInput::Document {
                file_name: "dogovor.docx",
                file_size: 120_000,
            },
        );
        match t {
            Transition::Advanced { step } => assert_eq!(step.name, "awaiting_side"),
            other => panic!("expected Advanced, got {:?}", other),
        }

        let t = engine.transition(user, &UserInput::Text("заказчик"));
        match t {
            Transition::ReadyToProcess { flow, data } => {
                assert_eq!(flow.prompt_id, "contract_risks");
                assert_eq!(data["file"], "dogovor.docx");
                assert_eq!(data["side"], "customer");
            }
            other => panic!("expected ReadyToProcess, got {:?}", other),
        }

        let record = sessions.get_or_create(user);
        assert_eq!(record.step.as_deref(), Some("processing"));
    }

    #[test]
    fn test_invalid_input_stays_and_reports() {
        let (sessions, engine) = engine();
        let user = 2;

        engine.start(user, "contract_review");

        // Wrong file type
        let t = engine.transition(
            user,
            &UserInput::Document {
                file_name: "scan.jpg",
                file_size: 1000,
            },
        );
        assert!(matches!(t, Transition::Stay { step: "awaiting_file", .. }));

        // Oversized file
        let t = engine.transition(
            user,
            &UserInput::Document {
                file_name: "big.pdf",
                file_size: MAX_FILE_BYTES + 1,
            },
        );
        assert!(matches!(t, Transition::Stay { step: "awaiting_file", .. }));

        // State did not advance or reset
        let record = sessions.get_or_create(user);
        assert_eq!(record.flow.as_deref(), Some("contract_review"));
        assert_eq!(record.step.as_deref(), Some("awaiting_file"));
    }

    #[test]
    fn test_inn_validation() {
        assert_eq!(validate_inn("7707083893").unwrap(), "7707083893");
        assert_eq!(validate_inn("  7707 083893 ").unwrap(), "7707083893");
        assert_eq!(validate_inn("500100732259").unwrap(), "500100732259");
        assert!(validate_inn("12345").is_err());
        assert!(validate_inn("no digits here").is_err());
    }

    #[test]
    fn test_counterparty_flow_rejects_bad_inn() {
        let (_, engine) = engine();
        let user = 3;

        engine.start(user, "counterparty_check");

        let t = engine.transition(user, &UserInput::Text("771"));
        assert!(matches!(t, Transition::Stay { step: "awaiting_inn", .. }));

        let t = engine.transition(user, &UserInput::Text("7707083893"));
        match t {
            Transition::ReadyToProcess { flow, data } => {
                assert_eq!(flow.name, "counterparty_check");
                assert_eq!(data["inn"], "7707083893");
            }
            other => panic!("expected ReadyToProcess, got {:?}", other),
        }
    }

    #[test]
    fn test_text_length_bounds() {
        let (_, engine) = engine();
        let user = 4;

        engine.start(user, "legal_opinion");

        let t = engine.transition(user, &UserInput::Text("коротко"));
        assert!(matches!(t, Transition::Stay { .. }));

        let t = engine.transition(user, &UserInput::Text("нужна оценка рисков аренды"));
        assert!(matches!(t, Transition::Advanced { .. }));
    }

    #[test]
    fn test_prev_step_goes_back_and_stops_at_first() {
        let (sessions, engine) = engine();
        let user = 6;

        assert!(engine.prev_step(user).is_none());

        engine.start(user, "contract_review");
        engine.transition(
            user,
            &UserInput::Document {
                file_name: "dogovor.docx",
                file_size: 1000,
            },
        );
        assert_eq!(
            sessions.get_or_create(user).step.as_deref(),
            Some("awaiting_side")
        );

        let step = engine.prev_step(user).unwrap();
        assert_eq!(step.name, "awaiting_file");

        // Already at the first step: stays there
        let step = engine.prev_step(user).unwrap();
        assert_eq!(step.name, "awaiting_file");

        // Collected values survive the step back
        let record = sessions.get_or_create(user);
        assert_eq!(record.flow_data["file"], "dogovor.docx");

        // Re-uploading replaces the file and advances again
        let t = engine.transition(
            user,
            &UserInput::Document {
                file_name: "novyi.pdf",
                file_size: 2000,
            },
        );
        assert!(matches!(t, Transition::Advanced { .. }));
        let record = sessions.get_or_create(user);
        assert_eq!(record.flow_data["file"], "novyi.pdf");
    }

    #[test]
    fn test_no_flow() {
        let (_, engine) = engine();
        let t = engine.transition(99, &UserInput::Text("привет"));
        assert!(matches!(t, Transition::NoFlow));
    }

    #[test]
    fn test_input_during_processing_waits() {
        let (sessions, engine) = engine();
        let user = 5;

        engine.start(user, "counterparty_check");
        engine.transition(user, &UserInput::Text("7707083893"));

        // Flow is at the processing step now; more input does not advance it
        let t = engine.transition(user, &UserInput::Text("ну что там?"));
        assert!(matches!(t, Transition::Stay { step: "processing", .. }));
        assert_eq!(
            sessions.get_or_create(user).step.as_deref(),
            Some("processing")
        );
    }
}
