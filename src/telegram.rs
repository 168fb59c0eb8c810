//! Telegram transport
//!
//! Thin adapter between teloxide updates and the orchestrator. Inline buttons
//! never carry action parameters directly: each button is minted a one-time
//! ticket token and the callback payload is just `a:<token>`, which keeps every
//! payload far under Telegram's 64-byte callback_data limit.
//!
//! Uses the explicit Dispatcher pattern for reliable long polling.

use std::sync::Arc;
use teloxide::{
    dispatching::UpdateFilterExt,
    dptree,
    error_handlers::LoggingErrorHandler,
    net::Download,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup},
};
use tracing::{info, warn};

use crate::actions::Params;
use crate::flows::MAX_FILE_BYTES;
use crate::memory::MemoryScope;
use crate::orchestrator::{Event, Orchestrator, Reply};
use crate::tickets::TicketStore;

/// Callback payload prefix for ticket tokens
const CALLBACK_PREFIX: &str = "a:";

/// Telegram caps messages at 4096 chars
const MAX_MESSAGE_LEN: usize = 4096;

struct BotData {
    orchestrator: Orchestrator,
}

/// Mint a ticket for an action and wrap it into an inline button
async fn link(
    tickets: &TicketStore,
    label: &str,
    action: &str,
    params: Params,
) -> anyhow::Result<InlineKeyboardButton> {
    let token = tickets.mint(action, params).await?;
    Ok(InlineKeyboardButton::callback(
        label.to_string(),
        format!("{}{}", CALLBACK_PREFIX, token),
    ))
}

/// Home menu keyboard. Buttons are minted fresh on every render, so a stale
/// menu's buttons simply expire instead of replaying old parameters.
async fn home_keyboard(tickets: &TicketStore) -> anyhow::Result<InlineKeyboardMarkup> {
    let rows = vec![
        vec![link(tickets, "📄 Проверить договор", "contracts.risks_table", Params::new()).await?],
        vec![link(tickets, "✏️ Предложить правки", "contracts.suggest_edits", Params::new()).await?],
        vec![link(tickets, "🔎 Проверить контрагента", "kyc.full_scoring", Params::new()).await?],
        vec![link(tickets, "⚖️ Юридическое заключение", "utils.legal_opinion", Params::new()).await?],
        vec![link(tickets, "🧹 Очистить сессию", "session.clear", Params::new()).await?],
    ];
    Ok(InlineKeyboardMarkup::new(rows))
}

async fn send_reply(bot: &Bot, chat_id: ChatId, data: &BotData, reply: Reply) -> ResponseResult<()> {
    match reply {
        Reply::Text(text) => {
            send_long_message(bot, chat_id, &text).await?;
        }
        Reply::Menu { .. } => {
            match home_keyboard(data.orchestrator.tickets()).await {
                Ok(keyboard) => {
                    bot.send_message(chat_id, "Чем могу помочь?")
                        .reply_markup(keyboard)
                        .await?;
                }
                Err(e) => {
                    warn!("Failed to build menu keyboard: {}", e);
                    bot.send_message(chat_id, "⚠️ Не получилось открыть меню, попробуйте ещё раз.")
                        .await?;
                }
            }
        }
    }
    Ok(())
}

/// Split oversized replies on line boundaries where possible
async fn send_long_message(bot: &Bot, chat_id: ChatId, text: &str) -> ResponseResult<()> {
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest
            .char_indices()
            .take_while(|(i, _)| *i < MAX_MESSAGE_LEN)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(rest.len());
        if end < rest.len() {
            if let Some(nl) = rest[..end].rfind('\n') {
                if nl > 0 {
                    end = nl;
                }
            }
        }
        bot.send_message(chat_id, &rest[..end]).await?;
        rest = rest[end..].trim_start_matches('\n');
    }
    Ok(())
}

async fn message_handler(bot: Bot, msg: Message, data: Arc<BotData>) -> ResponseResult<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let chat_id = msg.chat.id;
    let orch = &data.orchestrator;

    if let Some(doc) = msg.document() {
        let file_name = doc
            .file_name
            .clone()
            .unwrap_or_else(|| "document".to_string());
        let file_size = doc.file.size as u64;

        let text = if file_size <= MAX_FILE_BYTES {
            match download_document_text(&bot, &doc.file.id).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to download document from user {}: {}", user_id, e);
                    String::new()
                }
            }
        } else {
            String::new()
        };

        let event = Event::Document {
            file_name: &file_name,
            file_size,
            text: &text,
        };
        match orch.handle(user_id, chat_id.0, event).await {
            Ok(reply) => send_reply(&bot, chat_id, &data, reply).await?,
            Err(e) => {
                warn!("Document handling failed for user {}: {}", user_id, e);
                bot.send_message(chat_id, FAILURE_TEXT).await?;
            }
        }
        return Ok(());
    }

    let text = match msg.text() {
        Some(t) => t.trim(),
        None => return Ok(()),
    };
    if text.is_empty() {
        return Ok(());
    }

    if let Some(command) = text.strip_prefix('/') {
        return command_handler(&bot, chat_id, user_id, command, &data).await;
    }

    match orch.handle(user_id, chat_id.0, Event::Text(text)).await {
        Ok(reply) => send_reply(&bot, chat_id, &data, reply).await?,
        Err(e) => {
            warn!("Message handling failed for user {}: {}", user_id, e);
            bot.send_message(chat_id, FAILURE_TEXT).await?;
        }
    }
    Ok(())
}

const FAILURE_TEXT: &str = "⚠️ Что-то пошло не так. Попробуйте ещё раз чуть позже.";

async fn command_handler(
    bot: &Bot,
    chat_id: ChatId,
    user_id: i64,
    command: &str,
    data: &Arc<BotData>,
) -> ResponseResult<()> {
    let orch = &data.orchestrator;
    let command = command
        .split_whitespace()
        .next()
        .unwrap_or("")
        .split('@')
        .next()
        .unwrap_or("");

    match command {
        "start" => {
            orch.sessions().touch(user_id);
            let greeting = "👋 Я юридический ассистент для малого бизнеса.\n\
                 Могу проверить договор, оценить контрагента по ИНН или \
                 подготовить юридическое заключение. Выберите действие или просто задайте вопрос.";
            match home_keyboard(orch.tickets()).await {
                Ok(keyboard) => {
                    bot.send_message(chat_id, greeting)
                        .reply_markup(keyboard)
                        .await?;
                }
                Err(e) => {
                    warn!("Failed to build start keyboard: {}", e);
                    bot.send_message(chat_id, greeting).await?;
                }
            }
        }
        "reset" => {
            orch.sessions().clear_session(user_id);
            bot.send_message(chat_id, "🧹 Сессия очищена. История и настройки сохранены.")
                .await?;
        }
        "stats" => {
            let record = orch.sessions().get_or_create(user_id);
            let memory = orch
                .memory()
                .stats(user_id)
                .map(|s| s.total())
                .unwrap_or(0);
            let text = format!(
                "📊 Ваша статистика\n\
                 Вопросов: {}\nДокументов: {}\nПроверок ИНН: {}\nСессий: {}\n\
                 Записей в памяти: {}",
                record.statistics.total_queries,
                record.statistics.total_documents,
                record.statistics.total_inn_checks,
                record.statistics.session_count,
                memory,
            );
            bot.send_message(chat_id, text).await?;
        }
        "export" => {
            let export = orch.sessions().export_user_data(user_id);
            let pretty = serde_json::to_string_pretty(&export)
                .unwrap_or_else(|_| export.to_string());
            send_long_message(bot, chat_id, &pretty).await?;
        }
        "forget_me" => {
            let chunks = orch.memory().delete_user(user_id).unwrap_or(0);
            orch.sessions().delete_user_data(user_id);
            info!("Forget-me request from user {}: {} chunks removed", user_id, chunks);
            bot.send_message(
                chat_id,
                "🗑 Все ваши данные удалены: сессия, история и память ассистента.",
            )
            .await?;
        }
        "memory" => {
            let recent = orch
                .memory()
                .get_recent(user_id, MemoryScope::Semantic, 5)
                .unwrap_or_default();
            if recent.is_empty() {
                bot.send_message(chat_id, "Пока я ничего о вас не запомнил.")
                    .await?;
            } else {
                let lines: Vec<String> =
                    recent.iter().map(|c| format!("• {}", c.content)).collect();
                send_long_message(
                    bot,
                    chat_id,
                    &format!("🧠 Что я помню:\n{}", lines.join("\n")),
                )
                .await?;
            }
        }
        _ => {
            bot.send_message(chat_id, "Неизвестная команда. Доступно: /start /reset /stats /export /memory /forget_me")
                .await?;
        }
    }
    Ok(())
}

async fn callback_handler(bot: Bot, query: CallbackQuery, data: Arc<BotData>) -> ResponseResult<()> {
    let user_id = query.from.id.0 as i64;
    let chat_id = query.message.as_ref().map(|m| m.chat().id);

    // Acknowledge first so the button stops spinning even on a slow action
    bot.answer_callback_query(&query.id).await?;

    let token = match query.data.as_deref().and_then(|d| d.strip_prefix(CALLBACK_PREFIX)) {
        Some(token) => token.to_string(),
        None => return Ok(()),
    };

    let chat_id = match chat_id {
        Some(id) => id,
        None => return Ok(()),
    };

    match data
        .orchestrator
        .handle(user_id, chat_id.0, Event::Callback { token: &token })
        .await
    {
        Ok(reply) => send_reply(&bot, chat_id, &data, reply).await?,
        Err(e) => {
            warn!("Callback handling failed for user {}: {}", user_id, e);
            bot.send_message(chat_id, FAILURE_TEXT).await?;
        }
    }
    Ok(())
}

async fn download_document_text(bot: &Bot, file_id: &str) -> anyhow::Result<String> {
    let file = bot.get_file(file_id).await?;
    let mut buf: Vec<u8> = Vec::new();
    bot.download_file(&file.path, &mut buf).await?;
    // Binary formats degrade to lossy text; good enough for prompt input
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Run the bot with long polling until interrupted
pub async fn run_bot(token: &str, orchestrator: Orchestrator) -> anyhow::Result<()> {
    let bot = Bot::new(token);

    match bot.get_me().await {
        Ok(me) => info!(
            "Bot authenticated: @{}",
            me.username.as_deref().unwrap_or("unknown")
        ),
        Err(e) => anyhow::bail!("Bot authentication failed: {}", e),
    }

    if let Err(e) = bot.delete_webhook().await {
        warn!("Failed to delete webhook: {} (continuing anyway)", e);
    }

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(message_handler))
        .branch(Update::filter_callback_query().endpoint(callback_handler));

    let data = Arc::new(BotData { orchestrator });

    info!("Starting dispatcher with long polling...");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![data])
        .default_handler(|upd| async move {
            tracing::debug!("Unhandled update: {:?}", upd);
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Error in update handler",
        ))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
