use std::sync::Arc;

use teloxide::prelude::*;

use super::keyboard::parse_callback_data;
use super::outbound::{TelegramTransport, extract_request_id};
use crate::coordinator::{Coordinator, ReplyOutcome};
use crate::directory::SessionDirectory;
use crate::error::Error;
use crate::transport::ChatTransport;
use crate::types::{HitlRequest, ReplySelection, Session};

/// Text sent to a human whose reply targets an unknown or settled request.
const STALE_REPLY_TEXT: &str = "This request is no longer accepting responses.";

/// Text sent to a human whose selection could not be parsed or resolved.
const INVALID_REPLY_TEXT: &str = "Sorry, that selection could not be processed.";

/// Telegram ingress: long-polls for updates, parses replies and callback
/// selections, and hands `(request_id, selection)` pairs to the coordinator.
/// The adapter never mutates request state itself; acknowledgments go out
/// through the shared transport.
pub struct TelegramAdapter {
    bot: Bot,
    transport: Arc<TelegramTransport>,
    coordinator: Arc<Coordinator>,
    directory: Arc<SessionDirectory>,
}

impl TelegramAdapter {
    pub fn new(
        bot: Bot,
        transport: Arc<TelegramTransport>,
        coordinator: Arc<Coordinator>,
        directory: Arc<SessionDirectory>,
    ) -> Self {
        Self {
            bot,
            transport,
            coordinator,
            directory,
        }
    }

    /// Start the bot with long polling. Blocks until the dispatcher stops.
    pub async fn run(self: Arc<Self>) {
        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handle_message))
            .branch(Update::filter_callback_query().endpoint(handle_callback));

        let bot = self.bot.clone();

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![self])
            .default_handler(|_upd| async {})
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }

    /// Handle an incoming text message: a command, a free-text reply quoting
    /// a prompt, or noise to ignore.
    async fn handle_text(
        &self,
        chat_id: i64,
        text: &str,
        quoted: Option<&str>,
    ) -> Result<(), Error> {
        if let Some(command) = text.strip_prefix('/') {
            return self.handle_command(chat_id, command).await;
        }

        // A free-text reply correlates through the token in the quoted prompt.
        let Some(quoted) = quoted else {
            tracing::debug!(chat_id, "ignoring message without a quoted prompt");
            return Ok(());
        };
        let Some(request_id) = extract_request_id(quoted) else {
            tracing::debug!(chat_id, "quoted message carries no correlation token");
            return Ok(());
        };

        let outcome = self
            .coordinator
            .deliver_reply(request_id, ReplySelection::FreeText(text.to_string()))?;
        self.acknowledge_outcome(chat_id, &outcome).await;
        Ok(())
    }

    /// Handle an inline keyboard press carrying a `response:<id>:<idx>`
    /// payload. Malformed payloads are dropped, logged, and acknowledged to
    /// the human.
    async fn handle_selection(&self, chat_id: i64, data: &str) -> Result<(), Error> {
        let reply = match parse_callback_data(data) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(chat_id, data, error = %e, "malformed callback payload dropped");
                self.transport.acknowledge(chat_id, INVALID_REPLY_TEXT).await;
                return Ok(());
            }
        };
        let outcome = self.coordinator.deliver_reply(
            reply.request_id,
            ReplySelection::Choice {
                option_index: reply.option_index,
            },
        )?;
        self.acknowledge_outcome(chat_id, &outcome).await;
        Ok(())
    }

    /// Read-only commands; they never mutate state.
    async fn handle_command(&self, chat_id: i64, command: &str) -> Result<(), Error> {
        match command.trim() {
            "status" => {
                let sessions = self.directory.active_sessions()?;
                let text = format_status_reply(&sessions, chat_id);
                self.send(chat_id, &text).await;
            }
            "pending" => {
                let pending = self.coordinator.list_pending()?;
                let text = format_pending_reply(&pending);
                self.send(chat_id, &text).await;
            }
            other => {
                tracing::debug!(chat_id, command = other, "ignoring unknown command");
            }
        }
        Ok(())
    }

    async fn acknowledge_outcome(&self, chat_id: i64, outcome: &ReplyOutcome) {
        match outcome {
            ReplyOutcome::Recorded { response, approved } => {
                let marker = if *approved { "✅" } else { "🚫" };
                self.transport
                    .acknowledge(chat_id, &format!("{marker} Recorded: {response}"))
                    .await;
            }
            ReplyOutcome::Stale => {
                self.transport.acknowledge(chat_id, STALE_REPLY_TEXT).await;
            }
            ReplyOutcome::Invalid => {
                self.transport.acknowledge(chat_id, INVALID_REPLY_TEXT).await;
            }
        }
    }

    async fn send(&self, chat_id: i64, text: &str) {
        self.transport.acknowledge(chat_id, text).await;
    }
}

/// Render the `/status` reply: active sessions bound to this chat.
fn format_status_reply(sessions: &[Session], chat_id: i64) -> String {
    let bound: Vec<&Session> = sessions
        .iter()
        .filter(|s| s.human_address == chat_id)
        .collect();
    if bound.is_empty() {
        return "No active session is bound to this chat.".to_string();
    }
    let mut text = String::from("Active sessions for this chat:");
    for session in bound {
        text.push_str(&format!(
            "\n• {} (client {})",
            session.session_id, session.client_id
        ));
    }
    text
}

/// Render the `/pending` reply: pending request count and identifiers.
fn format_pending_reply(pending: &[HitlRequest]) -> String {
    if pending.is_empty() {
        return "No pending requests.".to_string();
    }
    let mut text = format!("{} pending request(s):", pending.len());
    for request in pending {
        text.push_str(&format!("\n• {}: {}", request.id, request.message));
    }
    text
}

/// Teloxide handler for incoming messages.
async fn handle_message(
    msg: Message,
    adapter: Arc<TelegramAdapter>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let text = match msg.text() {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(()),
    };
    let quoted = msg.reply_to_message().and_then(|m| m.text());

    if let Err(e) = adapter.handle_text(msg.chat.id.0, text, quoted).await {
        tracing::error!(
            chat_id = msg.chat.id.0,
            error = %e,
            "telegram message handler error"
        );
    }
    Ok(())
}

/// Teloxide handler for callback queries (inline keyboard presses).
async fn handle_callback(
    q: CallbackQuery,
    adapter: Arc<TelegramAdapter>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(data) = &q.data {
        let chat_id = q.message.as_ref().map(|m| m.chat().id.0).unwrap_or_default();
        tracing::debug!(chat_id, data, "telegram callback query received");

        if let Err(e) = adapter.handle_selection(chat_id, data).await {
            tracing::warn!(chat_id, data, error = %e, "callback resolution failed");
        }

        // Answer the callback to dismiss the loading indicator.
        let _ = adapter.bot.answer_callback_query(q.id.clone()).await;
    }
    Ok(())
}
