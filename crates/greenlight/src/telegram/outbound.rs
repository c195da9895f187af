use std::future::Future;
use std::pin::Pin;

use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup};
use uuid::Uuid;

use super::keyboard::option_buttons;
use crate::error::Error;
use crate::transport::ChatTransport;
use crate::types::HitlRequest;

/// Label that precedes the correlation token in every prompt. Free-text
/// replies are matched back to their request by finding this label in the
/// quoted message.
const REQUEST_ID_LABEL: &str = "Request ID:";

/// Render the chat prompt for a request.
///
/// Carries the agent's message verbatim, the labeled request identifier (the
/// correlation token), and the session/client identifiers. Requests without
/// options instruct the human to reply to the message instead.
pub fn format_prompt(request: &HitlRequest) -> String {
    let mut text = format!(
        "🤖 {}\n\n{REQUEST_ID_LABEL} {}\nSession: {}\nClient: {}",
        request.message, request.id, request.session_id, request.client_id
    );
    if request.options.is_empty() {
        text.push_str("\n\nReply to this message with your response.");
    }
    text
}

/// Extract the correlation token from a quoted prompt message.
pub fn extract_request_id(text: &str) -> Option<Uuid> {
    let start = text.find(REQUEST_ID_LABEL)? + REQUEST_ID_LABEL.len();
    let token = text[start..].split_whitespace().next()?;
    Uuid::parse_str(token).ok()
}

/// Telegram egress: sends prompts with inline choice buttons and best-effort
/// acknowledgments.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl ChatTransport for TelegramTransport {
    fn send_prompt<'a>(
        &'a self,
        human_address: i64,
        request: &'a HitlRequest,
    ) -> Pin<Box<dyn Future<Output = Result<i32, Error>> + Send + 'a>> {
        Box::pin(async move {
            let text = format_prompt(request);
            let mut send = self.bot.send_message(ChatId(human_address), text);
            if !request.options.is_empty() {
                // One button per row, mirroring the option order.
                let rows: Vec<Vec<InlineKeyboardButton>> =
                    option_buttons(request.id, &request.options)
                        .into_iter()
                        .map(|(label, data)| vec![InlineKeyboardButton::callback(label, data)])
                        .collect();
                send = send.reply_markup(InlineKeyboardMarkup::new(rows));
            }
            let sent = send
                .await
                .map_err(|e| Error::Transport(format!("sendMessage failed: {e}")))?;
            Ok(sent.id.0)
        })
    }

    fn acknowledge<'a>(
        &'a self,
        human_address: i64,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = self.bot.send_message(ChatId(human_address), text).await {
                tracing::warn!(human_address, error = %e, "failed to send acknowledgment");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_request(options: Vec<String>) -> HitlRequest {
        HitlRequest::new(
            Uuid::new_v4(),
            "s1",
            "c1",
            "Deploy to production?",
            options,
            HashMap::new(),
            300,
        )
    }

    #[test]
    fn prompt_carries_message_and_identifiers() {
        let request = make_request(vec!["Deploy".into(), "Cancel".into()]);
        let prompt = format_prompt(&request);
        assert!(prompt.contains("Deploy to production?"));
        assert!(prompt.contains(&format!("Request ID: {}", request.id)));
        assert!(prompt.contains("Session: s1"));
        assert!(prompt.contains("Client: c1"));
        // Choice prompts carry buttons, not a reply instruction.
        assert!(!prompt.contains("Reply to this message"));
    }

    #[test]
    fn prompt_without_options_asks_for_reply() {
        let request = make_request(Vec::new());
        let prompt = format_prompt(&request);
        assert!(prompt.contains("Reply to this message with your response."));
    }

    #[test]
    fn extract_request_id_from_prompt() {
        let request = make_request(Vec::new());
        let prompt = format_prompt(&request);
        assert_eq!(extract_request_id(&prompt), Some(request.id));
    }

    #[test]
    fn extract_request_id_missing_label() {
        assert_eq!(extract_request_id("just some text"), None);
    }

    #[test]
    fn extract_request_id_malformed_token() {
        assert_eq!(extract_request_id("Request ID: not-a-uuid"), None);
    }

    #[test]
    fn extract_request_id_label_mid_text() {
        let id = Uuid::new_v4();
        let text = format!("🤖 Approve?\n\nRequest ID: {id}\nSession: s1");
        assert_eq!(extract_request_id(&text), Some(id));
    }
}
