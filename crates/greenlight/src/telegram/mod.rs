mod adapter;
mod keyboard;
mod outbound;

pub use adapter::TelegramAdapter;
pub use keyboard::{CallbackReply, option_buttons, parse_callback_data};
pub use outbound::{TelegramTransport, extract_request_id, format_prompt};
