use uuid::Uuid;

use crate::error::Error;

/// Prefix of inline-button callback payloads: `response:<request_id>:<index>`.
const CALLBACK_PREFIX: &str = "response";

/// Parsed callback payload from an inline keyboard button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackReply {
    pub request_id: Uuid,
    pub option_index: usize,
}

/// Build inline keyboard button data for a choice prompt.
///
/// Returns `(label, callback_data)` pairs, one per option, in option order.
pub fn option_buttons(request_id: Uuid, options: &[String]) -> Vec<(String, String)> {
    options
        .iter()
        .enumerate()
        .map(|(index, label)| {
            (
                label.clone(),
                format!("{CALLBACK_PREFIX}:{request_id}:{index}"),
            )
        })
        .collect()
}

/// Parse a callback_data string into a `CallbackReply`.
pub fn parse_callback_data(data: &str) -> Result<CallbackReply, Error> {
    let parts: Vec<&str> = data.splitn(3, ':').collect();
    if parts.len() != 3 || parts[0] != CALLBACK_PREFIX {
        return Err(Error::Transport(format!("unknown callback payload: {data}")));
    }
    let request_id = Uuid::parse_str(parts[1])
        .map_err(|e| Error::Transport(format!("invalid request id in callback: {e}")))?;
    let option_index = parts[2]
        .parse()
        .map_err(|e| Error::Transport(format!("invalid option index in callback: {e}")))?;
    Ok(CallbackReply {
        request_id,
        option_index,
    })
}
