use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State machine for the HITL request lifecycle. All non-pending states are
/// terminal and absorbing; attributes are frozen after the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
    Timeout,
    Canceled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// A request from an automated agent for a human decision or input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlRequest {
    pub id: Uuid,
    pub session_id: String,
    pub client_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timeout_seconds: u64,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub approved: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    /// Handle to the chat message that carried the prompt, once delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_message_id: Option<i32>,
}

impl HitlRequest {
    /// Create a new pending request with defaults applied.
    pub fn new(
        id: Uuid,
        session_id: impl Into<String>,
        client_id: impl Into<String>,
        message: impl Into<String>,
        options: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            id,
            session_id: session_id.into(),
            client_id: client_id.into(),
            message: message.into(),
            options,
            metadata,
            timeout_seconds,
            status: RequestStatus::Pending,
            response: None,
            approved: false,
            created_at: Utc::now(),
            responded_at: None,
            transport_message_id: None,
        }
    }

    /// The moment this request's timeout fires if no reply arrives.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.timeout_seconds as i64)
    }
}

/// A persistent binding between an agent and a human recipient on the chat
/// transport. Deactivation tombstones the record rather than deleting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub client_id: String,
    pub human_address: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Create a new active session binding.
    pub fn new(
        session_id: impl Into<String>,
        client_id: impl Into<String>,
        human_address: i64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            client_id: client_id.into(),
            human_address,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// A human's reply as parsed by the chat transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplySelection {
    /// An inline-button selection carrying the option index; the option text
    /// is resolved against the stored request.
    Choice { option_index: usize },
    /// A plain reply to the prompt message.
    FreeText(String),
}
