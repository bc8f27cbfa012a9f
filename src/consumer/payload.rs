use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One inbound message for one thread, as published by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessagePayload {
    pub bot_id: String,
    pub user_id: String,
    pub thread_id: String,
    pub platform: String,
    pub channel_id: String,
    pub message_id: String,
    pub message_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(default)]
    pub platform_metadata: Map<String, Value>,
    #[serde(default)]
    pub claude_options: Map<String, Value>,
}

impl ThreadMessagePayload {
    /// Session the sender asked to continue, if any: `agentSessionId`, then
    /// `claudeOptions.resumeSessionId`. Blank values count as absent.
    pub fn session_hint(&self) -> Option<&str> {
        let from_options = || {
            self.claude_options
                .get("resumeSessionId")
                .and_then(Value::as_str)
        };
        self.agent_session_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| from_options().filter(|s| !s.trim().is_empty()))
    }
}

/// Whether `payload` belongs to the thread owned by `owner_user_id`.
/// User ids compare case-insensitively.
pub fn accepts(payload: &ThreadMessagePayload, owner_user_id: &str) -> bool {
    payload.user_id.to_lowercase() == owner_user_id.to_lowercase()
}

/// A payload accepted into the pending buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub payload: ThreadMessagePayload,
    /// Acceptance time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl QueuedMessage {
    pub const fn new(payload: ThreadMessagePayload, timestamp: i64) -> Self {
        Self { payload, timestamp }
    }

    /// Stamp `payload` with the current time.
    pub fn now(payload: ThreadMessagePayload) -> Self {
        Self::new(payload, chrono::Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
pub(crate) fn test_payload(user_id: &str, thread_id: &str, text: &str) -> ThreadMessagePayload {
    ThreadMessagePayload {
        bot_id: "B1".into(),
        user_id: user_id.into(),
        thread_id: thread_id.into(),
        platform: "slack".into(),
        channel_id: "C1".into(),
        message_id: format!("msg-{text}"),
        message_text: text.into(),
        agent_session_id: None,
        platform_metadata: Map::new(),
        claude_options: Map::new(),
    }
}
