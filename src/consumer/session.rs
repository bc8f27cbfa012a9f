//! Session continuity: one thread maps to one agent session for the life of
//! the consumer. The first batch picks the session, every later batch
//! resumes it.

use std::time::Duration;

use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::{Map, Value};

use super::payload::QueuedMessage;
use crate::config::PolicyConfig;

/// Separator between messages merged into one turn.
pub const MESSAGE_SEPARATOR: &str = "\n\n";

/// Option keys carried in dedicated `WorkerConfig` fields instead.
const SESSION_OPTION_KEYS: &[&str] = &["sessionId", "resumeSessionId"];

/// The thread's session, once chosen. Never cleared.
#[derive(Debug, Default, Clone)]
pub struct SessionState {
    current_session_id: Option<String>,
}

impl SessionState {
    pub fn current(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }
}

/// Process-level inputs to every `WorkerConfig`.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub deployment: String,
    pub policy: PolicyConfig,
}

/// Everything a processing unit needs to run one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Set only when this batch starts a brand-new session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Set when this batch continues an existing session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    pub user_id: String,
    pub channel_id: String,
    pub thread_id: String,
    pub platform: String,
    /// Latest message in the batch.
    pub message_id: String,
    pub deployment: String,
    /// Combined prompt text, base64.
    pub user_prompt: String,
    /// JSON object of agent options after policy overrides.
    pub claude_options: String,
    /// JSON object of the latest message's platform metadata.
    pub platform_metadata: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    pub message_count: usize,
}

impl WorkerConfig {
    /// The session this turn runs in, new or resumed.
    pub fn session_key(&self) -> &str {
        self.session_id
            .as_deref()
            .or(self.resume_session_id.as_deref())
            .unwrap_or_default()
    }

    pub const fn is_resume(&self) -> bool {
        self.resume_session_id.is_some()
    }

    /// Decode `user_prompt`.
    pub fn prompt_text(&self) -> anyhow::Result<String> {
        let bytes = BASE64.decode(&self.user_prompt)?;
        Ok(String::from_utf8(bytes)?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_minutes
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
    }

    /// Environment for process-based units.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("USER_ID".to_string(), self.user_id.clone()),
            ("CHANNEL_ID".to_string(), self.channel_id.clone()),
            ("THREAD_ID".to_string(), self.thread_id.clone()),
            ("PLATFORM".to_string(), self.platform.clone()),
            ("MESSAGE_ID".to_string(), self.message_id.clone()),
            ("DEPLOYMENT_NAME".to_string(), self.deployment.clone()),
            ("USER_PROMPT".to_string(), self.user_prompt.clone()),
            ("CLAUDE_OPTIONS".to_string(), self.claude_options.clone()),
            ("PLATFORM_METADATA".to_string(), self.platform_metadata.clone()),
        ];
        if let Some(ref id) = self.session_id {
            env.push(("SESSION_ID".to_string(), id.clone()));
        }
        if let Some(ref id) = self.resume_session_id {
            env.push(("RESUME_SESSION_ID".to_string(), id.clone()));
        }
        env
    }
}

/// Build the config for one batch, choosing the thread's session on the
/// first call.
///
/// A session hint on the first message is adopted as-is; it is not checked
/// against the agent backend.
pub fn build_config(
    batch: &[QueuedMessage],
    state: &mut SessionState,
    ctx: &SessionContext,
) -> anyhow::Result<WorkerConfig> {
    let (first, latest) = match (batch.first(), batch.last()) {
        (Some(first), Some(latest)) => (&first.payload, &latest.payload),
        _ => return Err(anyhow!("cannot build a worker config for an empty batch")),
    };

    let (session_id, resume_session_id) = match state.current_session_id {
        Some(ref current) => (None, Some(current.clone())),
        None => {
            let (session_id, resume) = match first.session_hint() {
                Some(hint) => (None, Some(hint.to_string())),
                None => (Some(format!("session-{}", first.thread_id)), None),
            };
            state.current_session_id = session_id.clone().or_else(|| resume.clone());
            (session_id, resume)
        }
    };

    let prompt = batch
        .iter()
        .map(|m| m.payload.message_text.as_str())
        .collect::<Vec<_>>()
        .join(MESSAGE_SEPARATOR);

    let mut options = latest.claude_options.clone();
    for key in SESSION_OPTION_KEYS {
        options.remove(*key);
    }
    apply_policy(&mut options, &ctx.policy);
    let timeout_minutes = options.get("timeoutMinutes").and_then(option_minutes);

    Ok(WorkerConfig {
        session_id,
        resume_session_id,
        user_id: first.user_id.clone(),
        channel_id: first.channel_id.clone(),
        thread_id: first.thread_id.clone(),
        platform: first.platform.clone(),
        message_id: latest.message_id.clone(),
        deployment: ctx.deployment.clone(),
        user_prompt: BASE64.encode(prompt.as_bytes()),
        claude_options: serde_json::to_string(&options)?,
        platform_metadata: serde_json::to_string(&latest.platform_metadata)?,
        timeout_minutes,
        message_count: batch.len(),
    })
}

/// Policy values replace whatever the payload asked for.
fn apply_policy(options: &mut Map<String, Value>, policy: &PolicyConfig) {
    if let Some(ref tools) = policy.allowed_tools {
        options.insert("allowedTools".into(), Value::from(tools.clone()));
    }
    if let Some(ref tools) = policy.disallowed_tools {
        options.insert("disallowedTools".into(), Value::from(tools.clone()));
    }
    if let Some(minutes) = policy.timeout_minutes {
        options.insert("timeoutMinutes".into(), Value::from(minutes));
    }
}

// Payloads send this as a number or a numeric string.
fn option_minutes(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::consumer::payload::test_payload;

    fn queued(text: &str, timestamp: i64) -> QueuedMessage {
        QueuedMessage::new(test_payload("U1", "T1", text), timestamp)
    }

    fn ctx() -> SessionContext {
        SessionContext {
            deployment: "peer-t1".into(),
            policy: PolicyConfig::default(),
        }
    }

    #[test]
    fn first_batch_creates_thread_session() {
        let mut state = SessionState::default();
        let config = build_config(&[queued("hello", 100)], &mut state, &ctx()).unwrap();

        assert_eq!(config.session_id.as_deref(), Some("session-T1"));
        assert_eq!(config.resume_session_id, None);
        assert_eq!(state.current(), Some("session-T1"));
        assert_eq!(config.prompt_text().unwrap(), "hello");
        assert_eq!(config.session_key(), "session-T1");
        assert_eq!(config.deployment, "peer-t1");
    }

    #[test]
    fn later_batches_resume_and_merge() {
        let mut state = SessionState::default();
        build_config(&[queued("A", 100)], &mut state, &ctx()).unwrap();

        let config = build_config(&[queued("B", 105), queued("C", 110)], &mut state, &ctx()).unwrap();
        assert_eq!(config.session_id, None);
        assert_eq!(config.resume_session_id.as_deref(), Some("session-T1"));
        assert_eq!(config.prompt_text().unwrap(), "B\n\nC");
        assert_eq!(config.message_count, 2);
        assert_eq!(config.message_id, "msg-C");

        let third = build_config(&[queued("D", 120)], &mut state, &ctx()).unwrap();
        assert_eq!(third.session_id, None);
        assert_eq!(third.resume_session_id.as_deref(), Some("session-T1"));
    }

    #[test]
    fn first_message_hint_is_adopted() {
        let mut state = SessionState::default();
        let mut message = queued("continue", 1);
        message.payload.agent_session_id = Some("external-42".into());

        let config = build_config(&[message], &mut state, &ctx()).unwrap();
        assert_eq!(config.session_id, None);
        assert_eq!(config.resume_session_id.as_deref(), Some("external-42"));
        assert_eq!(state.current(), Some("external-42"));

        // A later hint cannot move the thread to another session
        let mut later = queued("more", 2);
        later.payload.agent_session_id = Some("other".into());
        let config = build_config(&[later], &mut state, &ctx()).unwrap();
        assert_eq!(config.resume_session_id.as_deref(), Some("external-42"));
    }

    #[test]
    fn empty_batch_is_an_error() {
        let mut state = SessionState::default();
        assert!(build_config(&[], &mut state, &ctx()).is_err());
        assert_eq!(state.current(), None);
    }

    #[test]
    fn policy_overrides_payload_options() {
        let mut message = queued("hi", 1);
        message.payload.claude_options = json!({
            "model": "sonnet",
            "allowedTools": ["Bash"],
            "timeoutMinutes": 60,
            "resumeSessionId": "ignored-after-first"
        })
        .as_object()
        .cloned()
        .unwrap();

        let ctx = SessionContext {
            deployment: "d".into(),
            policy: PolicyConfig {
                allowed_tools: Some(vec!["Read".into(), "Grep".into()]),
                disallowed_tools: Some(vec!["Bash".into()]),
                timeout_minutes: Some(5),
            },
        };
        let mut state = SessionState::default();
        state.current_session_id = Some("s".into());

        let config = build_config(&[message], &mut state, &ctx).unwrap();
        let options: Value = serde_json::from_str(&config.claude_options).unwrap();
        assert_eq!(options["model"], "sonnet");
        assert_eq!(options["allowedTools"], json!(["Read", "Grep"]));
        assert_eq!(options["disallowedTools"], json!(["Bash"]));
        assert_eq!(options["timeoutMinutes"], 5);
        assert!(options.get("resumeSessionId").is_none());
        assert_eq!(config.timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn payload_options_apply_without_policy() {
        let mut message = queued("hi", 1);
        message.payload.claude_options.insert("timeoutMinutes".into(), json!("7"));
        message.payload.claude_options.insert("allowedTools".into(), json!("Read"));

        let mut state = SessionState::default();
        let config = build_config(&[message], &mut state, &ctx()).unwrap();
        let options: Value = serde_json::from_str(&config.claude_options).unwrap();
        assert_eq!(options["allowedTools"], "Read");
        assert_eq!(config.timeout_minutes, Some(7));
    }

    #[test]
    fn huge_payload_timeout_saturates() {
        let mut message = queued("hi", 1);
        message
            .payload
            .claude_options
            .insert("timeoutMinutes".into(), json!(307_445_734_561_825_861_u64));

        let mut state = SessionState::default();
        let config = build_config(&[message], &mut state, &ctx()).unwrap();
        assert_eq!(config.timeout(), Some(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn env_carries_session_fields() {
        let mut state = SessionState::default();
        let first = build_config(&[queued("a", 1)], &mut state, &ctx()).unwrap();
        let env = first.to_env();
        assert!(env.contains(&("SESSION_ID".into(), "session-T1".into())));
        assert!(!env.iter().any(|(k, _)| k == "RESUME_SESSION_ID"));

        let second = build_config(&[queued("b", 2)], &mut state, &ctx()).unwrap();
        let env = second.to_env();
        assert!(env.contains(&("RESUME_SESSION_ID".into(), "session-T1".into())));
        assert!(!env.iter().any(|(k, _)| k == "SESSION_ID"));
        assert!(env.contains(&("USER_PROMPT".into(), BASE64.encode("b"))));
    }
}
