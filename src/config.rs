use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".thread-worker.toml";
pub const CONFIG_JSON: &str = ".thread-worker.json";

/// Find the config file path, preferring .thread-worker.toml over .thread-worker.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Top-level .thread-worker.toml config.
///
/// All structs use snake_case (TOML native) with `alias` attributes so the
/// camelCase JSON form loads too.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub worker: WorkerCommandConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConsumerConfig {
    /// Deployment identifier; the queue name is derived from it.
    #[serde(default)]
    pub deployment: Option<String>,
    /// The user that owns this thread. Payloads for anyone else are dropped.
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    /// A drain running longer than this marks the consumer unhealthy.
    #[serde(default = "default_stuck_after", alias = "stuckAfterSecs")]
    pub stuck_after_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            deployment: None,
            user_id: None,
            stuck_after_secs: default_stuck_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerCommandConfig {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl Default for WorkerCommandConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            workdir: None,
        }
    }
}

/// Process-level policy. Any value set here wins over the same option
/// supplied in a message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyConfig {
    #[serde(default, alias = "allowedTools")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, alias = "disallowedTools")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default, alias = "timeoutMinutes")]
    pub timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReclaimConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_stuck_after() -> u64 { 3600 }
fn default_worker_command() -> String { "claude-worker".into() }

impl Config {
    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }
    }

    /// Load the config file from `explicit`, or look in `dir`. A missing
    /// file is not an error; everything can come from the environment.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => match find_config(dir) {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).map_err(|e| {
            ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into()
        })
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into()
        })
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup`. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("DEPLOYMENT_NAME") {
            self.consumer.deployment = Some(v);
        }
        if let Some(v) = get("USER_ID") {
            self.consumer.user_id = Some(v);
        }
        if let Some(v) = get("ALLOWED_TOOLS") {
            self.policy.allowed_tools = Some(split_list(&v));
        }
        if let Some(v) = get("DISALLOWED_TOOLS") {
            self.policy.disallowed_tools = Some(split_list(&v));
        }
        if let Some(v) = get("TIMEOUT_MINUTES") {
            let minutes = v.parse::<u64>().map_err(|_| {
                ExitError::Config(format!("TIMEOUT_MINUTES must be a whole number, got {v:?}"))
            })?;
            self.policy.timeout_minutes = Some(minutes);
        }
        if let Some(v) = get("WORKER_COMMAND") {
            self.worker.command = v;
        }
        if let Some(v) = get("RECLAIM_URL") {
            self.reclaim.url = Some(v);
        }
        if let Some(v) = get("RECLAIM_TOKEN") {
            self.reclaim.token = Some(v);
        }
        Ok(())
    }

    /// The validated deployment identifier.
    pub fn deployment(&self) -> anyhow::Result<&str> {
        let deployment = self
            .consumer
            .deployment
            .as_deref()
            .ok_or_else(|| ExitError::Config("deployment not set (DEPLOYMENT_NAME or [consumer].deployment)".into()))?;
        validate_deployment(deployment)?;
        Ok(deployment)
    }

    /// The owning user id.
    pub fn user_id(&self) -> anyhow::Result<&str> {
        self.consumer
            .user_id
            .as_deref()
            .ok_or_else(|| ExitError::Config("user id not set (USER_ID or [consumer].user_id)".into()).into())
    }
}

/// Deployment ids end up in queue names: `[a-z0-9][a-z0-9-_]*`, max 63 chars.
pub fn validate_deployment(deployment: &str) -> anyhow::Result<()> {
    if deployment.is_empty()
        || deployment.len() > 63
        || !deployment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        || !deployment.as_bytes()[0].is_ascii_alphanumeric()
    {
        return Err(ExitError::Config(format!(
            "invalid deployment {deployment:?}: must match [a-z0-9][a-z0-9-_]*, max 63 chars"
        ))
        .into());
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_full_toml_config() {
        let config = Config::parse_toml(r#"
[consumer]
deployment = "peer-abc123"
user_id = "U123"
stuck_after_secs = 600

[worker]
command = "my-worker"
args = ["--verbose"]

[policy]
allowed_tools = ["Read", "Grep"]
disallowed_tools = ["Bash"]
timeout_minutes = 10

[reclaim]
url = "http://orchestrator/scale"
"#).unwrap();

        assert_eq!(config.consumer.deployment.as_deref(), Some("peer-abc123"));
        assert_eq!(config.consumer.user_id.as_deref(), Some("U123"));
        assert_eq!(config.consumer.stuck_after_secs, 600);
        assert_eq!(config.worker.command, "my-worker");
        assert_eq!(config.worker.args, vec!["--verbose"]);
        assert_eq!(config.policy.allowed_tools, Some(vec!["Read".into(), "Grep".into()]));
        assert_eq!(config.policy.disallowed_tools, Some(vec!["Bash".into()]));
        assert_eq!(config.policy.timeout_minutes, Some(10));
        assert_eq!(config.reclaim.url.as_deref(), Some("http://orchestrator/scale"));
    }

    #[test]
    fn parse_json_config_with_camel_case() {
        let config = Config::parse_json(r#"{
            "consumer": { "deployment": "d1", "userId": "U9", "stuckAfterSecs": 5 },
            "policy": { "allowedTools": ["Read"], "timeoutMinutes": 3 }
        }"#).unwrap();

        assert_eq!(config.consumer.user_id.as_deref(), Some("U9"));
        assert_eq!(config.consumer.stuck_after_secs, 5);
        assert_eq!(config.policy.allowed_tools, Some(vec!["Read".into()]));
        assert_eq!(config.policy.timeout_minutes, Some(3));
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config.consumer.stuck_after_secs, 3600);
        assert_eq!(config.worker.command, "claude-worker");
        assert_eq!(config.policy, PolicyConfig::default());
        assert!(config.reclaim.url.is_none());
    }

    #[test]
    fn parse_malformed_toml() {
        let err = Config::parse_toml("not valid toml [[[").unwrap_err();
        assert!(err.to_string().contains("invalid .thread-worker.toml"));
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn parse_malformed_json() {
        let err = Config::parse_json("not json").unwrap_err();
        assert!(err.to_string().contains("invalid .thread-worker.json"));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::parse_toml(r#"
[consumer]
deployment = "from-file"
user_id = "file-user"

[policy]
allowed_tools = ["Read"]
"#).unwrap();

        config
            .apply_env_from(env(&[
                ("DEPLOYMENT_NAME", "from-env"),
                ("ALLOWED_TOOLS", "Read, Write ,,Edit"),
                ("TIMEOUT_MINUTES", "15"),
                ("USER_ID", ""),
            ]))
            .unwrap();

        assert_eq!(config.consumer.deployment.as_deref(), Some("from-env"));
        // Empty env values do not clobber the file
        assert_eq!(config.consumer.user_id.as_deref(), Some("file-user"));
        assert_eq!(
            config.policy.allowed_tools,
            Some(vec!["Read".into(), "Write".into(), "Edit".into()])
        );
        assert_eq!(config.policy.timeout_minutes, Some(15));
    }

    #[test]
    fn env_rejects_bad_timeout() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(env(&[("TIMEOUT_MINUTES", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("TIMEOUT_MINUTES"));
    }

    #[test]
    fn deployment_and_user_are_required() {
        let config = Config::default();
        assert!(config.deployment().is_err());
        assert!(config.user_id().is_err());
    }

    #[test]
    fn deployment_validation() {
        assert!(validate_deployment("peer-abc_123").is_ok());
        assert!(validate_deployment("").is_err());
        assert!(validate_deployment("-leading").is_err());
        assert!(validate_deployment("Upper").is_err());
        assert!(validate_deployment("has space").is_err());
        assert!(validate_deployment("../etc").is_err());
        assert!(validate_deployment(&"a".repeat(64)).is_err());
    }

    #[test]
    fn discover_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_JSON), r#"{"consumer":{"userId":"json"}}"#).unwrap();
        std::fs::write(dir.path().join(CONFIG_TOML), "[consumer]\nuser_id = \"toml\"\n").unwrap();

        let config = Config::discover(None, dir.path()).unwrap();
        assert_eq!(config.consumer.user_id.as_deref(), Some("toml"));
    }

    #[test]
    fn discover_without_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::discover(None, dir.path()).unwrap();
        assert!(config.consumer.deployment.is_none());
    }
}
