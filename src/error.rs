use std::process::ExitCode;

/// Errors that cause thread-worker to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

/// Failures raised by the thread consumer.
///
/// Only `MalformedEnvelope` is ever handed back to the broker as a job
/// failure. A payload addressed to another user is not an error at all: the
/// handler acknowledges it and drops it.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("malformed job envelope: {reason}")]
    MalformedEnvelope { reason: String },

    #[error("batch of {batch_size} message(s) failed")]
    BatchProcessing {
        batch_size: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("consumer is not running")]
    NotRunning,

    #[error("broker error")]
    Broker(#[source] anyhow::Error),
}

impl ConsumerError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }

    /// True when the broker should apply its retry / dead-letter policy.
    pub const fn is_job_rejection(&self) -> bool {
        matches!(self, Self::MalformedEnvelope { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            ExitError::Config(String::new()).exit_code(),
            ExitError::ToolNotFound { tool: "x".into() }.exit_code(),
            ExitError::ToolFailed { tool: "x".into(), code: 1, message: String::new() }.exit_code(),
            ExitError::Timeout { tool: "x".into(), timeout_secs: 1 }.exit_code(),
            ExitError::Other(String::new()).exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn only_malformed_rejects_job() {
        assert!(ConsumerError::malformed("no data").is_job_rejection());
        assert!(!ConsumerError::NotRunning.is_job_rejection());
        let batch = ConsumerError::BatchProcessing {
            batch_size: 2,
            source: anyhow::anyhow!("boom"),
        };
        assert!(!batch.is_job_rejection());
    }

    #[test]
    fn malformed_message_includes_reason() {
        let err = ConsumerError::malformed("empty indexed wrapper");
        assert_eq!(
            err.to_string(),
            "malformed job envelope: empty indexed wrapper"
        );
    }
}
