use thiserror::Error;

/// Convenience type alias for Results with MaestroError
pub type Result<T> = std::result::Result<T, MaestroError>;

/// Main error type for Maestro Core
///
/// Each variant corresponds to one externally visible error kind. The
/// `code()` string is what the UI receives; `failed_layer()` names the
/// component that produced the error.
#[derive(Error, Debug)]
pub enum MaestroError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task {task_id} is still running")]
    TaskRunning { task_id: String },

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Permission denied: agent {agent_id} may not use tool {tool_name}")]
    PermissionDenied { agent_id: String, tool_name: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Aborted: {reason}")]
    Aborted { reason: String },

    #[error("Model adapter error: {message}")]
    Model { message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MaestroError {
    pub fn aborted(reason: impl Into<String>) -> Self {
        MaestroError::Aborted {
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        MaestroError::Execution {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        MaestroError::Timeout {
            message: message.into(),
        }
    }

    /// UI-visible error code.
    pub fn code(&self) -> &'static str {
        match self {
            MaestroError::Validation(_) | MaestroError::Configuration(_) => "VALIDATION",
            MaestroError::TaskRunning { .. } => "TASK_RUNNING",
            MaestroError::Timeout { .. } => "TIMEOUT",
            MaestroError::PermissionDenied { .. } => "PERMISSION_DENIED",
            MaestroError::RateLimit { .. } => "RATE_LIMIT",
            MaestroError::NotFound(_) => "NOT_FOUND",
            MaestroError::Execution { .. } | MaestroError::TaskExecution { .. } => {
                "EXECUTION_ERROR"
            }
            MaestroError::Aborted { .. } => "ABORTED",
            MaestroError::Model { .. } => "MODEL_ERROR",
            _ => "INTERNAL",
        }
    }

    /// Component label surfaced in the task record's `failed_layer` field.
    pub fn failed_layer(&self) -> &'static str {
        match self {
            MaestroError::Validation(_) | MaestroError::Configuration(_) => "Validation",
            MaestroError::TaskRunning { .. } | MaestroError::NotFound(_) => "Task Store",
            MaestroError::Timeout { .. } => "Agent Runtime",
            MaestroError::PermissionDenied { .. } | MaestroError::RateLimit { .. } => {
                "Tool Manager"
            }
            MaestroError::Execution { .. } | MaestroError::TaskExecution { .. } => "Agent Runtime",
            MaestroError::Aborted { .. } => "Cancellation",
            MaestroError::Model { .. } | MaestroError::Http(_) => "Model Adapter",
            _ => "Runtime",
        }
    }

    /// True when this error carries a cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, MaestroError::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn aborted_message_matches_cancellation_contract() {
        let re = Regex::new(r"(?i)abort|cancel").unwrap();
        let err = MaestroError::aborted("cancelled by user");
        assert!(re.is_match(&err.to_string()));
        assert_eq!(err.code(), "ABORTED");
        assert!(err.is_aborted());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(MaestroError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(
            MaestroError::TaskRunning { task_id: "t".into() }.code(),
            "TASK_RUNNING"
        );
        assert_eq!(
            MaestroError::RateLimit { message: "m".into() }.code(),
            "RATE_LIMIT"
        );
        assert_eq!(MaestroError::timeout("slow").code(), "TIMEOUT");
    }

    #[test]
    fn failed_layer_names_component() {
        assert_eq!(
            MaestroError::PermissionDenied {
                agent_id: "a".into(),
                tool_name: "t".into()
            }
            .failed_layer(),
            "Tool Manager"
        );
        assert_eq!(
            MaestroError::Model { message: "m".into() }.failed_layer(),
            "Model Adapter"
        );
    }
}
