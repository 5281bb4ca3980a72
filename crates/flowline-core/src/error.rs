use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("Invalid workflow structure: {0}")]
    Structure(String),

    // Condition errors
    #[error("Type mismatch evaluating '{field}' {operator}: {message}")]
    TypeMismatch {
        field: String,
        operator: String,
        message: String,
    },

    #[error("No branch of condition node '{node}' matches result '{result}'")]
    NoMatchingBranch { node: String, result: bool },

    // Step errors
    #[error("Action '{kind}' failed: {cause}")]
    Action { kind: String, cause: String },

    #[error("Script failed: {0}")]
    Script(String),

    // Run errors
    #[error("timeout")]
    Timeout,

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Registry errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow already exists: {0}")]
    AlreadyExists(String),

    #[error("Cannot {action} workflow '{id}' while {status}")]
    InvalidTransition {
        id: String,
        action: String,
        status: String,
    },

    #[error("Workflow '{id}' is not active ({status})")]
    NotActive { id: String, status: String },

    #[error("Trigger '{got}' does not match workflow trigger '{expected}'")]
    TriggerMismatch { expected: String, got: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Wrap any handler failure as an action error.
    pub fn action(kind: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Action {
            kind: kind.into(),
            cause: cause.to_string(),
        }
    }

    /// Errors that end a run immediately, whatever the error policy says.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Structure(_) | Self::TypeMismatch { .. } | Self::NoMatchingBranch { .. } | Self::Timeout
        )
    }

    /// Errors the workflow's Stop/Continue/Retry policy applies to.
    pub fn is_policy_governed(&self) -> bool {
        matches!(self, Self::Action { .. } | Self::Script(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
