//! Error taxonomy for the agent core.
//!
//! Tool-level errors (`ToolCallError`) stay inside a turn: they are recorded
//! as failed invocations and handed back to the reasoner. Only `AgentError`
//! reaches callers of the session interface.

use std::path::PathBuf;

use thiserror::Error;

/// Typed rejection from the domain gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Invalid(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl DomainError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    /// Stable machine-readable code recorded in tool outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Invalid(_) => "invalid",
            Self::Unavailable(_) => "unavailable",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Failure of a single catalog invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolCallError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String, available: Vec<String> },

    #[error("Invalid input for {tool}: {message}")]
    InvalidInput { tool: String, message: String },

    #[error("{tool} failed: {source}")]
    Domain {
        tool: String,
        #[source]
        source: DomainError,
    },
}

impl ToolCallError {
    pub fn invalid_input(tool: &str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn domain(tool: &str, source: DomainError) -> Self {
        Self::Domain {
            tool: tool.to_string(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTool { .. } => "unknown_tool",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Domain { source, .. } => source.code(),
        }
    }

    /// Extra context for the reasoner, if any.
    pub fn details(&self) -> Option<String> {
        match self {
            Self::UnknownTool { available, .. } => {
                Some(format!("Available tools: {}", available.join(", ")))
            }
            Self::InvalidInput { .. } | Self::Domain { .. } => None,
        }
    }
}

/// Registration-time catalog error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("invalid session key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("version conflict for '{key}': expected {expected}, got {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("checkpoint I/O failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint record is not valid JSON")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported checkpoint schema version {0}")]
    UnsupportedSchema(u32),

    #[error("checkpoint store is closed")]
    Closed,

    #[error("checkpoint store failed to open: {0}")]
    Open(String),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of the black-box reasoning step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("reasoner failed: {0}")]
pub struct ReasonerError(pub String);

/// Errors that cross the session boundary.
///
/// Any of these means the turn was not committed: the session's latest
/// persisted version is the one that existed before the turn started.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent did not converge within {limit} tool iterations")]
    Convergence { limit: usize },

    #[error("session state was not saved")]
    Persistence(#[from] CheckpointError),

    #[error("turn cancelled")]
    Cancelled,

    #[error("session interface is shutting down")]
    ShuttingDown,

    #[error("invalid session key '{key}': {reason}")]
    InvalidSessionKey { key: String, reason: &'static str },

    #[error(transparent)]
    Reasoner(#[from] ReasonerError),
}
