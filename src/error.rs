use std::path::PathBuf;
use std::time::Duration;

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Missing API key: environment variable {var} is not set")]
    MissingApiKey { var: String },
}

/// Errors raised by the chat provider client.
///
/// Only [`ProviderError::is_retryable`] variants are retried by the client's
/// backoff loop; everything else surfaces on the first attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Authentication failed (HTTP {status}): {body}")]
    Authentication { status: u16, body: String },

    #[error("Rate limited (HTTP 429): {body}")]
    RateLimited { body: String },

    #[error("Server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("Request rejected (HTTP {status}): {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to decode provider response: {0}")]
    Decode(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Classify a non-2xx HTTP status into the matching error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ProviderError::Authentication { status, body },
            429 => ProviderError::RateLimited { body },
            500..=599 => ProviderError::Server { status, body },
            _ => ProviderError::Http { status, body },
        }
    }

    /// Whether the backoff loop may issue another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Server { .. }
                | ProviderError::Network(_)
                | ProviderError::Timeout
        )
    }

    /// Short machine-friendly kind, printed by the CLI next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Authentication { .. } => "AuthenticationError",
            ProviderError::RateLimited { .. } => "RateLimitedError",
            ProviderError::Server { .. } => "ServerError",
            ProviderError::Http { .. } => "HttpError",
            ProviderError::Network(_) => "NetworkError",
            ProviderError::Timeout => "TimeoutError",
            ProviderError::Decode(_) => "DecodeError",
            ProviderError::Cancelled => "Cancelled",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Errors raised while assembling the tool registry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool already registered: {0}")]
    DuplicateName(String),

    #[error("Invalid blocklist pattern: {0}")]
    InvalidPattern(String),

    #[error("Failed to prepare workspace {path}: {message}")]
    Workspace { path: PathBuf, message: String },
}

/// Errors related to the agent loop and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Session persistence error: {0}")]
    Session(String),
}

/// Workflow-level failures. These reject `TaskOrchestrator::execute` as a
/// whole; individual task failures are recorded in the result map instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Invalid workflow: duplicate task id `{0}`")]
    DuplicateTaskId(String),

    #[error("Invalid DAG: task `{task}` depends on unknown task `{dependency}`")]
    UnknownDependency { task: String, dependency: String },

    #[error("Invalid DAG: cycle detected")]
    CycleDetected,

    #[error("Workflow timeout exceeded after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by the time-based task scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task queue is full ({max} entries)")]
    QueueFull { max: usize },

    #[error("Unsupported schedule: {0}")]
    UnsupportedSchedule(String),

    #[error("Scheduler is stopped")]
    Stopped,
}

/// Errors returned by the background task manager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackgroundError {
    #[error("Background task not found: {0}")]
    NotFound(String),

    #[error("Background task id already in use: {0}")]
    DuplicateId(String),
}
