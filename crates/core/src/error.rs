use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Gateway startup failed: {0}")]
    GatewayStartup(String),

    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Iteration limit exceeded ({0} iterations)")]
    IterationLimitExceeded(u32),

    #[error("Consecutive tool error limit exceeded ({0} errors)")]
    ConsecutiveToolErrorLimit(u32),

    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("A run is already in progress")]
    RunInProgress,

    #[error("{0}")]
    Other(String),
}

/// Machine-checkable classification so boundary layers can branch on the
/// failure class without string-matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Io,
    Json,
    ProviderNotConfigured,
    Provider,
    GatewayStartup,
    GatewayUnavailable,
    ToolExecution,
    Cancelled,
    IterationLimit,
    ConsecutiveToolErrorLimit,
    ContextOverflow,
    RunInProgress,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Json,
            Error::ProviderNotConfigured(_) => ErrorKind::ProviderNotConfigured,
            Error::Provider(_) => ErrorKind::Provider,
            Error::GatewayStartup(_) => ErrorKind::GatewayStartup,
            Error::GatewayUnavailable(_) => ErrorKind::GatewayUnavailable,
            Error::ToolExecution(_) => ErrorKind::ToolExecution,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::IterationLimitExceeded(_) => ErrorKind::IterationLimit,
            Error::ConsecutiveToolErrorLimit(_) => ErrorKind::ConsecutiveToolErrorLimit,
            Error::ContextOverflow(_) => ErrorKind::ContextOverflow,
            Error::RunInProgress => ErrorKind::RunInProgress,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether this error terminates the current run. Tool-level and visual
    /// comparison failures are absorbed into model-facing observations instead
    /// of propagating; everything here ends the run.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config
                | ErrorKind::ProviderNotConfigured
                | ErrorKind::GatewayStartup
                | ErrorKind::GatewayUnavailable
                | ErrorKind::Cancelled
                | ErrorKind::IterationLimit
                | ErrorKind::ConsecutiveToolErrorLimit
                | ErrorKind::ContextOverflow
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
