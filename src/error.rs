//! Error types for the advisory agent graph

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Graph Pipeline Errors
    // =============================

    #[error("Encoding fail-fast: {0}")]
    EncodingFailFast(String),

    #[error("Router extraction error: {0}")]
    RouterExtractionError(String),

    #[error("Suitability denied: {0}")]
    SuitabilityDenied(String),

    #[error("Tool invocation error: {0}")]
    ToolInvocationError(String),

    #[error("Synthesis validation error: {0}")]
    SynthesisValidationError(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Client canceled: {0}")]
    ClientCanceled(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
