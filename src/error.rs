//! Error types for Berth

use thiserror::Error;

/// Result type for Berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

/// Berth error types
#[derive(Error, Debug)]
pub enum BerthError {
    /// Malformed byte, duration, port or command expression
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Service {service} refers to undefined {kind} {reference}")]
    UnresolvedReference {
        service: String,
        kind: &'static str,
        reference: String,
    },

    #[error("The definition of project {project} is invalid: {}", reasons.join("; "))]
    InvalidDefinition {
        project: String,
        reasons: Vec<String>,
    },

    #[error("External {kind} {name} not found")]
    ExternalResourceMissing { kind: &'static str, name: String },

    #[error("Pull image {image} aborted: {reason}")]
    PullAborted { image: String, reason: String },

    #[error("Engine request {method} {path} failed with status {status}: {message}")]
    EngineRequest {
        method: String,
        path: String,
        status: u16,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Raised by `${VAR?msg}` / `${VAR:?msg}` interpolation
    #[error("Environment variable {name}: {message}")]
    MissingVariable { name: String, message: String },

    /// Engine connection and decoding failures that carry no HTTP status
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BerthError {
    /// Shorthand for a parse failure
    pub fn parse(message: impl Into<String>) -> Self {
        BerthError::Parse(message.into())
    }

    /// Whether this error came back from the engine with the given status
    pub fn is_status(&self, code: u16) -> bool {
        matches!(self, BerthError::EngineRequest { status, .. } if *status == code)
    }
}
