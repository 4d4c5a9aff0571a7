//! Core error type for agentmesh.
//!
//! `MeshError` is used throughout the core (transport, registry, lifecycle,
//! correlator). Domain transforms report through the narrower
//! `TransformError`, which the worker runtime turns into a drop or an error
//! envelope.

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timed out after {waited_ms}ms waiting for reply on '{topic}'")]
    Timeout { topic: String, waited_ms: u128 },

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Agent '{agent}' failed: {message}")]
    AgentFailed { agent: String, message: String },

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MeshResult<T> = Result<T, MeshError>;

/// Failure raised by a domain transform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// The request is malformed (missing field, wrong type, bad encoding).
    /// Treated like unparseable JSON: logged and dropped without a reply.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The domain logic itself failed (model call, parse exception).
    #[error("{0}")]
    Failed(String),
}

impl TransformError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<serde_json::Error> for TransformError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<serde_yaml::Error> for MeshError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<rumqttc::ClientError> for MeshError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Connection(e.to_string())
    }
}
