//! Error taxonomy for the engine.

use serde::{Deserialize, Serialize};
use tutor_agent::LlmError;

use crate::store::StoreError;

/// Sub-kind of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamKind {
    /// The caller-supplied deadline expired
    Timeout,
    /// The model or tool infrastructure failed
    Failure,
}

/// Errors surfaced by engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Bad or missing arguments
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced resource does not exist
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Resource exists but belongs to another tenant or learner
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource is in the wrong state for the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Another turn holds the session and the wait queue is full
    #[error("Session {0} is busy")]
    SessionBusy(String),

    /// Model or tool infrastructure failure
    #[error("Upstream error ({kind:?}): {message}")]
    Upstream { kind: UpstreamKind, message: String },

    /// Unexpected internal failure
    #[error("System error: {0}")]
    System(String),

    /// Session has no current node to navigate from
    #[error("Session {0} has no current node")]
    NoCurrentNode(String),

    /// Choice id is not among the current node's choices
    #[error("Choice {0} not found on the current node")]
    ChoiceNotFound(String),

    /// Choice points at a node that does not exist in scope
    #[error("Target node {0} not found")]
    TargetNodeNotFound(String),
}

impl EngineError {
    /// Wire name of the error kind.
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::ResourceNotFound(_) => "ResourceNotFound",
            EngineError::PermissionDenied(_) => "PermissionDenied",
            EngineError::InvalidState(_) => "InvalidState",
            EngineError::SessionBusy(_) => "SessionBusy",
            EngineError::Upstream { .. } => "UpstreamError",
            EngineError::System(_) => "SystemError",
            EngineError::NoCurrentNode(_) => "NoCurrentNode",
            EngineError::ChoiceNotFound(_) => "ChoiceNotFound",
            EngineError::TargetNodeNotFound(_) => "TargetNodeNotFound",
        }
    }

    /// Whether the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SessionBusy(_) | EngineError::Upstream { .. })
    }

    /// Upstream timeout shorthand.
    pub fn timeout(message: impl Into<String>) -> Self {
        EngineError::Upstream {
            kind: UpstreamKind::Timeout,
            message: message.into(),
        }
    }

    /// Structured body for transports.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            error_type: self.error_type().to_string(),
            message: self.to_string(),
            upstream_kind: match self {
                EngineError::Upstream { kind, .. } => Some(*kind),
                _ => None,
            },
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EngineError::ResourceNotFound(what),
            StoreError::Conflict(what) => EngineError::InvalidState(what),
            StoreError::Backend(what) => EngineError::System(what),
        }
    }
}

impl From<LlmError> for EngineError {
    fn from(err: LlmError) -> Self {
        let kind = if err.is_timeout() {
            UpstreamKind::Timeout
        } else {
            UpstreamKind::Failure
        };
        EngineError::Upstream {
            kind,
            message: err.to_string(),
        }
    }
}

/// Structured error body shared by REST and real-time transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_kind: Option<UpstreamKind>,
}

pub type Result<T> = std::result::Result<T, EngineError>;
