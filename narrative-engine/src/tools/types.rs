//! Tool execution types shared by the registry, handlers and orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::model::DeliveryMode;

/// Identity of the turn a tool runs in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolContext {
    pub tenant_id: String,
    pub session_id: String,
    pub learner_id: String,
    /// Session delivery mode, used for format defaults
    #[serde(default)]
    pub mode: DeliveryMode,
}

impl ToolContext {
    pub fn new(
        tenant_id: impl Into<String>,
        session_id: impl Into<String>,
        learner_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
            learner_id: learner_id.into(),
            mode: DeliveryMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Structured failure carried in a [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolFailure {
    pub error_type: String,
    pub message: String,
}

impl From<&EngineError> for ToolFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            error_type: err.error_type().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one tool execution. Always present, never a raw error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(err: &EngineError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.into()),
        }
    }

    /// Wire name of the failure, if any.
    pub fn error_type(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.error_type.as_str())
    }

    /// Body handed back to the model as the tool message content.
    pub fn to_model_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"success":false,"error":{"errorType":"SystemError","message":"unserializable tool result"}}"#
                .to_string()
        })
    }
}

/// One executed tool call, scoped to a single turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    /// Id of the model's tool call this answers
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: ToolResult,
    pub duration_ms: u64,
}
