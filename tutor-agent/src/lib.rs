//! Tutor Agent - language-model client layer
//!
//! Provides the infrastructure the narrative tutor needs to talk to a model:
//! - Trait-based LLM backends (OpenAI-compatible HTTP, scripted mock)
//! - Function-call round trips (tool definitions, tool calls, tool results)
//! - Best-effort usage/cost collection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      narrative-engine orchestrator      │
//! └────────────────┬────────────────────────┘
//!                  │
//!      ┌───────────┴───────────┐
//!      ▼                       ▼
//! ┌─────────────┐       ┌──────────────┐
//! │ LlmBackend  │       │UsageCollector│
//! │ (OpenAI/    │       │ (JSONL/mem/  │
//! │  Mock)      │       │  noop)       │
//! └─────────────┘       └──────────────┘
//! ```

pub mod backend;
pub mod usage;

// Re-export main types for convenience
pub use backend::traits::{
    CompletionRequest, CompletionResponse, FinishReason, LlmBackend, LlmError, Message,
    MessageRole, ModelCapabilities, ToolCall, ToolDefinition, Usage,
};
pub use backend::{MockBackend, OpenAiBackend, ScriptedReply};
pub use usage::{
    JsonlUsageLogger, MemoryUsageCollector, NoopUsageCollector, UsageCollector, UsageError,
    UsageRecord,
};
