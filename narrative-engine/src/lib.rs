//! Narrative Engine - adaptive narrative sessions for microlearning
//!
//! Tracks a learner's position in a graph of short lessons, drives the
//! tutor's tool-calling protocol, and keeps mastery and knowledge gaps
//! consistent across REST and real-time entry points:
//!
//! - **Mastery tracking**: clamped scores, hysteresis gap rule, recomputation
//! - **Navigation**: choice resolution with atomic path advancement
//! - **Tools**: name-keyed registry, failures returned as structured results
//! - **Orchestration**: two-call model protocol as an explicit state machine
//! - **Coordination**: one in-flight turn per session, real-time fan-out
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    SessionCoordinator                        │
//! │     (SessionGate per session, ConnectionRegistry fan-out)    │
//! │                                                              │
//! │   ┌──────────────────┐        ┌────────────────────────┐     │
//! │   │NarrativeNavigator│        │   TutorOrchestrator    │     │
//! │   └────────┬─────────┘        │ (LlmBackend, Usage)    │     │
//! │            │                  └───────────┬────────────┘     │
//! │            │                      ┌───────▼────────┐         │
//! │            │                      │  ToolRegistry  │         │
//! │            │                      └───────┬────────┘         │
//! │     ┌──────▼──────────────────────────────▼──────┐           │
//! │     │       MasteryTracker / NarrativeStore      │           │
//! │     └────────────────────────────────────────────┘           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod mastery;
pub mod model;
pub mod navigator;
pub mod orchestrator;
pub mod store;
pub mod tools;

// Re-export main types
pub use config::EngineConfig;
pub use coordinator::{
    ChoiceReply, ClientEvent, ConnectionId, ConnectionRegistry, Origin, ProgressUpdate,
    ServerEvent, SessionCoordinator, StartSession, TurnReply,
};
pub use error::{EngineError, ErrorPayload, Result, UpstreamKind};
pub use mastery::{GapTransition, LearnerProgress, MasteryDelta, MasteryTracker};
pub use model::*;
pub use navigator::{NarrativeNavigator, NavigationOutcome, PathOverride};
pub use orchestrator::{TurnOutcome, TutorOrchestrator};
pub use store::{MemoryStore, NarrativeStore, StoreError};
pub use tools::{QuestionLog, ToolContext, ToolInvocation, ToolRegistry, ToolResult};
