//! Tutor orchestrator - drives one turn of the tool-calling protocol.
//!
//! A turn is a small state machine:
//!
//! ```text
//! BuildingContext ─▶ AwaitingModel(Initial) ─┬─▶ Responding
//!                                            │
//!                                            └─▶ ExecutingTools ─▶ AwaitingModel(FollowUp) ─▶ Responding
//! ```
//!
//! There is at most one tool round per turn. The follow-up call is made
//! without tools and any tool calls it returns are ignored.

pub mod context;

use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tutor_agent::{
    CompletionRequest, CompletionResponse, LlmBackend, LlmError, Message, ToolCall,
    UsageCollector, UsageRecord,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{ChatRole, Session, SessionMessage};
use crate::store::{NarrativeStore, StoreError};
use crate::tools::{ToolContext, ToolInvocation, ToolRegistry};

pub use context::TurnContext;

/// Which of the two model calls is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRound {
    Initial,
    FollowUp,
}

/// Tool calls requested in a turn and their results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolRound {
    pub calls: Vec<ToolCall>,
    pub invocations: Vec<ToolInvocation>,
}

/// Turn protocol states.
#[derive(Debug, Clone)]
pub enum TurnState {
    BuildingContext,
    AwaitingModel {
        round: ModelRound,
        request: CompletionRequest,
        tools: Option<ToolRound>,
    },
    ExecutingTools {
        request: CompletionRequest,
        preface: String,
        calls: Vec<ToolCall>,
    },
    Responding {
        content: String,
        tools: Option<ToolRound>,
    },
}

impl TurnState {
    pub fn name(&self) -> &'static str {
        match self {
            TurnState::BuildingContext => "building_context",
            TurnState::AwaitingModel { round: ModelRound::Initial, .. } => "awaiting_model",
            TurnState::AwaitingModel { round: ModelRound::FollowUp, .. } => "awaiting_model_follow_up",
            TurnState::ExecutingTools { .. } => "executing_tools",
            TurnState::Responding { .. } => "responding",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Responding { .. })
    }
}

/// Transition taken once a model call has answered.
pub fn after_model(
    round: ModelRound,
    request: CompletionRequest,
    response: CompletionResponse,
    tools: Option<ToolRound>,
) -> TurnState {
    match round {
        ModelRound::Initial if !response.tool_calls.is_empty() => TurnState::ExecutingTools {
            request,
            preface: response.content,
            calls: response.tool_calls,
        },
        ModelRound::Initial => TurnState::Responding {
            content: response.content,
            tools: None,
        },
        ModelRound::FollowUp => {
            if !response.tool_calls.is_empty() {
                warn!(
                    ignored = response.tool_calls.len(),
                    "Follow-up model call requested tools; ignoring"
                );
            }
            TurnState::Responding {
                content: response.content,
                tools,
            }
        }
    }
}

/// Follow-up request: the initial request plus the assistant's tool calls
/// and one tool message per result, with no tools offered.
pub fn follow_up_request(
    mut request: CompletionRequest,
    preface: &str,
    calls: &[ToolCall],
    invocations: &[ToolInvocation],
) -> CompletionRequest {
    request
        .messages
        .push(Message::assistant_tool_calls(preface, calls.to_vec()));
    for invocation in invocations {
        request.messages.push(Message::tool_result(
            &invocation.call_id,
            invocation.result.to_model_content(),
        ));
    }
    request.tools.clear();
    request
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The persisted assistant message
    pub message: SessionMessage,
    /// Tool executions of this turn (empty when none were requested)
    pub invocations: Vec<ToolInvocation>,
    pub model_calls: u32,
}

/// Per-turn data threaded through the state machine.
struct TurnScope<'a> {
    session: &'a Session,
    user_text: &'a str,
    deadline: Option<Instant>,
    model_calls: u32,
}

/// Runs tutor turns against a language model.
pub struct TutorOrchestrator {
    store: Arc<dyn NarrativeStore>,
    backend: Arc<dyn LlmBackend>,
    registry: Arc<ToolRegistry>,
    usage: Arc<dyn UsageCollector>,
    config: EngineConfig,
}

impl TutorOrchestrator {
    pub fn new(
        store: Arc<dyn NarrativeStore>,
        backend: Arc<dyn LlmBackend>,
        registry: Arc<ToolRegistry>,
        usage: Arc<dyn UsageCollector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            backend,
            registry,
            usage,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one turn for `user_text`.
    ///
    /// `deadline` bounds the model calls; tool executions always run to
    /// completion so their side effects land.
    pub async fn run_turn(
        &self,
        session: &Session,
        user_text: &str,
        deadline: Option<Instant>,
    ) -> Result<TurnOutcome> {
        if session.is_completed() {
            return Err(EngineError::InvalidState(format!(
                "session {} is completed",
                session.id
            )));
        }
        if user_text.trim().is_empty() {
            return Err(EngineError::Validation("message text must not be empty".into()));
        }

        let started = StdInstant::now();
        info!(session_id = %session.id, learner_id = %session.learner_id, "Turn started");

        let mut scope = TurnScope {
            session,
            user_text,
            deadline,
            model_calls: 0,
        };

        let mut state = TurnState::BuildingContext;
        while !state.is_terminal() {
            debug!(session_id = %session.id, state = state.name(), "Turn step");
            state = self.step(state, &mut scope).await?;
        }

        let TurnState::Responding { content, tools } = state else {
            return Err(EngineError::System("turn ended outside the responding state".into()));
        };
        let round = tools.unwrap_or_default();

        let message = SessionMessage::new(&session.id, ChatRole::Assistant, content)
            .with_tool_round(round.calls, round.invocations.clone());
        let message = self.store.append_message(message).await?;
        self.touch(&session.id).await;

        info!(
            session_id = %session.id,
            tool_calls = round.invocations.len(),
            failed_tools = round.invocations.iter().filter(|i| !i.result.success).count(),
            model_calls = scope.model_calls,
            duration_ms = started.elapsed().as_millis() as u64,
            "Turn finished"
        );

        Ok(TurnOutcome {
            message,
            invocations: round.invocations,
            model_calls: scope.model_calls,
        })
    }

    /// Advance the state machine by one transition.
    async fn step(&self, state: TurnState, scope: &mut TurnScope<'_>) -> Result<TurnState> {
        match state {
            TurnState::BuildingContext => {
                let context = self.build_context(scope.session).await?;
                let request = CompletionRequest::default()
                    .with_system(context.system_prompt())
                    .with_messages(context.messages(scope.user_text))
                    .with_tools(self.registry.definitions().await)
                    .with_max_tokens(self.config.max_tokens)
                    .with_temperature(self.config.temperature);

                // Persisted after the history snapshot so it is not sent twice.
                self.store
                    .append_message(SessionMessage::new(
                        &scope.session.id,
                        ChatRole::User,
                        scope.user_text,
                    ))
                    .await?;

                Ok(TurnState::AwaitingModel {
                    round: ModelRound::Initial,
                    request,
                    tools: None,
                })
            }

            TurnState::AwaitingModel {
                round,
                request,
                tools,
            } => {
                let response = self.call_model(request.clone(), scope).await?;
                Ok(after_model(round, request, response, tools))
            }

            TurnState::ExecutingTools {
                request,
                preface,
                calls,
            } => {
                let ctx = ToolContext::new(
                    &scope.session.tenant_id,
                    &scope.session.id,
                    &scope.session.learner_id,
                )
                .with_mode(scope.session.mode);
                let invocations = self.registry.execute_all(&calls, &ctx).await;

                let request = follow_up_request(request, &preface, &calls, &invocations);
                Ok(TurnState::AwaitingModel {
                    round: ModelRound::FollowUp,
                    request,
                    tools: Some(ToolRound { calls, invocations }),
                })
            }

            TurnState::Responding { .. } => Ok(state),
        }
    }

    async fn build_context(&self, session: &Session) -> Result<TurnContext> {
        let learner = self.store.get_learner(&session.learner_id).await?;
        let node = match &session.current_node_id {
            Some(id) => match self.store.get_node(id).await {
                Ok(node) => Some(node),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        let nugget = match &node {
            Some(node) => self.store.get_nugget(&node.nugget_id).await.ok(),
            None => None,
        };
        let history = self
            .store
            .recent_messages(&session.id, self.config.history_window)
            .await?;

        Ok(TurnContext {
            session: session.clone(),
            learner,
            node,
            nugget,
            history,
        })
    }

    async fn call_model(
        &self,
        request: CompletionRequest,
        scope: &mut TurnScope<'_>,
    ) -> Result<CompletionResponse> {
        scope.model_calls += 1;
        let started = StdInstant::now();

        let result = match scope.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.backend.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            },
            None => self.backend.complete(request).await,
        };

        let response = result.map_err(|e| {
            warn!(session_id = %scope.session.id, error = %e, "Model call failed");
            EngineError::from(e)
        })?;

        debug!(
            session_id = %scope.session.id,
            tool_calls = response.tool_calls.len(),
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            duration_ms = started.elapsed().as_millis() as u64,
            "Model call finished"
        );

        self.record_usage(scope.session, &response);
        Ok(response)
    }

    /// Report usage on a detached task; failures are logged and dropped.
    fn record_usage(&self, session: &Session, response: &CompletionResponse) {
        let record = UsageRecord::new(
            self.backend.provider(),
            self.backend.id(),
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            &session.tenant_id,
        )
        .with_learner(&session.learner_id);

        let usage = Arc::clone(&self.usage);
        tokio::spawn(async move {
            if let Err(e) = usage.record(record).await {
                warn!(error = %e, "Failed to record model usage");
            }
        });
    }

    async fn touch(&self, session_id: &str) {
        if let Err(e) = self.store.touch_session(session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to touch session");
        }
    }
}
