//! Session coordinator - the single entry point for transports.
//!
//! Every mutating operation runs inside the session's gate, on a spawned
//! task. A caller that goes away (closed socket, dropped HTTP request) only
//! loses the reply; the state change still lands exactly once.
//!
//! Fan-out order after a successful operation: the initiator is answered
//! first, then the remaining live connections of the session get a broadcast.

pub mod connections;
pub mod events;
pub mod gate;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tutor_agent::{LlmBackend, UsageCollector};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::mastery::{LearnerProgress, MasteryDelta, MasteryTracker};
use crate::model::{
    ChatRole, DeliveryMode, NarrativeNode, Session, SessionMessage, SessionSnapshot,
};
use crate::navigator::NarrativeNavigator;
use crate::orchestrator::TutorOrchestrator;
use crate::store::{NarrativeStore, StoreError};
use crate::tools::{
    register_builtin_tools, QuestionLog, ToolInvocation, ToolRegistry, ToolServices,
};

pub use connections::{ConnectionId, ConnectionRegistry};
pub use events::{ClientEvent, ConceptScore, ServerEvent};
pub use gate::{SessionGate, SessionPermit};

/// Transport that initiated an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Request/response caller; answered through the return value
    Rest,
    /// A registered real-time connection
    Realtime(ConnectionId),
}

impl Origin {
    fn connection(self) -> Option<ConnectionId> {
        match self {
            Origin::Rest => None,
            Origin::Realtime(id) => Some(id),
        }
    }
}

/// Parameters for starting a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub tenant_id: String,
    pub learner_id: String,
    #[serde(default)]
    pub mode: DeliveryMode,
    /// Explicit first node; selected automatically when absent
    #[serde(default)]
    pub start_node_id: Option<String>,
}

/// Progress delta attached to replies and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub concepts: Vec<ConceptScore>,
    pub gaps: BTreeSet<String>,
}

/// Result of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReply {
    pub message: SessionMessage,
    pub tool_results: Vec<ToolInvocation>,
    /// Set when a tool moved the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_updated: Option<NarrativeNode>,
    /// Set when a tool changed mastery or gaps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressUpdate>,
}

/// Result of a choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceReply {
    pub next_node: NarrativeNode,
    pub mastery_updates: Vec<MasteryDelta>,
    pub path_history: Vec<String>,
}

/// Events for the initiator and for everyone else.
struct Fanout {
    initiator: Vec<ServerEvent>,
    others: Vec<ServerEvent>,
}

/// Owns per-session serialization and real-time fan-out.
#[derive(Clone)]
pub struct SessionCoordinator {
    store: Arc<dyn NarrativeStore>,
    tracker: Arc<MasteryTracker>,
    navigator: Arc<NarrativeNavigator>,
    orchestrator: Arc<TutorOrchestrator>,
    questions: Arc<QuestionLog>,
    gate: Arc<SessionGate>,
    connections: Arc<ConnectionRegistry>,
    config: EngineConfig,
}

impl SessionCoordinator {
    /// Wire the engine together and register the built-in tools.
    pub async fn new(
        store: Arc<dyn NarrativeStore>,
        backend: Arc<dyn LlmBackend>,
        usage: Arc<dyn UsageCollector>,
        config: EngineConfig,
    ) -> Self {
        let tracker = Arc::new(
            MasteryTracker::new(Arc::clone(&store))
                .with_recent_events_limit(config.recent_events_limit),
        );
        let navigator = Arc::new(NarrativeNavigator::new(Arc::clone(&store)));
        let questions = Arc::new(QuestionLog::with_capacity(config.question_log_capacity));

        let registry = Arc::new(ToolRegistry::with_timeout(config.tool_timeout()));
        register_builtin_tools(
            &registry,
            ToolServices {
                store: Arc::clone(&store),
                tracker: Arc::clone(&tracker),
                navigator: Arc::clone(&navigator),
                questions: Arc::clone(&questions),
                search_limit_max: config.search_limit_max,
            },
        )
        .await;

        let orchestrator = Arc::new(TutorOrchestrator::new(
            Arc::clone(&store),
            backend,
            registry,
            usage,
            config.clone(),
        ));

        info!(
            max_queued_turns = config.max_queued_turns,
            history_window = config.history_window,
            "Session coordinator ready"
        );

        Self {
            store,
            tracker,
            navigator,
            orchestrator,
            questions,
            gate: Arc::new(SessionGate::new(config.max_queued_turns)),
            connections: Arc::new(ConnectionRegistry::with_capacity(config.realtime_channel_capacity)),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn NarrativeStore> {
        &self.store
    }

    pub fn questions(&self) -> &Arc<QuestionLog> {
        &self.questions
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // === Session lifecycle ===

    /// Create a session, placing it on the starting node when one exists.
    pub async fn start_session(&self, params: StartSession) -> Result<SessionSnapshot> {
        if params.tenant_id.trim().is_empty() || params.learner_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "tenantId and learnerId are required".into(),
            ));
        }

        let learner = self
            .store
            .ensure_learner(&params.tenant_id, &params.learner_id)
            .await?;
        if learner.tenant_id != params.tenant_id {
            return Err(EngineError::PermissionDenied(format!(
                "learner {} belongs to another tenant",
                learner.id
            )));
        }

        let start = match &params.start_node_id {
            Some(node_id) => {
                let node = self.store.get_node(node_id).await?;
                if node.tenant_id != params.tenant_id {
                    return Err(EngineError::ResourceNotFound(format!("node {}", node_id)));
                }
                Some(node)
            }
            None => {
                self.navigator
                    .select_start_node(&params.tenant_id, &learner)
                    .await?
            }
        };

        let mut session = self
            .store
            .insert_session(Session::new(&params.tenant_id, &params.learner_id, params.mode))
            .await?;
        if let Some(node) = &start {
            session = self.navigator.enter_node(&session.id, &node.id).await?;
        }

        info!(
            session_id = %session.id,
            learner_id = %session.learner_id,
            start_node = ?session.current_node_id,
            "Session started"
        );
        Ok(SessionSnapshot::new(session, start))
    }

    /// Current session state.
    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let session = self.store.get_session(session_id).await?;
        let node = self.current_node(&session).await?;
        Ok(SessionSnapshot::new(session, node))
    }

    /// Check that a session exists and belongs to the tenant and learner.
    pub async fn authorize(&self, session_id: &str, tenant_id: &str, learner_id: &str) -> Result<Session> {
        let session = self.store.get_session(session_id).await?;
        if session.tenant_id != tenant_id || session.learner_id != learner_id {
            return Err(EngineError::PermissionDenied(format!(
                "session {} is not accessible",
                session_id
            )));
        }
        Ok(session)
    }

    /// Mark a session completed. Later mutations fail with `InvalidState`.
    pub async fn complete_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let this = self.clone();
        let id = session_id.to_string();
        run_detached(async move {
            let _permit = this.gate.acquire(&id).await?;
            let session = this.store.complete_session(&id).await?;
            let node = this.current_node(&session).await?;
            info!(session_id = %id, "Session completed");
            Ok(SessionSnapshot::new(session, node))
        })
        .await
    }

    /// Message log, oldest first, at most `limit` entries.
    pub async fn messages(&self, session_id: &str, limit: usize) -> Result<Vec<SessionMessage>> {
        self.store.get_session(session_id).await?;
        Ok(self.store.recent_messages(session_id, limit).await?)
    }

    // === Learner views ===

    pub async fn progress(&self, learner_id: &str, tenant_id: &str) -> Result<LearnerProgress> {
        self.check_learner(learner_id, tenant_id).await?;
        self.tracker.get_progress(learner_id).await
    }

    pub async fn identify_gaps(&self, learner_id: &str, tenant_id: &str) -> Result<BTreeSet<String>> {
        self.check_learner(learner_id, tenant_id).await?;
        self.tracker.identify_gaps(learner_id).await
    }

    // === Turns and choices ===

    /// Run one tutor turn with the configured deadline.
    pub async fn turn(&self, session_id: &str, text: &str, origin: Origin) -> Result<TurnReply> {
        let deadline = self.config.turn_deadline().map(|d| Instant::now() + d);
        self.turn_until(session_id, text, origin, deadline).await
    }

    /// Run one tutor turn bounded by a caller-supplied deadline.
    pub async fn turn_until(
        &self,
        session_id: &str,
        text: &str,
        origin: Origin,
        deadline: Option<Instant>,
    ) -> Result<TurnReply> {
        let this = self.clone();
        let id = session_id.to_string();
        let text = text.to_string();
        run_detached(async move {
            let result = this.turn_locked(&id, &text, deadline).await;
            this.publish(&id, origin, result)
        })
        .await
    }

    /// Follow a choice of the current node and apply its mastery follow-up.
    pub async fn choose(&self, session_id: &str, choice_id: &str, origin: Origin) -> Result<ChoiceReply> {
        let this = self.clone();
        let id = session_id.to_string();
        let choice_id = choice_id.to_string();
        run_detached(async move {
            let result = this.choose_locked(&id, &choice_id).await;
            this.publish(&id, origin, result)
        })
        .await
    }

    // === Real-time connections ===

    /// Handshake: authorize and register a connection.
    ///
    /// Returns the connection id, the outbound event stream and the initial
    /// `joined` event.
    pub async fn connect(
        &self,
        session_id: &str,
        tenant_id: &str,
        learner_id: &str,
    ) -> Result<(ConnectionId, mpsc::Receiver<ServerEvent>, ServerEvent)> {
        self.authorize(session_id, tenant_id, learner_id).await?;
        let joined = self.joined_event(session_id).await?;
        let (id, rx) = self.connections.register(session_id);
        info!(session_id = %session_id, connection_id = id, "Real-time connection joined");
        Ok((id, rx, joined))
    }

    pub fn disconnect(&self, session_id: &str, connection_id: ConnectionId) {
        self.connections.deregister(session_id, connection_id);
        info!(session_id = %session_id, connection_id, "Real-time connection closed");
    }

    /// Current state as a `joined` event; used on handshake and resync.
    pub async fn joined_event(&self, session_id: &str) -> Result<ServerEvent> {
        let snapshot = self.snapshot(session_id).await?;
        Ok(ServerEvent::Joined {
            session_id: snapshot.session_id.clone(),
            current_node: snapshot.current_node.clone(),
            snapshot,
        })
    }

    /// Dispatch one inbound real-time event from a registered connection.
    ///
    /// Replies reach the connection through its event stream; failures become
    /// `error` events and never close the connection.
    pub async fn handle_client_event(&self, session_id: &str, connection_id: ConnectionId, event: ClientEvent) {
        let origin = Origin::Realtime(connection_id);
        match event {
            ClientEvent::Message { content } => {
                // Success and failure are both delivered by the fan-out.
                let _ = self.turn(session_id, &content, origin).await;
            }
            ClientEvent::Choice { choice_id } => {
                let _ = self.choose(session_id, &choice_id, origin).await;
            }
            ClientEvent::Resync => {
                let event = match self.joined_event(session_id).await {
                    Ok(event) => event,
                    Err(e) => ServerEvent::Error(e.to_payload()),
                };
                self.connections.send_to(session_id, connection_id, event);
            }
            ClientEvent::Ping => {
                self.connections
                    .send_to(session_id, connection_id, ServerEvent::Pong);
            }
        }
    }

    // === Internals ===

    /// Answer the initiator, then broadcast to the session's other connections.
    fn publish<T>(&self, session_id: &str, origin: Origin, result: Result<(T, Fanout)>) -> Result<T> {
        match result {
            Ok((reply, fanout)) => {
                if let Some(conn) = origin.connection() {
                    for event in fanout.initiator {
                        self.connections.send_to(session_id, conn, event);
                    }
                }
                let deliveries: usize = fanout
                    .others
                    .iter()
                    .map(|event| self.connections.broadcast(session_id, origin.connection(), event))
                    .sum();
                debug!(session_id = %session_id, deliveries, "Fan-out delivered");
                Ok(reply)
            }
            Err(err) => {
                if let Some(conn) = origin.connection() {
                    self.connections
                        .send_to(session_id, conn, ServerEvent::Error(err.to_payload()));
                }
                Err(err)
            }
        }
    }

    async fn turn_locked(
        &self,
        session_id: &str,
        text: &str,
        deadline: Option<Instant>,
    ) -> Result<(TurnReply, Fanout)> {
        let _permit = self.gate.acquire(session_id).await?;
        let session = self.store.get_session(session_id).await?;

        let outcome = self.orchestrator.run_turn(&session, text, deadline).await?;

        // The turn has landed; the reads below only decorate the reply.
        let node_updated = match self.store.get_session(session_id).await {
            Ok(after) if after.current_node_id != session.current_node_id => {
                self.current_node(&after).await.unwrap_or_else(|e| {
                    warn!(session_id = %session_id, error = %e, "Failed to load updated node");
                    None
                })
            }
            Ok(_) => None,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to reload session after turn");
                None
            }
        };
        let progress = self
            .turn_progress(&session, &outcome.invocations)
            .await
            .unwrap_or_else(|e| {
                warn!(session_id = %session_id, error = %e, "Failed to load turn progress");
                None
            });

        let reply = TurnReply {
            message: outcome.message,
            tool_results: outcome.invocations,
            node_updated,
            progress,
        };

        let assistant = ServerEvent::Message {
            session_id: session_id.to_string(),
            role: ChatRole::Assistant,
            content: reply.message.content.clone(),
            message_id: Some(reply.message.id.clone()),
        };
        let mut updates = Vec::new();
        if let Some(node) = &reply.node_updated {
            updates.push(node_event(session_id, node));
        }
        if let Some(progress) = &reply.progress {
            updates.push(progress_event(&session.learner_id, progress));
        }

        let mut initiator = vec![assistant.clone()];
        initiator.extend(updates.iter().cloned());
        let mut others = vec![
            ServerEvent::Message {
                session_id: session_id.to_string(),
                role: ChatRole::User,
                content: text.to_string(),
                message_id: None,
            },
            assistant,
        ];
        others.extend(updates);

        Ok((reply, Fanout { initiator, others }))
    }

    async fn choose_locked(&self, session_id: &str, choice_id: &str) -> Result<(ChoiceReply, Fanout)> {
        let _permit = self.gate.acquire(session_id).await?;
        let outcome = self.navigator.resolve_choice(session_id, choice_id).await?;
        let learner_id = &outcome.session.learner_id;

        let mut mastery_updates = Vec::new();
        let adjustments = outcome
            .choice
            .reveals_gap
            .iter()
            .map(|c| (c, -self.config.choice_gap_penalty, "revealed a gap"))
            .chain(
                outcome
                    .choice
                    .confirms_mastery
                    .iter()
                    .map(|c| (c, self.config.choice_mastery_bonus, "confirmed mastery")),
            );
        for (concept, amount, what) in adjustments {
            let evidence = format!("choice:{} {} in {}", choice_id, what, concept);
            match self.tracker.adjust(learner_id, concept, amount, &evidence).await {
                Ok(delta) => mastery_updates.push(delta),
                // The move already happened; report and keep going.
                Err(e) => error!(
                    session_id = %session_id,
                    concept = %concept,
                    error = %e,
                    "Choice mastery follow-up failed"
                ),
            }
        }

        let mut events = vec![node_event(session_id, &outcome.node)];
        if !mastery_updates.is_empty() {
            match self.store.get_learner(learner_id).await {
                Ok(learner) => events.push(progress_event(
                    learner_id,
                    &ProgressUpdate {
                        concepts: mastery_updates.iter().map(ConceptScore::from).collect(),
                        gaps: learner.gaps,
                    },
                )),
                Err(e) => warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to load progress after choice"
                ),
            }
        }

        let reply = ChoiceReply {
            next_node: outcome.node,
            mastery_updates,
            path_history: outcome.session.path_history,
        };
        Ok((
            reply,
            Fanout {
                initiator: events.clone(),
                others: events,
            },
        ))
    }

    /// Progress delta from a turn's successful mastery tools.
    async fn turn_progress(
        &self,
        session: &Session,
        invocations: &[ToolInvocation],
    ) -> Result<Option<ProgressUpdate>> {
        let touched: Vec<&ToolInvocation> = invocations
            .iter()
            .filter(|i| i.result.success)
            .filter(|i| matches!(i.tool_name.as_str(), "update_mastery" | "identify_gaps"))
            .collect();
        if touched.is_empty() {
            return Ok(None);
        }

        let concepts = touched
            .iter()
            .filter(|i| i.tool_name == "update_mastery")
            .filter_map(|i| i.result.data.clone())
            .filter_map(|data| serde_json::from_value::<MasteryDelta>(data).ok())
            .map(|delta| ConceptScore::from(&delta))
            .collect();
        let learner = self.store.get_learner(&session.learner_id).await?;
        Ok(Some(ProgressUpdate {
            concepts,
            gaps: learner.gaps,
        }))
    }

    async fn current_node(&self, session: &Session) -> Result<Option<NarrativeNode>> {
        match &session.current_node_id {
            Some(id) => match self.store.get_node(id).await {
                Ok(node) => Ok(Some(node)),
                Err(StoreError::NotFound(_)) => {
                    warn!(session_id = %session.id, node_id = %id, "Current node missing from graph");
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            },
            None => Ok(None),
        }
    }

    async fn check_learner(&self, learner_id: &str, tenant_id: &str) -> Result<()> {
        let learner = self.store.get_learner(learner_id).await?;
        if learner.tenant_id != tenant_id {
            return Err(EngineError::PermissionDenied(format!(
                "learner {} belongs to another tenant",
                learner_id
            )));
        }
        Ok(())
    }
}

/// Run `work` on its own task so caller cancellation cannot interrupt it.
async fn run_detached<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Session task aborted");
            Err(EngineError::System(format!("session task aborted: {}", e)))
        }
    }
}

fn node_event(session_id: &str, node: &NarrativeNode) -> ServerEvent {
    ServerEvent::NodeUpdated {
        session_id: session_id.to_string(),
        node_id: node.id.clone(),
        node: node.clone(),
    }
}

fn progress_event(learner_id: &str, progress: &ProgressUpdate) -> ServerEvent {
    ServerEvent::ProgressUpdated {
        learner_id: learner_id.to_string(),
        concepts: progress.concepts.clone(),
        gaps: progress.gaps.clone(),
    }
}
