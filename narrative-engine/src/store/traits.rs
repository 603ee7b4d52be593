//! Persistence contract consumed by the engine.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::model::{
    Learner, MasteryEvent, NarrativeNode, Nugget, Session, SessionMessage, TraversalRecord,
};

/// Errors from a persistence backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Record does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Conditional write lost or record is terminal
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of an atomic concept-score upsert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWrite {
    /// Score before the write (None for unseen concepts)
    pub previous: Option<f64>,
    /// Score after the write
    pub current: f64,
}

/// Tenant-scoped persistence for the narrative engine.
///
/// Operations documented as atomic must not interleave with concurrent
/// calls on the same record.
#[async_trait]
pub trait NarrativeStore: Send + Sync {
    // === Learners ===

    /// Fetch a learner.
    async fn get_learner(&self, learner_id: &str) -> StoreResult<Learner>;

    /// Fetch a learner, creating an empty one on first sight.
    async fn ensure_learner(&self, tenant_id: &str, learner_id: &str) -> StoreResult<Learner>;

    /// Atomically write one concept score, returning the previous value.
    async fn upsert_concept_score(
        &self,
        learner_id: &str,
        concept: &str,
        score: f64,
    ) -> StoreResult<ScoreWrite>;

    /// Add a concept to the gap set. Returns whether it was newly added.
    async fn add_gap(&self, learner_id: &str, concept: &str) -> StoreResult<bool>;

    /// Remove a concept from the gap set. Returns whether it was present.
    async fn remove_gap(&self, learner_id: &str, concept: &str) -> StoreResult<bool>;

    /// Replace the gap set wholesale.
    async fn set_gaps(&self, learner_id: &str, gaps: BTreeSet<String>) -> StoreResult<()>;

    /// Append a mastery audit event.
    async fn record_mastery_event(&self, event: MasteryEvent) -> StoreResult<()>;

    /// Most recent mastery events, newest first.
    async fn recent_mastery_events(
        &self,
        learner_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<MasteryEvent>>;

    // === Sessions ===

    async fn insert_session(&self, session: Session) -> StoreResult<Session>;

    async fn get_session(&self, session_id: &str) -> StoreResult<Session>;

    /// Bump the last-activity timestamp.
    async fn touch_session(&self, session_id: &str) -> StoreResult<()>;

    /// Mark a session completed. Fails with `Conflict` if already completed.
    async fn complete_session(&self, session_id: &str) -> StoreResult<Session>;

    /// Atomically move to `node_id`: set the current node, append it to the
    /// path history and log a traversal record.
    ///
    /// When `expected_current` is `Some`, the write only happens if the
    /// session's current node still equals it; otherwise `Conflict`.
    async fn advance_session(
        &self,
        session_id: &str,
        node_id: &str,
        choice_id: Option<&str>,
        expected_current: Option<&str>,
    ) -> StoreResult<Session>;

    /// Atomically append `entries` verbatim to the path history and, when
    /// `jump_to` is given, set the current node and log a traversal record
    /// without appending it again.
    async fn adapt_path(
        &self,
        session_id: &str,
        entries: &[String],
        jump_to: Option<&str>,
    ) -> StoreResult<Session>;

    /// Traversal log of a session, oldest first.
    async fn traversals(&self, session_id: &str) -> StoreResult<Vec<TraversalRecord>>;

    // === Narrative graph ===

    async fn insert_node(&self, node: NarrativeNode) -> StoreResult<()>;

    async fn get_node(&self, node_id: &str) -> StoreResult<NarrativeNode>;

    /// All nodes of a tenant in insertion order.
    async fn nodes_in_scope(&self, tenant_id: &str) -> StoreResult<Vec<NarrativeNode>>;

    /// Node wrapping the given nugget, if any.
    async fn find_node_by_nugget(
        &self,
        tenant_id: &str,
        nugget_id: &str,
    ) -> StoreResult<Option<NarrativeNode>>;

    // === Messages ===

    /// Append to the session log, assigning the ordering sequence.
    async fn append_message(&self, message: SessionMessage) -> StoreResult<SessionMessage>;

    /// Most recent `limit` messages, in ascending creation order.
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<SessionMessage>>;

    // === Nuggets ===

    async fn insert_nugget(&self, nugget: Nugget) -> StoreResult<()>;

    async fn get_nugget(&self, nugget_id: &str) -> StoreResult<Nugget>;

    /// Ready nuggets of a tenant matching `query`.
    async fn search_nuggets(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Nugget>>;
}
