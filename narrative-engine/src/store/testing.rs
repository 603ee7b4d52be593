//! Store wrapper with injectable latency and read failures.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::memory::MemoryStore;
use super::traits::{NarrativeStore, ScoreWrite, StoreError, StoreResult};
use crate::model::{
    ChatRole, Learner, MasteryEvent, NarrativeNode, Nugget, Session, SessionMessage,
    TraversalRecord,
};

pub(crate) struct FaultyStore {
    pub inner: MemoryStore,
    gap_delay: Duration,
    fail_learner_reads_after_reply: bool,
    replied: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            gap_delay: Duration::ZERO,
            fail_learner_reads_after_reply: false,
            replied: AtomicBool::new(false),
        }
    }

    /// Delay every gap-set write.
    pub fn with_gap_delay(mut self, delay: Duration) -> Self {
        self.gap_delay = delay;
        self
    }

    /// Fail learner reads once an assistant message has been stored.
    pub fn failing_learner_reads_after_reply(mut self) -> Self {
        self.fail_learner_reads_after_reply = true;
        self
    }
}

#[async_trait]
impl NarrativeStore for FaultyStore {
    async fn get_learner(&self, learner_id: &str) -> StoreResult<Learner> {
        if self.fail_learner_reads_after_reply && self.replied.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("learner read failed".into()));
        }
        self.inner.get_learner(learner_id).await
    }

    async fn ensure_learner(&self, tenant_id: &str, learner_id: &str) -> StoreResult<Learner> {
        self.inner.ensure_learner(tenant_id, learner_id).await
    }

    async fn upsert_concept_score(
        &self,
        learner_id: &str,
        concept: &str,
        score: f64,
    ) -> StoreResult<ScoreWrite> {
        self.inner.upsert_concept_score(learner_id, concept, score).await
    }

    async fn add_gap(&self, learner_id: &str, concept: &str) -> StoreResult<bool> {
        tokio::time::sleep(self.gap_delay).await;
        self.inner.add_gap(learner_id, concept).await
    }

    async fn remove_gap(&self, learner_id: &str, concept: &str) -> StoreResult<bool> {
        tokio::time::sleep(self.gap_delay).await;
        self.inner.remove_gap(learner_id, concept).await
    }

    async fn set_gaps(&self, learner_id: &str, gaps: BTreeSet<String>) -> StoreResult<()> {
        self.inner.set_gaps(learner_id, gaps).await
    }

    async fn record_mastery_event(&self, event: MasteryEvent) -> StoreResult<()> {
        self.inner.record_mastery_event(event).await
    }

    async fn recent_mastery_events(
        &self,
        learner_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<MasteryEvent>> {
        self.inner.recent_mastery_events(learner_id, limit).await
    }

    async fn insert_session(&self, session: Session) -> StoreResult<Session> {
        self.inner.insert_session(session).await
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Session> {
        self.inner.get_session(session_id).await
    }

    async fn touch_session(&self, session_id: &str) -> StoreResult<()> {
        self.inner.touch_session(session_id).await
    }

    async fn complete_session(&self, session_id: &str) -> StoreResult<Session> {
        self.inner.complete_session(session_id).await
    }

    async fn advance_session(
        &self,
        session_id: &str,
        node_id: &str,
        choice_id: Option<&str>,
        expected_current: Option<&str>,
    ) -> StoreResult<Session> {
        self.inner
            .advance_session(session_id, node_id, choice_id, expected_current)
            .await
    }

    async fn adapt_path(
        &self,
        session_id: &str,
        entries: &[String],
        jump_to: Option<&str>,
    ) -> StoreResult<Session> {
        self.inner.adapt_path(session_id, entries, jump_to).await
    }

    async fn traversals(&self, session_id: &str) -> StoreResult<Vec<TraversalRecord>> {
        self.inner.traversals(session_id).await
    }

    async fn insert_node(&self, node: NarrativeNode) -> StoreResult<()> {
        self.inner.insert_node(node).await
    }

    async fn get_node(&self, node_id: &str) -> StoreResult<NarrativeNode> {
        self.inner.get_node(node_id).await
    }

    async fn nodes_in_scope(&self, tenant_id: &str) -> StoreResult<Vec<NarrativeNode>> {
        self.inner.nodes_in_scope(tenant_id).await
    }

    async fn find_node_by_nugget(
        &self,
        tenant_id: &str,
        nugget_id: &str,
    ) -> StoreResult<Option<NarrativeNode>> {
        self.inner.find_node_by_nugget(tenant_id, nugget_id).await
    }

    async fn append_message(&self, message: SessionMessage) -> StoreResult<SessionMessage> {
        let assistant = message.role == ChatRole::Assistant;
        let stored = self.inner.append_message(message).await?;
        if assistant {
            self.replied.store(true, Ordering::SeqCst);
        }
        Ok(stored)
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<SessionMessage>> {
        self.inner.recent_messages(session_id, limit).await
    }

    async fn insert_nugget(&self, nugget: Nugget) -> StoreResult<()> {
        self.inner.insert_nugget(nugget).await
    }

    async fn get_nugget(&self, nugget_id: &str) -> StoreResult<Nugget> {
        self.inner.get_nugget(nugget_id).await
    }

    async fn search_nuggets(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Nugget>> {
        self.inner.search_nuggets(tenant_id, query, limit).await
    }
}
