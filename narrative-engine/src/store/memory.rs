//! In-memory store backed by `DashMap`.
//!
//! Each record lives in its own map entry; atomic operations are performed
//! while holding the entry's write guard, so concurrent calls on the same
//! record serialize and calls on different records proceed in parallel.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use super::traits::{NarrativeStore, ScoreWrite, StoreError, StoreResult};
use crate::model::{
    Learner, MasteryEvent, NarrativeNode, Nugget, Session, SessionMessage, TraversalRecord,
};

/// Mastery events retained per learner.
const MAX_EVENTS_PER_LEARNER: usize = 1_000;

/// Entry wrapper that remembers insertion order.
struct Ordered<T> {
    seq: u64,
    value: T,
}

/// In-memory implementation of [`NarrativeStore`].
pub struct MemoryStore {
    learners: DashMap<String, Learner>,
    sessions: DashMap<String, Session>,
    nodes: DashMap<String, Ordered<NarrativeNode>>,
    nuggets: DashMap<String, Ordered<Nugget>>,
    messages: DashMap<String, Vec<SessionMessage>>,
    traversals: DashMap<String, Vec<TraversalRecord>>,
    mastery_events: DashMap<String, Vec<MasteryEvent>>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            learners: DashMap::new(),
            sessions: DashMap::new(),
            nodes: DashMap::new(),
            nuggets: DashMap::new(),
            messages: DashMap::new(),
            traversals: DashMap::new(),
            mastery_events: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn log_traversal(&self, session_id: &str, node_id: &str, choice_id: Option<&str>) {
        self.traversals
            .entry(session_id.to_string())
            .or_default()
            .push(TraversalRecord {
                session_id: session_id.to_string(),
                node_id: node_id.to_string(),
                choice_id: choice_id.map(str::to_string),
                visited_at: Utc::now(),
            });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn session_not_found(session_id: &str) -> StoreError {
    StoreError::NotFound(format!("session {}", session_id))
}

fn learner_not_found(learner_id: &str) -> StoreError {
    StoreError::NotFound(format!("learner {}", learner_id))
}

fn ensure_open(session: &Session) -> StoreResult<()> {
    if session.is_completed() {
        return Err(StoreError::Conflict(format!(
            "session {} is completed",
            session.id
        )));
    }
    Ok(())
}

#[async_trait]
impl NarrativeStore for MemoryStore {
    async fn get_learner(&self, learner_id: &str) -> StoreResult<Learner> {
        self.learners
            .get(learner_id)
            .map(|l| l.clone())
            .ok_or_else(|| learner_not_found(learner_id))
    }

    async fn ensure_learner(&self, tenant_id: &str, learner_id: &str) -> StoreResult<Learner> {
        let entry = self
            .learners
            .entry(learner_id.to_string())
            .or_insert_with(|| Learner::new(tenant_id, learner_id));
        Ok(entry.clone())
    }

    async fn upsert_concept_score(
        &self,
        learner_id: &str,
        concept: &str,
        score: f64,
    ) -> StoreResult<ScoreWrite> {
        let mut learner = self
            .learners
            .get_mut(learner_id)
            .ok_or_else(|| learner_not_found(learner_id))?;
        let previous = learner.mastery.insert(concept.to_string(), score);
        Ok(ScoreWrite {
            previous,
            current: score,
        })
    }

    async fn add_gap(&self, learner_id: &str, concept: &str) -> StoreResult<bool> {
        let mut learner = self
            .learners
            .get_mut(learner_id)
            .ok_or_else(|| learner_not_found(learner_id))?;
        Ok(learner.gaps.insert(concept.to_string()))
    }

    async fn remove_gap(&self, learner_id: &str, concept: &str) -> StoreResult<bool> {
        let mut learner = self
            .learners
            .get_mut(learner_id)
            .ok_or_else(|| learner_not_found(learner_id))?;
        Ok(learner.gaps.remove(concept))
    }

    async fn set_gaps(&self, learner_id: &str, gaps: BTreeSet<String>) -> StoreResult<()> {
        let mut learner = self
            .learners
            .get_mut(learner_id)
            .ok_or_else(|| learner_not_found(learner_id))?;
        learner.gaps = gaps;
        Ok(())
    }

    async fn record_mastery_event(&self, event: MasteryEvent) -> StoreResult<()> {
        let mut events = self
            .mastery_events
            .entry(event.learner_id.clone())
            .or_default();
        events.push(event);
        if events.len() > MAX_EVENTS_PER_LEARNER {
            let overflow = events.len() - MAX_EVENTS_PER_LEARNER;
            events.drain(..overflow);
        }
        Ok(())
    }

    async fn recent_mastery_events(
        &self,
        learner_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<MasteryEvent>> {
        Ok(self
            .mastery_events
            .get(learner_id)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_session(&self, session: Session) -> StoreResult<Session> {
        if self.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Session> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| session_not_found(session_id))
    }

    async fn touch_session(&self, session_id: &str) -> StoreResult<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        session.last_activity_at = Utc::now();
        Ok(())
    }

    async fn complete_session(&self, session_id: &str) -> StoreResult<Session> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        ensure_open(&session)?;
        let now = Utc::now();
        session.completed_at = Some(now);
        session.last_activity_at = now;
        Ok(session.clone())
    }

    async fn advance_session(
        &self,
        session_id: &str,
        node_id: &str,
        choice_id: Option<&str>,
        expected_current: Option<&str>,
    ) -> StoreResult<Session> {
        let snapshot = {
            let mut session = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| session_not_found(session_id))?;
            ensure_open(&session)?;

            if let Some(expected) = expected_current {
                if session.current_node_id.as_deref() != Some(expected) {
                    return Err(StoreError::Conflict(format!(
                        "session {} moved away from node {}",
                        session_id, expected
                    )));
                }
            }

            session.current_node_id = Some(node_id.to_string());
            session.path_history.push(node_id.to_string());
            session.last_activity_at = Utc::now();

            // Logged while the session entry is still held so traversal order
            // matches path order.
            self.log_traversal(session_id, node_id, choice_id);
            session.clone()
        };
        Ok(snapshot)
    }

    async fn adapt_path(
        &self,
        session_id: &str,
        entries: &[String],
        jump_to: Option<&str>,
    ) -> StoreResult<Session> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        ensure_open(&session)?;

        session.path_history.extend(entries.iter().cloned());
        if let Some(node_id) = jump_to {
            session.current_node_id = Some(node_id.to_string());
            self.log_traversal(session_id, node_id, None);
        }
        session.last_activity_at = Utc::now();
        Ok(session.clone())
    }

    async fn traversals(&self, session_id: &str) -> StoreResult<Vec<TraversalRecord>> {
        if !self.sessions.contains_key(session_id) {
            return Err(session_not_found(session_id));
        }
        Ok(self
            .traversals
            .get(session_id)
            .map(|t| t.clone())
            .unwrap_or_default())
    }

    async fn insert_node(&self, node: NarrativeNode) -> StoreResult<()> {
        let seq = self.next_seq();
        self.nodes
            .insert(node.id.clone(), Ordered { seq, value: node });
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> StoreResult<NarrativeNode> {
        self.nodes
            .get(node_id)
            .map(|n| n.value.clone())
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))
    }

    async fn nodes_in_scope(&self, tenant_id: &str) -> StoreResult<Vec<NarrativeNode>> {
        let mut nodes: Vec<(u64, NarrativeNode)> = self
            .nodes
            .iter()
            .filter(|n| n.value.tenant_id == tenant_id)
            .map(|n| (n.seq, n.value.clone()))
            .collect();
        nodes.sort_by_key(|(seq, _)| *seq);
        Ok(nodes.into_iter().map(|(_, n)| n).collect())
    }

    async fn find_node_by_nugget(
        &self,
        tenant_id: &str,
        nugget_id: &str,
    ) -> StoreResult<Option<NarrativeNode>> {
        Ok(self
            .nodes_in_scope(tenant_id)
            .await?
            .into_iter()
            .find(|n| n.nugget_id == nugget_id))
    }

    async fn append_message(&self, mut message: SessionMessage) -> StoreResult<SessionMessage> {
        if !self.sessions.contains_key(&message.session_id) {
            return Err(session_not_found(&message.session_id));
        }
        let mut log = self
            .messages
            .entry(message.session_id.clone())
            .or_default();
        message.sequence = self.next_seq();
        log.push(message.clone());
        Ok(message)
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<SessionMessage>> {
        let Some(log) = self.messages.get(session_id) else {
            return Ok(Vec::new());
        };
        let mut recent: Vec<SessionMessage> = log.iter().rev().take(limit).cloned().collect();
        recent.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(recent)
    }

    async fn insert_nugget(&self, nugget: Nugget) -> StoreResult<()> {
        let seq = self.next_seq();
        self.nuggets
            .insert(nugget.id.clone(), Ordered { seq, value: nugget });
        Ok(())
    }

    async fn get_nugget(&self, nugget_id: &str) -> StoreResult<Nugget> {
        self.nuggets
            .get(nugget_id)
            .map(|n| n.value.clone())
            .ok_or_else(|| StoreError::NotFound(format!("nugget {}", nugget_id)))
    }

    async fn search_nuggets(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Nugget>> {
        let needle = query.trim().to_lowercase();

        // Title matches rank ahead of body/tag matches.
        let mut hits: Vec<(bool, u64, Nugget)> = self
            .nuggets
            .iter()
            .filter(|n| n.value.tenant_id == tenant_id && n.value.is_ready())
            .filter_map(|n| {
                let nugget = &n.value;
                let in_title = nugget.title.to_lowercase().contains(&needle);
                let elsewhere = nugget.content.to_lowercase().contains(&needle)
                    || nugget
                        .tags
                        .iter()
                        .any(|t| t.to_lowercase().contains(&needle));
                (in_title || elsewhere).then(|| (!in_title, n.seq, nugget.clone()))
            })
            .collect();

        hits.sort_by_key(|(not_title, seq, _)| (*not_title, *seq));
        Ok(hits.into_iter().take(limit).map(|(_, _, n)| n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatRole, DeliveryMode, NuggetStatus};

    fn nugget(id: &str, tenant: &str, title: &str, status: NuggetStatus) -> Nugget {
        Nugget {
            id: id.into(),
            tenant_id: tenant.into(),
            title: title.into(),
            content: format!("{} body", title),
            status,
            image_url: None,
            audio_url: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_advance_appends_and_logs() {
        let store = MemoryStore::new();
        let session = store
            .insert_session(Session::new("t", "l", DeliveryMode::Text))
            .await
            .unwrap();

        store.advance_session(&session.id, "a", None, None).await.unwrap();
        let updated = store
            .advance_session(&session.id, "b", Some("c1"), Some("a"))
            .await
            .unwrap();

        assert_eq!(updated.current_node_id.as_deref(), Some("b"));
        assert_eq!(updated.path_history, vec!["a", "b"]);

        let log = store.traversals(&session.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].choice_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_advance_conditional_write() {
        let store = MemoryStore::new();
        let session = store
            .insert_session(Session::new("t", "l", DeliveryMode::Text))
            .await
            .unwrap();
        store.advance_session(&session.id, "a", None, None).await.unwrap();

        let stale = store
            .advance_session(&session.id, "b", Some("c1"), Some("z"))
            .await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));
        assert_eq!(store.get_session(&session.id).await.unwrap().path_history, vec!["a"]);
    }

    #[tokio::test]
    async fn test_completed_session_rejects_mutation() {
        let store = MemoryStore::new();
        let session = store
            .insert_session(Session::new("t", "l", DeliveryMode::Text))
            .await
            .unwrap();
        store.complete_session(&session.id).await.unwrap();

        assert!(matches!(
            store.advance_session(&session.id, "a", None, None).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.adapt_path(&session.id, &["x".to_string()], None).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.complete_session(&session.id).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_messages_ascending() {
        let store = MemoryStore::new();
        let session = store
            .insert_session(Session::new("t", "l", DeliveryMode::Text))
            .await
            .unwrap();

        for i in 0..5 {
            store
                .append_message(SessionMessage::new(&session.id, ChatRole::User, format!("m{}", i)))
                .await
                .unwrap();
        }

        let recent = store.recent_messages(&session.id, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_search_scoped_to_tenant_and_ready() {
        let store = MemoryStore::new();
        store
            .insert_nugget(nugget("n1", "t", "Borrowing rules", NuggetStatus::Ready))
            .await
            .unwrap();
        store
            .insert_nugget(nugget("n2", "t", "Borrowing drafts", NuggetStatus::Processing))
            .await
            .unwrap();
        store
            .insert_nugget(nugget("n3", "other", "Borrowing elsewhere", NuggetStatus::Ready))
            .await
            .unwrap();

        let hits = store.search_nuggets("t", "BORROW", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "n1");
    }

    #[tokio::test]
    async fn test_upsert_reports_previous() {
        let store = MemoryStore::new();
        store.ensure_learner("t", "l").await.unwrap();

        let first = store.upsert_concept_score("l", "x", 40.0).await.unwrap();
        assert_eq!(first.previous, None);
        let second = store.upsert_concept_score("l", "x", 10.0).await.unwrap();
        assert_eq!(second.previous, Some(40.0));
    }
}
