//! Narrative navigator - moves a session through the narrative graph.
//!
//! Three ways to change a session's position, kept deliberately separate:
//!
//! - [`NarrativeNavigator::resolve_choice`] follows a choice of the current node.
//! - [`NarrativeNavigator::enter_node`] places a session on a node without a
//!   choice (session start).
//! - [`NarrativeNavigator::override_path`] is the tutor-driven jump used by
//!   `adapt_narrative`. It trusts its input: no choice or prerequisite checks.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::model::{Choice, Learner, NarrativeNode, Session};
use crate::store::{NarrativeStore, StoreError};

/// Result of following a choice.
#[derive(Debug, Clone)]
pub struct NavigationOutcome {
    /// Session after the move
    pub session: Session,
    /// Node the session now points at
    pub node: NarrativeNode,
    /// The choice that was followed
    pub choice: Choice,
}

/// Result of a tutor-driven path override.
#[derive(Debug, Clone)]
pub struct PathOverride {
    pub session: Session,
    /// Node jumped to, when the first entry resolved
    pub jumped_to: Option<NarrativeNode>,
}

/// Resolves choices and owns every write to a session's position.
pub struct NarrativeNavigator {
    store: Arc<dyn NarrativeStore>,
}

impl NarrativeNavigator {
    pub fn new(store: Arc<dyn NarrativeStore>) -> Self {
        Self { store }
    }

    /// Follow `choice_id` from the session's current node.
    pub async fn resolve_choice(&self, session_id: &str, choice_id: &str) -> Result<NavigationOutcome> {
        let session = self.store.get_session(session_id).await?;
        if session.is_completed() {
            return Err(EngineError::InvalidState(format!(
                "session {} is completed",
                session_id
            )));
        }

        let current_id = session
            .current_node_id
            .clone()
            .ok_or_else(|| EngineError::NoCurrentNode(session_id.to_string()))?;

        let current = match self.store.get_node(&current_id).await {
            Ok(node) => node,
            Err(StoreError::NotFound(_)) => {
                // Dangling pointer: nothing to choose from.
                warn!(session_id = %session_id, node_id = %current_id, "Current node missing from graph");
                return Err(EngineError::NoCurrentNode(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let choice = current
            .choice(choice_id)
            .cloned()
            .ok_or_else(|| EngineError::ChoiceNotFound(choice_id.to_string()))?;

        let target = match self.store.get_node(&choice.target_node_id).await {
            Ok(node) if node.tenant_id == session.tenant_id => node,
            Ok(_) | Err(StoreError::NotFound(_)) => {
                return Err(EngineError::TargetNodeNotFound(choice.target_node_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let session = match self
            .store
            .advance_session(session_id, &target.id, Some(choice_id), Some(&current_id))
            .await
        {
            Ok(session) => session,
            // Someone moved the session while we were resolving; the choice
            // no longer belongs to the current node.
            Err(StoreError::Conflict(reason)) => {
                debug!(session_id = %session_id, reason = %reason, "Choice went stale");
                if self.store.get_session(session_id).await?.is_completed() {
                    return Err(EngineError::InvalidState(reason));
                }
                return Err(EngineError::ChoiceNotFound(choice_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            session_id = %session_id,
            from = %current_id,
            to = %target.id,
            choice_id = %choice_id,
            "Choice resolved"
        );

        Ok(NavigationOutcome {
            session,
            node: target,
            choice,
        })
    }

    /// Pick the node a new session should start on.
    ///
    /// Nodes whose prerequisites the learner has mastered win, in graph
    /// insertion order. Otherwise any node in scope is used and a warning is
    /// logged. `None` means the tenant has no narrative yet.
    pub async fn select_start_node(
        &self,
        tenant_id: &str,
        learner: &Learner,
    ) -> Result<Option<NarrativeNode>> {
        let nodes = self.store.nodes_in_scope(tenant_id).await?;

        if let Some(node) = nodes.iter().find(|n| n.is_unlocked_for(learner)) {
            return Ok(Some(node.clone()));
        }

        match nodes.into_iter().next() {
            Some(node) => {
                warn!(
                    tenant_id = %tenant_id,
                    learner_id = %learner.id,
                    node_id = %node.id,
                    "No unlocked start node; falling back to first node in scope"
                );
                Ok(Some(node))
            }
            None => {
                debug!(tenant_id = %tenant_id, "Narrative library is empty");
                Ok(None)
            }
        }
    }

    /// Place a session on `node_id` without a choice.
    pub async fn enter_node(&self, session_id: &str, node_id: &str) -> Result<Session> {
        Ok(self
            .store
            .advance_session(session_id, node_id, None, None)
            .await?)
    }

    /// Append `entries` verbatim to the path history and, if the first entry
    /// resolves to a node of the session's tenant (by nugget id, then by node
    /// id), jump the current node there.
    pub async fn override_path(&self, session_id: &str, entries: &[String]) -> Result<PathOverride> {
        let session = self.store.get_session(session_id).await?;
        if session.is_completed() {
            return Err(EngineError::InvalidState(format!(
                "session {} is completed",
                session_id
            )));
        }

        let jumped_to = match entries.first() {
            Some(first) => self.resolve_entry(&session.tenant_id, first).await?,
            None => None,
        };

        let session = self
            .store
            .adapt_path(session_id, entries, jumped_to.as_ref().map(|n| n.id.as_str()))
            .await?;

        info!(
            session_id = %session_id,
            appended = entries.len(),
            jumped_to = ?jumped_to.as_ref().map(|n| &n.id),
            "Narrative path overridden"
        );

        Ok(PathOverride { session, jumped_to })
    }

    async fn resolve_entry(&self, tenant_id: &str, entry: &str) -> Result<Option<NarrativeNode>> {
        if let Some(node) = self.store.find_node_by_nugget(tenant_id, entry).await? {
            return Ok(Some(node));
        }
        match self.store.get_node(entry).await {
            Ok(node) if node.tenant_id == tenant_id => Ok(Some(node)),
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryMode;
    use crate::store::MemoryStore;
    use std::collections::BTreeSet;

    fn node(id: &str, tenant: &str, prereqs: &[&str], choices: Vec<Choice>) -> NarrativeNode {
        NarrativeNode {
            id: id.into(),
            tenant_id: tenant.into(),
            nugget_id: format!("nug-{}", id),
            prerequisites: prereqs.iter().map(|s| s.to_string()).collect(),
            adapts_to: vec![],
            choices,
        }
    }

    fn choice(id: &str, target: &str) -> Choice {
        Choice {
            id: id.into(),
            text: format!("go to {}", target),
            target_node_id: target.into(),
            reveals_gap: BTreeSet::new(),
            confirms_mastery: BTreeSet::new(),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, NarrativeNavigator, Session) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_node(node("a", "t", &[], vec![choice("to-b", "b"), choice("to-x", "x")]))
            .await
            .unwrap();
        store
            .insert_node(node("b", "t", &["basics"], vec![choice("to-a", "a")]))
            .await
            .unwrap();
        store.insert_node(node("x", "other", &[], vec![])).await.unwrap();

        let session = store
            .insert_session(Session::new("t", "l", DeliveryMode::Text))
            .await
            .unwrap();
        let navigator = NarrativeNavigator::new(store.clone());
        (store, navigator, session)
    }

    #[tokio::test]
    async fn test_no_current_node() {
        let (_, nav, session) = setup().await;
        let err = nav.resolve_choice(&session.id, "to-b").await.unwrap_err();
        assert_eq!(err, EngineError::NoCurrentNode(session.id.clone()));
    }

    #[tokio::test]
    async fn test_resolve_and_stale_choice() {
        let (store, nav, session) = setup().await;
        nav.enter_node(&session.id, "a").await.unwrap();

        let outcome = nav.resolve_choice(&session.id, "to-b").await.unwrap();
        assert_eq!(outcome.node.id, "b");
        assert_eq!(outcome.session.path_history, vec!["a", "b"]);

        // Same choice again: it belongs to "a", not "b".
        let err = nav.resolve_choice(&session.id, "to-b").await.unwrap_err();
        assert_eq!(err.error_type(), "ChoiceNotFound");

        let log = store.traversals(&session.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].choice_id.as_deref(), Some("to-b"));
    }

    #[tokio::test]
    async fn test_target_outside_tenant() {
        let (_, nav, session) = setup().await;
        nav.enter_node(&session.id, "a").await.unwrap();
        let err = nav.resolve_choice(&session.id, "to-x").await.unwrap_err();
        assert_eq!(err, EngineError::TargetNodeNotFound("x".into()));
    }

    #[tokio::test]
    async fn test_start_node_prefers_unlocked() {
        let (store, nav, _) = setup().await;
        let learner = Learner::new("t", "l");
        let start = nav.select_start_node("t", &learner).await.unwrap().unwrap();
        assert_eq!(start.id, "a");

        // Only locked nodes: falls back to the first one.
        store.insert_node(node("c", "locked", &["z"], vec![])).await.unwrap();
        let start = nav.select_start_node("locked", &learner).await.unwrap().unwrap();
        assert_eq!(start.id, "c");

        assert!(nav.select_start_node("empty", &learner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_override_path_appends_verbatim() {
        let (_, nav, session) = setup().await;
        nav.enter_node(&session.id, "a").await.unwrap();

        let entries = vec!["nug-b".to_string(), "not-a-node".to_string()];
        let result = nav.override_path(&session.id, &entries).await.unwrap();
        assert_eq!(result.jumped_to.map(|n| n.id), Some("b".to_string()));
        assert_eq!(result.session.current_node_id.as_deref(), Some("b"));
        assert_eq!(result.session.path_history, vec!["a", "nug-b", "not-a-node"]);

        // Unresolvable first entry: appended, position unchanged.
        let entries = vec!["ghost".to_string()];
        let result = nav.override_path(&session.id, &entries).await.unwrap();
        assert!(result.jumped_to.is_none());
        assert_eq!(result.session.current_node_id.as_deref(), Some("b"));
        assert_eq!(result.session.path_history.len(), 4);
    }

    #[tokio::test]
    async fn test_completed_session_is_terminal() {
        let (store, nav, session) = setup().await;
        nav.enter_node(&session.id, "a").await.unwrap();
        store.complete_session(&session.id).await.unwrap();

        let err = nav.resolve_choice(&session.id, "to-b").await.unwrap_err();
        assert_eq!(err.error_type(), "InvalidState");
        let err = nav.override_path(&session.id, &["nug-b".to_string()]).await.unwrap_err();
        assert_eq!(err.error_type(), "InvalidState");
    }
}
