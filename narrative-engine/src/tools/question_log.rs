//! Log of questions posed by the tutor, kept for later answer evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default number of retained questions.
const DEFAULT_CAPACITY: usize = 1_000;

/// A question asked during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionEntry {
    pub question_id: String,
    pub session_id: String,
    pub learner_id: String,
    pub question: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_answer: Option<String>,
    pub asked_at: DateTime<Utc>,
}

/// Bounded question log (newest first).
pub struct QuestionLog {
    entries: Arc<RwLock<VecDeque<QuestionEntry>>>,
    capacity: usize,
}

impl QuestionLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Record a question, pruning the oldest entries past capacity.
    pub async fn record(&self, entry: QuestionEntry) {
        let mut entries = self.entries.write().await;
        entries.push_front(entry);
        while entries.len() > self.capacity {
            entries.pop_back();
        }
    }

    /// Questions of one session, newest first.
    pub async fn for_session(&self, session_id: &str, limit: usize) -> Vec<QuestionEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn recent(&self, limit: usize) -> Vec<QuestionEntry> {
        let entries = self.entries.read().await;
        entries.iter().take(limit).cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for QuestionLog {
    fn default() -> Self {
        Self::new()
    }
}
