//! Core data model: learners, nuggets, narrative graph, sessions, messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use tutor_agent::ToolCall;

use crate::tools::ToolInvocation;

/// Score at or above which a concept counts as mastered.
pub const MASTERY_THRESHOLD: f64 = 70.0;
/// Score below which a concept (re)enters the gap set during per-event updates.
pub const GAP_THRESHOLD: f64 = 30.0;
/// Score below which periodic recomputation flags a gap.
pub const RECOMPUTE_GAP_THRESHOLD: f64 = 50.0;
/// Lowest and highest storable scores.
pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

/// Clamp a score into `[0, 100]`; non-finite input becomes 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(MIN_SCORE, MAX_SCORE)
    } else {
        MIN_SCORE
    }
}

/// A learner and their mastery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Learner {
    pub id: String,
    pub tenant_id: String,
    /// Concept name to score in `[0, 100]`
    #[serde(default)]
    pub mastery: BTreeMap<String, f64>,
    /// Concepts flagged as knowledge gaps
    #[serde(default)]
    pub gaps: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Learner {
    pub fn new(tenant_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            mastery: BTreeMap::new(),
            gaps: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Concepts scored at or above the mastery threshold.
    pub fn mastered_concepts(&self) -> BTreeSet<&str> {
        self.mastery
            .iter()
            .filter(|(_, score)| **score >= MASTERY_THRESHOLD)
            .map(|(concept, _)| concept.as_str())
            .collect()
    }
}

/// Processing status of a nugget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NuggetStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

/// A unit of learning content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nugget {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub content: String,
    pub status: NuggetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Nugget {
    pub fn is_ready(&self) -> bool {
        self.status == NuggetStatus::Ready
    }
}

/// A labeled edge between narrative nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Choice {
    pub id: String,
    pub text: String,
    pub target_node_id: String,
    #[serde(default)]
    pub reveals_gap: BTreeSet<String>,
    #[serde(default)]
    pub confirms_mastery: BTreeSet<String>,
}

/// A vertex of the narrative graph, wrapping one nugget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeNode {
    pub id: String,
    pub tenant_id: String,
    pub nugget_id: String,
    /// Concepts that should be mastered before visiting
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Gap tags this node addresses
    #[serde(default)]
    pub adapts_to: Vec<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

impl NarrativeNode {
    /// Look up an outgoing choice.
    pub fn choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|c| c.id == choice_id)
    }

    /// Whether the learner meets every prerequisite (vacuously true when there are none).
    pub fn is_unlocked_for(&self, learner: &Learner) -> bool {
        let mastered = learner.mastered_concepts();
        self.prerequisites
            .iter()
            .all(|p| mastered.contains(p.as_str()))
    }
}

/// How content is delivered in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Text,
    Voice,
}

/// A learner's traversal through the narrative graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub learner_id: String,
    pub current_node_id: Option<String>,
    /// Append-only, oldest first
    pub path_history: Vec<String>,
    pub mode: DeliveryMode,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        tenant_id: impl Into<String>,
        learner_id: impl Into<String>,
        mode: DeliveryMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sess_{}", uuid::Uuid::new_v4().simple()),
            tenant_id: tenant_id.into(),
            learner_id: learner_id.into(),
            current_node_id: None,
            path_history: Vec::new(),
            mode,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Author of a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One entry of a session's append-only message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: String,
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolInvocation>,
    pub created_at: DateTime<Utc>,
    /// Store-assigned tiebreaker for messages created in the same instant
    #[serde(default)]
    pub sequence: u64,
}

impl SessionMessage {
    pub fn new(session_id: impl Into<String>, role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            session_id: session_id.into(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            created_at: Utc::now(),
            sequence: 0,
        }
    }

    pub fn with_tool_round(mut self, calls: Vec<ToolCall>, results: Vec<ToolInvocation>) -> Self {
        self.tool_calls = calls;
        self.tool_results = results;
        self
    }
}

/// Durable log entry for one node visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraversalRecord {
    pub session_id: String,
    pub node_id: String,
    pub choice_id: Option<String>,
    pub visited_at: DateTime<Utc>,
}

/// Audit entry for one mastery update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasteryEvent {
    pub learner_id: String,
    pub concept: String,
    pub previous: f64,
    pub score: f64,
    pub delta: f64,
    pub evidence: String,
    pub recorded_at: DateTime<Utc>,
}

/// Read-only view of a session for transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub learner_id: String,
    pub current_node: Option<NarrativeNode>,
    pub path_history: Vec<String>,
    pub mode: DeliveryMode,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn new(session: Session, current_node: Option<NarrativeNode>) -> Self {
        Self {
            session_id: session.id,
            learner_id: session.learner_id,
            current_node,
            path_history: session.path_history,
            mode: session.mode,
            started_at: session.started_at,
            last_activity_at: session.last_activity_at,
            completed_at: session.completed_at,
        }
    }
}
