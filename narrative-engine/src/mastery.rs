//! Mastery tracker - owns per-concept scores and the knowledge-gap set.
//!
//! Two distinct gap rules live here and must stay separate:
//!
//! - [`MasteryTracker::apply_update`] applies hysteresis per event: a concept
//!   enters the gap set only when its score falls from `>= 30` to `< 30`, and
//!   leaves only when it climbs from `< 70` to `>= 70`.
//! - [`MasteryTracker::identify_gaps`] recomputes the set wholesale: every
//!   concept scored below 50 is a gap.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::{
    clamp_score, MasteryEvent, GAP_THRESHOLD, MASTERY_THRESHOLD, RECOMPUTE_GAP_THRESHOLD,
};
use crate::store::NarrativeStore;

/// How an update changed gap-set membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapTransition {
    Added,
    Removed,
    Unchanged,
}

/// Outcome of a single mastery update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasteryDelta {
    pub concept: String,
    pub previous: f64,
    pub score: f64,
    pub delta: f64,
    pub gap_transition: GapTransition,
    /// Gap membership after the update
    pub is_gap: bool,
}

/// Learner progress view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerProgress {
    pub learner_id: String,
    pub mastery: BTreeMap<String, f64>,
    pub gaps: BTreeSet<String>,
    /// Newest first
    pub recent_events: Vec<MasteryEvent>,
    pub generated_at: DateTime<Utc>,
}

/// Gap-set rule for a single update.
pub fn gap_transition(previous: f64, score: f64) -> GapTransition {
    if previous >= GAP_THRESHOLD && score < GAP_THRESHOLD {
        GapTransition::Added
    } else if previous < MASTERY_THRESHOLD && score >= MASTERY_THRESHOLD {
        GapTransition::Removed
    } else {
        GapTransition::Unchanged
    }
}

/// Held per-learner lock. Releasing it drops the map entry once no other
/// caller holds or waits on the same learner.
struct LearnerGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    learner_id: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LearnerGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(self.learner_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Owns learners' mastery maps and gap sets.
///
/// Read-modify-write sequences are serialized per learner, so concurrent
/// updates for the same learner (even from different sessions) never lose
/// a write or apply a gap transition against a stale previous score.
pub struct MasteryTracker {
    store: Arc<dyn NarrativeStore>,
    learner_locks: DashMap<String, Arc<Mutex<()>>>,
    recent_events_limit: usize,
}

impl MasteryTracker {
    pub fn new(store: Arc<dyn NarrativeStore>) -> Self {
        Self {
            store,
            learner_locks: DashMap::new(),
            recent_events_limit: 10,
        }
    }

    /// Number of events returned by [`Self::get_progress`].
    pub fn with_recent_events_limit(mut self, limit: usize) -> Self {
        self.recent_events_limit = limit;
        self
    }

    async fn lock_learner<'a>(&'a self, learner_id: &'a str) -> LearnerGuard<'a> {
        let lock = Arc::clone(
            self.learner_locks
                .entry(learner_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        LearnerGuard {
            locks: &self.learner_locks,
            learner_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Learners with a pending or running update.
    pub fn locked_learners(&self) -> usize {
        self.learner_locks.len()
    }

    /// Apply one scored observation for a concept.
    pub async fn apply_update(
        &self,
        learner_id: &str,
        concept: &str,
        new_score: f64,
        evidence: &str,
    ) -> Result<MasteryDelta> {
        self.apply_with(learner_id, concept, evidence, |_| new_score)
            .await
    }

    /// Shift a concept's score by `amount` relative to its current value.
    pub async fn adjust(
        &self,
        learner_id: &str,
        concept: &str,
        amount: f64,
        evidence: &str,
    ) -> Result<MasteryDelta> {
        self.apply_with(learner_id, concept, evidence, |current| {
            current.unwrap_or(0.0) + amount
        })
        .await
    }

    async fn apply_with(
        &self,
        learner_id: &str,
        concept: &str,
        evidence: &str,
        compute: impl FnOnce(Option<f64>) -> f64,
    ) -> Result<MasteryDelta> {
        let concept = concept.trim();
        if concept.is_empty() {
            return Err(EngineError::Validation("concept must not be empty".into()));
        }

        let _guard = self.lock_learner(learner_id).await;

        let learner = self.store.get_learner(learner_id).await?;
        let score = clamp_score(compute(learner.mastery.get(concept).copied()));

        let write = self
            .store
            .upsert_concept_score(learner_id, concept, score)
            .await?;
        let previous = write.previous.unwrap_or(0.0);

        let transition = gap_transition(previous, score);
        let mut is_gap = learner.gaps.contains(concept);
        match transition {
            GapTransition::Added => {
                self.store.add_gap(learner_id, concept).await?;
                is_gap = true;
            }
            GapTransition::Removed => {
                self.store.remove_gap(learner_id, concept).await?;
                is_gap = false;
            }
            GapTransition::Unchanged => {}
        }

        let delta = score - previous;
        self.store
            .record_mastery_event(MasteryEvent {
                learner_id: learner_id.to_string(),
                concept: concept.to_string(),
                previous,
                score,
                delta,
                evidence: evidence.to_string(),
                recorded_at: Utc::now(),
            })
            .await?;

        debug!(
            learner_id = %learner_id,
            concept = %concept,
            previous,
            score,
            transition = ?transition,
            "Mastery updated"
        );

        Ok(MasteryDelta {
            concept: concept.to_string(),
            previous,
            score,
            delta,
            gap_transition: transition,
            is_gap,
        })
    }

    /// Recompute the gap set from scratch (score below 50 is a gap).
    pub async fn identify_gaps(&self, learner_id: &str) -> Result<BTreeSet<String>> {
        let _guard = self.lock_learner(learner_id).await;

        let learner = self.store.get_learner(learner_id).await?;
        let gaps: BTreeSet<String> = learner
            .mastery
            .iter()
            .filter(|(_, score)| **score < RECOMPUTE_GAP_THRESHOLD)
            .map(|(concept, _)| concept.clone())
            .collect();

        self.store.set_gaps(learner_id, gaps.clone()).await?;
        info!(learner_id = %learner_id, gaps = gaps.len(), "Knowledge gaps recomputed");
        Ok(gaps)
    }

    /// Mastery map, gap set and recent events without side effects.
    pub async fn get_progress(&self, learner_id: &str) -> Result<LearnerProgress> {
        let learner = self.store.get_learner(learner_id).await?;
        let recent_events = self
            .store
            .recent_mastery_events(learner_id, self.recent_events_limit)
            .await?;

        Ok(LearnerProgress {
            learner_id: learner.id,
            mastery: learner.mastery,
            gaps: learner.gaps,
            recent_events,
            generated_at: Utc::now(),
        })
    }
}
