//! Configuration for the narrative engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide tuning knobs.
///
/// Every field has a default so a partial YAML document is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of prior messages included in the model context
    pub history_window: usize,
    /// Number of mastery events returned with progress
    pub recent_events_limit: usize,
    /// Turns allowed to wait behind the in-flight turn of a session (0 = reject when busy)
    pub max_queued_turns: usize,
    /// Default deadline for one turn's model calls in ms (0 = none)
    pub turn_deadline_ms: u64,
    /// Upper bound for a single tool execution in ms
    pub tool_timeout_ms: u64,
    /// Hard ceiling for `search_nuggets` limit
    pub search_limit_max: usize,
    /// Score subtracted when a choice reveals a gap
    pub choice_gap_penalty: f64,
    /// Score added when a choice confirms mastery
    pub choice_mastery_bonus: f64,
    /// Entries retained in the question log
    pub question_log_capacity: usize,
    /// Buffered outbound events per real-time connection
    pub realtime_channel_capacity: usize,
    /// Model sampling temperature
    pub temperature: f32,
    /// Max tokens per model response
    pub max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            recent_events_limit: 10,
            max_queued_turns: 2,
            turn_deadline_ms: 60_000,
            tool_timeout_ms: 15_000,
            search_limit_max: 50,
            choice_gap_penalty: 20.0,
            choice_mastery_bonus: 20.0,
            question_log_capacity: 1_000,
            realtime_channel_capacity: 64,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

impl EngineConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Default turn deadline, if any.
    pub fn turn_deadline(&self) -> Option<Duration> {
        (self.turn_deadline_ms > 0).then(|| Duration::from_millis(self.turn_deadline_ms))
    }

    /// Per-tool execution bound.
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml("history_window: 5\nmax_queued_turns: 0\n").unwrap();
        assert_eq!(config.history_window, 5);
        assert_eq!(config.max_queued_turns, 0);
        assert_eq!(config.search_limit_max, 50);
    }

    #[test]
    fn test_zero_deadline_disables_it() {
        let config = EngineConfig {
            turn_deadline_ms: 0,
            ..Default::default()
        };
        assert!(config.turn_deadline().is_none());
        assert_eq!(
            EngineConfig::default().turn_deadline(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = EngineConfig::default().to_yaml().unwrap();
        assert_eq!(EngineConfig::from_yaml(&yaml).unwrap(), EngineConfig::default());
    }
}
