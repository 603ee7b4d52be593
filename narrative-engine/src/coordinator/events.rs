//! Real-time protocol events.
//!
//! Both directions are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ErrorPayload;
use crate::mastery::MasteryDelta;
use crate::model::{ChatRole, NarrativeNode, SessionSnapshot};

/// One concept score in a progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptScore {
    pub concept: String,
    pub score: f64,
}

impl From<&MasteryDelta> for ConceptScore {
    fn from(delta: &MasteryDelta) -> Self {
        Self {
            concept: delta.concept.clone(),
            score: delta.score,
        }
    }
}

/// Events pushed to real-time connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Sent once after the handshake and on every resync
    #[serde(rename_all = "camelCase")]
    Joined {
        session_id: String,
        current_node: Option<NarrativeNode>,
        snapshot: SessionSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        session_id: String,
        role: ChatRole,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    NodeUpdated {
        session_id: String,
        node_id: String,
        node: NarrativeNode,
    },
    #[serde(rename_all = "camelCase")]
    ProgressUpdated {
        learner_id: String,
        concepts: Vec<ConceptScore>,
        gaps: BTreeSet<String>,
    },
    Error(ErrorPayload),
    Pong,
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::Message { .. } => "message",
            ServerEvent::NodeUpdated { .. } => "nodeUpdated",
            ServerEvent::ProgressUpdated { .. } => "progressUpdated",
            ServerEvent::Error(_) => "error",
            ServerEvent::Pong => "pong",
        }
    }
}

/// Events received from real-time connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Learner utterance, drives a turn
    Message { content: String },
    /// Choice selection
    #[serde(rename_all = "camelCase")]
    Choice { choice_id: String },
    /// Re-fetch current session state
    Resync,
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use serde_json::json;

    #[test]
    fn test_client_event_parsing() {
        let event: ClientEvent =
            serde_json::from_value(json!({"type": "choice", "choiceId": "c1"})).unwrap();
        assert_eq!(event, ClientEvent::Choice { choice_id: "c1".into() });

        let event: ClientEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(event, ClientEvent::Ping);

        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn test_server_event_tags() {
        let event = ServerEvent::Error(EngineError::ChoiceNotFound("c9".into()).to_payload());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["errorType"], "ChoiceNotFound");

        let json = serde_json::to_value(ServerEvent::ProgressUpdated {
            learner_id: "l".into(),
            concepts: vec![ConceptScore { concept: "x".into(), score: 40.0 }],
            gaps: BTreeSet::new(),
        })
        .unwrap();
        assert_eq!(json["type"], "progressUpdated");
        assert_eq!(json["learnerId"], "l");
        assert_eq!(ServerEvent::Pong.kind(), "pong");
    }
}
