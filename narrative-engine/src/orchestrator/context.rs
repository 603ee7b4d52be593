//! Turn context assembly: learner summary and bounded message history.

use std::fmt::Write;

use tutor_agent::Message;

use crate::model::{ChatRole, DeliveryMode, Learner, NarrativeNode, Nugget, Session, SessionMessage};

/// Snapshot of everything the model sees for one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session: Session,
    pub learner: Learner,
    pub node: Option<NarrativeNode>,
    /// Nugget of the current node, when it resolves
    pub nugget: Option<Nugget>,
    /// Prior messages, oldest first
    pub history: Vec<SessionMessage>,
}

const TUTOR_ROLE: &str = "You are a patient tutor guiding a learner through a branching narrative of short \
lessons. Keep replies brief and conversational. Use the available tools to deliver content, check \
understanding, record mastery with concrete evidence, and adapt the path when the learner struggles.";

impl TurnContext {
    /// Instruction payload: tutor role plus a summary of the learner's position.
    pub fn system_prompt(&self) -> String {
        let mut prompt = String::from(TUTOR_ROLE);
        prompt.push_str("\n\n## Session\n");
        let _ = writeln!(
            prompt,
            "Delivery mode: {}",
            match self.session.mode {
                DeliveryMode::Text => "text",
                DeliveryMode::Voice => "voice (keep sentences short and speakable)",
            }
        );
        let _ = writeln!(prompt, "Nodes visited: {}", self.session.path_history.len());

        prompt.push_str("\n## Current node\n");
        match (&self.node, &self.nugget) {
            (Some(node), nugget) => {
                let _ = writeln!(prompt, "Node: {}", node.id);
                if let Some(nugget) = nugget {
                    let _ = writeln!(prompt, "Nugget: {} ({})", nugget.title, nugget.id);
                    let _ = writeln!(prompt, "Content: {}", nugget.content);
                } else {
                    let _ = writeln!(prompt, "Nugget: {}", node.nugget_id);
                }
                if !node.prerequisites.is_empty() {
                    let _ = writeln!(prompt, "Prerequisites: {}", node.prerequisites.join(", "));
                }
                if !node.choices.is_empty() {
                    prompt.push_str("Choices:\n");
                    for choice in &node.choices {
                        let _ = writeln!(prompt, "- [{}] {}", choice.id, choice.text);
                    }
                }
            }
            (None, _) => prompt.push_str("None. The narrative has not started yet.\n"),
        }

        prompt.push_str("\n## Learner\n");
        if self.learner.mastery.is_empty() {
            prompt.push_str("Mastery: no concepts assessed yet\n");
        } else {
            let scores: Vec<String> = self
                .learner
                .mastery
                .iter()
                .map(|(concept, score)| format!("{} {:.0}", concept, score))
                .collect();
            let _ = writeln!(prompt, "Mastery: {}", scores.join(", "));
        }
        if self.learner.gaps.is_empty() {
            prompt.push_str("Knowledge gaps: none\n");
        } else {
            let gaps: Vec<&str> = self.learner.gaps.iter().map(String::as_str).collect();
            let _ = writeln!(prompt, "Knowledge gaps: {}", gaps.join(", "));
        }

        prompt
    }

    /// Prior messages in model form, followed by the new utterance.
    pub fn messages(&self, user_text: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .history
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| match m.role {
                ChatRole::User => Message::user(&m.content),
                ChatRole::Assistant => Message::assistant(&m.content),
            })
            .collect();
        messages.push(Message::user(user_text));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Choice;
    use std::collections::BTreeSet;
    use tutor_agent::MessageRole;

    fn context() -> TurnContext {
        let mut learner = Learner::new("t", "l");
        learner.mastery.insert("borrowing".into(), 42.0);
        learner.gaps.insert("lifetimes".into());
        let session = Session::new("t", "l", DeliveryMode::Voice);
        let mut history = vec![
            SessionMessage::new(&session.id, ChatRole::User, "hi"),
            SessionMessage::new(&session.id, ChatRole::Assistant, "hello"),
        ];
        history.push(SessionMessage::new(&session.id, ChatRole::Assistant, ""));
        TurnContext {
            session,
            learner,
            node: Some(NarrativeNode {
                id: "n1".into(),
                tenant_id: "t".into(),
                nugget_id: "g1".into(),
                prerequisites: vec![],
                adapts_to: vec![],
                choices: vec![Choice {
                    id: "c1".into(),
                    text: "Dig deeper".into(),
                    target_node_id: "n2".into(),
                    reveals_gap: BTreeSet::new(),
                    confirms_mastery: BTreeSet::new(),
                }],
            }),
            nugget: None,
            history,
        }
    }

    #[test]
    fn test_prompt_summarizes_learner_and_node() {
        let prompt = context().system_prompt();
        assert!(prompt.contains("Node: n1"));
        assert!(prompt.contains("[c1] Dig deeper"));
        assert!(prompt.contains("borrowing 42"));
        assert!(prompt.contains("Knowledge gaps: lifetimes"));
        assert!(prompt.contains("voice"));
    }

    #[test]
    fn test_messages_end_with_utterance() {
        let messages = context().messages("what next?");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[2].content, "what next?");
    }
}
