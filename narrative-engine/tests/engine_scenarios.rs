//! End-to-end scenarios through the session coordinator.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use narrative_engine::{
    Choice, ClientEvent, DeliveryMode, EngineConfig, MemoryStore, NarrativeNode, NarrativeStore,
    Nugget, NuggetStatus, Origin, ServerEvent, SessionCoordinator, StartSession, UpstreamKind,
};
use tutor_agent::{CompletionResponse, MockBackend, NoopUsageCollector, ToolCall};

fn nugget(id: &str, title: &str) -> Nugget {
    Nugget {
        id: id.into(),
        tenant_id: "acme".into(),
        title: title.into(),
        content: format!("{} explained in three sentences.", title),
        status: NuggetStatus::Ready,
        image_url: None,
        audio_url: None,
        tags: vec![],
    }
}

fn choice(id: &str, target: &str, reveals: &[&str], confirms: &[&str]) -> Choice {
    Choice {
        id: id.into(),
        text: format!("Continue to {}", target),
        target_node_id: target.into(),
        reveals_gap: reveals.iter().map(|s| s.to_string()).collect(),
        confirms_mastery: confirms.iter().map(|s| s.to_string()).collect(),
    }
}

fn node(id: &str, nugget_id: &str, prereqs: &[&str], choices: Vec<Choice>) -> NarrativeNode {
    NarrativeNode {
        id: id.into(),
        tenant_id: "acme".into(),
        nugget_id: nugget_id.into(),
        prerequisites: prereqs.iter().map(|s| s.to_string()).collect(),
        adapts_to: vec![],
        choices,
    }
}

/// Library: `advanced` (locked) is inserted first, `intro` is open.
async fn library() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (id, title) in [("g-adv", "Lifetimes"), ("g-intro", "Ownership"), ("g-borrow", "Borrowing")] {
        store.insert_nugget(nugget(id, title)).await.unwrap();
    }
    store
        .insert_node(node("advanced", "g-adv", &["ownership"], vec![]))
        .await
        .unwrap();
    store
        .insert_node(node(
            "intro",
            "g-intro",
            &[],
            vec![
                choice("got-it", "borrow", &[], &["ownership"]),
                choice("lost", "borrow", &["ownership"], &[]),
            ],
        ))
        .await
        .unwrap();
    store
        .insert_node(node("borrow", "g-borrow", &[], vec![choice("back", "intro", &[], &[])]))
        .await
        .unwrap();
    store
}

async fn coordinator(store: Arc<MemoryStore>, backend: MockBackend, config: EngineConfig) -> SessionCoordinator {
    SessionCoordinator::new(store, Arc::new(backend), Arc::new(NoopUsageCollector), config).await
}

fn start(learner: &str) -> StartSession {
    StartSession {
        tenant_id: "acme".into(),
        learner_id: learner.into(),
        mode: DeliveryMode::Text,
        start_node_id: None,
    }
}

#[tokio::test]
async fn new_learner_starts_on_unlocked_node() {
    let store = library().await;
    let engine = coordinator(store.clone(), MockBackend::default(), EngineConfig::default()).await;

    let snapshot = engine.start_session(start("ada")).await.unwrap();
    let current = snapshot.current_node.expect("start node");
    assert_eq!(current.id, "intro");
    assert!(current.prerequisites.is_empty());
    assert_eq!(snapshot.path_history, vec!["intro"]);

    let log = store.traversals(&snapshot.session_id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].choice_id.is_none());
}

#[tokio::test]
async fn empty_library_starts_without_node() {
    let store = Arc::new(MemoryStore::new());
    let engine = coordinator(store, MockBackend::default(), EngineConfig::default()).await;

    let snapshot = engine.start_session(start("ada")).await.unwrap();
    assert!(snapshot.current_node.is_none());

    let err = engine
        .choose(&snapshot.session_id, "anything", Origin::Rest)
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "NoCurrentNode");
}

#[tokio::test]
async fn choice_moves_session_and_applies_mastery() {
    let store = library().await;
    let engine = coordinator(store.clone(), MockBackend::default(), EngineConfig::default()).await;
    let snapshot = engine.start_session(start("ada")).await.unwrap();
    let sid = snapshot.session_id.clone();

    let reply = engine.choose(&sid, "got-it", Origin::Rest).await.unwrap();
    assert_eq!(reply.next_node.id, "borrow");
    assert_eq!(reply.path_history, vec!["intro", "borrow"]);
    assert_eq!(reply.mastery_updates.len(), 1);
    assert_eq!(reply.mastery_updates[0].concept, "ownership");
    assert_eq!(reply.mastery_updates[0].score, 20.0);

    // Already resolved: the choice is not on "borrow".
    let err = engine.choose(&sid, "got-it", Origin::Rest).await.unwrap_err();
    assert_eq!(err.error_type(), "ChoiceNotFound");

    let err = engine.choose(&sid, "nope", Origin::Rest).await.unwrap_err();
    assert_eq!(err.error_type(), "ChoiceNotFound");

    // Failed resolutions leave the path alone.
    let session = store.get_session(&sid).await.unwrap();
    assert_eq!(session.path_history.len(), 2);
}

#[tokio::test]
async fn path_history_is_append_only() {
    let store = library().await;
    let engine = coordinator(store.clone(), MockBackend::default(), EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let mut seen: Vec<String> = store.get_session(&sid).await.unwrap().path_history;
    for choice_id in ["got-it", "back", "lost", "back"] {
        engine.choose(&sid, choice_id, Origin::Rest).await.unwrap();
        let path = store.get_session(&sid).await.unwrap().path_history;
        assert_eq!(path.len(), seen.len() + 1);
        assert_eq!(&path[..seen.len()], &seen[..]);
        seen = path;
    }
    assert_eq!(seen, vec!["intro", "borrow", "intro", "borrow", "intro"]);
}

#[tokio::test]
async fn update_mastery_tool_clamps_to_100() {
    let backend = MockBackend::default()
        .with_reply(CompletionResponse::with_tool_calls(
            "",
            vec![ToolCall::new(
                "update_mastery",
                json!({"conceptId": "x", "masteryLevel": 150, "evidence": "evidence"}),
            )],
        ))
        .with_reply(CompletionResponse::text("Great job."));
    let store = library().await;
    let engine = coordinator(store.clone(), backend, EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let reply = engine.turn(&sid, "I know x", Origin::Rest).await.unwrap();
    assert_eq!(reply.message.content, "Great job.");
    let progress = reply.progress.expect("progress update");
    assert_eq!(progress.concepts[0].score, 100.0);
    assert_eq!(store.get_learner("ada").await.unwrap().mastery["x"], 100.0);
}

#[tokio::test]
async fn turn_with_k_tools_persists_one_assistant_message() {
    let backend = MockBackend::default()
        .with_reply(CompletionResponse::with_tool_calls(
            "Let me check.",
            vec![
                ToolCall::new("deliver_nugget", json!({"nuggetId": "g-borrow"})),
                ToolCall::new("deliver_nugget", json!({"nuggetId": "missing"})),
                ToolCall::new("identify_gaps", json!({})),
            ],
        ))
        .with_reply(CompletionResponse::text("Here is the next idea."));
    let store = library().await;
    let engine = coordinator(store.clone(), backend, EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let reply = engine.turn(&sid, "next please", Origin::Rest).await.unwrap();
    assert_eq!(reply.tool_results.len(), 3);
    assert!(reply.tool_results[0].result.success);
    assert_eq!(reply.tool_results[1].result.error_type(), Some("ResourceNotFound"));
    assert!(reply.tool_results[2].result.success);

    let messages = engine.messages(&sid, 50).await.unwrap();
    let assistant: Vec<_> = messages
        .iter()
        .filter(|m| m.role == narrative_engine::ChatRole::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].tool_results.len(), 3);
    assert_eq!(assistant[0].content, "Here is the next idea.");
}

#[tokio::test]
async fn turn_without_tools_persists_one_assistant_message() {
    let backend = MockBackend::default().with_reply(CompletionResponse::text("Hello!"));
    let store = library().await;
    let engine = coordinator(store, backend, EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let reply = engine.turn(&sid, "hi", Origin::Rest).await.unwrap();
    assert!(reply.tool_results.is_empty());
    assert!(reply.progress.is_none());

    let messages = engine.messages(&sid, 50).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Hello!");
}

#[tokio::test]
async fn concurrent_turns_never_interleave() {
    let backend = MockBackend::default()
        .with_delay(Duration::from_millis(50))
        .with_response("ok");
    let store = library().await;
    let config = EngineConfig {
        max_queued_turns: 0,
        ..Default::default()
    };
    let engine = coordinator(store, backend, config).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let (a, b) = tokio::join!(
        engine.turn(&sid, "first", Origin::Rest),
        engine.turn(&sid, "second", Origin::Rest)
    );
    let outcomes = [a, b];
    let ok = outcomes.iter().filter(|r| r.is_ok()).count();
    let busy = outcomes
        .iter()
        .filter(|r| matches!(r, Err(e) if e.error_type() == "SessionBusy"))
        .count();
    assert_eq!((ok, busy), (1, 1));

    // Only the winning turn touched the log.
    assert_eq!(engine.messages(&sid, 50).await.unwrap().len(), 2);
}

#[tokio::test]
async fn queued_turns_run_in_order() {
    let backend = MockBackend::default()
        .with_delay(Duration::from_millis(20))
        .with_response("ok");
    let store = library().await;
    let engine = coordinator(store, backend, EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let (a, b) = tokio::join!(
        engine.turn(&sid, "first", Origin::Rest),
        engine.turn(&sid, "second", Origin::Rest)
    );
    a.unwrap();
    b.unwrap();

    let messages = engine.messages(&sid, 50).await.unwrap();
    assert_eq!(messages.len(), 4);
    // Each user message is immediately followed by its own reply.
    assert_eq!(messages[0].role, narrative_engine::ChatRole::User);
    assert_eq!(messages[1].role, narrative_engine::ChatRole::Assistant);
    assert_eq!(messages[2].role, narrative_engine::ChatRole::User);
    assert_eq!(messages[3].role, narrative_engine::ChatRole::Assistant);
}

#[tokio::test]
async fn deadline_expiry_is_upstream_timeout() {
    let backend = MockBackend::default().with_delay(Duration::from_millis(300));
    let store = library().await;
    let engine = coordinator(store, backend, EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(20);
    let err = engine
        .turn_until(&sid, "hello", Origin::Rest, Some(deadline))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "UpstreamError");
    assert_eq!(err.to_payload().upstream_kind, Some(UpstreamKind::Timeout));
}

#[tokio::test]
async fn completed_session_rejects_mutation() {
    let store = library().await;
    let engine = coordinator(store, MockBackend::default(), EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let snapshot = engine.complete_session(&sid).await.unwrap();
    assert!(snapshot.completed_at.is_some());

    let err = engine.turn(&sid, "hi", Origin::Rest).await.unwrap_err();
    assert_eq!(err.error_type(), "InvalidState");
    let err = engine.choose(&sid, "got-it", Origin::Rest).await.unwrap_err();
    assert_eq!(err.error_type(), "InvalidState");
    let err = engine.complete_session(&sid).await.unwrap_err();
    assert_eq!(err.error_type(), "InvalidState");
}

#[tokio::test]
async fn realtime_initiator_answered_before_broadcast() {
    let store = library().await;
    let engine = coordinator(store, MockBackend::default(), EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let (me, mut my_rx, joined) = engine.connect(&sid, "acme", "ada").await.unwrap();
    assert!(matches!(joined, ServerEvent::Joined { .. }));
    let (_other, mut other_rx, _) = engine.connect(&sid, "acme", "ada").await.unwrap();

    engine
        .handle_client_event(&sid, me, ClientEvent::Choice { choice_id: "lost".into() })
        .await;

    // Initiator: node update then progress, no echo of anything else.
    let first = my_rx.recv().await.unwrap();
    assert!(matches!(first, ServerEvent::NodeUpdated { ref node_id, .. } if node_id == "borrow"));
    assert!(matches!(my_rx.recv().await.unwrap(), ServerEvent::ProgressUpdated { .. }));

    // Observer gets the same updates.
    assert!(matches!(other_rx.recv().await.unwrap(), ServerEvent::NodeUpdated { .. }));

    // Failures come back as error events on the initiator only.
    engine
        .handle_client_event(&sid, me, ClientEvent::Choice { choice_id: "lost".into() })
        .await;
    match my_rx.recv().await.unwrap() {
        ServerEvent::Error(payload) => assert_eq!(payload.error_type, "ChoiceNotFound"),
        other => panic!("unexpected event {:?}", other),
    }

    engine.handle_client_event(&sid, me, ClientEvent::Ping).await;
    assert_eq!(my_rx.recv().await.unwrap(), ServerEvent::Pong);
}

#[tokio::test]
async fn handshake_requires_ownership() {
    let store = library().await;
    let engine = coordinator(store, MockBackend::default(), EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    let err = engine.connect(&sid, "acme", "mallory").await.unwrap_err();
    assert_eq!(err.error_type(), "PermissionDenied");
    let err = engine.connect("sess_missing", "acme", "ada").await.unwrap_err();
    assert_eq!(err.error_type(), "ResourceNotFound");
}

#[tokio::test]
async fn dropped_caller_still_lands_turn() {
    let backend = MockBackend::default()
        .with_delay(Duration::from_millis(50))
        .with_reply(CompletionResponse::with_tool_calls(
            "",
            vec![ToolCall::new(
                "update_mastery",
                json!({"conceptId": "ownership", "masteryLevel": 90, "evidence": "explained moves"}),
            )],
        ))
        .with_reply(CompletionResponse::text("done"));
    let store = library().await;
    let engine = coordinator(store.clone(), backend, EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;

    // Caller gives up long before the turn finishes.
    let _ = tokio::time::timeout(
        Duration::from_millis(10),
        engine.turn(&sid, "moves transfer ownership", Origin::Rest),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.get_learner("ada").await.unwrap().mastery["ownership"], 90.0);
    assert_eq!(engine.messages(&sid, 50).await.unwrap().len(), 2);
}

#[tokio::test]
async fn gap_recomputation_is_separate_from_hysteresis() {
    let backend = MockBackend::default()
        .with_reply(CompletionResponse::with_tool_calls(
            "",
            vec![ToolCall::new(
                "update_mastery",
                json!({"conceptId": "traits", "masteryLevel": 45, "evidence": "partial"}),
            )],
        ))
        .with_reply(CompletionResponse::text("ok"));
    let store = library().await;
    let engine = coordinator(store, backend, EngineConfig::default()).await;
    let sid = engine.start_session(start("ada")).await.unwrap().session_id;
    engine.turn(&sid, "traits?", Origin::Rest).await.unwrap();

    let progress = engine.progress("ada", "acme").await.unwrap();
    assert!(progress.gaps.is_empty());

    let gaps = engine.identify_gaps("ada", "acme").await.unwrap();
    assert_eq!(gaps, BTreeSet::from(["traits".to_string()]));

    let err = engine.progress("ada", "other-tenant").await.unwrap_err();
    assert_eq!(err.error_type(), "PermissionDenied");
}
