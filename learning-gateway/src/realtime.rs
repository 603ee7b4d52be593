//! Real-time session channel over WebSocket.
//!
//! `GET /ws?sessionId=&tenantId=&learnerId=`. The handshake is refused before
//! the upgrade when the session cannot be resolved or belongs to someone else.
//! After the upgrade the connection receives a `joined` event, then every
//! event the coordinator routes to it. Inbound events are handled one at a
//! time; failures come back as `error` events and the socket stays open.

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use narrative_engine::{
    ClientEvent, EngineError, ErrorPayload, ServerEvent, SessionCoordinator,
};

use crate::routes::ApiError;
use crate::SharedState;

/// Handshake parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub session_id: String,
    pub tenant_id: String,
    pub learner_id: String,
}

impl Handshake {
    fn is_complete(&self) -> bool {
        !self.session_id.is_empty() && !self.tenant_id.is_empty() && !self.learner_id.is_empty()
    }
}

/// GET /ws
pub async fn ws_handler(
    State(state): State<SharedState>,
    query: Result<Query<Handshake>, QueryRejection>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let handshake = match query {
        Ok(Query(h)) if h.is_complete() => h,
        _ => return unauthorized(),
    };

    if let Err(e) = state
        .coordinator
        .authorize(&handshake.session_id, &handshake.tenant_id, &handshake.learner_id)
        .await
    {
        debug!(session_id = %handshake.session_id, error = %e, "WebSocket handshake refused");
        return ApiError(e).into_response();
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let coordinator = state.coordinator.clone();
    upgrade.on_upgrade(move |socket| run_connection(socket, coordinator, handshake))
}

fn unauthorized() -> Response {
    let payload = ErrorPayload {
        error_type: "Unauthorized".to_string(),
        message: "sessionId, tenantId and learnerId are required".to_string(),
        upstream_kind: None,
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// Drive one upgraded connection until either side closes it.
async fn run_connection(socket: WebSocket, coordinator: SessionCoordinator, handshake: Handshake) {
    let session_id = handshake.session_id.clone();
    let (mut sender, mut receiver) = socket.split();

    let (connection_id, mut events, joined) = match coordinator
        .connect(&session_id, &handshake.tenant_id, &handshake.learner_id)
        .await
    {
        Ok(registered) => registered,
        Err(e) => {
            // Session changed between handshake and upgrade.
            let _ = send_event(&mut sender, &ServerEvent::Error(e.to_payload())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    if send_event(&mut sender, &joined).await.is_err() {
        coordinator.disconnect(&session_id, connection_id);
        return;
    }

    loop {
        tokio::select! {
            // Events routed to this connection
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Message from client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                coordinator
                                    .handle_client_event(&session_id, connection_id, event)
                                    .await;
                            }
                            Err(e) => {
                                let err = EngineError::Validation(format!("invalid event: {}", e));
                                coordinator.connections().send_to(
                                    &session_id,
                                    connection_id,
                                    ServerEvent::Error(err.to_payload()),
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    coordinator.disconnect(&session_id, connection_id);
    info!(session_id = %session_id, connection_id, "WebSocket connection closed");
}

async fn send_event<S>(sender: &mut S, event: &ServerEvent) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(event = event.kind(), error = %e, "Failed to encode event");
            return Ok(());
        }
    };
    sender.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    use narrative_engine::{EngineConfig, MemoryStore, SessionCoordinator, StartSession};
    use tutor_agent::{MockBackend, NoopUsageCollector};

    use crate::routes::create_router;
    use crate::AppState;

    async fn setup() -> (axum::Router, String) {
        let coordinator = SessionCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockBackend::default()),
            Arc::new(NoopUsageCollector),
            EngineConfig::default(),
        )
        .await;
        let snapshot = coordinator
            .start_session(StartSession {
                tenant_id: "acme".into(),
                learner_id: "ada".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let app = create_router(Arc::new(AppState {
            coordinator,
            dev_mode: true,
        }));
        (app, snapshot.session_id)
    }

    async fn handshake_status(app: &axum::Router, query: &str) -> StatusCode {
        let request = Request::builder()
            .uri(format!("/ws{}", query))
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_handshake_refusals() {
        let (app, sid) = setup().await;

        assert_eq!(handshake_status(&app, "").await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            handshake_status(&app, &format!("?sessionId={}&tenantId=acme", sid)).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            handshake_status(&app, &format!("?sessionId={}&tenantId=acme&learnerId=eve", sid)).await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            handshake_status(&app, &format!("?sessionId={}&tenantId=other&learnerId=ada", sid)).await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            handshake_status(&app, "?sessionId=sess_missing&tenantId=acme&learnerId=ada").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_authorized_handshake_requires_upgrade() {
        let (app, sid) = setup().await;
        let status = handshake_status(&app, &format!("?sessionId={}&tenantId=acme&learnerId=ada", sid)).await;
        // Plain GET without upgrade headers passes authorization but cannot upgrade.
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::UNAUTHORIZED);
        assert_ne!(status, StatusCode::FORBIDDEN);
        assert_ne!(status, StatusCode::NOT_FOUND);
    }
}
