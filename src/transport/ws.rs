//! Client WebSocket endpoint
//!
//! Each connection gets a fresh session id. Text frames carry JSON commands,
//! server events go back as JSON text frames through the connection hub.

use crate::error::{RendezvousError, Result};
use crate::metrics::MetricsCollector;
use crate::room::RoomManager;
use crate::transport::hub::ConnectionHub;
use crate::types::ClientCommand;
use crate::utils::generate_session_id;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Everything a connection handler needs
#[derive(Clone)]
pub struct TransportState {
    pub manager: Arc<RoomManager>,
    pub hub: Arc<ConnectionHub>,
    pub metrics_collector: Arc<MetricsCollector>,
}

/// Create the WebSocket router
pub fn router(state: TransportState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// Decode one client frame
pub fn parse_command(frame: &str) -> Result<ClientCommand> {
    serde_json::from_str(frame).map_err(|e| {
        RendezvousError::InvalidCommand {
            reason: e.to_string(),
        }
        .into()
    })
}

/// GET /ws
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<TransportState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: TransportState) {
    let session_id = generate_session_id();
    let events = state.hub.register(&session_id);
    state.manager.connect(&session_id);
    info!("Session {} connected", session_id);

    let (mut sender, mut receiver) = socket.split();

    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(events);
        while let Some(event) = events.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {} event: {}", event.name(), e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text.into())).await {
                debug!("Failed to write to session {}: {}", writer_session, e);
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_frame(&state, &session_id, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                warn!("Session {} sent a binary frame, ignoring it", session_id);
                state.metrics_collector.record_malformed_command();
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("Session {} requested close", session_id);
                break;
            }
            Err(e) => {
                debug!("WebSocket error for session {}: {}", session_id, e);
                break;
            }
        }
    }

    state.hub.unregister(&session_id);
    if let Err(e) = state.manager.handle_disconnect(&session_id).await {
        warn!("Failed to clean up session {}: {}", session_id, e);
    }
    writer.abort();
    info!("Session {} disconnected", session_id);
}

async fn handle_frame(state: &TransportState, session_id: &str, frame: &str) {
    let command = match parse_command(frame) {
        Ok(command) => command,
        Err(e) => {
            state.metrics_collector.record_malformed_command();
            warn!("Ignoring malformed frame from {}: {}", session_id, e);
            return;
        }
    };

    let name = command.name();
    if let Err(e) = state.manager.handle_command(session_id, command).await {
        warn!("Command {} from {} failed: {}", name, session_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SignalKind, Visibility};

    #[test]
    fn test_parse_pool_intent_with_missing_fields() {
        let command = parse_command(r#"{"type":"enqueue-pool"}"#).unwrap();
        assert_eq!(
            command,
            ClientCommand::EnqueuePool {
                locale: String::new(),
                activities: Vec::new(),
                display_name: String::new(),
            }
        );
    }

    #[test]
    fn test_parse_direct_intent() {
        let command = parse_command(
            r#"{"type":"enqueue-direct","locale":"en","displayName":"Ann","visibility":"public","mediaRequired":true}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            ClientCommand::EnqueueDirect {
                locale: "en".to_string(),
                display_name: "Ann".to_string(),
                visibility: Visibility::Public,
                room_code: None,
                media_required: true,
            }
        );
    }

    #[test]
    fn test_parse_signal() {
        let command = parse_command(
            r#"{"type":"relay-signal","targetId":"b","kind":"candidate","payload":{"c":1}}"#,
        )
        .unwrap();
        assert!(matches!(
            command,
            ClientCommand::RelaySignal { kind: SignalKind::Candidate, ref target_id, .. } if target_id == "b"
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_command("not json").is_err());
        assert!(parse_command(r#"{"type":"teleport"}"#).is_err());
        let err = parse_command(r#"{"type":"relay-signal","kind":"offer"}"#).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendezvousError>(),
            Some(RendezvousError::InvalidCommand { .. })
        ));
    }
}
