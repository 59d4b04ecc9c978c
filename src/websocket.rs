/// WebSocket Support - real-time status streaming
///
/// Provides:
/// - /ws/chain-updates - subscribe to `ChainUpdateSummary` events (apply/
///   rollback heights per chain) as the stream coordinator processes them
/// - /ws/predicate-status - subscribe to predicate status transitions as
///   the lifecycle controller drives each predicate through its lifecycle
///
/// Uses tokio broadcast channels for pub/sub pattern

use axum::{
    extract::ws::{WebSocketUpgrade, WebSocket, Message},
    response::Response,
    Extension,
};
use futures::{stream::StreamExt, SinkExt};
use std::sync::Arc;

use crate::lifecycle::LifecycleController;
use crate::stream::StreamCoordinator;

/// WebSocket handler for chain-update events
pub async fn ws_chain_updates_handler(
    ws: WebSocketUpgrade,
    Extension(coordinator): Extension<Arc<StreamCoordinator>>,
) -> Response {
    ws.on_upgrade(|socket| handle_chain_updates_socket(socket, coordinator))
}

/// WebSocket handler for predicate-status events
pub async fn ws_predicate_status_handler(
    ws: WebSocketUpgrade,
    Extension(lifecycle): Extension<Arc<LifecycleController>>,
) -> Response {
    ws.on_upgrade(|socket| handle_predicate_status_socket(socket, lifecycle))
}

/// Handle WebSocket connection for chain-update events
async fn handle_chain_updates_socket(socket: WebSocket, coordinator: Arc<StreamCoordinator>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = coordinator.subscribe();

    let welcome = serde_json::json!({
        "type": "connected",
        "channel": "chain-updates",
        "message": "Subscribed to chain update events"
    });
    if sender.send(Message::Text(welcome.to_string().into())).await.is_err() {
        return;
    }

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Handle WebSocket connection for predicate-status events
async fn handle_predicate_status_socket(socket: WebSocket, lifecycle: Arc<LifecycleController>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = lifecycle.subscribe_status();

    let welcome = serde_json::json!({
        "type": "connected",
        "channel": "predicate-status",
        "message": "Subscribed to predicate status events"
    });
    if sender.send(Message::Text(welcome.to_string().into())).await.is_err() {
        return;
    }

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PredicateStatusEvent;
    use crate::predicates::types::PredicateStatus;
    use crate::stream::ChainUpdateSummary;
    use crate::types::Chain;

    #[test]
    fn chain_update_summary_serializes_to_json_text() {
        let summary = ChainUpdateSummary { chain: Chain::Bitcoin, apply_heights: vec![10], rollback_heights: vec![] };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"chain\""));
    }

    #[test]
    fn predicate_status_event_serializes_to_json_text() {
        let event = PredicateStatusEvent { uuid: "p1".to_string(), status: PredicateStatus::New };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"uuid\":\"p1\""));
    }
}
