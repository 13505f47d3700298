//! WebSocket handler for entity change streams.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::notifier::Subscription;

use super::{ClientMessage, ServerMessage};

/// Serve one watcher until either side goes away.
///
/// 1. Spawns a task forwarding outgoing messages to the socket
/// 2. Relays state changes and change events from the subscription
/// 3. Answers client pings
/// 4. Unsubscribes on disconnect
pub async fn handle_watch_connection(socket: WebSocket, mut subscription: Subscription) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    let subscription_id = subscription.id().to_string();
    let entity = subscription.entity();
    tracing::info!(subscription = %subscription_id, entity = %entity, "Watcher connected");

    let mut states = subscription.watch_state();
    let _ = tx.send(ServerMessage::State {
        state: *states.borrow_and_update(),
    });

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                let _ = tx.send(ServerMessage::State { state });
            }
            event = subscription.recv() => match event {
                Some(event) => {
                    let _ = tx.send(ServerMessage::Change { event });
                }
                None => break,
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Ping) => ServerMessage::Pong,
                        Err(e) => ServerMessage::error(format!("Invalid message format: {}", e)),
                    };
                    let _ = tx.send(reply);
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::warn!("Binary messages not supported");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::warn!(subscription = %subscription_id, "WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    subscription.unsubscribe();
    send_task.abort();

    tracing::info!(subscription = %subscription_id, entity = %entity, "Watcher disconnected");
}
