//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and tagged by a snake_case `type` field.

use serde::{Deserialize, Serialize};
use tandem_engine::ChangeEvent;

use crate::notifier::SubscriptionState;

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The watched entity may have changed; re-read it.
    Change {
        #[serde(flatten)]
        event: ChangeEvent,
    },

    /// The subscription moved to a new state.
    State { state: SubscriptionState },

    /// Response to ping.
    Pong,

    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_engine::{Entity, EventSource, EventType, Stamp};

    #[test]
    fn client_message_deserialization() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "pull"}"#).is_err());
    }

    #[test]
    fn server_message_serialization() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let json = serde_json::to_string(&ServerMessage::State {
            state: SubscriptionState::Polling,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"state","state":"polling"}"#);

        let change = ServerMessage::Change {
            event: ChangeEvent::new(
                Entity::Assignments,
                EventType::Update,
                EventSource::RemoteLive,
                Stamp::from_millis(0),
            ),
        };
        let json = serde_json::to_string(&change).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"type":"change","entity":"assignments","eventType":"UPDATE","#,
                r#""occurredAt":"1970-01-01T00:00:00.000Z","source":"remote-live"}"#,
            )
        );

        let json = serde_json::to_string(&ServerMessage::error("bad")).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"bad"}"#);
    }
}
