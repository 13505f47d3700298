//! WebSocket change streams.
//!
//! `GET /watch/{entity}` upgrades to a socket carrying the entity's change
//! events and subscription state changes.

mod handler;
mod protocol;

pub use handler::handle_watch_connection;
pub use protocol::{ClientMessage, ServerMessage};
