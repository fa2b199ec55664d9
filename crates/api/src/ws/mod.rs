//! WebSocket push gateway.
//!
//! Each upgraded connection is registered with the [`Broadcaster`] and
//! receives events for the topics it subscribes to. Clients can also submit
//! readings over the socket.
//!
//! [`Broadcaster`]: citypulse_events::Broadcaster

mod handler;
pub mod protocol;

pub use handler::ws_handler;
