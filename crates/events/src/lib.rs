//! CityPulse event fan-out.
//!
//! - [`Broadcaster`] — topic subscription table with a bounded, non-blocking
//!   outbound queue per connection.
//! - [`StreamEvent`] — the transport-independent event envelope.
//! - [`bridge`] — maps external pub/sub channel messages onto local topics.

pub mod bridge;
pub mod bus;
pub mod error;

pub use bridge::{BridgeMessage, BridgeStats};
pub use bus::{Broadcaster, PublishReport, StreamEvent, Topic};
pub use error::{BridgeError, BroadcastError};
