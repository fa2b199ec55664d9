use thiserror::Error;

/// Subscription and delivery errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Errors decoding messages that arrive over a bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Unknown bridge channel: {0}")]
    UnknownChannel(String),

    #[error("Malformed bridge message: {0}")]
    Malformed(#[from] serde_json::Error),
}
