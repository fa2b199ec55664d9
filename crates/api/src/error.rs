use citypulse_core::error::{CoreError, NormalizationError};
use citypulse_events::BroadcastError;

use crate::config::ConfigError;

/// Application-level error type for the hub.
///
/// Wraps [`CoreError`] for domain errors and adds gateway-specific variants.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `citypulse_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A subscription or delivery error from `citypulse_events`.
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A client message that could not be understood.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<NormalizationError> for AppError {
    fn from(e: NormalizationError) -> Self {
        AppError::Core(CoreError::Normalization(e))
    }
}

impl AppError {
    /// Whether the error was caused by caller input rather than hub state.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::BadRequest(_)
                | AppError::Broadcast(BroadcastError::UnknownTopic(_))
                | AppError::Core(CoreError::Normalization(_))
        )
    }
}

/// Convenience type alias for fallible hub operations.
pub type AppResult<T> = Result<T, AppError>;
