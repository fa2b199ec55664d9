/// Rejection reasons produced by the reading normalizer.
///
/// A rejected payload never reaches any buffer; the error is reported back
/// to the caller so producer bugs stay visible to operators.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error("Validation failed: {0}")]
    Validation(String),
}
