//! Error types for shopfloor-core construction-time validation.

/// Errors raised when building domain values from configuration.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid work calendar: {details}")]
    InvalidCalendar { details: String },
}
