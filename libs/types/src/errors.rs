//! Error types shared across the service
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

/// A swap event that cannot be aggregated
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Event id is empty")]
    EmptyEventId,

    #[error("Token is empty for event {event_id}")]
    EmptyToken { event_id: String },

    #[error("Field {field} contains a reserved character: {value}")]
    ReservedCharacter { field: &'static str, value: String },

    #[error("Invalid {field}: {value}")]
    InvalidAmount { field: &'static str, value: f64 },
}
