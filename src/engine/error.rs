use ulid::Ulid;

use crate::model::{Date, StayRange};

/// Every expected failure of the engine. None of these are fatal.
#[derive(Debug)]
pub enum EngineError {
    /// `check_out <= check_in`.
    InvalidRange { check_in: Date, check_out: Date },
    /// Check-in before today.
    PastDate { check_in: Date, today: Date },
    NotFound(Ulid),
    UnknownConfirmationCode(String),
    /// Admission refused: overlaps an existing booking.
    Conflict { booking_id: Ulid, stay: StayRange },
    Validation(&'static str),
    LimitExceeded(&'static str),
    /// Opaque persistence failure; not retried here.
    Storage(String),
}

impl EngineError {
    /// Stable result code for callers translating errors to their transport.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. } => "INVALID_RANGE",
            EngineError::PastDate { .. } => "PAST_DATE",
            EngineError::NotFound(_) | EngineError::UnknownConfirmationCode(_) => "NOT_FOUND",
            EngineError::Conflict { .. } => "CONFLICT",
            EngineError::Validation(_) => "VALIDATION",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { check_in, check_out } => {
                write!(f, "check-out {check_out} must be after check-in {check_in}")
            }
            EngineError::PastDate { check_in, today } => {
                write!(f, "check-in {check_in} is before today ({today})")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownConfirmationCode(code) => {
                write!(f, "no booking with confirmation code {code}")
            }
            EngineError::Conflict { booking_id, stay } => {
                write!(f, "room already booked for {stay} by booking {booking_id}")
            }
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
