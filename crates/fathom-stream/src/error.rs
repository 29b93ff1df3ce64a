use thiserror::Error;

use fathom_core::error::FathomError;

use crate::phase::TurnPhase;

/// Errors raised by the reconciliation engine and its helpers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Invalid turn phase transition: {from} -> {to}")]
    InvalidTransition { from: TurnPhase, to: TurnPhase },

    #[error("Query cannot be empty")]
    EmptyQuery,

    #[error("Query exceeds the maximum of {max} characters (got {actual})")]
    QueryTooLong { max: usize, actual: usize },

    #[error("A response is still in progress")]
    Busy,

    #[error("Export error: {0}")]
    Export(String),

    #[error("Core error: {0}")]
    Core(String),
}

impl From<FathomError> for StreamError {
    fn from(err: FathomError) -> Self {
        StreamError::Core(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Export(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::InvalidTransition {
            from: TurnPhase::Idle,
            to: TurnPhase::Complete,
        };
        assert_eq!(err.to_string(), "Invalid turn phase transition: Idle -> Complete");

        let err = StreamError::QueryTooLong { max: 10, actual: 12 };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_from_core_error() {
        let err: StreamError = FathomError::Config("bad".into()).into();
        assert!(matches!(err, StreamError::Core(msg) if msg.contains("bad")));
    }
}
