use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the flow engine, the dispatcher and the prompt coordinator.
///
/// `InvalidState` marks caller misuse (advancing a terminal node, raising a
/// second prompt while one is active, ...). It is never swallowed internally.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("collector action failed: {0}")]
    Action(String),
    #[error("{} validation error(s) on collector {collector}", errors.len())]
    Validation {
        collector: String,
        errors: Vec<super::policy::ValidationError>,
    },
}

impl FlowError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_convert() {
        let err: FlowError = TransportError::Network("connection refused".to_string()).into();
        assert!(matches!(err, FlowError::Transport(_)));
        assert_eq!(err.to_string(), "network error: connection refused");
    }

    #[test]
    fn predicates() {
        assert!(FlowError::Cancelled("user".into()).is_cancelled());
        assert!(FlowError::invalid_state("terminal").is_invalid_state());
        assert!(!FlowError::Action("boom".into()).is_cancelled());
    }
}
