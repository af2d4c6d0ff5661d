//! Error taxonomy for dispatch, delivery and configuration.
//!
//! Every failure a caller can observe from `send`/`publish` is a
//! [`MediatorError`]. Configuration problems are reported synchronously as
//! [`ConfigError`] before any pipeline runs.

use serde::{Deserialize, Serialize};

use crate::id::MessageId;

/// Failures surfaced by the mediator, its behaviors, stores and transports.
#[derive(Debug, thiserror::Error)]
pub enum MediatorError {
    #[error("no handler registered for {message_type}")]
    HandlerNotFound { message_type: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("circuit open for {key}")]
    CircuitOpen { key: String },
    #[error("capacity exceeded on {resource}")]
    CapacityExceeded { resource: String },
    #[error("duplicate message {id}")]
    DuplicateMessage { id: MessageId },
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("cancelled")]
    Cancelled,
    #[error("handler {handler} panicked: {message}")]
    HandlerPanicked { handler: String, message: String },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
}

/// Stable, serializable discriminant of a [`MediatorError`].
///
/// Used as a metrics label and to persist failures in the idempotency store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HandlerNotFound,
    Validation,
    Transient,
    CircuitOpen,
    CapacityExceeded,
    DuplicateMessage,
    Timeout,
    Cancelled,
    HandlerPanicked,
    StoreUnavailable,
    Transport,
    Serialization,
    Handler,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::HandlerNotFound => "handler_not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::DuplicateMessage => "duplicate_message",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::HandlerPanicked => "handler_panicked",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Transport => "transport",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Handler => "handler",
        }
    }
}

impl MediatorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediatorError::HandlerNotFound { .. } => ErrorKind::HandlerNotFound,
            MediatorError::Validation(_) => ErrorKind::Validation,
            MediatorError::Transient(_) => ErrorKind::Transient,
            MediatorError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            MediatorError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            MediatorError::DuplicateMessage { .. } => ErrorKind::DuplicateMessage,
            MediatorError::Timeout { .. } => ErrorKind::Timeout,
            MediatorError::Cancelled => ErrorKind::Cancelled,
            MediatorError::HandlerPanicked { .. } => ErrorKind::HandlerPanicked,
            MediatorError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            MediatorError::Transport(_) => ErrorKind::Transport,
            MediatorError::Serialization(_) => ErrorKind::Serialization,
            MediatorError::Handler(_) => ErrorKind::Handler,
        }
    }

    /// Default retry predicate: failures that may succeed if attempted again.
    ///
    /// Circuit-open and capacity rejections are deliberately excluded: they are
    /// fast-fail signals and retrying them locally defeats their purpose.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MediatorError::Transient(_)
                | MediatorError::Timeout { .. }
                | MediatorError::StoreUnavailable(_)
                | MediatorError::Transport(_)
        )
    }

    /// Whether this failure should count against a circuit breaker.
    ///
    /// Caller mistakes (validation, missing handler), cancellations and
    /// rejections produced by other guards do not indicate an unhealthy
    /// dependency.
    #[must_use]
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            MediatorError::HandlerNotFound { .. }
                | MediatorError::Validation(_)
                | MediatorError::CircuitOpen { .. }
                | MediatorError::CapacityExceeded { .. }
                | MediatorError::DuplicateMessage { .. }
                | MediatorError::Cancelled
        )
    }

    /// Rebuilds an error from its persisted form.
    ///
    /// The original cause chain is not preserved; `message` carries its
    /// rendered text.
    #[must_use]
    pub fn from_stored(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::HandlerNotFound => MediatorError::HandlerNotFound {
                message_type: message,
            },
            ErrorKind::Validation => MediatorError::Validation(message),
            ErrorKind::Transient => MediatorError::Transient(message),
            ErrorKind::CircuitOpen => MediatorError::CircuitOpen { key: message },
            ErrorKind::CapacityExceeded => MediatorError::CapacityExceeded { resource: message },
            ErrorKind::DuplicateMessage => MediatorError::DuplicateMessage {
                id: MessageId::new(message),
            },
            ErrorKind::Timeout => MediatorError::Timeout {
                timeout_ms: message.parse().unwrap_or_default(),
            },
            ErrorKind::Cancelled => MediatorError::Cancelled,
            ErrorKind::HandlerPanicked => MediatorError::HandlerPanicked {
                handler: String::new(),
                message,
            },
            ErrorKind::StoreUnavailable => MediatorError::StoreUnavailable(message),
            ErrorKind::Transport => MediatorError::Transport(message),
            ErrorKind::Serialization => MediatorError::Serialization(message),
            ErrorKind::Handler => MediatorError::Handler(anyhow::anyhow!(message)),
        }
    }

    /// The text persisted by [`MediatorError::from_stored`]'s counterpart.
    #[must_use]
    pub fn stored_message(&self) -> String {
        match self {
            MediatorError::HandlerNotFound { message_type } => message_type.clone(),
            MediatorError::Validation(m)
            | MediatorError::Transient(m)
            | MediatorError::StoreUnavailable(m)
            | MediatorError::Transport(m)
            | MediatorError::Serialization(m) => m.clone(),
            MediatorError::CircuitOpen { key } => key.clone(),
            MediatorError::CapacityExceeded { resource } => resource.clone(),
            MediatorError::DuplicateMessage { id } => id.to_string(),
            MediatorError::Timeout { timeout_ms } => timeout_ms.to_string(),
            MediatorError::Cancelled => String::new(),
            MediatorError::HandlerPanicked { message, .. } => message.clone(),
            MediatorError::Handler(e) => format!("{e:#}"),
        }
    }
}

/// Errors from building a mediator, endpoint or store with invalid settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{message_type} has {count} request handlers registered; exactly one is allowed")]
    DuplicateRequestHandler { message_type: String, count: usize },
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
    #[error("exactly-once subscription to {destination} requires an inbox")]
    MissingInbox { destination: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(MediatorError::Transient("db".into()).is_transient());
        assert!(MediatorError::Timeout { timeout_ms: 10 }.is_transient());
        assert!(!MediatorError::Validation("bad".into()).is_transient());
        assert!(!MediatorError::CircuitOpen { key: "x".into() }.is_transient());
        assert!(!MediatorError::Cancelled.is_transient());
    }

    #[test]
    fn breaker_accounting_ignores_caller_errors() {
        assert!(!MediatorError::Validation("bad".into()).counts_as_failure());
        assert!(!MediatorError::Cancelled.counts_as_failure());
        assert!(MediatorError::Transient("db".into()).counts_as_failure());
        assert!(MediatorError::Handler(anyhow::anyhow!("boom")).counts_as_failure());
    }

    #[test]
    fn stored_form_preserves_kind_and_text() {
        let original = MediatorError::Validation("quantity must be positive".into());
        let rebuilt = MediatorError::from_stored(original.kind(), original.stored_message());
        assert_eq!(rebuilt.kind(), ErrorKind::Validation);
        assert_eq!(rebuilt.to_string(), original.to_string());

        let timeout = MediatorError::Timeout { timeout_ms: 250 };
        let rebuilt = MediatorError::from_stored(timeout.kind(), timeout.stored_message());
        assert!(matches!(rebuilt, MediatorError::Timeout { timeout_ms: 250 }));
    }

    #[test]
    fn handler_error_converts_from_anyhow() {
        fn fails() -> Result<(), MediatorError> {
            Err::<(), _>(anyhow::anyhow!("inventory service refused"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handler);
        assert!(err.to_string().contains("inventory service refused"));
    }
}
