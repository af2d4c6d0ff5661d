//! Persisted form of a dispatch outcome.
//!
//! In memory an outcome is simply `Result<T, MediatorError>`. When the
//! idempotency store caches it, the value is encoded with the configured
//! [`Serializer`] and the error is reduced to its [`ErrorKind`] and text.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, MediatorError};
use crate::serializer::Serializer;

/// A cached outcome: exactly one of a success payload or a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum StoredOutcome {
    Success {
        /// Serialized response value.
        value: Vec<u8>,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl StoredOutcome {
    /// Captures `result` for caching.
    ///
    /// # Errors
    ///
    /// Returns `MediatorError::Serialization` if the success value cannot be encoded.
    pub fn capture<T, S>(result: &Result<T, MediatorError>, serializer: &S) -> Result<Self, MediatorError>
    where
        T: Serialize,
        S: Serializer,
    {
        Ok(match result {
            Ok(value) => StoredOutcome::Success {
                value: serializer.serialize(value)?,
            },
            Err(err) => StoredOutcome::Failure {
                kind: err.kind(),
                message: err.stored_message(),
            },
        })
    }

    /// Restores the typed outcome.
    ///
    /// A cached value that no longer decodes as `T` surfaces as a
    /// serialization failure rather than being silently re-executed.
    pub fn restore<T, S>(&self, serializer: &S) -> Result<T, MediatorError>
    where
        T: DeserializeOwned,
        S: Serializer,
    {
        match self {
            StoredOutcome::Success { value } => serializer.deserialize(value),
            StoredOutcome::Failure { kind, message } => {
                Err(MediatorError::from_stored(*kind, message.clone()))
            }
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, StoredOutcome::Success { .. })
    }
}
