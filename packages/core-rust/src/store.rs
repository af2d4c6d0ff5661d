//! Persistence contract shared by the idempotency, inbox and outbox stores.
//!
//! A [`KeyValueBackend`] is the only thing a custom storage engine has to
//! implement. Keys are namespaced strings (`idem:<id>`, `inbox:<id>`,
//! `outbox:<id>`); values are opaque bytes encoded by the store above.
//!
//! Expired keys must behave exactly like absent keys for every operation.
//! Backends may expire lazily on access, in [`KeyValueBackend::purge_expired`],
//! or natively.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::MediatorError;

/// Failures reported by a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<BackendError> for MediatorError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Corrupt { key, reason } => {
                MediatorError::Serialization(format!("{key}: {reason}"))
            }
            other => MediatorError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Async key-value storage with per-key TTL and atomic conditional writes.
///
/// `set_if_absent` and `compare_and_swap` must be atomic with respect to
/// each other for the same key: they are how stores guarantee a single
/// winner among concurrent claimants and forbid status regressions.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Reads the live value under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Unconditionally writes `value`. `None` ttl means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), BackendError>;

    /// Writes `value` only if no live value exists. Returns `true` if written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Replaces the live value only if it equals `expected`. Returns `true` if swapped.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Removes `key`. Returns `true` if a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Whether a live value exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Every live key starting with `prefix`, in unspecified order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Physically removes expired entries, returning how many were dropped.
    ///
    /// Backends with native expiry can keep the default no-op.
    async fn purge_expired(&self) -> Result<usize, BackendError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn unavailable_maps_to_store_unavailable() {
        let err: MediatorError = BackendError::Unavailable("connection refused".into()).into();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(err.is_transient());
    }

    #[test]
    fn corrupt_maps_to_serialization() {
        let err: MediatorError = BackendError::Corrupt {
            key: "idem:1".into(),
            reason: "truncated".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
