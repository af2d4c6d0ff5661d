//! Message identity: ids, correlation ids, and the id supplier contract.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Globally unique identifier assigned to a message exactly once, at creation.
///
/// Serialized as a bare string. The generation algorithm belongs to the
/// configured [`IdSupplier`]; Courier never parses the contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an externally produced id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier tying together every message caused by one logical operation.
///
/// Defaults to the id of the message that started the chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&MessageId> for CorrelationId {
    fn from(id: &MessageId) -> Self {
        Self(id.0.clone())
    }
}

/// Produces fresh message ids.
///
/// Implementations must never hand out the same id twice within the
/// retention window of the idempotency and inbox stores.
pub trait IdSupplier: Send + Sync {
    /// Returns a new, globally unique message id.
    fn next_id(&self) -> MessageId;
}

/// Default supplier: random UUID v4 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSupplier;

impl IdSupplier for UuidSupplier {
    fn next_id(&self) -> MessageId {
        MessageId(uuid::Uuid::new_v4().to_string())
    }
}

/// Shared handle to an id supplier.
pub type SharedIdSupplier = Arc<dyn IdSupplier>;
