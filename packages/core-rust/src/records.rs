//! Records owned by the idempotency, inbox and outbox stores.
//!
//! These are the values persisted through a
//! [`KeyValueBackend`](crate::store::KeyValueBackend). All times are
//! milliseconds since Unix epoch.

use serde::{Deserialize, Serialize};

use crate::id::MessageId;
use crate::message::{MessageHeaders, Qos};
use crate::outcome::StoredOutcome;

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

/// Processing state of one message id in the idempotency store.
///
/// Unseen is represented by the absence of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum IdempotencyState {
    /// A caller owns processing until `lease_expires_at_ms`.
    Processing { lease_expires_at_ms: u64 },
    /// Processing finished; the outcome is immutable until the record expires.
    Completed { outcome: StoredOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub message_id: MessageId,
    pub state: IdempotencyState,
    pub claimed_at_ms: u64,
    /// Set once the record reaches `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at_ms: Option<u64>,
    pub expires_at_ms: u64,
}

impl IdempotencyRecord {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.state, IdempotencyState::Completed { .. })
    }

    /// The cached outcome, if processing has completed.
    #[must_use]
    pub fn outcome(&self) -> Option<&StoredOutcome> {
        match &self.state {
            IdempotencyState::Completed { outcome } => Some(outcome),
            IdempotencyState::Processing { .. } => None,
        }
    }

    /// Whether a `Processing` claim has outlived its lease at `now_ms`.
    #[must_use]
    pub fn lease_expired(&self, now_ms: u64) -> bool {
        match self.state {
            IdempotencyState::Processing { lease_expires_at_ms } => now_ms >= lease_expires_at_ms,
            IdempotencyState::Completed { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxStatus {
    Claimed,
    /// Terminal.
    Processed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    pub message_id: MessageId,
    pub message_type: String,
    pub status: InboxStatus,
    pub claimed_at_ms: u64,
    /// Claims older than this may be taken over by a redelivery.
    pub lease_expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    /// Terminal: confirmed by the transport.
    Published,
    /// Terminal: retry budget exhausted, awaiting dead-letter handling.
    Failed,
}

impl OutboxStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }
}

/// An event queued for publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub headers: MessageHeaders,
    /// Transport destination (topic, queue or routing key).
    pub destination: String,
    /// Serialized event payload.
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub created_at_ms: u64,
    /// Number of publish attempts made so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at_ms: Option<u64>,
}

impl OutboxEntry {
    /// A new `Pending` entry. `created_at_ms` is taken from the headers.
    #[must_use]
    pub fn pending(headers: MessageHeaders, destination: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            created_at_ms: headers.created_at_ms,
            headers,
            destination: destination.into(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            published_at_ms: None,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.headers.id
    }

    #[must_use]
    pub fn qos(&self) -> Qos {
        self.headers.qos
    }
}
