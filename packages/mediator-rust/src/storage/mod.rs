//! Reliability stores and the bundled in-memory backend.
//!
//! Every store is a thin typed layer over a
//! [`KeyValueBackend`](courier_core::KeyValueBackend); swapping the backend
//! swaps persistence for all of them at once.

pub mod idempotency;
pub mod inbox;
pub mod memory;
pub mod outbox;
pub mod sweeper;

pub use idempotency::{Claim, IdempotencyStore};
pub use inbox::{InboxClaim, InboxStore};
pub use memory::InMemoryBackend;
pub use outbox::{KvOutboxStore, OutboxCounts, OutboxStore};
pub use sweeper::{ExpirySweeper, SweepTask};
