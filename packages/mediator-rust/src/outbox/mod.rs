//! Transactional outbox: writing pending events and publishing them.
//!
//! [`OutboxWriter`] turns an event into a `Pending` entry, to be stored in
//! the same transaction as the state change that raised it.
//! [`OutboxPublisher`] runs on a [`BackgroundWorker`](crate::worker::BackgroundWorker)
//! and moves entries onto a [`Transport`](crate::transport::Transport).

mod publisher;
mod writer;

pub use publisher::{DrainReport, OutboxPublisher, OutboxTask};
pub use writer::OutboxWriter;
