//! Background publisher that drains the outbox to a transport.
//!
//! Only the leader drains. Each entry is handled on its own: a transport
//! failure or a failed bookkeeping write on one entry never stops the rest
//! of the batch.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{ConfigError, MediatorError, OutboxEntry, OutboxStatus};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::OutboxConfig;
use crate::leadership::LeadershipSignal;
use crate::storage::OutboxStore;
use crate::transport::{Transport, TransportMessage};
use crate::worker::BackgroundRunnable;

#[derive(Debug)]
pub enum OutboxTask {
    /// Drain now instead of waiting for the next tick.
    DrainNow,
    /// Drain now and report the result.
    DrainAndNotify(oneshot::Sender<DrainReport>),
}

/// What one drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub published: usize,
    /// Publish attempts that failed but left the entry pending.
    pub failed_attempts: usize,
    /// Entries that ran out of attempts and moved to `Failed`.
    pub dead_lettered: usize,
    /// Set when the drain was skipped because this process is not the leader.
    pub skipped_not_leader: bool,
}

/// Publishes pending outbox entries to a transport.
///
/// Entries are marked `Published` only after the transport accepted them, so
/// a crash in between leaves them `Pending` and they go out again on the next
/// drain. Consumers deduplicate by message id.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn Transport>,
    leadership: Arc<dyn LeadershipSignal>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if `config` does not validate.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn Transport>,
        leadership: Arc<dyn LeadershipSignal>,
        config: OutboxConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            transport,
            leadership,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Publishes up to one batch of pending entries.
    ///
    /// # Errors
    ///
    /// Store errors while listing pending entries. Per-entry failures,
    /// including a failure to record one, are logged and counted in the
    /// report instead.
    pub async fn drain_once(&self) -> Result<DrainReport, MediatorError> {
        let mut report = DrainReport::default();
        if !self.leadership.is_leader() {
            report.skipped_not_leader = true;
            return Ok(report);
        }

        let batch = self.store.pending(self.config.batch_size).await?;
        for entry in batch {
            match self.publish_entry(&entry).await {
                Ok(()) => report.published += 1,
                Err(err) => {
                    let reason = err.to_string();
                    let recorded = self
                        .store
                        .record_failure(entry.message_id(), &reason, self.config.max_attempts)
                        .await;
                    match recorded {
                        Ok(OutboxStatus::Failed) => {
                            report.dead_lettered += 1;
                            metrics::counter!("courier_outbox_failed_total", "destination" => entry.destination.clone())
                                .increment(1);
                            error!(
                                message_id = %entry.message_id(),
                                destination = %entry.destination,
                                error = %reason,
                                "outbox entry dead-lettered"
                            );
                        }
                        Ok(OutboxStatus::Pending | OutboxStatus::Published) => {
                            report.failed_attempts += 1;
                            warn!(
                                message_id = %entry.message_id(),
                                destination = %entry.destination,
                                attempt = entry.attempts + 1,
                                error = %reason,
                                "outbox publish failed"
                            );
                        }
                        // The attempt is not counted, so the entry gets one
                        // more try than `max_attempts` allows.
                        Err(store_err) => {
                            report.failed_attempts += 1;
                            warn!(
                                message_id = %entry.message_id(),
                                error = %reason,
                                store_error = %store_err,
                                "outbox publish failed and the failure was not recorded"
                            );
                        }
                    }
                }
            }
        }

        if report.published > 0 || report.failed_attempts > 0 || report.dead_lettered > 0 {
            debug!(
                published = report.published,
                failed_attempts = report.failed_attempts,
                dead_lettered = report.dead_lettered,
                "outbox drained"
            );
        }
        Ok(report)
    }

    async fn publish_entry(&self, entry: &OutboxEntry) -> Result<(), MediatorError> {
        let message = TransportMessage::new(entry.headers.clone(), entry.destination.clone(), entry.payload.clone());
        self.transport.publish(message).await?;
        // The transport has it. If this write fails the entry stays pending
        // and is published again.
        if let Err(err) = self.store.mark_published(entry.message_id()).await {
            warn!(message_id = %entry.message_id(), error = %err, "published but not marked; will republish");
            return Ok(());
        }
        metrics::counter!("courier_outbox_published_total", "destination" => entry.destination.clone()).increment(1);
        Ok(())
    }

    async fn drain_logged(&self) -> DrainReport {
        match self.drain_once().await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "outbox drain failed");
                DrainReport::default()
            }
        }
    }
}

impl std::fmt::Debug for OutboxPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxPublisher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BackgroundRunnable for OutboxPublisher {
    type Task = OutboxTask;

    fn name(&self) -> &'static str {
        "outbox-publisher"
    }

    async fn run(&mut self, task: OutboxTask) {
        match task {
            OutboxTask::DrainNow => {
                self.drain_logged().await;
            }
            OutboxTask::DrainAndNotify(reply) => {
                let report = self.drain_logged().await;
                let _ = reply.send(report);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.drain_logged().await;
    }

    async fn shutdown(&mut self) {
        // Last chance to flush what is already committed.
        self.drain_logged().await;
    }
}
