//! Periodic removal of expired store records.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::KeyValueBackend;
use tracing::{debug, warn};

use crate::worker::BackgroundRunnable;

#[derive(Debug)]
pub enum SweepTask {
    /// Sweep now instead of waiting for the next tick.
    Now,
}

/// Calls [`KeyValueBackend::purge_expired`] on every tick.
pub struct ExpirySweeper {
    backend: Arc<dyn KeyValueBackend>,
    purged_total: u64,
}

impl ExpirySweeper {
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            purged_total: 0,
        }
    }

    /// Runs one sweep and returns how many records were dropped.
    pub async fn sweep(&mut self) -> usize {
        match self.backend.purge_expired().await {
            Ok(purged) => {
                let count = u64::try_from(purged).unwrap_or(u64::MAX);
                self.purged_total = self.purged_total.saturating_add(count);
                if purged > 0 {
                    metrics::counter!("courier_store_purged_total").increment(count);
                    debug!(purged, total = self.purged_total, "purged expired records");
                }
                purged
            }
            Err(err) => {
                warn!(error = %err, "expiry sweep failed");
                0
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for ExpirySweeper {
    type Task = SweepTask;

    fn name(&self) -> &'static str {
        "expiry-sweeper"
    }

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::Now => {
                self.sweep().await;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::ManualClock;

    use super::*;
    use crate::storage::InMemoryBackend;
    use crate::worker::BackgroundWorker;

    #[tokio::test]
    async fn sweep_drops_expired_records() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
        backend
            .set("idem:a", vec![1], Some(Duration::from_millis(10)))
            .await
            .unwrap();
        backend.set("idem:b", vec![2], None).await.unwrap();
        clock.advance(Duration::from_millis(20));

        let mut sweeper = ExpirySweeper::new(backend.clone());
        assert_eq!(sweeper.sweep().await, 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn sweeps_on_demand_through_worker() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
        backend
            .set("inbox:a", vec![1], Some(Duration::from_millis(1)))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(5));

        let mut worker = BackgroundWorker::start(ExpirySweeper::new(backend.clone()), Duration::from_secs(3_600));
        worker.submit(SweepTask::Now).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;
        assert!(backend.is_empty());
    }
}
