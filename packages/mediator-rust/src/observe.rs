//! Observability hooks fired around every dispatch.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{CorrelationId, ErrorKind, MessageId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Send,
    Publish,
}

impl DispatchKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchKind::Send => "send",
            DispatchKind::Publish => "publish",
        }
    }
}

/// Identity of one dispatch, handed to observers.
#[derive(Debug, Clone)]
pub struct DispatchInfo {
    pub kind: DispatchKind,
    pub message_type: &'static str,
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failure(ErrorKind),
    /// Publish where `failed` of `total` handlers failed.
    Partial { failed: usize, total: usize },
}

impl DispatchOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchOutcome::Success => "ok",
            DispatchOutcome::Failure(kind) => kind.as_str(),
            DispatchOutcome::Partial { .. } => "partial",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, DispatchOutcome::Success)
    }
}

/// Sink for dispatch start/completion. Exporters live outside this crate.
pub trait DispatchObserver: Send + Sync + 'static {
    fn on_start(&self, _info: &DispatchInfo) {}

    fn on_complete(&self, info: &DispatchInfo, outcome: DispatchOutcome, elapsed: Duration);
}

/// Default observer: `tracing` events plus `metrics` counters and histograms.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl DispatchObserver for TracingObserver {
    fn on_start(&self, info: &DispatchInfo) {
        debug!(
            kind = info.kind.as_str(),
            message_type = info.message_type,
            message_id = %info.message_id,
            "dispatch started"
        );
    }

    fn on_complete(&self, info: &DispatchInfo, outcome: DispatchOutcome, elapsed: Duration) {
        let kind = info.kind.as_str();
        let labels = [
            ("kind", kind.to_string()),
            ("message_type", info.message_type.to_string()),
            ("outcome", outcome.as_str().to_string()),
        ];
        metrics::counter!("courier_dispatch_total", &labels[..]).increment(1);
        metrics::histogram!(
            "courier_dispatch_duration_seconds",
            "kind" => kind,
            "message_type" => info.message_type,
        )
        .record(elapsed.as_secs_f64());

        if outcome.is_success() {
            debug!(kind, message_type = info.message_type, "dispatch complete");
        } else {
            metrics::counter!("courier_dispatch_failures_total", &labels[..]).increment(1);
            warn!(
                kind,
                message_type = info.message_type,
                message_id = %info.message_id,
                correlation_id = %info.correlation_id,
                outcome = outcome.as_str(),
                "dispatch failed"
            );
        }
    }
}

/// Fans every notification out to several observers, in order.
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn DispatchObserver>>,
}

impl CompositeObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl DispatchObserver for CompositeObserver {
    fn on_start(&self, info: &DispatchInfo) {
        for observer in &self.observers {
            observer.on_start(info);
        }
    }

    fn on_complete(&self, info: &DispatchInfo, outcome: DispatchOutcome, elapsed: Duration) {
        for observer in &self.observers {
            observer.on_complete(info, outcome, elapsed);
        }
    }
}
