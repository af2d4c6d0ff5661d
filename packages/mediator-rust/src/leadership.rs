//! Leader gating for singleton background work.
//!
//! With several processes sharing one outbox, only the elected leader
//! should publish. Election itself happens elsewhere; the publisher only
//! reads the current verdict through [`LeadershipSignal`].

use tokio::sync::watch;

pub trait LeadershipSignal: Send + Sync + 'static {
    fn is_leader(&self) -> bool;
}

/// Single-process deployments: always the leader.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLeader;

impl LeadershipSignal for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Leadership driven by a `watch` channel fed by an external elector.
#[derive(Debug, Clone)]
pub struct WatchLeadership {
    rx: watch::Receiver<bool>,
}

impl WatchLeadership {
    #[must_use]
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal plus the sender that flips it.
    #[must_use]
    pub fn channel(initially_leader: bool) -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(initially_leader);
        (tx, Self::new(rx))
    }
}

impl LeadershipSignal for WatchLeadership {
    fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }
}
