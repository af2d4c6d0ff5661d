//! In-process transport over bounded tokio channels.
//!
//! Each subscription owns a bounded queue and a consumer task. Acknowledged
//! publishes wait (up to `ack_timeout`) for queue space and fail when a
//! destination has no subscribers; at-most-once publishes never wait and
//! silently drop on a full queue. Rejected deliveries are redelivered in
//! place, preserving per-subscription order, until `max_redeliveries`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use courier_core::{ConfigError, MediatorError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use super::{Delivery, DeliveryHandler, Subscription, Transport, TransportMessage};
use crate::config::InProcessTransportConfig;

#[derive(Clone)]
struct Route {
    id: u64,
    tx: mpsc::Sender<Delivery>,
}

type RouteTable = HashMap<String, Vec<Route>>;

struct Shared {
    /// Copy-on-write: publishes read a snapshot, (un)subscribes swap in a new table.
    routes: ArcSwap<RouteTable>,
    next_id: AtomicU64,
    config: InProcessTransportConfig,
}

impl Shared {
    fn remove_route(&self, destination: &str, id: u64) {
        self.routes.rcu(|table| {
            let mut next = RouteTable::clone(table);
            if let Some(routes) = next.get_mut(destination) {
                routes.retain(|route| route.id != id);
                if routes.is_empty() {
                    next.remove(destination);
                }
            }
            next
        });
    }
}

/// Transport for a single process: tests, demos and modular monoliths.
#[derive(Clone)]
pub struct InProcessTransport {
    shared: Arc<Shared>,
}

impl InProcessTransport {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` for a zero queue capacity.
    pub fn new(config: InProcessTransportConfig) -> Result<Self, ConfigError> {
        if config.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "queue_capacity",
                reason: "must be non-zero".into(),
            });
        }
        Ok(Self {
            shared: Arc::new(Shared {
                routes: ArcSwap::from_pointee(RouteTable::new()),
                next_id: AtomicU64::new(1),
                config,
            }),
        })
    }

    #[must_use]
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.shared.routes.load().get(destination).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("destinations", &self.shared.routes.load().len())
            .field("config", &self.shared.config)
            .finish()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn publish(&self, message: TransportMessage) -> Result<(), MediatorError> {
        let routes = self
            .shared
            .routes
            .load()
            .get(&message.destination)
            .cloned()
            .unwrap_or_default();
        let qos = message.qos();
        let destination = message.destination.clone();

        if routes.is_empty() {
            if qos.requires_ack() {
                return Err(MediatorError::Transport(format!("no subscribers for {destination}")));
            }
            metrics::counter!("courier_transport_dropped_total", "reason" => "no_subscribers").increment(1);
            return Ok(());
        }

        for route in routes {
            let delivery = Delivery {
                message: message.clone(),
                attempt: 1,
            };
            if !qos.requires_ack() {
                if route.tx.try_send(delivery).is_err() {
                    metrics::counter!("courier_transport_dropped_total", "reason" => "queue_full").increment(1);
                    debug!(destination = %destination, "at-most-once delivery dropped");
                }
                continue;
            }
            match tokio::time::timeout(self.shared.config.ack_timeout, route.tx.send(delivery)).await {
                Ok(Ok(())) => {}
                Ok(Err(_closed)) => {
                    return Err(MediatorError::Transport(format!("subscriber on {destination} closed")));
                }
                Err(_elapsed) => {
                    return Err(MediatorError::Transport(format!("ack timeout publishing to {destination}")));
                }
            }
        }

        metrics::counter!(
            "courier_transport_published_total",
            "destination" => destination,
            "qos" => qos.as_str(),
        )
        .increment(1);
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, MediatorError> {
        let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.routes.rcu(|table| {
            let mut next = RouteTable::clone(table);
            next.entry(destination.to_string()).or_default().push(Route { id, tx: tx.clone() });
            next
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            consume(rx, handler, self.shared.config.clone(), cancel.clone())
                .instrument(info_span!("subscription", destination, id)),
        );

        let shared = Arc::clone(&self.shared);
        let owned = destination.to_string();
        Ok(Subscription::new(destination, cancel, Some(task), move || {
            shared.remove_route(&owned, id);
        }))
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Delivery>,
    handler: Arc<dyn DeliveryHandler>,
    config: InProcessTransportConfig,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        deliver(handler.as_ref(), delivery, &config, &cancel).await;
    }
}

async fn deliver(
    handler: &dyn DeliveryHandler,
    mut delivery: Delivery,
    config: &InProcessTransportConfig,
    cancel: &CancellationToken,
) {
    loop {
        let Err(err) = handler.on_delivery(delivery.clone()).await else {
            return;
        };
        let headers = &delivery.message.headers;
        if !headers.qos.allows_redelivery() || delivery.attempt > config.max_redeliveries {
            metrics::counter!("courier_transport_dropped_total", "reason" => "rejected").increment(1);
            warn!(
                message_id = %headers.id,
                message_type = %headers.message_type,
                attempt = delivery.attempt,
                error = %err,
                "delivery rejected; dropping"
            );
            return;
        }

        metrics::counter!("courier_transport_redeliveries_total").increment(1);
        debug!(message_id = %headers.id, attempt = delivery.attempt, error = %err, "redelivering");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(config.redelivery_delay) => {}
        }
        delivery.attempt += 1;
    }
}
