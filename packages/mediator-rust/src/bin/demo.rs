//! End-to-end walk through the reliability pipeline.
//!
//! A command handler writes `OrderPlaced` events to the outbox; the outbox
//! publisher moves them onto the in-process transport; an inbox-guarded
//! endpoint dispatches them into a second mediator. Duplicate commands and
//! duplicate deliveries are injected along the way and absorbed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use courier_core::clock::system_clock;
use courier_core::{
    Envelope, Event, JsonSerializer, MediatorError, Message, MessageId, Qos, Request, SharedIdSupplier, UuidSupplier,
};
use courier_mediator::behaviors::{IdempotencyLayer, RetryLayer};
use courier_mediator::config::{IdempotencyConfig, InProcessTransportConfig, InboxConfig, OutboxConfig, RetryConfig};
use courier_mediator::outbox::{OutboxPublisher, OutboxTask, OutboxWriter};
use courier_mediator::storage::{InMemoryBackend, InboxStore, IdempotencyStore, KvOutboxStore, OutboxStore};
use courier_mediator::telemetry::init_tracing;
use courier_mediator::transport::{EventEndpoint, InProcessTransport, Transport, TransportMessage};
use courier_mediator::{event_fn, request_fn, AlwaysLeader, BackgroundWorker, Mediator};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DESTINATION: &str = "orders";

/// Courier reliability demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of orders to place
    #[arg(short, long, default_value_t = 3, env = "COURIER_DEMO_ORDERS")]
    orders: u32,

    /// Emit logs as JSON
    #[arg(long, env = "COURIER_DEMO_JSON")]
    json: bool,

    /// Default log filter when `RUST_LOG` is unset
    #[arg(short, long, default_value = "info,courier_mediator=debug")]
    log_level: String,

    /// Outbox poll interval in milliseconds
    #[arg(long, default_value_t = 200)]
    poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlaceOrder {
    order_id: String,
}

impl Message for PlaceOrder {
    fn message_type() -> &'static str {
        "orders.place"
    }
}

impl Request for PlaceOrder {
    type Response = String;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
}

impl Message for OrderPlaced {
    fn message_type() -> &'static str {
        "orders.placed"
    }
}

impl Event for OrderPlaced {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json)?;

    let clock = system_clock();
    let ids: SharedIdSupplier = Arc::new(UuidSupplier);
    let backend = Arc::new(InMemoryBackend::new());
    let transport = Arc::new(InProcessTransport::new(InProcessTransportConfig::default())?);

    // Receiving side.
    let shipped = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&shipped);
    let receiver = Mediator::builder()
        .event_handler(event_fn("ship-order", move |envelope: Envelope<OrderPlaced>, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                info!(order_id = %envelope.payload().order_id, "shipping order");
                Ok(())
            }
        }))
        .build()?;
    let inbox = Arc::new(InboxStore::new(
        backend.clone(),
        JsonSerializer,
        clock.clone(),
        InboxConfig::default(),
    ));
    let subscription = EventEndpoint::<OrderPlaced>::new(
        receiver,
        DESTINATION,
        Qos::ExactlyOnce,
        JsonSerializer,
        Some(inbox),
    )?
    .subscribe(transport.as_ref())
    .await?;

    // Sending side.
    let outbox_config = OutboxConfig {
        poll_interval: Duration::from_millis(cli.poll_ms),
        ..OutboxConfig::default()
    };
    let outbox: Arc<dyn OutboxStore> = Arc::new(KvOutboxStore::new(
        backend.clone(),
        JsonSerializer,
        clock.clone(),
        outbox_config.published_retention,
    )
    .with_failed_retention(outbox_config.failed_retention));
    let writer = Arc::new(OutboxWriter::new(
        outbox.clone(),
        JsonSerializer,
        ids.clone(),
        clock.clone(),
    ));
    let idempotency = Arc::new(IdempotencyStore::new(
        backend.clone(),
        JsonSerializer,
        clock.clone(),
        IdempotencyConfig::default(),
    )?);

    let placed = Arc::new(AtomicU32::new(0));
    let placed_counter = Arc::clone(&placed);
    let (event_ids_source, event_clock) = (ids.clone(), clock.clone());
    let sender = Mediator::builder()
        .request_handler(request_fn("place-order", move |envelope: Envelope<PlaceOrder>, _| {
            let writer = Arc::clone(&writer);
            let placed = Arc::clone(&placed_counter);
            let (ids, clock) = (Arc::clone(&event_ids_source), Arc::clone(&event_clock));
            async move {
                let order_id = envelope.payload().order_id.clone();
                let event = Envelope::new(
                    OrderPlaced {
                        order_id: order_id.clone(),
                    },
                    ids.as_ref(),
                    clock.as_ref(),
                )
                .with_causation(envelope.id().clone())
                .with_correlation(envelope.headers.correlation_id.clone())
                .with_qos(Qos::ExactlyOnce);
                let event_id = writer.enqueue(&event, DESTINATION).await?;
                placed.fetch_add(1, Ordering::SeqCst);
                info!(order_id = %order_id, event_id = %event_id, "order accepted");
                Ok::<_, MediatorError>(event_id.to_string())
            }
        }))
        .request_behavior::<PlaceOrder, _>(IdempotencyLayer::new(idempotency))
        .request_behavior::<PlaceOrder, _>(RetryLayer::new(RetryConfig::default()))
        .id_supplier(ids)
        .clock(clock)
        .build()?;

    let mut event_ids = Vec::new();
    for n in 0..cli.orders {
        let envelope = sender.envelope(PlaceOrder {
            order_id: format!("order-{n}"),
        });
        let event_id = sender
            .send_envelope(envelope.clone(), CancellationToken::new())
            .await?;
        // A client retry of the same command replays the stored result.
        let replayed = sender.send_envelope(envelope, CancellationToken::new()).await?;
        anyhow::ensure!(replayed == event_id, "replayed command produced a different event");
        event_ids.push(MessageId::new(event_id));
    }

    let publisher = OutboxPublisher::new(
        outbox.clone(),
        transport.clone() as Arc<dyn Transport>,
        Arc::new(AlwaysLeader),
        outbox_config.clone(),
    )?;
    let mut worker = BackgroundWorker::start(publisher, outbox_config.poll_interval);
    let (tx, rx) = oneshot::channel();
    worker
        .submit(OutboxTask::DrainAndNotify(tx))
        .await
        .context("outbox publisher stopped")?;
    let report = rx.await.context("outbox publisher dropped the drain reply")?;
    info!(published = report.published, "outbox drained");

    let counts = outbox.counts().await?;
    info!(pending = counts.pending, published = counts.published, "outbox status");

    // A broker redelivering after a lost ack: the inbox drops the copy.
    let mut redelivered = 0_u32;
    if let Some(entry) = match event_ids.first() {
        Some(id) => outbox.get(id).await?,
        None => None,
    } {
        transport
            .publish(TransportMessage::new(entry.headers, entry.destination, entry.payload))
            .await?;
        redelivered += 1;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.stop().await;
    subscription.close().await;

    info!(
        commands = cli.orders,
        handler_runs = placed.load(Ordering::SeqCst),
        shipped = shipped.load(Ordering::SeqCst),
        redelivered,
        "demo finished"
    );
    Ok(())
}
