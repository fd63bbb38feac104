// Event source abstraction.
//
// The dispatcher pulls deliveries one at a time and only asks for the next
// one after the previous is queued, ignored or rejected. A transport that
// needs to know the verdict (the HTTP ingress, a broker consumer that acks
// offsets) attaches a oneshot channel to the delivery.

use std::future::Future;

use repomirror_common::event::InboundEvent;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAck {
    /// Accepted into the sync queue.
    Queued,
    /// Well-formed but not a push.
    Ignored,
    /// Permanently invalid; redelivery will not help.
    Rejected(String),
    /// The dispatcher stopped before the event was queued.
    ShuttingDown,
}

#[derive(Debug)]
pub struct Delivery {
    pub event: InboundEvent,
    ack: Option<oneshot::Sender<DeliveryAck>>,
}

impl Delivery {
    /// A fire-and-forget delivery.
    pub fn new(event: InboundEvent) -> Self {
        Self { event, ack: None }
    }

    pub fn with_ack(event: InboundEvent) -> (Self, oneshot::Receiver<DeliveryAck>) {
        let (tx, rx) = oneshot::channel();
        (Self { event, ack: Some(tx) }, rx)
    }

    /// Report the verdict. A receiver that has gone away is not an error.
    pub fn acknowledge(&mut self, ack: DeliveryAck) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(ack);
        }
    }
}

pub trait EventSource: Send + 'static {
    /// Next delivery, or `None` once the source is exhausted.
    fn next_delivery(&mut self) -> impl Future<Output = Option<Delivery>> + Send;
}

/// In-process source fed by [`EventSender`] handles.
#[derive(Debug)]
pub struct ChannelEventSource {
    rx: mpsc::Receiver<Delivery>,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Delivery>,
}

/// Create a source and its sender. `buffer` bounds deliveries waiting to be
/// pulled; keep it small so a full sync queue is felt by producers.
pub fn channel_source(buffer: usize) -> (EventSender, ChannelEventSource) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EventSender { tx }, ChannelEventSource { rx })
}

impl EventSource for ChannelEventSource {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl EventSender {
    /// Hand over `event` and wait for the dispatcher's verdict.
    pub async fn deliver(&self, event: InboundEvent) -> DeliveryAck {
        let (delivery, ack) = Delivery::with_ack(event);
        if self.tx.send(delivery).await.is_err() {
            return DeliveryAck::ShuttingDown;
        }
        // A dropped delivery means the dispatcher went away with it unqueued.
        ack.await.unwrap_or(DeliveryAck::ShuttingDown)
    }

    /// Hand over `event` without waiting for a verdict.
    pub async fn publish(&self, event: InboundEvent) -> bool {
        self.tx.send(Delivery::new(event)).await.is_ok()
    }
}
