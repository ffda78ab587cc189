// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes messages on a dedicated publish channel and tracks
//! every message until the broker settles it. Each `publish` call assigns the
//! next correlation id, transmits the message, and hands the caller a future
//! that resolves to `Confirmed`, `Nacked`, or `Lost`. A semaphore sized to the
//! configured watermark applies backpressure once too many messages are
//! unconfirmed, bounding memory growth when the broker or network stalls.
//!
//! The publisher is re-armed by the reconnection supervisor with a fresh
//! channel after every reconnect; messages still pending at the moment of
//! loss resolve to `Lost`, and whether to republish is the caller's decision.

use crate::{
    channel::RoleChannel,
    config::{OutboxPolicy, PublisherConfig},
    confirm::{ConfirmLedger, ConfirmResult, PendingConfirm},
    errors::AmqpError,
    otel,
};
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::{AMQPValue, FieldTable, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties,
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex, Semaphore},
    time::{sleep, timeout, Instant},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for messages that do not specify one.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// A typed header value carried in the message's AMQP header table.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Text(String),
    Int(i64),
    UInt(u32),
    Bool(bool),
}

impl HeaderValue {
    fn to_amqp(&self) -> AMQPValue {
        match self {
            HeaderValue::Text(value) => AMQPValue::LongString(LongString::from(value.clone())),
            HeaderValue::Int(value) => AMQPValue::LongLongInt(LongLongInt::from(*value)),
            HeaderValue::UInt(value) => AMQPValue::LongUInt(LongUInt::from(*value)),
            HeaderValue::Bool(value) => AMQPValue::Boolean(*value),
        }
    }
}

/// An outbound message with its routing metadata.
///
/// The payload is opaque bytes; serialization is the caller's concern.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) message_type: Option<String>,
    pub(crate) content_type: String,
    pub(crate) headers: BTreeMap<String, HeaderValue>,
}

impl OutboundMessage {
    /// Creates a message for the given exchange and routing key.
    pub fn new(exchange: &str, routing_key: &str, payload: &[u8]) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_owned(),
            message_type: None,
            content_type: OCTET_STREAM_CONTENT_TYPE.to_owned(),
            headers: BTreeMap::new(),
        }
    }

    /// Sets the AMQP type property, used by consumers to pick a handler.
    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }
}

#[derive(Clone)]
struct ArmedChannel {
    channel: RoleChannel,
    confirm_tx: mpsc::UnboundedSender<(u64, PublisherConfirm)>,
}

struct QueuedPublish {
    correlation_id: u64,
    message: OutboundMessage,
    tx: oneshot::Sender<ConfirmResult>,
}

struct PublisherState {
    ledger: ConfirmLedger,
    armed: Option<ArmedChannel>,
    outbox: VecDeque<QueuedPublish>,
    // While true, all publishes are routed through the outbox so that wire
    // order keeps matching correlation-id order during a flush.
    flushing: bool,
}

struct PublisherInner {
    cfg: PublisherConfig,
    limiter: Arc<Semaphore>,
    state: Mutex<PublisherState>,
}

/// Publishes messages and tracks in-flight confirmations.
///
/// Cheap to clone; all clones share the same ledger and watermark.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(cfg: PublisherConfig) -> Publisher {
        let watermark = cfg.watermark.max(1);
        Publisher {
            inner: Arc::new(PublisherInner {
                cfg,
                limiter: Arc::new(Semaphore::new(watermark)),
                state: Mutex::new(PublisherState {
                    ledger: ConfirmLedger::new(),
                    armed: None,
                    outbox: VecDeque::new(),
                    flushing: false,
                }),
            }),
        }
    }

    /// Publishes a message and returns the future tracking its confirmation.
    ///
    /// Waits up to the configured interval when the watermark is reached, then
    /// fails with `Overloaded`. With no open session the outbox policy decides
    /// between failing fast with `NotConnected` and queuing the message until
    /// the supervisor re-arms the publisher.
    ///
    /// # Parameters
    /// * `message` - The message with its routing metadata
    ///
    /// # Returns
    /// * `Result<PendingConfirm, AmqpError>` - A future resolving to the
    ///   broker's verdict, or the reason the message was not accepted locally
    pub async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm, AmqpError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.armed.is_none() || state.flushing {
                return self.inner.queue_or_reject(&mut state, message);
            }
        }

        let permit = match timeout(
            self.inner.cfg.publish_wait(),
            self.inner.limiter.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AmqpError::Shutdown),
            Err(_) => {
                warn!("publish watermark exceeded");
                return Err(AmqpError::Overloaded);
            }
        };

        let mut state = self.inner.state.lock().await;
        let Some(armed) = state.armed.clone() else {
            // The session was lost while waiting for a permit.
            drop(permit);
            return self.inner.queue_or_reject(&mut state, message);
        };

        // The lock spans transmission and registration: ids are assigned in
        // wire order, which is what cumulative confirmation relies on.
        match armed
            .channel
            .inner()
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                build_properties(&message),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishRejected)
            }
            Ok(confirm) => {
                let (id, pending) = state
                    .ledger
                    .register(armed.channel.generation(), Some(permit));
                let _ = armed.confirm_tx.send((id, confirm));
                Ok(pending)
            }
        }
    }

    /// Installs a fresh publish channel and starts draining the outbox.
    ///
    /// Called by the supervisor whenever a session opens.
    pub(crate) async fn arm(&self, channel: RoleChannel) {
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        let generation = channel.generation();
        let queued = {
            let mut state = self.inner.state.lock().await;
            state.armed = Some(ArmedChannel {
                channel,
                confirm_tx,
            });
            state.flushing = !state.outbox.is_empty();
            state.outbox.len()
        };

        debug!(generation, "publisher armed");
        tokio::spawn(drive_confirms(self.inner.clone(), generation, confirm_rx));

        if queued > 0 {
            debug!(queued, "flushing outbox after reconnect");
            tokio::spawn(flush_outbox(self.inner.clone()));
        }
    }

    /// Drops the current channel and resolves everything still pending in its
    /// generation to `Lost`.
    ///
    /// Queued outbox messages are kept; their callers stay pending until the
    /// next successful reconnect flushes them.
    pub(crate) async fn disarm(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let Some(armed) = state.armed.take() else {
            return 0;
        };

        let generation = armed.channel.generation();
        let lost = state.ledger.abort_generation(generation);
        if lost > 0 {
            warn!(lost, generation, "pending confirmations resolved as lost");
        }
        lost
    }

    /// Disarms and resolves every queued outbox message to `Lost`.
    pub(crate) async fn shutdown(&self) -> usize {
        let lost = self.disarm().await;

        let mut state = self.inner.state.lock().await;
        let dropped = state.outbox.len();
        for entry in state.outbox.drain(..) {
            let _ = entry.tx.send(ConfirmResult::Lost);
        }
        if dropped > 0 {
            warn!(dropped, "queued messages resolved as lost at shutdown");
        }
        lost + dropped
    }

    /// Waits until every in-flight confirmation settles, up to the grace
    /// period. Returns whether the ledger fully drained.
    pub(crate) async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.inner.state.lock().await.ledger.pending_len() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    /// Number of messages awaiting a broker response.
    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.ledger.pending_len()
    }

    /// Number of messages queued while disconnected.
    pub async fn queued(&self) -> usize {
        self.inner.state.lock().await.outbox.len()
    }

    /// Highest correlation id the broker has confirmed.
    pub async fn highest_confirmed(&self) -> u64 {
        self.inner.state.lock().await.ledger.highest_confirmed()
    }
}

impl PublisherInner {
    fn queue_or_reject(
        &self,
        state: &mut PublisherState,
        message: OutboundMessage,
    ) -> Result<PendingConfirm, AmqpError> {
        match self.cfg.outbox {
            OutboxPolicy::Reject => Err(AmqpError::NotConnected),
            OutboxPolicy::Buffer { capacity } => {
                if state.outbox.len() >= capacity {
                    warn!(capacity, "outbox full, rejecting publish");
                    return Err(AmqpError::Overloaded);
                }

                let correlation_id = state.ledger.reserve();
                let (tx, rx) = oneshot::channel();
                state.outbox.push_back(QueuedPublish {
                    correlation_id,
                    message,
                    tx,
                });
                debug!(correlation_id, "message queued while disconnected");
                Ok(PendingConfirm::from_parts(correlation_id, rx))
            }
        }
    }
}

/// Awaits broker confirmations in send order and drives the ledger.
///
/// Runs once per publisher generation; ends when the generation's channel is
/// disarmed and the sender side is dropped.
async fn drive_confirms(
    inner: Arc<PublisherInner>,
    generation: u64,
    mut confirm_rx: mpsc::UnboundedReceiver<(u64, PublisherConfirm)>,
) {
    while let Some((id, confirm)) = confirm_rx.recv().await {
        let result = confirm.await;
        let mut state = inner.state.lock().await;
        match result {
            Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => {
                state.ledger.confirm_up_to(generation, id);
            }
            Ok(Confirmation::Nack(_)) => {
                warn!(correlation_id = id, "message nacked by the broker");
                state.ledger.nack(generation, id);
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    correlation_id = id,
                    "confirmation interrupted"
                );
                state.ledger.resolve_lost(generation, id);
            }
        }
    }
    debug!(generation, "confirmation driver stopped");
}

/// Drains the outbox onto a freshly armed channel in submission order.
///
/// While the flush runs, new publishes keep entering the outbox so that ids
/// and wire order stay aligned. A transmission failure leaves the message
/// queued for the next reconnect cycle.
async fn flush_outbox(inner: Arc<PublisherInner>) {
    loop {
        let entry = {
            let mut state = inner.state.lock().await;
            if state.armed.is_none() {
                break;
            }
            match state.outbox.pop_front() {
                Some(entry) => entry,
                None => {
                    state.flushing = false;
                    break;
                }
            }
        };

        let permit = match inner.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let mut state = inner.state.lock().await;
        let Some(armed) = state.armed.clone() else {
            state.outbox.push_front(entry);
            break;
        };

        match armed
            .channel
            .inner()
            .basic_publish(
                &entry.message.exchange,
                &entry.message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &entry.message.payload,
                build_properties(&entry.message),
            )
            .await
        {
            Ok(confirm) => {
                let id = state.ledger.register_reserved(
                    entry.correlation_id,
                    armed.channel.generation(),
                    Some(permit),
                    entry.tx,
                );
                let _ = armed.confirm_tx.send((id, confirm));
                debug!(correlation_id = id, "queued message flushed");
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    correlation_id = entry.correlation_id,
                    "flush failed, message stays queued"
                );
                state.outbox.push_front(entry);
                break;
            }
        }
    }
}

fn build_properties(message: &OutboundMessage) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject_current_context(&mut headers);

    for (key, value) in &message.headers {
        headers.insert(ShortString::from(key.clone()), value.to_amqp());
    }

    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers));

    match &message.message_type {
        Some(kind) => properties.with_kind(ShortString::from(kind.clone())),
        None => properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn publisher(outbox: OutboxPolicy) -> Publisher {
        Publisher::new(PublisherConfig {
            watermark: 4,
            publish_wait_ms: 10,
            outbox,
        })
    }

    #[test]
    fn builder_fills_routing_metadata() {
        let message = OutboundMessage::new("orders", "orders.created", b"{}")
            .message_type("order-created")
            .content_type("application/json")
            .header("tenant", HeaderValue::Text("acme".to_owned()));

        assert_eq!(message.exchange, "orders");
        assert_eq!(message.routing_key, "orders.created");
        assert_eq!(message.message_type.as_deref(), Some("order-created"));
        assert_eq!(message.content_type, "application/json");
        assert_eq!(
            message.headers.get("tenant"),
            Some(&HeaderValue::Text("acme".to_owned()))
        );
    }

    #[test]
    fn header_values_map_to_amqp_types() {
        assert!(matches!(
            HeaderValue::Text("x".to_owned()).to_amqp(),
            AMQPValue::LongString(_)
        ));
        assert!(matches!(HeaderValue::Int(-2).to_amqp(), AMQPValue::LongLongInt(-2)));
        assert!(matches!(HeaderValue::UInt(7).to_amqp(), AMQPValue::LongUInt(7)));
        assert!(matches!(HeaderValue::Bool(true).to_amqp(), AMQPValue::Boolean(true)));
    }

    #[tokio::test]
    async fn disconnected_publish_fails_fast_by_default() {
        let publisher = publisher(OutboxPolicy::Reject);

        let err = publisher
            .publish(OutboundMessage::new("", "q", b"payload"))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::NotConnected);
    }

    #[tokio::test]
    async fn bounded_outbox_queues_until_capacity() {
        let publisher = publisher(OutboxPolicy::Buffer { capacity: 1 });

        let mut queued = publisher
            .publish(OutboundMessage::new("", "q", b"first"))
            .await
            .unwrap();
        let overflow = publisher
            .publish(OutboundMessage::new("", "q", b"second"))
            .await
            .unwrap_err();

        assert_eq!(queued.correlation_id(), 1);
        assert_eq!(overflow, AmqpError::Overloaded);
        assert_eq!(publisher.queued().await, 1);
        assert!((&mut queued).now_or_never().is_none());
    }

    #[tokio::test]
    async fn shutdown_resolves_queued_messages_as_lost() {
        let publisher = publisher(OutboxPolicy::Buffer { capacity: 8 });

        let queued = publisher
            .publish(OutboundMessage::new("", "q", b"payload"))
            .await
            .unwrap();

        assert_eq!(publisher.shutdown().await, 1);
        assert_eq!(queued.await, ConfirmResult::Lost);
        assert_eq!(publisher.queued().await, 0);
    }

    #[tokio::test]
    async fn queued_messages_keep_monotonic_correlation_ids() {
        let publisher = publisher(OutboxPolicy::Buffer { capacity: 8 });

        let first = publisher
            .publish(OutboundMessage::new("", "q", b"a"))
            .await
            .unwrap();
        let second = publisher
            .publish(OutboundMessage::new("", "q", b"b"))
            .await
            .unwrap();

        assert!(second.correlation_id() > first.correlation_id());
    }

    #[tokio::test]
    async fn drain_returns_immediately_with_nothing_pending() {
        let publisher = publisher(OutboxPolicy::Reject);

        assert!(publisher.drain(Duration::ZERO).await);
        assert_eq!(publisher.pending().await, 0);
    }

    #[tokio::test]
    async fn disarm_without_a_channel_is_a_no_op() {
        let publisher = publisher(OutboxPolicy::Reject);

        assert_eq!(publisher.disarm().await, 0);
    }
}
