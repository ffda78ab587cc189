// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module subscribes to queues and feeds deliveries to application
//! handlers. Each subscription runs on its own consume channel: deliveries on
//! one subscription are dispatched sequentially in broker order, while
//! separate subscriptions process in parallel. For every delivery exactly one
//! acknowledgment operation is sent to the broker, chosen from the handler's
//! decision: ack, reject with requeue, or reject without requeue for poison
//! messages. A handler that fails is treated as reject-with-requeue so the
//! broker can attempt redelivery.
//!
//! The broker-side prefetch limit bounds how many deliveries can be in flight
//! per channel; after a session loss unacked deliveries are redelivered to
//! the next subscriber, so handlers must be idempotent or de-duplicate by
//! message identity.

use crate::{channel::RoleChannel, errors::AmqpError, otel};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Consumer as AmqpConsumer,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// The application's verdict on one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Acknowledge the delivery.
    Accept,
    /// Reject the delivery. With `requeue` the broker redelivers it later;
    /// without, the message is dropped or dead-lettered broker-side.
    Discard { requeue: bool },
}

/// One inbound delivery with its broker-assigned metadata.
///
/// The delivery tag and generation identify the delivery only within the
/// consume channel that produced it; after a reconnect all prior tags are
/// invalid.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    payload: Vec<u8>,
    exchange: String,
    routing_key: String,
    message_type: Option<String>,
    delivery_tag: u64,
    redelivered: bool,
    consumer_tag: String,
    generation: u64,
}

impl InboundDelivery {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The AMQP type property, when the publisher set one.
    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker already delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// The session generation this delivery belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn from_delivery(delivery: &Delivery, consumer_tag: &str, generation: u64) -> InboundDelivery {
        InboundDelivery {
            payload: delivery.data.clone(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            message_type: delivery.properties.kind().as_ref().map(|k| k.to_string()),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            consumer_tag: consumer_tag.to_owned(),
            generation,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        payload: &[u8],
        routing_key: &str,
        delivery_tag: u64,
        redelivered: bool,
    ) -> InboundDelivery {
        InboundDelivery {
            payload: payload.to_owned(),
            exchange: "".to_owned(),
            routing_key: routing_key.to_owned(),
            message_type: None,
            delivery_tag,
            redelivered,
            consumer_tag: "test".to_owned(),
            generation: 1,
        }
    }
}

/// Contract implemented by the application to process deliveries.
///
/// The handler is invoked once per delivery, sequentially within one
/// subscription. Returning an error rejects the delivery with requeue; poison
/// messages should instead return `Discard { requeue: false }`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        delivery: &InboundDelivery,
    ) -> Result<HandlerOutcome, AmqpError>;
}

/// The single acknowledgment operation owed to the broker for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckDecision {
    Ack,
    Nack { requeue: bool },
}

/// Maps the handler's verdict to the broker operation.
///
/// Exactly one decision exists for every possible outcome, which is what
/// guarantees one acknowledgment per delivery tag.
pub(crate) fn decide(outcome: &Result<HandlerOutcome, AmqpError>) -> AckDecision {
    match outcome {
        Ok(HandlerOutcome::Accept) => AckDecision::Ack,
        Ok(HandlerOutcome::Discard { requeue }) => AckDecision::Nack { requeue: *requeue },
        Err(_) => AckDecision::Nack { requeue: true },
    }
}

/// Per-subscription bookkeeping shared between the supervisor, the worker
/// task, and the application's `Subscription` handle.
pub(crate) struct SubscriptionState {
    queue: String,
    prefetch: u16,
    handler: Arc<dyn DeliveryHandler>,
    consumer_tag: String,
    in_flight: AtomicUsize,
    failures: AtomicU32,
    abandoned: AtomicBool,
}

impl SubscriptionState {
    pub(crate) fn new(
        queue: &str,
        prefetch: u16,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Arc<SubscriptionState> {
        Arc::new(SubscriptionState {
            queue: queue.to_owned(),
            prefetch,
            handler,
            consumer_tag: format!("{}-{}", queue, Uuid::new_v4()),
            in_flight: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
            abandoned: AtomicBool::new(false),
        })
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Records a failed subscribe attempt; returns true when the bounded
    /// retry budget is now exhausted and the subscription is abandoned.
    pub(crate) fn note_failure(&self, limit: u32) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= limit {
            self.abandoned.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Clears the failure streak once the subscription is established.
    pub(crate) fn note_established(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Application handle to an active subscription.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn new(state: Arc<SubscriptionState>) -> Subscription {
        Subscription { state }
    }

    pub fn queue(&self) -> &str {
        self.state.queue()
    }

    pub fn consumer_tag(&self) -> &str {
        self.state.consumer_tag()
    }

    /// Deliveries currently dispatched to the handler but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight()
    }

    /// Whether the subscription exhausted its re-subscribe budget and will
    /// not be re-established on reconnect.
    pub fn is_abandoned(&self) -> bool {
        self.state.is_abandoned()
    }
}

struct InFlightGuard<'g> {
    counter: &'g AtomicUsize,
}

impl<'g> InFlightGuard<'g> {
    fn enter(counter: &'g AtomicUsize) -> InFlightGuard<'g> {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Applies the prefetch limit and binds a consumer to the queue.
pub(crate) async fn subscribe_on(
    channel: &RoleChannel,
    sub: &SubscriptionState,
) -> Result<AmqpConsumer, AmqpError> {
    if let Err(err) = channel
        .inner()
        .basic_qos(sub.prefetch, BasicQosOptions::default())
        .await
    {
        error!(error = err.to_string(), queue = sub.queue(), "failure to configure qos");
        return Err(AmqpError::SubscribeFailure(sub.queue().to_owned()));
    }

    match channel
        .inner()
        .basic_consume(
            sub.queue(),
            sub.consumer_tag(),
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue = sub.queue(), "error to create the consumer");
            Err(AmqpError::SubscribeFailure(sub.queue().to_owned()))
        }
        Ok(consumer) => {
            debug!(
                queue = sub.queue(),
                tag = sub.consumer_tag(),
                generation = channel.generation(),
                "consumer subscribed"
            );
            Ok(consumer)
        }
    }
}

/// Drives one subscription until its channel dies.
///
/// The worker ends when the delivery stream closes; deliveries dispatched but
/// not yet acked at that point are redelivered by the broker to whichever
/// consumer subscribes next. The supervisor re-issues the subscription on the
/// next session generation.
pub(crate) async fn consume_loop(
    sub: Arc<SubscriptionState>,
    channel: RoleChannel,
    mut consumer: AmqpConsumer,
) {
    let tracer = global::tracer("amqp consumer");

    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) = dispatch(&sub, &channel, &tracer, delivery).await {
                    error!(error = err.to_string(), queue = sub.queue(), "error consuming message");
                }
            }
            Err(err) => {
                error!(error = err.to_string(), queue = sub.queue(), "consumer stream failure");
                break;
            }
        }
    }

    debug!(
        queue = sub.queue(),
        generation = channel.generation(),
        "consumer stream ended"
    );
}

/// Processes a single delivery and performs its one acknowledgment operation.
async fn dispatch(
    sub: &SubscriptionState,
    channel: &RoleChannel,
    tracer: &global::BoxedTracer,
    delivery: Delivery,
) -> Result<(), AmqpError> {
    let _in_flight = InFlightGuard::enter(&sub.in_flight);
    let inbound = InboundDelivery::from_delivery(&delivery, sub.consumer_tag(), channel.generation());

    let (ctx, mut span) = otel::delivery_span(&delivery.properties, tracer, sub.queue());

    debug!(
        queue = sub.queue(),
        delivery_tag = inbound.delivery_tag(),
        redelivered = inbound.redelivered(),
        "delivery received"
    );

    let outcome = sub.handler.handle(&ctx, &inbound).await;
    if let Err(err) = &outcome {
        warn!(
            error = err.to_string(),
            delivery_tag = inbound.delivery_tag(),
            "handler failure, requeuing delivery"
        );
        span.record_error(err);
    }

    match decide(&outcome) {
        AckDecision::Ack => match delivery.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckFailure)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(())
            }
        },
        AckDecision::Nack { requeue } => match delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to nack msg"),
                });
                Err(AmqpError::NackFailure)
            }
            _ => {
                span.set_status(match &outcome {
                    Err(_) => Status::Error {
                        description: Cow::from("delivery requeued after handler failure"),
                    },
                    Ok(_) => Status::Ok,
                });
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_deliveries_are_acked() {
        assert_eq!(decide(&Ok(HandlerOutcome::Accept)), AckDecision::Ack);
    }

    #[test]
    fn discarded_deliveries_are_nacked_as_requested() {
        assert_eq!(
            decide(&Ok(HandlerOutcome::Discard { requeue: false })),
            AckDecision::Nack { requeue: false }
        );
        assert_eq!(
            decide(&Ok(HandlerOutcome::Discard { requeue: true })),
            AckDecision::Nack { requeue: true }
        );
    }

    #[test]
    fn handler_failure_defaults_to_requeue() {
        let outcome = Err(AmqpError::HandlerFailure("boom".to_owned()));
        assert_eq!(decide(&outcome), AckDecision::Nack { requeue: true });
    }

    #[tokio::test]
    async fn failing_mock_handler_maps_to_requeue() {
        let mut handler = MockDeliveryHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Err(AmqpError::HandlerFailure("poison parse".to_owned())));

        let delivery = InboundDelivery::from_parts(b"payload", "orders.created", 7, false);
        let outcome = handler.handle(&Context::current(), &delivery).await;

        assert_eq!(decide(&outcome), AckDecision::Nack { requeue: true });
    }

    #[tokio::test]
    async fn poison_mock_handler_discards_without_requeue() {
        let mut handler = MockDeliveryHandler::new();
        handler
            .expect_handle()
            .returning(|_, delivery| {
                assert!(delivery.redelivered());
                Ok(HandlerOutcome::Discard { requeue: false })
            });

        let delivery = InboundDelivery::from_parts(b"payload", "orders.created", 7, true);
        let outcome = handler.handle(&Context::current(), &delivery).await;

        assert_eq!(decide(&outcome), AckDecision::Nack { requeue: false });
    }

    #[test]
    fn in_flight_guard_tracks_dispatch_depth() {
        let counter = AtomicUsize::new(0);

        {
            let _first = InFlightGuard::enter(&counter);
            let _second = InFlightGuard::enter(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_failures_are_bounded() {
        let handler: Arc<dyn DeliveryHandler> = Arc::new(MockDeliveryHandler::new());
        let sub = SubscriptionState::new("orders", 16, handler);

        assert!(!sub.note_failure(3));
        assert!(!sub.note_failure(3));
        assert!(sub.note_failure(3));
        assert!(sub.is_abandoned());
    }

    #[test]
    fn established_subscription_resets_its_failure_streak() {
        let handler: Arc<dyn DeliveryHandler> = Arc::new(MockDeliveryHandler::new());
        let sub = SubscriptionState::new("orders", 16, handler);

        sub.note_failure(3);
        sub.note_established();
        assert!(!sub.note_failure(3));
        assert!(!sub.is_abandoned());
    }

    #[test]
    fn consumer_tags_are_unique_per_subscription() {
        let handler: Arc<dyn DeliveryHandler> = Arc::new(MockDeliveryHandler::new());
        let first = SubscriptionState::new("orders", 16, handler.clone());
        let second = SubscriptionState::new("orders", 16, handler);

        assert_ne!(first.consumer_tag(), second.consumer_tag());
        assert!(first.consumer_tag().starts_with("orders-"));
    }
}
