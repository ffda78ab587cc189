// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient AMQP Client
//!
//! This module provides the error taxonomy for the client. The `AmqpError` enum
//! distinguishes transport-level failures, which the reconnection supervisor
//! absorbs and retries, from protocol-level outcomes, which are always surfaced
//! to the code that issued the operation.

use thiserror::Error;

/// Represents errors that can occur while operating against the broker.
///
/// Transport-level variants (`ConnectFailure`) never propagate to application
/// code as exceptions; they are handled by the reconnection supervisor.
/// Everything else is returned to the caller of the operation that failed,
/// since only the caller can decide on re-publication or redelivery policy.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// DNS, TCP, or authentication failure while opening a session.
    /// Retried by the supervisor with backoff.
    #[error("failure to connect")]
    ConnectFailure,

    /// The session is valid but the broker rejected channel negotiation,
    /// for example due to a resource limit. Retried on the next reconnect cycle.
    #[error("failure to allocate a `{0}` channel")]
    ChannelAllocation(String),

    /// The broker refused to take the message at publish time.
    /// Not retried automatically.
    #[error("failure to publish")]
    PublishRejected,

    /// The number of unconfirmed messages reached the configured watermark,
    /// or the bounded outbox is full.
    #[error("publisher is overloaded")]
    Overloaded,

    /// No open session exists and the outbox policy rejects queuing.
    #[error("no open session")]
    NotConnected,

    /// The queue is missing or access to it was denied.
    /// Fatal for the subscription after a bounded number of attempts.
    #[error("failure to subscribe to queue `{0}`")]
    SubscribeFailure(String),

    /// An application delivery handler reported a failure.
    /// Converted to a reject-with-requeue by the consumer.
    #[error("handler failure: `{0}`")]
    HandlerFailure(String),

    /// Error acknowledging a delivery.
    #[error("failure to ack message")]
    AckFailure,

    /// Error negative-acknowledging a delivery.
    #[error("failure to nack message")]
    NackFailure,

    /// The client was shut down and no longer accepts operations.
    #[error("client is shut down")]
    Shutdown,
}
