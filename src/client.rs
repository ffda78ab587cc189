// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application Facade
//!
//! The `AmqpClient` handle is what the host service holds: it publishes,
//! subscribes, observes connectivity, and shuts the client down. Handles are
//! cheap to clone and all clones drive the same supervised connection.
//!
//! Transport failures never surface here as errors; the supervisor absorbs
//! them and reports connectivity through [`StatusListener`] events. What does
//! surface is every protocol-level outcome: a `Nacked` or `Lost` confirmation,
//! an `Overloaded` publisher, or a subscription the broker refused.

use crate::{
    confirm::PendingConfirm,
    consumer::{DeliveryHandler, Subscription},
    errors::AmqpError,
    publisher::OutboundMessage,
    supervisor::{Command, Core, Lifecycle},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};

/// Connectivity transitions reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// A connection attempt is starting. Repeated once per backoff cycle
    /// while the broker stays unreachable.
    Connecting,
    /// The session is open, the publisher is armed, and subscriptions are
    /// re-established.
    Open,
    /// The session dropped; pending confirmations have resolved to `Lost`.
    Lost,
}

/// Contract for observing connectivity, implemented by the application.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusListener: Send + Sync {
    async fn on_status(&self, event: StatusEvent);
}

/// Cheap-clone handle to a supervised client.
///
/// ```no_run
/// use std::time::Duration;
/// use resilient_amqp::config::AmqpConfig;
/// use resilient_amqp::publisher::OutboundMessage;
/// use resilient_amqp::supervisor::Supervisor;
///
/// # async fn example() -> Result<(), resilient_amqp::errors::AmqpError> {
/// let client = Supervisor::start(AmqpConfig::default());
///
/// let confirm = client
///     .publish(OutboundMessage::new("orders", "orders.created", b"{}"))
///     .await?;
/// let outcome = confirm.await;
///
/// client.shutdown(Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AmqpClient {
    core: Arc<Core>,
    commands: mpsc::Sender<Command>,
}

impl AmqpClient {
    pub(crate) fn new(core: Arc<Core>, commands: mpsc::Sender<Command>) -> AmqpClient {
        AmqpClient { core, commands }
    }

    /// Publishes a message and returns the future tracking its confirmation.
    ///
    /// See [`crate::publisher::Publisher::publish`] for the backpressure and
    /// disconnected-policy behavior.
    pub async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm, AmqpError> {
        self.core.publisher.publish(message).await
    }

    /// Subscribes a handler to a queue.
    ///
    /// With an open session the subscription starts immediately and a broker
    /// refusal is surfaced as `SubscribeFailure`. While disconnected the
    /// subscription is registered and starts on the next successful
    /// reconnect.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume; it must already exist
    /// * `prefetch` - Per-channel cap on unacked deliveries; the configured
    ///   default when `None`
    /// * `handler` - Invoked once per delivery
    pub async fn subscribe(
        &self,
        queue: &str,
        prefetch: Option<u16>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, AmqpError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                queue: queue.to_owned(),
                prefetch,
                handler,
                reply,
            })
            .await
            .map_err(|_| AmqpError::Shutdown)?;
        rx.await.map_err(|_| AmqpError::Shutdown)?
    }

    /// Registers a connectivity listener.
    ///
    /// Listeners receive every event emitted after registration.
    pub async fn on_status(&self, listener: Arc<dyn StatusListener>) {
        self.core.listeners.lock().await.push(listener);
    }

    /// Shuts the client down, waiting up to `grace` for in-flight publisher
    /// confirmations before forcing the session closed.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), AmqpError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { grace, reply })
            .await
            .map_err(|_| AmqpError::Shutdown)?;
        rx.await.map_err(|_| AmqpError::Shutdown)
    }

    /// Current lifecycle state, for diagnostics.
    pub async fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle().await
    }

    /// Number of publishes awaiting a broker response.
    pub async fn pending_publishes(&self) -> usize {
        self.core.publisher.pending().await
    }
}
