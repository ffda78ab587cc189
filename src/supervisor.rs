// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Supervisor
//!
//! The supervisor is the single owner of the transport session and the only
//! component that replaces it. It drives the client lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Open -> (Draining) -> Closed
//!                     ^           |
//!                     +-- lost ---+
//! ```
//!
//! On session loss it invalidates every channel, disarms the publisher so
//! pending confirmations resolve to `Lost`, and reconnects under a fresh
//! generation with geometric backoff. On success it re-arms the publisher and
//! re-issues every active subscription. Exhausting reconnect attempts is not a
//! thing: the supervisor retries at the capped delay until shutdown, and
//! connectivity is reported to the application through status events.

use crate::{
    backoff::Backoff,
    channel::{ChannelPool, ChannelRole},
    client::{AmqpClient, StatusEvent, StatusListener},
    config::AmqpConfig,
    consumer::{self, DeliveryHandler, Subscription, SubscriptionState},
    errors::AmqpError,
    publisher::Publisher,
    session::Session,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, warn};

/// Grace period applied when every client handle is dropped without an
/// explicit shutdown call.
const IMPLICIT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Client lifecycle states, owned by the supervisor's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Disconnected,
    Connecting,
    Open,
    Draining,
    Closed,
}

impl Lifecycle {
    /// Startup transition. Loss re-entry goes through `on_lost` instead.
    pub(crate) fn on_connect_requested(&mut self) -> bool {
        match self {
            Lifecycle::Disconnected => {
                *self = Lifecycle::Connecting;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn on_opened(&mut self) -> bool {
        match self {
            Lifecycle::Connecting => {
                *self = Lifecycle::Open;
                true
            }
            _ => false,
        }
    }

    /// Returns whether a reconnect cycle should begin. A loss notification
    /// while already Connecting is absorbed, so at most one cycle is active.
    pub(crate) fn on_lost(&mut self) -> bool {
        match self {
            Lifecycle::Open => {
                *self = Lifecycle::Connecting;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn on_shutdown(&mut self) -> bool {
        match self {
            Lifecycle::Disconnected | Lifecycle::Connecting | Lifecycle::Open => {
                *self = Lifecycle::Draining;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn on_drained(&mut self) -> bool {
        match self {
            Lifecycle::Draining => {
                *self = Lifecycle::Closed;
                true
            }
            _ => false,
        }
    }
}

/// Commands from client handles to the run loop.
pub(crate) enum Command {
    Subscribe {
        queue: String,
        prefetch: Option<u16>,
        handler: Arc<dyn DeliveryHandler>,
        reply: oneshot::Sender<Result<Subscription, AmqpError>>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

/// Shared state between the run loop and the client handles.
pub(crate) struct Core {
    pub(crate) cfg: AmqpConfig,
    pub(crate) pool: ChannelPool,
    pub(crate) publisher: Publisher,
    pub(crate) subscriptions: Mutex<Vec<Arc<SubscriptionState>>>,
    pub(crate) listeners: Mutex<Vec<Arc<dyn StatusListener>>>,
    generation: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

impl Core {
    pub(crate) fn new(cfg: AmqpConfig) -> Core {
        let publisher = Publisher::new(cfg.publisher.clone());
        Core {
            cfg,
            pool: ChannelPool::new(),
            publisher,
            subscriptions: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::Disconnected),
        }
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().await
    }

    async fn transition(&self, apply: impl FnOnce(&mut Lifecycle) -> bool) -> bool {
        apply(&mut *self.lifecycle.lock().await)
    }

    /// Notifies every registered listener; listener order is registration
    /// order, and slow listeners delay the loop rather than being dropped.
    pub(crate) async fn emit(&self, event: StatusEvent) {
        let listeners: Vec<Arc<dyn StatusListener>> =
            self.listeners.lock().await.iter().cloned().collect();
        for listener in listeners {
            listener.on_status(event).await;
        }
    }
}

/// Entry point owning the retry policy and session replacement.
pub struct Supervisor;

impl Supervisor {
    /// Spawns the supervision loop onto the current runtime and returns the
    /// client handle.
    ///
    /// The loop starts in `Disconnected`, connects with backoff, and keeps
    /// the client serviced until `shutdown` is called or every handle is
    /// dropped.
    pub fn start(cfg: AmqpConfig) -> AmqpClient {
        let core = Arc::new(Core::new(cfg));
        let (commands_tx, commands_rx) = mpsc::channel(64);
        tokio::spawn(run(core.clone(), commands_rx));
        AmqpClient::new(core, commands_tx)
    }
}

async fn run(core: Arc<Core>, mut commands: mpsc::Receiver<Command>) {
    let mut backoff = Backoff::new(&core.cfg.backoff);

    loop {
        core.transition(Lifecycle::on_connect_requested).await;

        let Some(mut session) = establish(&core, &mut backoff, &mut commands).await else {
            return;
        };
        backoff.reset();

        let Some(mut lost_rx) = session.take_lost() else {
            handle_loss(&core, session.generation()).await;
            continue;
        };

        if !arm(&core, &session).await {
            // The broker accepted the connection but refused our channels;
            // treated like a failed attempt and retried on the next cycle.
            session.close("channel negotiation failed").await;
            let delay = backoff.next_delay();
            warn!(delay_ms = delay.as_millis() as u64, "channel negotiation failed, backing off");
            if !wait_or_handle_commands(&core, &mut commands, delay).await {
                return;
            }
            continue;
        }

        core.transition(Lifecycle::on_opened).await;
        core.emit(StatusEvent::Open).await;
        debug!(generation = session.generation(), "client open");

        let reason = loop {
            tokio::select! {
                lost = &mut lost_rx => {
                    break lost.unwrap_or_else(|_| "connection closed".to_owned());
                }
                command = commands.recv() => match command {
                    Some(Command::Subscribe { queue, prefetch, handler, reply }) => {
                        let result = add_subscription(&core, &session, &queue, prefetch, handler).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown { grace, reply }) => {
                        drain_and_close(&core, &mut session, grace).await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        drain_and_close(&core, &mut session, IMPLICIT_SHUTDOWN_GRACE).await;
                        return;
                    }
                }
            }
        };

        warn!(error = reason, generation = session.generation(), "session lost");
        handle_loss(&core, session.generation()).await;
    }
}

/// Connects with backoff until a session opens or the client shuts down.
async fn establish(
    core: &Arc<Core>,
    backoff: &mut Backoff,
    commands: &mut mpsc::Receiver<Command>,
) -> Option<Session> {
    loop {
        core.emit(StatusEvent::Connecting).await;

        let generation = core.next_generation();
        match Session::open(&core.cfg.connection, generation).await {
            Ok(session) => {
                debug!(generation, "session established");
                return Some(session);
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(
                    error = err.to_string(),
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "connect attempt failed, backing off"
                );
                if !wait_or_handle_commands(core, commands, delay).await {
                    return None;
                }
            }
        }
    }
}

/// Sleeps through a backoff delay while still servicing client commands.
/// Returns false when the client shut down during the wait.
async fn wait_or_handle_commands(
    core: &Arc<Core>,
    commands: &mut mpsc::Receiver<Command>,
    delay: Duration,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return true,
            command = commands.recv() => match command {
                Some(Command::Subscribe { queue, prefetch, handler, reply }) => {
                    // No session to subscribe on; the subscription is
                    // registered and starts when one opens.
                    let prefetch = prefetch.unwrap_or(core.cfg.consumer.prefetch);
                    let sub = SubscriptionState::new(&queue, prefetch, handler);
                    core.subscriptions.lock().await.push(sub.clone());
                    debug!(queue, "subscription registered while disconnected");
                    let _ = reply.send(Ok(Subscription::new(sub)));
                }
                Some(Command::Shutdown { reply, .. }) => {
                    shutdown_disconnected(core).await;
                    let _ = reply.send(());
                    return false;
                }
                None => {
                    shutdown_disconnected(core).await;
                    return false;
                }
            }
        }
    }
}

/// Allocates the publish channel and re-issues every live subscription.
async fn arm(core: &Arc<Core>, session: &Session) -> bool {
    let publish_channel = match core.pool.acquire(session, ChannelRole::Publish).await {
        Ok(channel) => channel,
        Err(err) => {
            error!(error = err.to_string(), "failure to arm the publisher");
            return false;
        }
    };
    core.publisher.arm(publish_channel).await;

    let subs: Vec<Arc<SubscriptionState>> =
        core.subscriptions.lock().await.iter().cloned().collect();
    for sub in subs {
        if sub.is_abandoned() {
            continue;
        }
        if let Err(err) = start_worker(core, session, &sub).await {
            warn!(
                error = err.to_string(),
                queue = sub.queue(),
                "failure to re-establish subscription"
            );
        }
    }

    true
}

/// Starts one subscription worker on a dedicated consume channel, counting
/// the attempt against the subscription's bounded retry budget.
async fn start_worker(
    core: &Arc<Core>,
    session: &Session,
    sub: &Arc<SubscriptionState>,
) -> Result<(), AmqpError> {
    let channel = match core.pool.acquire(session, ChannelRole::Consume).await {
        Ok(channel) => channel,
        Err(err) => {
            note_subscribe_failure(core, sub);
            return Err(err);
        }
    };

    match consumer::subscribe_on(&channel, sub).await {
        Ok(stream) => {
            sub.note_established();
            tokio::spawn(consumer::consume_loop(sub.clone(), channel, stream));
            Ok(())
        }
        Err(err) => {
            core.pool.release(channel).await;
            note_subscribe_failure(core, sub);
            Err(err)
        }
    }
}

fn note_subscribe_failure(core: &Arc<Core>, sub: &Arc<SubscriptionState>) {
    let limit = core.cfg.consumer.subscribe_retry_limit;
    if sub.note_failure(limit) {
        error!(
            queue = sub.queue(),
            limit, "subscription abandoned after repeated failures"
        );
    }
}

/// Handles a `subscribe` issued while the client is Open.
///
/// The subscription is only registered once the initial subscribe succeeds;
/// an immediate failure is surfaced to the caller, who may retry.
async fn add_subscription(
    core: &Arc<Core>,
    session: &Session,
    queue: &str,
    prefetch: Option<u16>,
    handler: Arc<dyn DeliveryHandler>,
) -> Result<Subscription, AmqpError> {
    let prefetch = prefetch.unwrap_or(core.cfg.consumer.prefetch);
    let sub = SubscriptionState::new(queue, prefetch, handler);

    let channel = core.pool.acquire(session, ChannelRole::Consume).await?;
    match consumer::subscribe_on(&channel, &sub).await {
        Ok(stream) => {
            core.subscriptions.lock().await.push(sub.clone());
            tokio::spawn(consumer::consume_loop(sub.clone(), channel, stream));
            Ok(Subscription::new(sub))
        }
        Err(err) => {
            core.pool.release(channel).await;
            Err(err)
        }
    }
}

/// Tears down the lost generation: channels are invalidated first so no
/// role-holder can race a "looks valid" check against the replacement.
async fn handle_loss(core: &Arc<Core>, generation: u64) {
    core.transition(Lifecycle::on_lost).await;
    core.pool.invalidate_all(generation).await;
    core.publisher.disarm().await;
    core.emit(StatusEvent::Lost).await;
}

/// Graceful shutdown from the Open state: wait for in-flight confirmations
/// up to the grace period, then force the session closed.
async fn drain_and_close(core: &Arc<Core>, session: &mut Session, grace: Duration) {
    core.transition(Lifecycle::on_shutdown).await;
    debug!(grace_ms = grace.as_millis() as u64, "draining in-flight confirmations...");

    if !core.publisher.drain(grace).await {
        let pending = core.publisher.pending().await;
        warn!(pending, "grace period expired, forcing close");
    }

    core.publisher.shutdown().await;
    core.pool.invalidate_all(session.generation()).await;
    session.close("client shutdown").await;
    core.transition(Lifecycle::on_drained).await;
    debug!("client closed");
}

/// Shutdown requested while no session exists.
async fn shutdown_disconnected(core: &Arc<Core>) {
    core.transition(Lifecycle::on_shutdown).await;
    core.publisher.shutdown().await;
    core.transition(Lifecycle::on_drained).await;
    debug!("client closed while disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_walks_disconnected_to_open() {
        let mut lifecycle = Lifecycle::Disconnected;

        assert!(lifecycle.on_connect_requested());
        assert_eq!(lifecycle, Lifecycle::Connecting);
        assert!(lifecycle.on_opened());
        assert_eq!(lifecycle, Lifecycle::Open);
    }

    #[test]
    fn repeated_loss_notifications_start_one_cycle() {
        let mut lifecycle = Lifecycle::Open;

        assert!(lifecycle.on_lost());
        assert_eq!(lifecycle, Lifecycle::Connecting);
        // A second notification while already reconnecting is absorbed.
        assert!(!lifecycle.on_lost());
        assert_eq!(lifecycle, Lifecycle::Connecting);
    }

    #[test]
    fn opened_is_only_reachable_from_connecting() {
        let mut lifecycle = Lifecycle::Disconnected;
        assert!(!lifecycle.on_opened());

        let mut lifecycle = Lifecycle::Closed;
        assert!(!lifecycle.on_opened());
    }

    #[test]
    fn shutdown_drains_then_closes() {
        let mut lifecycle = Lifecycle::Open;

        assert!(lifecycle.on_shutdown());
        assert_eq!(lifecycle, Lifecycle::Draining);
        assert!(lifecycle.on_drained());
        assert_eq!(lifecycle, Lifecycle::Closed);
        assert!(!lifecycle.on_shutdown());
    }

    #[test]
    fn loss_during_draining_is_ignored() {
        let mut lifecycle = Lifecycle::Draining;
        assert!(!lifecycle.on_lost());
        assert_eq!(lifecycle, Lifecycle::Draining);
    }

    #[test]
    fn generations_are_monotonic() {
        let core = Core::new(AmqpConfig::default());

        let first = core.next_generation();
        let second = core.next_generation();
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn emit_reaches_every_listener_in_order() {
        use crate::client::MockStatusListener;

        let core = Core::new(AmqpConfig::default());

        let mut first = MockStatusListener::new();
        first
            .expect_on_status()
            .withf(|event| *event == StatusEvent::Connecting)
            .times(1)
            .returning(|_| ());
        let mut second = MockStatusListener::new();
        second.expect_on_status().times(1).returning(|_| ());

        core.listeners.lock().await.push(Arc::new(first));
        core.listeners.lock().await.push(Arc::new(second));

        core.emit(StatusEvent::Connecting).await;
    }
}
