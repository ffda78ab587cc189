// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Pool
//!
//! This module allocates and recycles the lightweight logical channels the
//! client multiplexes over one transport session. Channels are allocated for a
//! specific role so that publish traffic and consume traffic never share a
//! channel: a protocol-level error on one role cannot force-close the channel
//! carrying the other role's in-flight work.
//!
//! All channels allocated from a session are implicitly invalidated when that
//! session is lost; the supervisor calls [`ChannelPool::invalidate_all`] once
//! per loss to flush the pool's bookkeeping for that generation.

use crate::{errors::AmqpError, session::Session};
use lapin::{options::ConfirmSelectOptions, protocol::constants::REPLY_SUCCESS, Channel};
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// The role a channel is dedicated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Publish,
    Consume,
    Admin,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Publish => write!(f, "publish"),
            ChannelRole::Consume => write!(f, "consume"),
            ChannelRole::Admin => write!(f, "admin"),
        }
    }
}

/// A channel bound to one role and one session generation.
///
/// Owned by exactly one role-holder (the publisher or one subscription
/// worker); it does not outlive the session that created it.
#[derive(Clone)]
pub struct RoleChannel {
    channel: Channel,
    role: ChannelRole,
    generation: u64,
}

impl RoleChannel {
    /// Channel number, unique within its session.
    pub fn id(&self) -> u16 {
        self.channel.id()
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// The session generation this channel belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_usable(&self) -> bool {
        self.channel.status().connected()
    }

    pub(crate) fn inner(&self) -> &Channel {
        &self.channel
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChannelRecord {
    id: u16,
    role: ChannelRole,
    generation: u64,
}

/// Pool bookkeeping, separated from the transport so invalidation logic can
/// be exercised directly.
#[derive(Default)]
struct PoolLedger {
    records: Vec<ChannelRecord>,
}

impl PoolLedger {
    fn track(&mut self, id: u16, role: ChannelRole, generation: u64) {
        self.records.push(ChannelRecord {
            id,
            role,
            generation,
        });
    }

    fn forget(&mut self, id: u16, generation: u64) -> bool {
        let before = self.records.len();
        self.records
            .retain(|r| !(r.id == id && r.generation == generation));
        self.records.len() != before
    }

    fn invalidate_generation(&mut self, generation: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.generation != generation);
        before - self.records.len()
    }

    fn live(&self) -> usize {
        self.records.len()
    }
}

/// Allocates role-dedicated channels over an open session.
pub struct ChannelPool {
    ledger: Mutex<PoolLedger>,
}

impl ChannelPool {
    pub fn new() -> ChannelPool {
        ChannelPool {
            ledger: Mutex::new(PoolLedger::default()),
        }
    }

    /// Creates a channel on the session for the given role.
    ///
    /// Publish-role channels are put into confirm mode at allocation time so
    /// every message published over them is acknowledged by the broker.
    ///
    /// # Parameters
    /// * `session` - The session to allocate over; must be Open
    /// * `role` - The single role the channel will carry
    ///
    /// # Returns
    /// * `Result<RoleChannel, AmqpError>` - The channel, or
    ///   `ChannelAllocation` if the session is not Open or negotiation failed
    pub async fn acquire(
        &self,
        session: &Session,
        role: ChannelRole,
    ) -> Result<RoleChannel, AmqpError> {
        if !session.is_open() {
            warn!(role = %role, "channel requested while session is not open");
            return Err(AmqpError::ChannelAllocation(role.to_string()));
        }

        debug!(role = %role, "creating amqp channel...");
        let channel = match session.connection().create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), role = %role, "error to create the channel");
                Err(AmqpError::ChannelAllocation(role.to_string()))
            }
        }?;

        if role == ChannelRole::Publish {
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
            {
                error!(error = err.to_string(), "error to enable publisher confirms");
                return Err(AmqpError::ChannelAllocation(role.to_string()));
            }
        }

        let generation = session.generation();
        self.ledger.lock().await.track(channel.id(), role, generation);
        debug!(role = %role, id = channel.id(), generation, "channel created");

        Ok(RoleChannel {
            channel,
            role,
            generation,
        })
    }

    /// Returns a channel to the pool, closing it if it is still usable.
    pub async fn release(&self, channel: RoleChannel) {
        self.ledger
            .lock()
            .await
            .forget(channel.id(), channel.generation());

        if channel.is_usable() {
            if let Err(err) = channel.inner().close(REPLY_SUCCESS, "released").await {
                warn!(error = err.to_string(), id = channel.id(), "error closing released channel");
            }
        }
    }

    /// Flushes the bookkeeping for every channel of a lost session.
    ///
    /// Called once by the supervisor per loss. The channels themselves died
    /// with the connection; role-holders are disarmed separately, top-down.
    pub async fn invalidate_all(&self, generation: u64) -> usize {
        let dropped = self.ledger.lock().await.invalidate_generation(generation);
        if dropped > 0 {
            debug!(dropped, generation, "channels invalidated with their session");
        }
        dropped
    }

    /// Number of channels currently tracked, for diagnostics.
    pub async fn live_channels(&self) -> usize {
        self.ledger.lock().await.live()
    }
}

impl Default for ChannelPool {
    fn default() -> Self {
        ChannelPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_is_scoped_to_one_generation() {
        let mut ledger = PoolLedger::default();
        ledger.track(1, ChannelRole::Publish, 1);
        ledger.track(2, ChannelRole::Consume, 1);
        ledger.track(1, ChannelRole::Consume, 2);

        assert_eq!(ledger.invalidate_generation(1), 2);
        assert_eq!(ledger.live(), 1);
        assert_eq!(ledger.invalidate_generation(1), 0);
    }

    #[test]
    fn forget_removes_a_single_channel() {
        let mut ledger = PoolLedger::default();
        ledger.track(1, ChannelRole::Publish, 3);
        ledger.track(2, ChannelRole::Consume, 3);

        assert!(ledger.forget(2, 3));
        assert!(!ledger.forget(2, 3));
        assert_eq!(ledger.live(), 1);
    }

    #[test]
    fn channel_ids_are_scoped_to_their_generation() {
        let mut ledger = PoolLedger::default();
        ledger.track(7, ChannelRole::Consume, 1);
        ledger.track(7, ChannelRole::Consume, 2);

        // Forgetting the stale generation's channel leaves the new one alone.
        assert!(ledger.forget(7, 1));
        assert_eq!(ledger.live(), 1);
    }

    #[test]
    fn roles_render_for_diagnostics() {
        assert_eq!(ChannelRole::Publish.to_string(), "publish");
        assert_eq!(ChannelRole::Consume.to_string(), "consume");
        assert_eq!(ChannelRole::Admin.to_string(), "admin");
    }
}
