// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Session Management
//!
//! This module owns the physical connection to the broker. A `Session` wraps
//! one connection together with the generation counter that scopes every
//! channel, delivery tag, and correlation id created over it. Sessions are
//! never repaired in place: when the link drops, the session fires its
//! one-shot lost notification and the reconnection supervisor replaces it
//! with a fresh one under the next generation.

use crate::{config::ConnectionConfig, errors::AmqpError};
use lapin::{protocol::constants::REPLY_SUCCESS, types::LongString, Connection, ConnectionProperties};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Connection lifecycle state, readable for diagnostics.
///
/// The state is mutated only by the session's owner; a session that observes
/// loss of liveness reports it upward and never attempts self-repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// One physical connection to the broker, scoped to a generation.
pub struct Session {
    connection: Connection,
    generation: u64,
    state: SessionState,
    lost_rx: Option<oneshot::Receiver<String>>,
}

impl Session {
    /// Opens a connection to the broker using the given endpoint parameters.
    ///
    /// The heartbeat interval is negotiated through the connection URI; if the
    /// broker or network stalls past it, the underlying transport reports the
    /// loss through the same callback as a graceful or broker-initiated close,
    /// and the session fires its lost notification exactly once.
    ///
    /// # Parameters
    /// * `cfg` - Endpoint address, credentials, and connection tuning
    /// * `generation` - The generation this session and everything created
    ///   over it belongs to
    ///
    /// # Returns
    /// * `Result<Session, AmqpError>` - An open session, or `ConnectFailure`
    pub async fn open(cfg: &ConnectionConfig, generation: u64) -> Result<Session, AmqpError> {
        debug!(generation, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.name.clone()));

        let connection = match Connection::connect(&cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectFailure)
            }
        }?;

        let (lost_tx, lost_rx) = oneshot::channel();
        let mut lost_tx = Some(lost_tx);
        connection.on_error(move |err| {
            // The callback can fire more than once while the connection tears
            // down; only the first signal reaches the supervisor.
            if let Some(tx) = lost_tx.take() {
                let _ = tx.send(err.to_string());
            }
        });

        debug!(generation, "amqp connected");
        Ok(Session {
            connection,
            generation,
            state: SessionState::Open,
            lost_rx: Some(lost_rx),
        })
    }

    /// The generation this session belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether channels can currently be allocated over this session.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open && self.connection.status().connected()
    }

    /// Takes the one-shot lost notification.
    ///
    /// Fired exactly once when the underlying link drops, whether by graceful
    /// close, broker-initiated close, or heartbeat timeout. The payload is the
    /// transport's description of the failure.
    pub fn take_lost(&mut self) -> Option<oneshot::Receiver<String>> {
        self.lost_rx.take()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Closes the connection gracefully.
    pub async fn close(&mut self, reason: &str) {
        self.state = SessionState::Closing;
        debug!(generation = self.generation, "closing amqp connection...");

        if let Err(err) = self.connection.close(REPLY_SUCCESS, reason).await {
            warn!(error = err.to_string(), "error closing the connection");
        }

        self.state = SessionState::Disconnected;
    }
}
