// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirmation Ledger
//!
//! Bookkeeping for in-flight publisher confirmations. Every published message
//! is assigned a correlation id, monotonically increasing for the lifetime of
//! the publisher, and the ledger maps each id to the future handed back to the
//! caller. Broker acknowledgments are observed in send order on a channel, so
//! an acknowledgment for id N resolves every pending id at or below N
//! (cumulative confirmation).
//!
//! Ids are only meaningful relative to the session generation that issued
//! them. Operations carry the generation they belong to and are rejected when
//! it is stale; when a session is lost, `abort_generation` resolves everything
//! still pending in that generation as `Lost`, exactly once.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, OwnedSemaphorePermit};

/// Terminal outcome of one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmResult {
    /// The broker durably accepted the message.
    Confirmed,
    /// The broker explicitly refused the message.
    Nacked,
    /// The session was invalidated before a broker response arrived; the
    /// outcome is unknown and re-publication is the caller's decision.
    Lost,
}

/// Future side of one pending confirmation.
///
/// Dropping it cancels the local wait without retracting the message already
/// sent to the broker.
#[derive(Debug)]
pub struct PendingConfirm {
    correlation_id: u64,
    rx: oneshot::Receiver<ConfirmResult>,
}

impl PendingConfirm {
    /// The correlation id assigned to this message.
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub(crate) fn from_parts(
        correlation_id: u64,
        rx: oneshot::Receiver<ConfirmResult>,
    ) -> PendingConfirm {
        PendingConfirm { correlation_id, rx }
    }
}

impl Future for PendingConfirm {
    type Output = ConfirmResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The ledger being dropped wholesale means the outcome was never
        // observed, which is indistinguishable from a lost session.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(ConfirmResult::Lost))
    }
}

struct PendingEntry {
    tx: oneshot::Sender<ConfirmResult>,
    generation: u64,
    // Watermark permit; released when the entry resolves.
    _permit: Option<OwnedSemaphorePermit>,
}

/// Map from correlation id to pending resolution, with the cumulative
/// confirmation watermark.
pub struct ConfirmLedger {
    next_id: u64,
    highest_confirmed: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

impl ConfirmLedger {
    pub fn new() -> ConfirmLedger {
        ConfirmLedger {
            next_id: 1,
            highest_confirmed: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Assigns the next correlation id and registers a pending entry for it.
    pub fn register(
        &mut self,
        generation: u64,
        permit: Option<OwnedSemaphorePermit>,
    ) -> (u64, PendingConfirm) {
        let id = self.reserve();
        let (tx, rx) = oneshot::channel();
        self.register_reserved(id, generation, permit, tx);
        (
            id,
            PendingConfirm {
                correlation_id: id,
                rx,
            },
        )
    }

    /// Assigns the next correlation id without registering a pending entry.
    ///
    /// Used when the caller must be handed its id before the message can be
    /// transmitted, such as an outbox entry queued while disconnected.
    pub fn reserve(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Registers a pending entry under a previously reserved id, resolving
    /// through an existing sender.
    pub fn register_reserved(
        &mut self,
        id: u64,
        generation: u64,
        permit: Option<OwnedSemaphorePermit>,
        tx: oneshot::Sender<ConfirmResult>,
    ) -> u64 {
        self.pending.insert(
            id,
            PendingEntry {
                tx,
                generation,
                _permit: permit,
            },
        );
        id
    }

    /// Resolves every pending id at or below `id` in the given generation as
    /// `Confirmed`. Returns how many entries were resolved.
    pub fn confirm_up_to(&mut self, generation: u64, id: u64) -> usize {
        let ids: Vec<u64> = self
            .pending
            .range(..=id)
            .filter(|(_, entry)| entry.generation == generation)
            .map(|(k, _)| *k)
            .collect();

        for confirmed in &ids {
            if let Some(entry) = self.pending.remove(confirmed) {
                let _ = entry.tx.send(ConfirmResult::Confirmed);
            }
        }

        if !ids.is_empty() && id > self.highest_confirmed {
            self.highest_confirmed = id;
        }

        ids.len()
    }

    /// Resolves exactly the given id as `Nacked`. Returns false when the id is
    /// unknown or belongs to another generation.
    pub fn nack(&mut self, generation: u64, id: u64) -> bool {
        self.resolve_one(generation, id, ConfirmResult::Nacked)
    }

    /// Resolves exactly the given id as `Lost`. Returns false when the id is
    /// unknown or belongs to another generation.
    pub fn resolve_lost(&mut self, generation: u64, id: u64) -> bool {
        self.resolve_one(generation, id, ConfirmResult::Lost)
    }

    fn resolve_one(&mut self, generation: u64, id: u64, result: ConfirmResult) -> bool {
        match self.pending.get(&id) {
            Some(entry) if entry.generation == generation => {
                if let Some(entry) = self.pending.remove(&id) {
                    let _ = entry.tx.send(result);
                }
                true
            }
            _ => false,
        }
    }

    /// Resolves everything still pending in the given generation as `Lost`.
    ///
    /// Entries are removed as they resolve, so a second call for the same
    /// generation finds nothing and no future can resolve twice.
    pub fn abort_generation(&mut self, generation: u64) -> usize {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.generation == generation)
            .map(|(k, _)| *k)
            .collect();

        for id in &ids {
            if let Some(entry) = self.pending.remove(id) {
                let _ = entry.tx.send(ConfirmResult::Lost);
            }
        }

        ids.len()
    }

    /// Number of messages awaiting a broker response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Highest correlation id the broker has acknowledged so far.
    pub fn highest_confirmed(&self) -> u64 {
        self.highest_confirmed
    }
}

impl Default for ConfirmLedger {
    fn default() -> Self {
        ConfirmLedger::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn confirms_resolve_in_submission_order() {
        let mut ledger = ConfirmLedger::new();
        let (id1, first) = ledger.register(1, None);
        let (id2, second) = ledger.register(1, None);
        let (id3, third) = ledger.register(1, None);

        assert_eq!((id1, id2, id3), (1, 2, 3));
        assert_eq!(ledger.confirm_up_to(1, 3), 3);

        assert_eq!(first.await, ConfirmResult::Confirmed);
        assert_eq!(second.await, ConfirmResult::Confirmed);
        assert_eq!(third.await, ConfirmResult::Confirmed);
        assert_eq!(ledger.highest_confirmed(), 3);
        assert_eq!(ledger.pending_len(), 0);
    }

    #[tokio::test]
    async fn cumulative_confirmation_leaves_later_ids_pending() {
        let mut ledger = ConfirmLedger::new();
        let (_, first) = ledger.register(1, None);
        let (_, second) = ledger.register(1, None);
        let (_, mut third) = ledger.register(1, None);

        assert_eq!(ledger.confirm_up_to(1, 2), 2);

        assert_eq!(first.await, ConfirmResult::Confirmed);
        assert_eq!(second.await, ConfirmResult::Confirmed);
        assert!((&mut third).now_or_never().is_none());
        assert_eq!(ledger.pending_len(), 1);
    }

    #[tokio::test]
    async fn session_loss_resolves_pending_as_lost_exactly_once() {
        let mut ledger = ConfirmLedger::new();
        let (_, first) = ledger.register(1, None);
        let (_, second) = ledger.register(1, None);
        let (_, third) = ledger.register(1, None);

        // Message #1 was already confirmed when the session dropped.
        ledger.confirm_up_to(1, 1);

        assert_eq!(ledger.abort_generation(1), 2);
        assert_eq!(ledger.abort_generation(1), 0);

        assert_eq!(first.await, ConfirmResult::Confirmed);
        assert_eq!(second.await, ConfirmResult::Lost);
        assert_eq!(third.await, ConfirmResult::Lost);
    }

    #[tokio::test]
    async fn nack_targets_a_single_id() {
        let mut ledger = ConfirmLedger::new();
        let (_, mut first) = ledger.register(1, None);
        let (id2, second) = ledger.register(1, None);

        assert!(ledger.nack(1, id2));

        assert_eq!(second.await, ConfirmResult::Nacked);
        assert!((&mut first).now_or_never().is_none());
    }

    #[tokio::test]
    async fn stale_generation_operations_are_rejected() {
        let mut ledger = ConfirmLedger::new();
        let (id, mut pending) = ledger.register(2, None);

        assert_eq!(ledger.confirm_up_to(1, id), 0);
        assert!(!ledger.nack(1, id));
        assert_eq!(ledger.abort_generation(1), 0);

        assert!((&mut pending).now_or_never().is_none());
        assert_eq!(ledger.pending_len(), 1);
    }

    #[tokio::test]
    async fn ids_keep_increasing_across_generations() {
        let mut ledger = ConfirmLedger::new();
        let (id1, _first) = ledger.register(1, None);
        ledger.abort_generation(1);
        let (id2, _second) = ledger.register(2, None);

        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn resolution_releases_the_watermark_permit() {
        let limiter = Arc::new(Semaphore::new(1));
        let mut ledger = ConfirmLedger::new();

        let permit = limiter.clone().try_acquire_owned().unwrap();
        let (id, pending) = ledger.register(1, Some(permit));
        assert_eq!(limiter.available_permits(), 0);

        ledger.confirm_up_to(1, id);
        assert_eq!(limiter.available_permits(), 1);
        assert_eq!(pending.await, ConfirmResult::Confirmed);
    }

    #[tokio::test]
    async fn reserved_ids_resolve_once_registered() {
        let mut ledger = ConfirmLedger::new();
        let reserved = ledger.reserve();
        let (later, _pending) = ledger.register(1, None);
        assert!(later > reserved);

        let (tx, rx) = oneshot::channel();
        ledger.register_reserved(reserved, 1, None, tx);
        ledger.confirm_up_to(1, later);

        assert_eq!(rx.await.unwrap(), ConfirmResult::Confirmed);
        assert_eq!(ledger.pending_len(), 0);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_break_resolution() {
        let mut ledger = ConfirmLedger::new();
        let (id, pending) = ledger.register(1, None);
        drop(pending);

        // The caller cancelled its wait; resolution is a quiet no-op.
        assert_eq!(ledger.confirm_up_to(1, id), 1);
        assert_eq!(ledger.pending_len(), 0);
    }
}
