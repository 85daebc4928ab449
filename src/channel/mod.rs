// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable channel adapter.
//!
//! The broker itself is an external collaborator; this module defines the
//! thin contract the engine publishes to and consumes from, plus an
//! in-process reference broker used by tests and single-process deployments.
//!
//! Guarantees required of any implementation:
//! - durability until consumed,
//! - per-routing-key (book id) publish-order delivery within a consumer
//!   group; different keys may interleave freely,
//! - at-least-once delivery: unacked messages come back, so consumers must
//!   be idempotent.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

use crate::event::ChangeEvent;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("unknown consumer group: {0}")]
    UnknownGroup(String),
}

/// Acknowledges a single delivery. Dropping the handle without calling
/// [`AckHandle::ack`] leaves the message unacked for redelivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), ChannelError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub event: ChangeEvent,
    pub ack: Box<dyn AckHandle>,
}

/// Ordered stream of deliveries for one consumer group.
///
/// A group is single-consumer: competing subscribers would break per-key
/// ordering, so a new subscription takes over the group (and picks up
/// whatever the previous consumer left unacked).
pub struct Subscription {
    group: Arc<GroupState>,
}

impl Subscription {
    /// Wait for the next delivery. Cancel-safe.
    pub async fn recv(&mut self) -> Delivery {
        loop {
            if let Some((seq, event)) = self.group.pop_pending() {
                return Delivery {
                    event,
                    ack: Box::new(MemoryAck {
                        group: self.group.clone(),
                        seq,
                    }),
                };
            }
            self.group.notify.notified().await;
        }
    }

    /// Next delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.group.pop_pending().map(|(seq, event)| Delivery {
            event,
            ack: Box::new(MemoryAck {
                group: self.group.clone(),
                seq,
            }),
        })
    }
}

#[async_trait]
pub trait DurableChannel: Send + Sync {
    /// Publish an event under its routing key. `Ok(())` is the broker ack;
    /// the outbox marks the event delivered only after it.
    async fn publish(&self, routing_key: &str, event: &ChangeEvent) -> Result<(), ChannelError>;

    /// Subscribe as the (single) consumer of a group.
    async fn subscribe(&self, group: &str) -> Result<Subscription, ChannelError>;
}

struct GroupState {
    /// Undelivered backlog in publish order, keyed by a per-group sequence.
    pending: Mutex<BTreeMap<u64, ChangeEvent>>,
    /// Delivered but not yet acked, keyed by the same sequence.
    unacked: Mutex<BTreeMap<u64, ChangeEvent>>,
    notify: Notify,
}

impl GroupState {
    fn pop_pending(&self) -> Option<(u64, ChangeEvent)> {
        let mut pending = self.pending.lock();
        let seq = *pending.keys().next()?;
        let event = pending.remove(&seq)?;
        self.unacked.lock().insert(seq, event.clone());
        Some((seq, event))
    }
}

struct MemoryAck {
    group: Arc<GroupState>,
    seq: u64,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        self.group.unacked.lock().remove(&self.seq);
        Ok(())
    }
}

/// In-process broker with declared consumer groups.
///
/// Every published event fans out to every group's backlog (each store
/// consumes the full stream and filters by version on apply). A single FIFO
/// per group trivially preserves per-routing-key publish order.
pub struct InMemoryChannel {
    groups: DashMap<String, Arc<GroupState>>,
    seq: AtomicU64,
}

impl InMemoryChannel {
    /// Create a broker with the given consumer groups declared up front, so
    /// events published before the first subscribe are retained.
    #[must_use]
    pub fn new(groups: &[&str]) -> Self {
        let map = DashMap::new();
        for name in groups {
            map.insert(
                (*name).to_string(),
                Arc::new(GroupState {
                    pending: Mutex::new(BTreeMap::new()),
                    unacked: Mutex::new(BTreeMap::new()),
                    notify: Notify::new(),
                }),
            );
        }
        Self {
            groups: map,
            seq: AtomicU64::new(0),
        }
    }

    /// Messages sitting in a group's backlog (delivered-but-unacked excluded).
    pub fn backlog(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .map(|g| g.pending.lock().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DurableChannel for InMemoryChannel {
    async fn publish(&self, _routing_key: &str, event: &ChangeEvent) -> Result<(), ChannelError> {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        for entry in self.groups.iter() {
            let group = entry.value();
            group.pending.lock().insert(seq, event.clone());
            group.notify.notify_one();
        }
        Ok(())
    }

    async fn subscribe(&self, group: &str) -> Result<Subscription, ChannelError> {
        let state = self
            .groups
            .get(group)
            .map(|g| g.value().clone())
            .ok_or_else(|| ChannelError::UnknownGroup(group.to_string()))?;

        // Redeliver whatever the previous consumer left unacked, ahead of
        // newer messages (sequence keys keep the original order).
        {
            let mut unacked = state.unacked.lock();
            let mut pending = state.pending.lock();
            let resumed = std::mem::take(&mut *unacked);
            pending.extend(resumed);
        }
        state.notify.notify_one();

        Ok(Subscription { group: state })
    }
}
