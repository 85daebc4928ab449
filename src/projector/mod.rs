// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent consumer side of the sync pipeline.
//!
//! Every delivery passes a version gate against the book's last-applied
//! version:
//! - at or below it: duplicate or stale replay, acked and dropped;
//! - exactly one above: applied, acked, and any buffered successors drained;
//! - further ahead: a gap. The event is buffered unacked for a bounded
//!   window; if the missing version never shows up the book is escalated to
//!   targeted reconciliation and the buffered events are dropped as
//!   superseded by the snapshot.
//!
//! Tombstones and snapshot corrections carry full state and supersede
//! whatever versions they skip, so they bypass the gap buffer entirely.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::channel::Delivery;
use crate::event::{ChangeEvent, EventKind};
use crate::store::{LocalStore, StoreError};

/// What the projector did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied to the projection (possibly draining buffered successors).
    Applied,
    /// Version at or below last-applied; dropped without state change.
    Duplicate,
    /// Version gap; held in the reorder buffer, not yet acknowledged.
    Buffered,
}

struct Buffered {
    delivery: Delivery,
    held_since: Instant,
}

pub struct Projector {
    store: Arc<dyn LocalStore>,
    buffers: DashMap<String, BTreeMap<u64, Buffered>>,
    /// How long a gapped book may sit in the buffer before escalation.
    reorder_wait: Duration,
    /// Per-book buffer cap; overflowing it escalates immediately.
    buffer_max: usize,
    escalated: Mutex<HashSet<String>>,
}

impl Projector {
    pub fn new(store: Arc<dyn LocalStore>, reorder_wait: Duration, buffer_max: usize) -> Self {
        Self {
            store,
            buffers: DashMap::new(),
            reorder_wait,
            buffer_max,
            escalated: Mutex::new(HashSet::new()),
        }
    }

    /// Full-state events supersede the versions they skip: a tombstone wins
    /// over anything in flight, and reconciliation corrections are minted
    /// above every version the authority has seen, so waiting for the gap to
    /// close would hold them hostage to events the snapshot already reflects.
    fn supersedes_gap(event: &ChangeEvent) -> bool {
        match event.kind {
            EventKind::BookRemoved => true,
            EventKind::BookUpdated => event.payload.get("availability_override").is_some(),
            _ => false,
        }
    }

    /// Run one delivery through the version gate.
    pub async fn apply(&self, delivery: Delivery) -> Result<ApplyOutcome, StoreError> {
        let book_id = delivery.event.book_id.clone();
        let version = delivery.event.version;
        let last = self.store.last_applied_version(&book_id).await?;

        if version <= last {
            debug!(book_id, version, last, "Duplicate event dropped");
            crate::metrics::record_duplicate_dropped();
            Self::ack(delivery).await;
            return Ok(ApplyOutcome::Duplicate);
        }

        if version == last + 1 || Self::supersedes_gap(&delivery.event) {
            self.store.upsert_projection(&delivery.event).await?;
            crate::metrics::record_event_applied(delivery.event.kind.as_str());
            Self::ack(delivery).await;
            self.drain_buffer(&book_id).await?;
            return Ok(ApplyOutcome::Applied);
        }

        // Gap: hold the event unacked until the missing version arrives or
        // the window closes.
        warn!(book_id, version, last, "Version gap, buffering event");
        crate::metrics::record_event_buffered();
        let overflowed = {
            let mut buffer = self.buffers.entry(book_id.clone()).or_default();
            buffer.insert(
                version,
                Buffered {
                    delivery,
                    held_since: Instant::now(),
                },
            );
            buffer.len() > self.buffer_max
        };
        if overflowed {
            self.escalate(&book_id).await;
        }
        Ok(ApplyOutcome::Buffered)
    }

    /// Apply buffered successors that have become contiguous, and discard any
    /// the applied versions have overtaken.
    async fn drain_buffer(&self, book_id: &str) -> Result<(), StoreError> {
        loop {
            let last = self.store.last_applied_version(book_id).await?;

            // Pull everything out under the map guard, ack after releasing it.
            let (overtaken, next, emptied) = {
                let Some(mut buffer) = self.buffers.get_mut(book_id) else {
                    return Ok(());
                };
                let mut overtaken = Vec::new();
                while let Some((&head, _)) = buffer.iter().next() {
                    if head > last {
                        break;
                    }
                    if let Some(stale) = buffer.remove(&head) {
                        overtaken.push(stale);
                    }
                }
                let next = buffer.remove(&(last + 1));
                (overtaken, next, buffer.is_empty())
            };
            if emptied {
                self.buffers.remove(book_id);
            }

            for stale in overtaken {
                crate::metrics::record_duplicate_dropped();
                Self::ack(stale.delivery).await;
            }

            match next {
                Some(buffered) => {
                    debug!(book_id, version = last + 1, "Gap closed, applying buffered event");
                    self.store.upsert_projection(&buffered.delivery.event).await?;
                    crate::metrics::record_event_applied(buffered.delivery.event.kind.as_str());
                    Self::ack(buffered.delivery).await;
                }
                None => return Ok(()),
            }
        }
    }

    /// Drop the book's buffer and queue it for targeted reconciliation. The
    /// buffered events are acked: the snapshot supersedes them.
    async fn escalate(&self, book_id: &str) {
        if let Some((_, buffer)) = self.buffers.remove(book_id) {
            let dropped = buffer.len();
            warn!(book_id, dropped, "Gap did not close, escalating to reconciliation");
            for (_, buffered) in buffer {
                Self::ack(buffered.delivery).await;
            }
        }
        crate::metrics::record_gap_escalation();
        self.escalated.lock().insert(book_id.to_string());
    }

    /// Escalate books whose oldest buffered event has outlived the reorder
    /// window, then hand back every book awaiting targeted reconciliation.
    /// Meant to be driven from a timer tick.
    pub async fn sweep(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .buffers
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .values()
                    .any(|b| b.held_since.elapsed() >= self.reorder_wait)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for book_id in &stale {
            self.escalate(book_id).await;
        }

        let mut escalated = self.escalated.lock();
        escalated.drain().collect()
    }

    /// Buffered (unacked) events currently held for a book.
    #[must_use]
    pub fn buffered(&self, book_id: &str) -> usize {
        self.buffers.get(book_id).map(|b| b.len()).unwrap_or(0)
    }

    async fn ack(delivery: Delivery) {
        if let Err(e) = delivery.ack.ack().await {
            // Redelivery will come back as a duplicate and drop at the gate.
            warn!(error = %e, "Ack failed, expecting redelivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AckHandle, ChannelError};
    use crate::outbox::MemoryOutbox;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestAck(Arc<AtomicBool>);

    #[async_trait]
    impl AckHandle for TestAck {
        async fn ack(self: Box<Self>) -> Result<(), ChannelError> {
            self.0.store(true, Ordering::Release);
            Ok(())
        }
    }

    fn delivery(event: ChangeEvent) -> (Delivery, Arc<AtomicBool>) {
        let acked = Arc::new(AtomicBool::new(false));
        (
            Delivery {
                event,
                ack: Box::new(TestAck(acked.clone())),
            },
            acked,
        )
    }

    fn book_added(book_id: &str) -> ChangeEvent {
        ChangeEvent::new(
            book_id,
            EventKind::BookAdded,
            1,
            json!({
                "title": "Dune", "author": "Frank Herbert",
                "publisher": "Chilton", "category": "sf", "total_copies": 2,
            }),
        )
    }

    fn borrowed(book_id: &str, version: u64, borrow_id: &str) -> ChangeEvent {
        ChangeEvent::new(
            book_id,
            EventKind::Borrowed,
            version,
            json!({"borrow_id": borrow_id, "user_id": "u-1", "borrowed_at": 1, "due_at": 100}),
        )
    }

    fn projector(store: Arc<MemoryStore>) -> Projector {
        Projector::new(store, Duration::from_millis(20), 4)
    }

    #[tokio::test]
    async fn test_in_order_applies_and_acks() {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryOutbox::new())));
        let p = projector(store.clone());

        let (d, acked) = delivery(book_added("b-1"));
        assert_eq!(p.apply(d).await.unwrap(), ApplyOutcome::Applied);
        assert!(acked.load(Ordering::Acquire));
        assert_eq!(store.last_applied_version("b-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_acked_without_state_change() {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryOutbox::new())));
        let p = projector(store.clone());

        let (d, _) = delivery(book_added("b-1"));
        p.apply(d).await.unwrap();
        let (d2, _) = delivery(borrowed("b-1", 2, "br-1"));
        p.apply(d2).await.unwrap();

        // Redelivery of the same borrow.
        let (dup, acked) = delivery(borrowed("b-1", 2, "br-1"));
        assert_eq!(p.apply(dup).await.unwrap(), ApplyOutcome::Duplicate);
        assert!(acked.load(Ordering::Acquire));

        let proj = store.read_projection("b-1").await.unwrap().unwrap();
        assert_eq!(proj.borrows.len(), 1);
        assert_eq!(proj.availability.available_copies, 1);
    }

    #[tokio::test]
    async fn test_gap_buffers_until_missing_version_arrives() {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryOutbox::new())));
        let p = projector(store.clone());

        let (d1, _) = delivery(book_added("b-1"));
        p.apply(d1).await.unwrap();

        // v3 before v2: held, not acked.
        let (d3, acked3) = delivery(borrowed("b-1", 3, "br-2"));
        assert_eq!(p.apply(d3).await.unwrap(), ApplyOutcome::Buffered);
        assert!(!acked3.load(Ordering::Acquire));
        assert_eq!(p.buffered("b-1"), 1);
        assert_eq!(store.last_applied_version("b-1").await.unwrap(), 1);

        // v2 arrives: both apply, buffer drains.
        let (d2, _) = delivery(borrowed("b-1", 2, "br-1"));
        assert_eq!(p.apply(d2).await.unwrap(), ApplyOutcome::Applied);
        assert!(acked3.load(Ordering::Acquire));
        assert_eq!(p.buffered("b-1"), 0);
        assert_eq!(store.last_applied_version("b-1").await.unwrap(), 3);

        let proj = store.read_projection("b-1").await.unwrap().unwrap();
        assert_eq!(proj.borrows.len(), 2);
        assert_eq!(proj.availability.available_copies, 0);
    }

    #[tokio::test]
    async fn test_sweep_escalates_stale_gap_and_drops_buffered() {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryOutbox::new())));
        let p = projector(store.clone());

        let (d1, _) = delivery(book_added("b-1"));
        p.apply(d1).await.unwrap();
        let (d3, acked3) = delivery(borrowed("b-1", 3, "br-2"));
        p.apply(d3).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let escalated = p.sweep().await;

        assert_eq!(escalated, vec!["b-1".to_string()]);
        assert_eq!(p.buffered("b-1"), 0);
        // Superseded by the coming snapshot, so acked rather than redelivered.
        assert!(acked3.load(Ordering::Acquire));
        assert_eq!(store.last_applied_version("b-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_buffer_overflow_escalates_immediately() {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryOutbox::new())));
        let p = Projector::new(store.clone(), Duration::from_secs(60), 2);

        let (d1, _) = delivery(book_added("b-1"));
        p.apply(d1).await.unwrap();

        for v in [5, 6, 7] {
            let (d, _) = delivery(borrowed("b-1", v, &format!("br-{v}")));
            p.apply(d).await.unwrap();
        }

        assert_eq!(p.buffered("b-1"), 0);
        assert_eq!(p.sweep().await, vec!["b-1".to_string()]);
    }

    #[tokio::test]
    async fn test_tombstone_bypasses_gap_buffer() {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryOutbox::new())));
        let p = projector(store.clone());

        let (d1, _) = delivery(book_added("b-1"));
        p.apply(d1).await.unwrap();

        // Removal minted at v4 while v2..v3 are still in flight.
        let (removed, acked) = delivery(ChangeEvent::new(
            "b-1",
            EventKind::BookRemoved,
            4,
            json!({}),
        ));
        assert_eq!(p.apply(removed).await.unwrap(), ApplyOutcome::Applied);
        assert!(acked.load(Ordering::Acquire));

        // The late borrow is now stale and bounces off the tombstone.
        let (late, _) = delivery(borrowed("b-1", 2, "br-1"));
        assert_eq!(p.apply(late).await.unwrap(), ApplyOutcome::Duplicate);

        let proj = store.read_projection("b-1").await.unwrap().unwrap();
        assert!(proj.tombstoned);
        assert!(proj.borrows.is_empty());
    }

    #[tokio::test]
    async fn test_correction_with_override_bypasses_gap_buffer() {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryOutbox::new())));
        let p = projector(store.clone());

        let (d1, _) = delivery(book_added("b-1"));
        p.apply(d1).await.unwrap();

        let (correction, _) = delivery(ChangeEvent::new(
            "b-1",
            EventKind::BookUpdated,
            9,
            json!({
                "title": "Dune", "author": "Frank Herbert",
                "publisher": "Chilton", "category": "sf", "total_copies": 2,
                "availability_override": {"available_copies": 1, "unavailable_until": null},
            }),
        ));
        assert_eq!(p.apply(correction).await.unwrap(), ApplyOutcome::Applied);

        let proj = store.read_projection("b-1").await.unwrap().unwrap();
        assert_eq!(proj.last_applied, 9);
        assert_eq!(proj.availability.available_copies, 1);
    }

    #[tokio::test]
    async fn test_buffered_events_overtaken_by_supersede_are_dropped() {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryOutbox::new())));
        let p = projector(store.clone());

        let (d1, _) = delivery(book_added("b-1"));
        p.apply(d1).await.unwrap();

        let (d3, acked3) = delivery(borrowed("b-1", 3, "br-2"));
        p.apply(d3).await.unwrap();

        // Tombstone at v5 overtakes the buffered v3.
        let (removed, _) = delivery(ChangeEvent::new(
            "b-1",
            EventKind::BookRemoved,
            5,
            json!({}),
        ));
        p.apply(removed).await.unwrap();

        assert_eq!(p.buffered("b-1"), 0);
        assert!(acked3.load(Ordering::Acquire));
        let proj = store.read_projection("b-1").await.unwrap().unwrap();
        assert!(proj.tombstoned);
    }
}
