//! Transactional outbox.
//!
//! Every state-changing operation records its [`ChangeEvent`] here inside the
//! same commit boundary as the domain write; a background publisher drains
//! undelivered events to the channel and marks them delivered only after the
//! broker acknowledges. Delivery is therefore at-least-once, never
//! at-most-once: a crash between publish and mark leaves the event pending
//! and the next drain re-sends it.

pub mod publisher;
pub mod wal;

pub use publisher::OutboxPublisher;
pub use wal::SqliteOutbox;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::CatalogSyncConfig;
use crate::event::ChangeEvent;
use crate::store::StoreError;

/// Open the outbox a config names: the SQLite-backed [`SqliteOutbox`] when
/// `outbox_path` is set, an in-process [`MemoryOutbox`] otherwise.
pub async fn open(config: &CatalogSyncConfig) -> Result<Arc<dyn OutboxStore>, StoreError> {
    match &config.outbox_path {
        Some(path) => Ok(Arc::new(SqliteOutbox::new(path).await?)),
        None => Ok(Arc::new(MemoryOutbox::new())),
    }
}

/// Durable local record of events pending delivery.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Record an event as undelivered. Idempotent on `event_id`.
    async fn append(&self, event: &ChangeEvent) -> Result<(), StoreError>;

    /// Undelivered events in `(book_id, version)` order, up to `limit`.
    async fn undelivered(&self, limit: usize) -> Result<Vec<ChangeEvent>, StoreError>;

    /// Mark events delivered. Called only after broker acknowledgment.
    async fn mark_delivered(&self, event_ids: &[String]) -> Result<(), StoreError>;

    /// Number of undelivered events.
    async fn pending(&self) -> Result<u64, StoreError>;
}

/// In-process outbox for tests and single-process deployments.
pub struct MemoryOutbox {
    rows: Mutex<Vec<ChangeEvent>>,
    seen: Mutex<HashSet<String>>,
    total_appended: AtomicU64,
    total_delivered: AtomicU64,
}

impl MemoryOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            seen: Mutex::new(HashSet::new()),
            total_appended: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
        }
    }

    /// Totals since startup: `(appended, delivered)`.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_appended.load(Ordering::Relaxed),
            self.total_delivered.load(Ordering::Relaxed),
        )
    }
}

impl Default for MemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn append(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        if !self.seen.lock().insert(event.event_id.clone()) {
            return Ok(());
        }
        self.rows.lock().push(event.clone());
        self.total_appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn undelivered(&self, limit: usize) -> Result<Vec<ChangeEvent>, StoreError> {
        let mut batch: Vec<ChangeEvent> = self.rows.lock().clone();
        batch.sort_by(|a, b| {
            a.book_id
                .cmp(&b.book_id)
                .then_with(|| a.version.cmp(&b.version))
        });
        batch.truncate(limit);
        Ok(batch)
    }

    async fn mark_delivered(&self, event_ids: &[String]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|e| !event_ids.contains(&e.event_id));
        self.total_delivered
            .fetch_add((before - rows.len()) as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn pending(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().len() as u64)
    }
}
