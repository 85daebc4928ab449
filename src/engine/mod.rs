// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One side of the catalog: local mutations in, remote events out, and the
//! background machinery keeping both stores convergent.
//!
//! A [`CatalogEngine`] owns the mutation API for the facts its store is
//! authoritative over (the admin engine adds/updates/removes books, the user
//! engine borrows and returns) plus the sync plumbing every side runs: the
//! outbox publisher, the idempotent projector consuming the channel, and the
//! reconciler pulling the counterpart's snapshots. [`CatalogEngine::run`]
//! drives all of it from a single select loop until [`CatalogEngine::shutdown`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use crate::book::{Book, BookPatch, BookProjection, BorrowRecord, DomainChange, NewBook};
use crate::channel::{ChannelError, DurableChannel};
use crate::config::CatalogSyncConfig;
use crate::event::{
    now_millis, BookPayload, BorrowPayload, ChangeEvent, CodecError, EventKind, ReturnPayload,
};
use crate::metrics::LatencyTimer;
use crate::outbox::{OutboxPublisher, OutboxStore};
use crate::projector::Projector;
use crate::reconcile::{CycleReport, Reconciler, SnapshotSource, StoreRole};
use crate::store::{DecrementOutcome, LocalStore, StoreError};

pub use crate::outbox::publisher::DrainReport;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Borrow attempted with no copies available. A normal business failure,
    /// not a system error.
    #[error("no copies available for book {0}")]
    CapacityExceeded(String),
    #[error("book not found: {0}")]
    BookNotFound(String),
    #[error("borrow not found: {0}")]
    BorrowNotFound(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BookNotFound(id) => EngineError::BookNotFound(id),
            StoreError::BorrowNotFound(id) => EngineError::BorrowNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

/// Engine lifecycle, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Created => "Created",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

pub struct CatalogEngine {
    /// Consumer-group identity on the channel ("admin" or "user", typically).
    name: String,
    store: Arc<dyn LocalStore>,
    channel: Arc<dyn DurableChannel>,
    publisher: Arc<OutboxPublisher>,
    projector: Projector,
    reconciler: Reconciler,
    config: CatalogSyncConfig,
    state_tx: watch::Sender<EngineState>,
    shutdown_tx: watch::Sender<bool>,
}

impl CatalogEngine {
    pub fn new(
        name: impl Into<String>,
        config: CatalogSyncConfig,
        store: Arc<dyn LocalStore>,
        outbox: Arc<dyn OutboxStore>,
        channel: Arc<dyn DurableChannel>,
        remote: Arc<dyn SnapshotSource>,
        remote_role: StoreRole,
    ) -> Self {
        let publisher = Arc::new(OutboxPublisher::new(
            outbox,
            channel.clone(),
            config.outbox_drain_batch_size,
        ));
        let projector = Projector::new(
            store.clone(),
            Duration::from_millis(config.reorder_wait_ms),
            config.reorder_buffer_max,
        );
        let reconciler = Reconciler::new(
            store.clone(),
            remote,
            remote_role,
            config.snapshot_page_size,
            config.divergence_alert_cycles,
        );
        let (state_tx, _) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            store,
            channel,
            publisher,
            projector,
            reconciler,
            config,
            state_tx,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions (e.g. to await `Running` in tests).
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        crate::metrics::set_engine_state(&state.to_string());
        let _ = self.state_tx.send(state);
    }

    // ── Mutation API ────────────────────────────────────────────────────────

    #[tracing::instrument(skip(self, new), fields(engine = %self.name))]
    pub async fn add_book(&self, new: NewBook) -> Result<Book, EngineError> {
        let _timer = LatencyTimer::new("add_book");
        let mut book = Book::create(new);
        book.version = self.store.reserve_version(&book.id).await?;

        let payload = serde_json::to_value(book_payload(&book)).map_err(CodecError::from)?;
        let event = ChangeEvent::new(&book.id, EventKind::BookAdded, book.version, payload);
        self.store
            .write_atomic(DomainChange::BookPut(book.clone()), event)
            .await?;

        info!(book_id = %book.id, title = %book.title, "Book added");
        Ok(book)
    }

    #[tracing::instrument(skip(self, patch), fields(engine = %self.name))]
    pub async fn update_book(&self, book_id: &str, patch: BookPatch) -> Result<Book, EngineError> {
        let _timer = LatencyTimer::new("update_book");
        let proj = self.require_book(book_id).await?;

        let mut book = proj.book;
        book.apply_patch(patch);
        book.version = self.store.reserve_version(book_id).await?;

        let payload = serde_json::to_value(book_payload(&book)).map_err(CodecError::from)?;
        let event = ChangeEvent::new(book_id, EventKind::BookUpdated, book.version, payload);
        self.store
            .write_atomic(DomainChange::BookPut(book.clone()), event)
            .await?;

        info!(book_id, version = book.version, "Book updated");
        Ok(book)
    }

    /// Tombstone a book. Idempotent: removing an already-removed book is Ok.
    #[tracing::instrument(skip(self), fields(engine = %self.name))]
    pub async fn remove_book(&self, book_id: &str) -> Result<(), EngineError> {
        let _timer = LatencyTimer::new("remove_book");
        let proj = self
            .store
            .read_projection(book_id)
            .await?
            .ok_or_else(|| EngineError::BookNotFound(book_id.to_string()))?;
        if proj.tombstoned {
            return Ok(());
        }

        let version = self.store.reserve_version(book_id).await?;
        let event = ChangeEvent::new(book_id, EventKind::BookRemoved, version, serde_json::json!({}));
        self.store
            .write_atomic(
                DomainChange::BookTombstone {
                    book_id: book_id.to_string(),
                },
                event,
            )
            .await?;

        info!(book_id, version, "Book removed");
        Ok(())
    }

    /// Borrow a copy for `days`. The store-level conditional grant is the
    /// only synchronization: it records the borrow and decrements in one
    /// atomic step, and if it reports no copies the caller gets
    /// [`EngineError::CapacityExceeded`] and nothing changed.
    #[tracing::instrument(skip(self), fields(engine = %self.name))]
    pub async fn borrow(
        &self,
        book_id: &str,
        user_id: &str,
        days: u32,
    ) -> Result<BorrowRecord, EngineError> {
        let _timer = LatencyTimer::new("borrow");
        self.require_book(book_id).await?;

        let borrow = BorrowRecord::open(user_id, book_id, days);
        match self.store.conditional_borrow(&borrow).await? {
            DecrementOutcome::NoCopies => {
                crate::metrics::record_borrow_denied();
                return Err(EngineError::CapacityExceeded(book_id.to_string()));
            }
            DecrementOutcome::Ok => {}
        }

        let version = self.store.reserve_version(book_id).await?;
        let payload = serde_json::to_value(BorrowPayload {
            borrow_id: borrow.id.clone(),
            user_id: borrow.user_id.clone(),
            borrowed_at: borrow.borrowed_at,
            due_at: borrow.due_at,
        })
        .map_err(CodecError::from)?;
        let event = ChangeEvent::new(book_id, EventKind::Borrowed, version, payload);
        self.store
            .write_atomic(DomainChange::BorrowOpen(borrow.clone()), event)
            .await?;

        crate::metrics::record_borrow_granted();
        info!(book_id, borrow_id = %borrow.id, due_at = borrow.due_at, "Borrow granted");
        Ok(borrow)
    }

    /// Close a borrow. Idempotent: returning an already-returned borrow hands
    /// back the closed record unchanged.
    #[tracing::instrument(skip(self), fields(engine = %self.name))]
    pub async fn return_book(
        &self,
        book_id: &str,
        borrow_id: &str,
    ) -> Result<BorrowRecord, EngineError> {
        let _timer = LatencyTimer::new("return");
        // Returns are allowed on tombstoned books: the loan still has to close.
        let proj = self
            .store
            .read_projection(book_id)
            .await?
            .ok_or_else(|| EngineError::BookNotFound(book_id.to_string()))?;
        let mut borrow = proj
            .borrows
            .iter()
            .find(|b| b.id == borrow_id)
            .cloned()
            .ok_or_else(|| EngineError::BorrowNotFound(borrow_id.to_string()))?;
        if !borrow.is_active() {
            return Ok(borrow);
        }

        let returned_at = now_millis();
        let version = self.store.reserve_version(book_id).await?;
        let payload = serde_json::to_value(ReturnPayload {
            borrow_id: borrow_id.to_string(),
            returned_at,
        })
        .map_err(CodecError::from)?;
        let event = ChangeEvent::new(book_id, EventKind::Returned, version, payload);
        self.store
            .write_atomic(
                DomainChange::BorrowClose {
                    book_id: book_id.to_string(),
                    borrow_id: borrow_id.to_string(),
                    returned_at,
                },
                event,
            )
            .await?;

        borrow.returned_at = Some(returned_at);
        info!(book_id, borrow_id, "Borrow returned");
        Ok(borrow)
    }

    // ── Read API ────────────────────────────────────────────────────────────

    pub async fn get_book(&self, book_id: &str) -> Result<Option<BookProjection>, EngineError> {
        Ok(self
            .store
            .read_projection(book_id)
            .await?
            .filter(BookProjection::is_listed))
    }

    /// All non-tombstoned books.
    pub async fn list_books(&self) -> Result<Vec<BookProjection>, EngineError> {
        Ok(self
            .store
            .list_projections()
            .await?
            .into_iter()
            .filter(BookProjection::is_listed)
            .collect())
    }

    /// Books with at least one copy on the shelf.
    pub async fn available_books(&self) -> Result<Vec<BookProjection>, EngineError> {
        Ok(self
            .list_books()
            .await?
            .into_iter()
            .filter(|p| p.availability.available_copies > 0)
            .collect())
    }

    /// Exhausted books; `availability.unavailable_until` carries the earliest
    /// expected return date.
    pub async fn unavailable_books(&self) -> Result<Vec<BookProjection>, EngineError> {
        Ok(self
            .list_books()
            .await?
            .into_iter()
            .filter(|p| p.availability.available_copies == 0)
            .collect())
    }

    /// Listed books in a category.
    pub async fn books_by_category(
        &self,
        category: &str,
    ) -> Result<Vec<BookProjection>, EngineError> {
        Ok(self
            .list_books()
            .await?
            .into_iter()
            .filter(|p| p.book.category == category)
            .collect())
    }

    /// Listed books from a publisher.
    pub async fn books_by_publisher(
        &self,
        publisher: &str,
    ) -> Result<Vec<BookProjection>, EngineError> {
        Ok(self
            .list_books()
            .await?
            .into_iter()
            .filter(|p| p.book.publisher == publisher)
            .collect())
    }

    /// A user's active borrows across the catalog.
    pub async fn user_borrows(&self, user_id: &str) -> Result<Vec<BorrowRecord>, EngineError> {
        Ok(self
            .store
            .list_projections()
            .await?
            .iter()
            .flat_map(|p| p.active_borrows())
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn require_book(&self, book_id: &str) -> Result<BookProjection, EngineError> {
        self.store
            .read_projection(book_id)
            .await?
            .filter(BookProjection::is_listed)
            .ok_or_else(|| EngineError::BookNotFound(book_id.to_string()))
    }

    // ── Sync plumbing ───────────────────────────────────────────────────────

    /// One outbox drain pass. `run` does this on a timer; tests call it
    /// directly for deterministic pumping.
    pub async fn drain_outbox(&self) -> Result<DrainReport, EngineError> {
        Ok(self.publisher.drain_once().await?)
    }

    /// Apply every event currently queued for this engine's consumer group.
    /// Returns how many deliveries went through the version gate.
    pub async fn process_pending(&self) -> Result<usize, EngineError> {
        let mut sub = self.channel.subscribe(&self.name).await?;
        let mut n = 0;
        while let Some(delivery) = sub.try_recv() {
            self.projector.apply(delivery).await?;
            n += 1;
        }
        Ok(n)
    }

    /// One full reconciliation pass against the counterpart's snapshot.
    pub async fn run_reconciliation(&self) -> Result<CycleReport, EngineError> {
        let report = self.reconciler.run_cycle().await?;
        crate::metrics::set_books_tracked(report.checked);
        Ok(report)
    }

    /// Escalate reorder-buffer gaps that outlived their window and run
    /// targeted reconciliation for each escalated book. Returns how many
    /// books were repaired. `run` does this on a timer; tests call it
    /// directly.
    pub async fn sweep_gaps(&self) -> Result<usize, EngineError> {
        let mut repaired = 0;
        for book_id in self.projector.sweep().await {
            if self.reconciler.reconcile_book(&book_id).await? {
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    /// Run the engine until [`CatalogEngine::shutdown`]: outbox drain on its
    /// own task, event consumption, gap sweeps, and periodic reconciliation.
    /// Every failure path degrades to retry; nothing here is fatal.
    pub async fn run(&self) -> Result<(), EngineError> {
        let mut sub = self.channel.subscribe(&self.name).await?;
        self.set_state(EngineState::Running);
        info!(engine = %self.name, "Catalog engine running");

        let drain_task = {
            let publisher = self.publisher.clone();
            let shutdown = self.shutdown_tx.subscribe();
            let tick = Duration::from_millis(self.config.outbox_drain_interval_ms);
            tokio::spawn(async move { publisher.run(shutdown, tick).await })
        };

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut reconcile = interval(Duration::from_secs(self.config.reconcile_interval_secs.max(1)));
        let mut sweep = interval(Duration::from_millis((self.config.reorder_wait_ms / 2).max(100)));

        loop {
            tokio::select! {
                delivery = sub.recv() => {
                    if let Err(e) = self.projector.apply(delivery).await {
                        warn!(engine = %self.name, error = %e, "Failed to apply event");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_gaps().await {
                        warn!(engine = %self.name, error = %e, "Targeted reconciliation failed");
                    }
                }
                _ = reconcile.tick() => {
                    match self.reconciler.run_cycle().await {
                        Ok(report) => crate::metrics::set_books_tracked(report.checked),
                        Err(e) => warn!(engine = %self.name, error = %e, "Reconciliation cycle failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(EngineState::ShuttingDown);
        info!(engine = %self.name, "Catalog engine shutting down");

        // The publisher sees the same shutdown signal and runs a final flush
        // before exiting.
        let _ = drain_task.await;

        self.set_state(EngineState::Stopped);
        info!(engine = %self.name, "Catalog engine stopped");
        Ok(())
    }

    /// Signal shutdown and wait for [`CatalogEngine::run`] to wind down.
    pub async fn shutdown(&self) {
        if self.state() == EngineState::Created {
            self.set_state(EngineState::Stopped);
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let mut rx = self.state_tx.subscribe();
        while *rx.borrow() != EngineState::Stopped {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

fn book_payload(book: &Book) -> BookPayload {
    BookPayload {
        title: book.title.clone(),
        author: book.author.clone(),
        publisher: book.publisher.clone(),
        category: book.category.clone(),
        total_copies: book.total_copies,
        availability_override: None,
    }
}
