use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::book::{BookProjection, BorrowRecord, DomainChange};
use crate::event::ChangeEvent;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("book not found: {0}")]
    BookNotFound(String),
    #[error("borrow not found: {0}")]
    BorrowNotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result of the store-level conditional borrow grant.
///
/// `NoCopies` is the normal business outcome when availability is exhausted;
/// it is never an error and never produces a negative count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    Ok,
    NoCopies,
}

/// One row of the paginated snapshot each side exposes to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub book_id: String,
    pub version: u64,
    pub total_copies: u32,
    pub active_borrows: u32,
    pub tombstoned: bool,
}

/// Local durable store contract for one side of the catalog.
///
/// Persistence drivers are external collaborators; [`super::MemoryStore`] is
/// the in-process reference implementation. The store is deliberately dumb:
/// ordering and dedup decisions live in the projector, the store just applies
/// and records.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Write a domain change and its outbox event in one atomic unit. The
    /// event must never be observable as sent if the domain write did not
    /// commit.
    async fn write_atomic(&self, change: DomainChange, event: ChangeEvent)
        -> Result<(), StoreError>;

    async fn read_projection(&self, book_id: &str) -> Result<Option<BookProjection>, StoreError>;

    /// All projections, tombstoned rows included, in stable `book_id` order.
    async fn list_projections(&self) -> Result<Vec<BookProjection>, StoreError>;

    /// Atomically grant a borrow: if `available_copies` is above zero, record
    /// the open borrow and decrement in one step.
    ///
    /// This is the single contended resource per book. Check, decrement, and
    /// borrow insert must happen under one guard: two concurrent borrows can
    /// never both take the last copy, and no concurrent writer may observe a
    /// granted copy without its borrow record (recomputing availability from
    /// an incomplete borrow set would hand the copy out again).
    async fn conditional_borrow(&self, borrow: &BorrowRecord)
        -> Result<DecrementOutcome, StoreError>;

    /// Apply a remote event to the local projection and record its version in
    /// the last-applied audit table.
    async fn upsert_projection(&self, event: &ChangeEvent) -> Result<(), StoreError>;

    /// Highest event version applied to (or issued for) the book; 0 if the
    /// book is unknown. The projector's gap check reads this.
    async fn last_applied_version(&self, book_id: &str) -> Result<u64, StoreError>;

    /// Reserve the next source-side version for the book (strictly above any
    /// version this store has issued or applied for it).
    async fn reserve_version(&self, book_id: &str) -> Result<u64, StoreError>;

    /// One page of the snapshot summary, ordered by `book_id`. Returns an
    /// empty page once `offset` passes the end.
    async fn snapshot_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SnapshotEntry>, StoreError>;
}
