use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{DecrementOutcome, LocalStore, SnapshotEntry, StoreError};
use crate::availability::{self, AvailabilityState};
use crate::book::{Book, BookProjection, BorrowRecord, DomainChange};
use crate::event::{BookPayload, BorrowPayload, ChangeEvent, EventKind, ReturnPayload};
use crate::outbox::OutboxStore;

/// In-process store for one side of the catalog.
///
/// Per-book state lives in a `DashMap`; the map's per-entry locking is the
/// serialization point for the borrow grant, so no cross-process
/// mutex exists anywhere. The outbox is written right after the domain
/// mutation commits - with the in-memory store the window between the two is
/// not crash-atomic, which is exactly the drift reconciliation exists to
/// repair.
pub struct MemoryStore {
    books: DashMap<String, BookProjection>,
    /// Highest version issued or applied per book, for minting source-side
    /// versions. Survives tombstoning (and the version race depends on that).
    seqs: DashMap<String, u64>,
    outbox: Arc<dyn OutboxStore>,
}

impl MemoryStore {
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            books: DashMap::new(),
            seqs: DashMap::new(),
            outbox,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.books.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    fn bump_seq(&self, book_id: &str, version: u64) {
        let mut seq = self.seqs.entry(book_id.to_string()).or_insert(0);
        if version > *seq {
            *seq = version;
        }
    }

    fn apply_domain_change(&self, change: DomainChange) -> Result<(), StoreError> {
        match change {
            DomainChange::BookPut(book) => {
                match self.books.get_mut(&book.id) {
                    Some(mut entry) => {
                        entry.book = book;
                        let (total, borrows) = (entry.book.total_copies, entry.borrows.clone());
                        availability::recompute(&mut entry.availability, total, &borrows);
                    }
                    None => {
                        self.books
                            .insert(book.id.clone(), BookProjection::new(book));
                    }
                }
                Ok(())
            }
            DomainChange::BookTombstone { book_id } => {
                let mut entry = self
                    .books
                    .get_mut(&book_id)
                    .ok_or_else(|| StoreError::BookNotFound(book_id.clone()))?;
                entry.tombstoned = true;
                Ok(())
            }
            DomainChange::BorrowOpen(borrow) => {
                let mut entry = self
                    .books
                    .get_mut(&borrow.book_id)
                    .ok_or_else(|| StoreError::BookNotFound(borrow.book_id.clone()))?;
                if entry.tombstoned {
                    return Err(StoreError::BookNotFound(borrow.book_id.clone()));
                }
                // `conditional_borrow` already recorded the grant under this
                // entry's guard; re-pushing would double-count it.
                if !entry.borrows.iter().any(|b| b.id == borrow.id) {
                    entry.borrows.push(borrow);
                }
                let (total, borrows) = (entry.book.total_copies, entry.borrows.clone());
                availability::recompute(&mut entry.availability, total, &borrows);
                Ok(())
            }
            DomainChange::BorrowClose {
                book_id,
                borrow_id,
                returned_at,
            } => {
                let mut entry = self
                    .books
                    .get_mut(&book_id)
                    .ok_or_else(|| StoreError::BookNotFound(book_id.clone()))?;
                let borrow = entry
                    .borrows
                    .iter_mut()
                    .find(|b| b.id == borrow_id)
                    .ok_or_else(|| StoreError::BorrowNotFound(borrow_id.clone()))?;
                if borrow.returned_at.is_none() {
                    borrow.returned_at = Some(returned_at);
                }
                let (total, borrows) = (entry.book.total_copies, entry.borrows.clone());
                availability::recompute(&mut entry.availability, total, &borrows);
                Ok(())
            }
        }
    }

    /// Record an applied version on the projection's audit field.
    fn record_applied(&self, book_id: &str, version: u64) {
        if let Some(mut entry) = self.books.get_mut(book_id) {
            if version > entry.last_applied {
                entry.last_applied = version;
            }
        }
        self.bump_seq(book_id, version);
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn write_atomic(
        &self,
        change: DomainChange,
        event: ChangeEvent,
    ) -> Result<(), StoreError> {
        debug_assert_eq!(change.book_id(), event.book_id);

        self.apply_domain_change(change)?;
        self.record_applied(&event.book_id, event.version);

        // Fan-out to all groups means the origin sees its own events come
        // back; recording the issued version above makes them drop as
        // duplicates on apply.
        self.outbox.append(&event).await?;
        Ok(())
    }

    async fn read_projection(&self, book_id: &str) -> Result<Option<BookProjection>, StoreError> {
        Ok(self.books.get(book_id).map(|r| r.value().clone()))
    }

    async fn list_projections(&self) -> Result<Vec<BookProjection>, StoreError> {
        let mut all: Vec<BookProjection> =
            self.books.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.book.id.cmp(&b.book.id));
        Ok(all)
    }

    async fn conditional_borrow(
        &self,
        borrow: &BorrowRecord,
    ) -> Result<DecrementOutcome, StoreError> {
        let mut entry = self
            .books
            .get_mut(&borrow.book_id)
            .ok_or_else(|| StoreError::BookNotFound(borrow.book_id.clone()))?;
        if entry.tombstoned {
            return Err(StoreError::BookNotFound(borrow.book_id.clone()));
        }

        // The entry guard serializes check, borrow insert, and decrement; two
        // concurrent borrows can never both take the last copy, and the
        // borrow set never lags the count, so recomputes elsewhere cannot
        // resurrect a granted copy.
        if entry.availability.available_copies == 0 {
            return Ok(DecrementOutcome::NoCopies);
        }
        entry.borrows.push(borrow.clone());
        let (total, borrows) = (entry.book.total_copies, entry.borrows.clone());
        availability::recompute(&mut entry.availability, total, &borrows);
        if entry.availability.available_copies == 0 {
            debug!(
                book_id = %borrow.book_id,
                state = %AvailabilityState::of(&entry.availability),
                "Last copy granted"
            );
        }
        Ok(DecrementOutcome::Ok)
    }

    async fn upsert_projection(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        match event.kind {
            EventKind::BookAdded | EventKind::BookUpdated => {
                let payload: BookPayload = match event.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        // Record the version anyway: a poison payload must not
                        // wedge the book's event stream.
                        warn!(event_id = %event.event_id, error = %e, "Undecodable book payload");
                        self.record_applied(&event.book_id, event.version);
                        return Ok(());
                    }
                };

                match self.books.get_mut(&event.book_id) {
                    Some(entry) if entry.tombstoned => {
                        // Tombstone wins: never resurrect.
                        debug!(book_id = %event.book_id, "Metadata event for tombstoned book dropped");
                    }
                    Some(mut entry) => {
                        entry.book.title = payload.title;
                        entry.book.author = payload.author;
                        entry.book.publisher = payload.publisher;
                        entry.book.category = payload.category;
                        entry.book.total_copies = payload.total_copies;
                        entry.book.version = event.version;
                        let (total, borrows) = (entry.book.total_copies, entry.borrows.clone());
                        availability::recompute(&mut entry.availability, total, &borrows);
                        if let Some(ov) = payload.availability_override {
                            entry.availability.available_copies = ov.available_copies;
                            entry.availability.unavailable_until = ov.unavailable_until;
                        }
                    }
                    None => {
                        let book = Book {
                            id: event.book_id.clone(),
                            title: payload.title,
                            author: payload.author,
                            publisher: payload.publisher,
                            category: payload.category,
                            total_copies: payload.total_copies,
                            version: event.version,
                        };
                        let mut proj = BookProjection::new(book);
                        if let Some(ov) = payload.availability_override {
                            proj.availability.available_copies = ov.available_copies;
                            proj.availability.unavailable_until = ov.unavailable_until;
                        }
                        self.books.insert(event.book_id.clone(), proj);
                    }
                }
            }
            EventKind::BookRemoved => {
                match self.books.get_mut(&event.book_id) {
                    Some(mut entry) => entry.tombstoned = true,
                    None => {
                        // Tombstone arriving before any metadata: keep a stub
                        // so later stale events still hit the tombstone guard.
                        let book = Book {
                            id: event.book_id.clone(),
                            title: String::new(),
                            author: String::new(),
                            publisher: String::new(),
                            category: String::new(),
                            total_copies: 0,
                            version: event.version,
                        };
                        let mut proj = BookProjection::new(book);
                        proj.tombstoned = true;
                        self.books.insert(event.book_id.clone(), proj);
                    }
                }
            }
            EventKind::Borrowed => {
                let payload: BorrowPayload = match event.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(event_id = %event.event_id, error = %e, "Undecodable borrow payload");
                        self.record_applied(&event.book_id, event.version);
                        return Ok(());
                    }
                };
                match self.books.get_mut(&event.book_id) {
                    Some(entry) if entry.tombstoned => {
                        debug!(book_id = %event.book_id, "Borrow event for tombstoned book rejected");
                    }
                    Some(mut entry) => {
                        if !entry.borrows.iter().any(|b| b.id == payload.borrow_id) {
                            entry.borrows.push(BorrowRecord {
                                id: payload.borrow_id,
                                user_id: payload.user_id,
                                book_id: event.book_id.clone(),
                                borrowed_at: payload.borrowed_at,
                                due_at: payload.due_at,
                                returned_at: None,
                            });
                        }
                        let (total, borrows) = (entry.book.total_copies, entry.borrows.clone());
                        availability::recompute(&mut entry.availability, total, &borrows);
                    }
                    None => {
                        warn!(book_id = %event.book_id, "Borrow event for unknown book, awaiting reconciliation");
                    }
                }
            }
            EventKind::Returned => {
                let payload: ReturnPayload = match event.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(event_id = %event.event_id, error = %e, "Undecodable return payload");
                        self.record_applied(&event.book_id, event.version);
                        return Ok(());
                    }
                };
                match self.books.get_mut(&event.book_id) {
                    Some(mut entry) => {
                        if let Some(borrow) =
                            entry.borrows.iter_mut().find(|b| b.id == payload.borrow_id)
                        {
                            if borrow.returned_at.is_none() {
                                borrow.returned_at = Some(payload.returned_at);
                            }
                        } else {
                            warn!(
                                book_id = %event.book_id,
                                borrow_id = %payload.borrow_id,
                                "Return event for unknown borrow, awaiting reconciliation"
                            );
                        }
                        let (total, borrows) = (entry.book.total_copies, entry.borrows.clone());
                        availability::recompute(&mut entry.availability, total, &borrows);
                    }
                    None => {
                        warn!(book_id = %event.book_id, "Return event for unknown book, awaiting reconciliation");
                    }
                }
            }
            EventKind::Unknown => {
                // Forward compatibility: ignore the payload, keep the version.
                debug!(event_id = %event.event_id, "Unknown event kind ignored");
            }
        }

        self.record_applied(&event.book_id, event.version);
        Ok(())
    }

    async fn last_applied_version(&self, book_id: &str) -> Result<u64, StoreError> {
        Ok(self.books.get(book_id).map(|e| e.last_applied).unwrap_or(0))
    }

    async fn reserve_version(&self, book_id: &str) -> Result<u64, StoreError> {
        let mut seq = self.seqs.entry(book_id.to_string()).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    async fn snapshot_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SnapshotEntry>, StoreError> {
        let all = self.list_projections().await?;
        Ok(all
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|p| SnapshotEntry {
                book_id: p.book.id.clone(),
                version: p.last_applied,
                total_copies: p.book.total_copies,
                active_borrows: p.active_borrow_count(),
                tombstoned: p.tombstoned,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::NewBook;
    use crate::outbox::MemoryOutbox;
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(MemoryOutbox::new()))
    }

    fn book(copies: u32) -> Book {
        Book::create(NewBook {
            title: "Dune".into(),
            author: "Frank Herbert".into(),
            publisher: "Chilton".into(),
            category: "sf".into(),
            total_copies: copies,
        })
    }

    fn book_added(book: &Book) -> ChangeEvent {
        ChangeEvent::new(
            &book.id,
            EventKind::BookAdded,
            1,
            json!({
                "title": book.title,
                "author": book.author,
                "publisher": book.publisher,
                "category": book.category,
                "total_copies": book.total_copies,
            }),
        )
    }

    #[tokio::test]
    async fn test_write_atomic_records_outbox_event() {
        let outbox = Arc::new(MemoryOutbox::new());
        let store = MemoryStore::new(outbox.clone());
        let b = book(2);
        let event = book_added(&b);

        store
            .write_atomic(DomainChange::BookPut(b.clone()), event)
            .await
            .unwrap();

        assert_eq!(outbox.pending().await.unwrap(), 1);
        let proj = store.read_projection(&b.id).await.unwrap().unwrap();
        assert_eq!(proj.availability.available_copies, 2);
        assert_eq!(proj.last_applied, 1);
    }

    #[tokio::test]
    async fn test_conditional_borrow_stops_at_zero() {
        let store = store();
        let b = book(1);
        store
            .write_atomic(DomainChange::BookPut(b.clone()), book_added(&b))
            .await
            .unwrap();

        let first = BorrowRecord::open("u-1", &b.id, 7);
        let second = BorrowRecord::open("u-2", &b.id, 7);
        assert_eq!(
            store.conditional_borrow(&first).await.unwrap(),
            DecrementOutcome::Ok
        );
        assert_eq!(
            store.conditional_borrow(&second).await.unwrap(),
            DecrementOutcome::NoCopies
        );

        // The denied borrow left no trace
        let proj = store.read_projection(&b.id).await.unwrap().unwrap();
        assert_eq!(proj.borrows.len(), 1);
        assert_eq!(proj.borrows[0].id, first.id);
    }

    #[tokio::test]
    async fn test_concurrent_grants_never_oversell() {
        let store = Arc::new(store());
        let b = book(3);
        store
            .write_atomic(DomainChange::BookPut(b.clone()), book_added(&b))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            let borrow = BorrowRecord::open(format!("u-{i}"), &b.id, 7);
            handles.push(tokio::spawn(async move {
                store.conditional_borrow(&borrow).await.unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() == DecrementOutcome::Ok {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);

        let proj = store.read_projection(&b.id).await.unwrap().unwrap();
        assert_eq!(proj.borrows.len(), 3);
        assert_eq!(proj.availability.available_copies, 0);
    }

    #[tokio::test]
    async fn test_write_landing_during_in_flight_grant_does_not_resurrect_copy() {
        // Two grants take both copies; the first borrower's write_atomic then
        // lands while the second grant has not written its event yet. The
        // recompute on that write must not hand the second copy back out.
        let store = store();
        let b = book(2);
        store
            .write_atomic(DomainChange::BookPut(b.clone()), book_added(&b))
            .await
            .unwrap();

        let first = BorrowRecord::open("u-1", &b.id, 7);
        let second = BorrowRecord::open("u-2", &b.id, 3);
        assert_eq!(
            store.conditional_borrow(&first).await.unwrap(),
            DecrementOutcome::Ok
        );
        assert_eq!(
            store.conditional_borrow(&second).await.unwrap(),
            DecrementOutcome::Ok
        );

        let event = ChangeEvent::new(
            &b.id,
            EventKind::Borrowed,
            2,
            json!({
                "borrow_id": first.id.clone(),
                "user_id": first.user_id.clone(),
                "borrowed_at": first.borrowed_at,
                "due_at": first.due_at,
            }),
        );
        store
            .write_atomic(DomainChange::BorrowOpen(first), event)
            .await
            .unwrap();

        let proj = store.read_projection(&b.id).await.unwrap().unwrap();
        assert_eq!(proj.availability.available_copies, 0);

        let third = BorrowRecord::open("u-3", &b.id, 7);
        assert_eq!(
            store.conditional_borrow(&third).await.unwrap(),
            DecrementOutcome::NoCopies
        );

        let proj = store.read_projection(&b.id).await.unwrap().unwrap();
        assert_eq!(proj.active_borrow_count(), 2);
    }

    #[tokio::test]
    async fn test_upsert_borrowed_on_tombstoned_book_is_noop() {
        let store = store();
        let b = book(2);
        store.upsert_projection(&book_added(&b)).await.unwrap();
        store
            .upsert_projection(&ChangeEvent::new(&b.id, EventKind::BookRemoved, 2, json!({})))
            .await
            .unwrap();

        store
            .upsert_projection(&ChangeEvent::new(
                &b.id,
                EventKind::Borrowed,
                3,
                json!({"borrow_id": "br-1", "user_id": "u-1", "borrowed_at": 1, "due_at": 2}),
            ))
            .await
            .unwrap();

        let proj = store.read_projection(&b.id).await.unwrap().unwrap();
        assert!(proj.tombstoned);
        assert!(proj.borrows.is_empty());
        assert_eq!(proj.last_applied, 3);
    }

    #[tokio::test]
    async fn test_upsert_duplicate_borrow_id_is_idempotent() {
        let store = store();
        let b = book(2);
        store.upsert_projection(&book_added(&b)).await.unwrap();

        let borrowed = ChangeEvent::new(
            &b.id,
            EventKind::Borrowed,
            2,
            json!({"borrow_id": "br-1", "user_id": "u-1", "borrowed_at": 1, "due_at": 2}),
        );
        store.upsert_projection(&borrowed).await.unwrap();
        store.upsert_projection(&borrowed).await.unwrap();

        let proj = store.read_projection(&b.id).await.unwrap().unwrap();
        assert_eq!(proj.borrows.len(), 1);
        assert_eq!(proj.availability.available_copies, 1);
    }

    #[tokio::test]
    async fn test_tombstone_before_metadata_leaves_guard_stub() {
        let store = store();
        store
            .upsert_projection(&ChangeEvent::new("b-x", EventKind::BookRemoved, 5, json!({})))
            .await
            .unwrap();

        let proj = store.read_projection("b-x").await.unwrap().unwrap();
        assert!(proj.tombstoned);
        assert!(!proj.is_listed());
        assert_eq!(store.last_applied_version("b-x").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_reserve_version_monotonic_past_tombstone() {
        let store = store();
        let b = book(1);
        store
            .write_atomic(DomainChange::BookPut(b.clone()), book_added(&b))
            .await
            .unwrap();
        assert_eq!(store.reserve_version(&b.id).await.unwrap(), 2);
        assert_eq!(store.reserve_version(&b.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_page_pagination() {
        let store = store();
        for _ in 0..5 {
            let b = book(1);
            store
                .write_atomic(DomainChange::BookPut(b.clone()), book_added(&b))
                .await
                .unwrap();
        }

        let first = store.snapshot_page(0, 3).await.unwrap();
        let second = store.snapshot_page(3, 3).await.unwrap();
        let past_end = store.snapshot_page(10, 3).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kind_advances_version_only() {
        let store = store();
        let b = book(1);
        store.upsert_projection(&book_added(&b)).await.unwrap();

        let wire = json!({
            "event_id": "e-x",
            "book_id": b.id,
            "kind": "book_digitized",
            "version": 2,
            "payload": {},
            "produced_at": 0,
        });
        let event: ChangeEvent = serde_json::from_value(wire).unwrap();
        store.upsert_projection(&event).await.unwrap();

        let proj = store.read_projection(&b.id).await.unwrap().unwrap();
        assert_eq!(proj.last_applied, 2);
        assert_eq!(proj.availability.available_copies, 1);
    }
}
