//! Catalog domain model.
//!
//! The admin store owns [`Book`] identity and metadata; the user store owns
//! [`BorrowRecord`] identity. [`AvailabilityRecord`] is derived on both sides
//! and must converge once all events are applied. [`BookProjection`] is the
//! per-book row a store materializes: metadata, tombstone flag, availability,
//! the borrow mirror, and the last-applied event version used for dedup.

use serde::{Deserialize, Serialize};

use crate::event::now_millis;

pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Book metadata, owned by the admin store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    /// Stable, globally unique id (uuid v4).
    pub id: String,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub category: String,
    pub total_copies: u32,
    /// Monotonic per book, used for ordering and last-writer-wins.
    pub version: u64,
}

/// Input for creating a book on the admin store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub category: String,
    pub total_copies: u32,
}

/// Partial metadata update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookPatch {
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub category: Option<String>,
    pub total_copies: Option<u32>,
}

impl Book {
    pub fn create(new: NewBook) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            author: new.author,
            publisher: new.publisher,
            category: new.category,
            total_copies: new.total_copies,
            version: 1,
        }
    }

    pub fn apply_patch(&mut self, patch: BookPatch) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(author) = patch.author {
            self.author = author;
        }
        if let Some(publisher) = patch.publisher {
            self.publisher = publisher;
        }
        if let Some(category) = patch.category {
            self.category = category;
        }
        if let Some(total) = patch.total_copies {
            self.total_copies = total;
        }
    }
}

/// A loan, owned by the user store. Immutable once `returned_at` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowRecord {
    pub id: String,
    pub user_id: String,
    pub book_id: String,
    /// Epoch millis.
    pub borrowed_at: i64,
    /// `borrowed_at + requested_days`.
    pub due_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<i64>,
}

impl BorrowRecord {
    pub fn open(user_id: impl Into<String>, book_id: impl Into<String>, days: u32) -> Self {
        let borrowed_at = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            book_id: book_id.into(),
            borrowed_at,
            due_at: borrowed_at + i64::from(days) * MILLIS_PER_DAY,
            returned_at: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.returned_at.is_none()
    }
}

/// Derived availability, maintained independently in both stores.
///
/// Invariant: `available_copies == total_copies - active borrows`, and
/// `unavailable_until` is `Some(min due_at)` exactly when `available_copies`
/// is zero with at least one active borrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub book_id: String,
    pub available_copies: u32,
    pub unavailable_until: Option<i64>,
}

impl AvailabilityRecord {
    pub fn full(book_id: impl Into<String>, total_copies: u32) -> Self {
        Self {
            book_id: book_id.into(),
            available_copies: total_copies,
            unavailable_until: None,
        }
    }
}

/// The materialized per-book row in a store's projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookProjection {
    pub book: Book,
    /// Removed books are tombstoned, not deleted, so late events referencing
    /// them are rejected instead of resurrecting the book.
    pub tombstoned: bool,
    pub availability: AvailabilityRecord,
    /// Mirror of borrow activity. Authoritative on the user store, read-only
    /// reporting data on the admin store.
    pub borrows: Vec<BorrowRecord>,
    /// Last event version applied to this row; the projector's dedup gate
    /// and the reconciler's staleness check both read it.
    pub last_applied: u64,
}

impl BookProjection {
    pub fn new(book: Book) -> Self {
        let availability = AvailabilityRecord::full(book.id.clone(), book.total_copies);
        let last_applied = book.version;
        Self {
            book,
            tombstoned: false,
            availability,
            borrows: Vec::new(),
            last_applied,
        }
    }

    pub fn active_borrows(&self) -> impl Iterator<Item = &BorrowRecord> {
        self.borrows.iter().filter(|b| b.is_active())
    }

    #[must_use]
    pub fn active_borrow_count(&self) -> u32 {
        self.active_borrows().count() as u32
    }

    /// Whether the book shows up in catalog listings at all.
    #[must_use]
    pub fn is_listed(&self) -> bool {
        !self.tombstoned
    }
}

/// A domain-state mutation written atomically with its outbox event.
#[derive(Debug, Clone)]
pub enum DomainChange {
    BookPut(Book),
    BookTombstone { book_id: String },
    BorrowOpen(BorrowRecord),
    BorrowClose {
        book_id: String,
        borrow_id: String,
        returned_at: i64,
    },
}

impl DomainChange {
    /// Routing key of the book this change touches.
    #[must_use]
    pub fn book_id(&self) -> &str {
        match self {
            DomainChange::BookPut(book) => &book.id,
            DomainChange::BookTombstone { book_id } => book_id,
            DomainChange::BorrowOpen(borrow) => &borrow.book_id,
            DomainChange::BorrowClose { book_id, .. } => book_id,
        }
    }
}
