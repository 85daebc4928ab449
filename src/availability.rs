// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-book availability state machine.
//!
//! A book is `Available` while `available_copies > 0` and `Exhausted` once the
//! count reaches zero, at which point `unavailable_until` surfaces the
//! earliest `due_at` among active borrows. The same transition logic runs on
//! the owning store (driven by local mutation) and the projecting store
//! (driven by applied events); both must converge to the same
//! `(available_copies, unavailable_until)` once all events are applied;
//! reconciliation verifies exactly this.
//!
//! The contended transition (grant that takes the count to zero) is not
//! handled here: the store layer's atomic borrow grant is the serialization
//! point. This module only recomputes the derived record from the borrow set.

use std::fmt;

use crate::book::{AvailabilityRecord, BorrowRecord};

/// Observable availability state of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    /// At least one copy on the shelf.
    Available { copies: u32 },
    /// All copies out. `unavailable_until` is the earliest due date among
    /// active borrows, or `None` when the book simply has zero total copies.
    Exhausted { unavailable_until: Option<i64> },
}

impl AvailabilityState {
    #[must_use]
    pub fn of(record: &AvailabilityRecord) -> Self {
        if record.available_copies > 0 {
            AvailabilityState::Available {
                copies: record.available_copies,
            }
        } else {
            AvailabilityState::Exhausted {
                unavailable_until: record.unavailable_until,
            }
        }
    }
}

impl fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvailabilityState::Available { copies } => write!(f, "available({copies})"),
            AvailabilityState::Exhausted { .. } => write!(f, "exhausted"),
        }
    }
}

/// Earliest due date among active borrows.
#[must_use]
pub fn min_due(borrows: &[BorrowRecord]) -> Option<i64> {
    borrows
        .iter()
        .filter(|b| b.is_active())
        .map(|b| b.due_at)
        .min()
}

/// Recompute the derived availability record from the borrow set.
///
/// `available_copies = total_copies - active borrows` (clamped at zero, since
/// a projection can transiently hold more borrow events than the metadata it
/// has seen allows). `unavailable_until` is set only in the exhausted state
/// with at least one active borrow; in `Available` it is always cleared.
pub fn recompute(record: &mut AvailabilityRecord, total_copies: u32, borrows: &[BorrowRecord]) {
    let active = borrows.iter().filter(|b| b.is_active()).count() as u32;
    record.available_copies = total_copies.saturating_sub(active);
    record.unavailable_until = if record.available_copies == 0 && active > 0 {
        min_due(borrows)
    } else {
        None
    };
}
