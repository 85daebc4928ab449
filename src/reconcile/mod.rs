//! Snapshot reconciliation and backfill.
//!
//! Events bound drift only while none are lost; reconciliation bounds it
//! unconditionally. On a configurable interval each side pulls a paginated
//! snapshot summary from the side that owns the facts it projects (the admin
//! store owns book metadata, total copies and tombstones; the user store owns
//! borrow activity), compares checksums, and repairs divergent books by
//! injecting synthetic correction events into its own projection. Corrections
//! are minted at a version no lower than anything either side has seen, so
//! the gap gate never treats them as stale, and the book's audit version is
//! advanced past whatever events were missed.
//!
//! The same per-book repair is what a gap escalation from the projector runs,
//! just without waiting for the next interval.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::book::{BookProjection, BorrowRecord};
use crate::event::{
    now_millis, AvailabilityOverride, BookPayload, BorrowPayload, ChangeEvent, EventKind,
    ReturnPayload,
};
use crate::store::{LocalStore, SnapshotEntry, StoreError};

/// Which store a snapshot source is, and therefore which facts it is
/// authoritative for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    /// Authoritative for book identity, metadata, total copies, tombstones.
    Admin,
    /// Authoritative for borrow activity.
    User,
}

/// Read-only snapshot interface each side exposes to the other. In-process
/// deployments point it straight at the counterpart store; remote ones put
/// the paginated snapshot endpoint behind it.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// One page of the summary, ordered by `book_id`, empty past the end.
    async fn snapshot_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SnapshotEntry>, StoreError>;

    /// Full projection of a single book, for targeted repair.
    async fn fetch_book(&self, book_id: &str) -> Result<Option<BookProjection>, StoreError>;
}

#[async_trait]
impl<T: LocalStore + ?Sized> SnapshotSource for T {
    async fn snapshot_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SnapshotEntry>, StoreError> {
        LocalStore::snapshot_page(self, offset, limit).await
    }

    async fn fetch_book(&self, book_id: &str) -> Result<Option<BookProjection>, StoreError> {
        self.read_projection(book_id).await
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub corrected: usize,
    /// Books past the persistent-divergence threshold this cycle.
    pub alerts: usize,
    /// Checksum fast path: both summaries identical, nothing compared.
    pub in_sync: bool,
}

pub struct Reconciler {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn SnapshotSource>,
    remote_role: StoreRole,
    page_size: usize,
    /// Consecutive divergent cycles before a book is alerted and its
    /// availability force-overridden from the authority.
    alert_cycles: u32,
    divergent: DashMap<String, u32>,
}

impl Reconciler {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn SnapshotSource>,
        remote_role: StoreRole,
        page_size: usize,
        alert_cycles: u32,
    ) -> Self {
        Self {
            local,
            remote,
            remote_role,
            page_size,
            alert_cycles: alert_cycles.max(1),
            divergent: DashMap::new(),
        }
    }

    async fn collect<S: SnapshotSource + ?Sized>(
        source: &S,
        page_size: usize,
    ) -> Result<Vec<SnapshotEntry>, StoreError> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = source.snapshot_page(offset, page_size).await?;
            let n = page.len();
            all.extend(page);
            if n < page_size {
                return Ok(all);
            }
            offset += n;
        }
    }

    /// Checksum over the role-relevant summary fields.
    fn digest(entries: &[SnapshotEntry], role: StoreRole) -> String {
        let mut hasher = Sha256::new();
        for e in entries {
            hasher.update(e.book_id.as_bytes());
            hasher.update(e.version.to_le_bytes());
            match role {
                StoreRole::Admin => {
                    hasher.update(e.total_copies.to_le_bytes());
                    hasher.update([u8::from(e.tombstoned)]);
                }
                StoreRole::User => {
                    hasher.update(e.active_borrows.to_le_bytes());
                }
            }
        }
        hex::encode(hasher.finalize())
    }

    fn diverged(&self, local: Option<&SnapshotEntry>, remote: Option<&SnapshotEntry>) -> bool {
        match self.remote_role {
            StoreRole::Admin => match (local, remote) {
                (None, Some(_)) => true,
                // A local tombstone is never resurrected, even if the
                // authority still lists the book; the authority's own removal
                // catches up on its side.
                (Some(l), _) if l.tombstoned => false,
                (Some(_), None) => true,
                (Some(l), Some(r)) => {
                    r.tombstoned || r.total_copies != l.total_copies || r.version > l.version
                }
                (None, None) => false,
            },
            StoreRole::User => match (local, remote) {
                // Metadata flows the other way; nothing to mirror onto yet.
                (None, _) => false,
                (Some(l), _) if l.tombstoned => false,
                (Some(l), None) => l.active_borrows > 0,
                (Some(l), Some(r)) => r.active_borrows != l.active_borrows,
            },
        }
    }

    /// Full-catalog pass: pull both summaries, fast-path on matching
    /// checksums, otherwise repair every divergent book and track which ones
    /// keep coming back.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let remote = Self::collect(&*self.remote, self.page_size).await?;
        let local = Self::collect(&*self.local, self.page_size).await?;
        crate::metrics::record_reconcile_cycle();

        if Self::digest(&remote, self.remote_role) == Self::digest(&local, self.remote_role) {
            self.divergent.clear();
            debug!(books = local.len(), "Reconciliation checksums match");
            return Ok(CycleReport {
                checked: local.len(),
                corrected: 0,
                alerts: 0,
                in_sync: true,
            });
        }

        let remote_map: HashMap<&str, &SnapshotEntry> =
            remote.iter().map(|e| (e.book_id.as_str(), e)).collect();
        let local_map: HashMap<&str, &SnapshotEntry> =
            local.iter().map(|e| (e.book_id.as_str(), e)).collect();
        let ids: BTreeSet<&str> = remote_map.keys().chain(local_map.keys()).copied().collect();

        let mut corrected = 0;
        let mut alerts = 0;
        for id in &ids {
            let l = local_map.get(id).copied();
            let r = remote_map.get(id).copied();
            if !self.diverged(l, r) {
                self.divergent.remove(*id);
                continue;
            }

            let cycles = {
                let mut count = self.divergent.entry((*id).to_string()).or_insert(0);
                *count += 1;
                *count
            };
            let force = cycles >= self.alert_cycles;
            if force {
                alerts += 1;
                error!(
                    book_id = %id,
                    cycles,
                    "Persistent divergence, forcing authoritative state"
                );
                crate::metrics::record_divergence_alert();
            }

            if self.repair_book(id, force).await? {
                corrected += 1;
            }
        }

        info!(
            checked = ids.len(),
            corrected, alerts, "Reconciliation cycle complete"
        );
        Ok(CycleReport {
            checked: ids.len(),
            corrected,
            alerts,
            in_sync: false,
        })
    }

    /// Targeted repair for one book, used by gap escalation. Fetches the
    /// authority's current state and corrects the local projection against
    /// it, advancing the audit version past the missed events.
    pub async fn reconcile_book(&self, book_id: &str) -> Result<bool, StoreError> {
        self.repair_book(book_id, false).await
    }

    async fn repair_book(&self, book_id: &str, force: bool) -> Result<bool, StoreError> {
        match self.remote_role {
            StoreRole::Admin => self.repair_metadata(book_id, force).await,
            StoreRole::User => self.repair_borrows(book_id).await,
        }
    }

    async fn repair_metadata(&self, book_id: &str, force: bool) -> Result<bool, StoreError> {
        let remote = self.remote.fetch_book(book_id).await?;
        let local = self.local.read_projection(book_id).await?;

        if local.as_ref().is_some_and(|l| l.tombstoned) {
            return Ok(false);
        }
        let local_last = local.as_ref().map(|l| l.last_applied).unwrap_or(0);

        let Some(remote) = remote else {
            // The authority has never heard of this book: tombstone the
            // phantom row.
            if local.is_none() {
                return Ok(false);
            }
            let event = ChangeEvent::new(book_id, EventKind::BookRemoved, local_last, json!({}));
            self.apply_correction(event).await?;
            return Ok(true);
        };

        let version = local_last.max(remote.last_applied);
        if remote.tombstoned {
            let event = ChangeEvent::new(book_id, EventKind::BookRemoved, version, json!({}));
            self.apply_correction(event).await?;
            return Ok(true);
        }

        let matches = local.as_ref().is_some_and(|l| {
            l.book.title == remote.book.title
                && l.book.author == remote.book.author
                && l.book.publisher == remote.book.publisher
                && l.book.category == remote.book.category
                && l.book.total_copies == remote.book.total_copies
                && l.last_applied >= remote.last_applied
        });
        if matches && !force {
            return Ok(false);
        }

        let kind = if local.is_some() {
            EventKind::BookUpdated
        } else {
            EventKind::BookAdded
        };
        let payload = BookPayload {
            title: remote.book.title.clone(),
            author: remote.book.author.clone(),
            publisher: remote.book.publisher.clone(),
            category: remote.book.category.clone(),
            total_copies: remote.book.total_copies,
            // Only a persistent mismatch overrides availability: locally
            // derived counts are normally recomputed from the local borrow
            // mirror after the metadata lands.
            availability_override: force.then(|| AvailabilityOverride {
                available_copies: remote.availability.available_copies,
                unavailable_until: remote.availability.unavailable_until,
            }),
        };
        let payload = serde_json::to_value(&payload).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.apply_correction(ChangeEvent::new(book_id, kind, version, payload)).await?;
        Ok(true)
    }

    async fn repair_borrows(&self, book_id: &str) -> Result<bool, StoreError> {
        let Some(local) = self.local.read_projection(book_id).await? else {
            return Ok(false);
        };
        if local.tombstoned {
            return Ok(false);
        }

        let remote = self.remote.fetch_book(book_id).await?;
        let remote_version = remote.as_ref().map(|r| r.last_applied).unwrap_or(0);
        let version = local.last_applied.max(remote_version);
        let remote_borrows: Vec<BorrowRecord> = remote.map(|r| r.borrows).unwrap_or_default();
        let mut emitted = false;

        // Borrows the authority holds active that the mirror missed.
        for rb in remote_borrows.iter().filter(|b| b.is_active()) {
            if !local.borrows.iter().any(|lb| lb.id == rb.id) {
                let payload = BorrowPayload {
                    borrow_id: rb.id.clone(),
                    user_id: rb.user_id.clone(),
                    borrowed_at: rb.borrowed_at,
                    due_at: rb.due_at,
                };
                let payload =
                    serde_json::to_value(&payload).map_err(|e| StoreError::Backend(e.to_string()))?;
                self.apply_correction(ChangeEvent::new(book_id, EventKind::Borrowed, version, payload))
                    .await?;
                emitted = true;
            }
        }

        // Mirror borrows the authority shows returned (or never had).
        for lb in local.active_borrows() {
            let remote_state = remote_borrows.iter().find(|rb| rb.id == lb.id);
            if remote_state.is_some_and(|rb| rb.is_active()) {
                continue;
            }
            let payload = ReturnPayload {
                borrow_id: lb.id.clone(),
                returned_at: remote_state
                    .and_then(|rb| rb.returned_at)
                    .unwrap_or_else(now_millis),
            };
            let payload =
                serde_json::to_value(&payload).map_err(|e| StoreError::Backend(e.to_string()))?;
            self.apply_correction(ChangeEvent::new(book_id, EventKind::Returned, version, payload))
                .await?;
            emitted = true;
        }

        // Borrow sets already match but the audit version is stuck behind the
        // authority (a gap whose events the snapshot already reflects):
        // advance it with a metadata refresh so the next live event clears
        // the gap gate.
        if !emitted && local.last_applied < remote_version {
            let payload = BookPayload {
                title: local.book.title.clone(),
                author: local.book.author.clone(),
                publisher: local.book.publisher.clone(),
                category: local.book.category.clone(),
                total_copies: local.book.total_copies,
                availability_override: None,
            };
            let payload =
                serde_json::to_value(&payload).map_err(|e| StoreError::Backend(e.to_string()))?;
            self.apply_correction(ChangeEvent::new(
                book_id,
                EventKind::BookUpdated,
                remote_version,
                payload,
            ))
            .await?;
            emitted = true;
        }

        Ok(emitted)
    }

    /// Corrections are injected straight into the local projection; they
    /// never go through the outbox, since the counterpart already owns the
    /// facts being copied.
    async fn apply_correction(&self, event: ChangeEvent) -> Result<(), StoreError> {
        debug!(
            book_id = %event.book_id,
            kind = event.kind.as_str(),
            version = event.version,
            "Applying correction"
        );
        crate::metrics::record_correction_emitted(event.kind.as_str());
        self.local.upsert_projection(&event).await
    }
}
