// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the catalog sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `catalog_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `kind`: book_added, book_updated, book_removed, borrowed, returned
//! - `operation`: add_book, update_book, remove_book, borrow, return

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// OUTBOX / PUBLISHER
// ═══════════════════════════════════════════════════════════════════════════

/// Record an event published to the channel (broker-acked)
pub fn record_event_published(kind: &'static str) {
    counter!(
        "catalog_sync_events_published_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a publish attempt rejected or timed out by the broker
pub fn record_publish_failure() {
    counter!("catalog_sync_publish_failures_total").increment(1);
}

/// Set the current undelivered outbox backlog
pub fn set_outbox_pending(count: usize) {
    gauge!("catalog_sync_outbox_pending").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// PROJECTOR - Version gate outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Record an event applied to the local projection
pub fn record_event_applied(kind: &'static str) {
    counter!(
        "catalog_sync_events_applied_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a duplicate/stale event dropped at the version gate
pub fn record_duplicate_dropped() {
    counter!("catalog_sync_duplicates_dropped_total").increment(1);
}

/// Record an event parked in the reorder buffer on a version gap
pub fn record_event_buffered() {
    counter!("catalog_sync_events_buffered_total").increment(1);
}

/// Record a gap that did not close and escalated to reconciliation
pub fn record_gap_escalation() {
    counter!("catalog_sync_gap_escalations_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RECONCILIATION
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed reconciliation cycle
pub fn record_reconcile_cycle() {
    counter!("catalog_sync_reconcile_cycles_total").increment(1);
}

/// Record a synthetic correction event applied to the projection
pub fn record_correction_emitted(kind: &'static str) {
    counter!(
        "catalog_sync_corrections_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a book diverged beyond the alert threshold
pub fn record_divergence_alert() {
    counter!("catalog_sync_divergence_alerts_total").increment(1);
}

/// Set the number of books in the local projection
pub fn set_books_tracked(count: usize) {
    gauge!("catalog_sync_books_tracked").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BORROW PATH
// ═══════════════════════════════════════════════════════════════════════════

/// Record a borrow granted by the store's conditional grant
pub fn record_borrow_granted() {
    counter!("catalog_sync_borrows_total", "outcome" => "granted").increment(1);
}

/// Record a borrow denied with no copies available
pub fn record_borrow_denied() {
    counter!("catalog_sync_borrows_total", "outcome" => "denied").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record an engine state transition
pub fn set_engine_state(state: &str) {
    counter!(
        "catalog_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &'static str, duration: Duration) {
    histogram!(
        "catalog_sync_operation_seconds",
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($op:expr) => {
        $crate::metrics::LatencyTimer::new($op)
    };
}
