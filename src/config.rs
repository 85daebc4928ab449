//! Configuration for the catalog sync engine.
//!
//! # Example
//!
//! ```
//! use catalog_sync::CatalogSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CatalogSyncConfig::default();
//! assert_eq!(config.outbox_drain_batch_size, 100);
//!
//! // Full config
//! let config = CatalogSyncConfig {
//!     outbox_path: Some("catalog_outbox.db".into()),
//!     outbox_drain_interval_ms: 50,
//!     reconcile_interval_secs: 10,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for one engine (one side of the catalog).
///
/// All fields have sensible defaults. For production use, configure
/// `outbox_path` so pending deliveries survive restarts.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSyncConfig {
    /// SQLite file for the durable outbox, opened by [`crate::outbox::open`].
    /// `None` keeps the outbox in memory (tests, throwaway deployments):
    /// pending deliveries then die with the process and reconciliation
    /// carries the repair.
    #[serde(default)]
    pub outbox_path: Option<String>,

    /// Max events published per outbox drain pass
    #[serde(default = "default_outbox_drain_batch_size")]
    pub outbox_drain_batch_size: usize,

    /// Outbox drain tick interval in milliseconds
    #[serde(default = "default_outbox_drain_interval_ms")]
    pub outbox_drain_interval_ms: u64,

    /// How long a version gap may sit in the reorder buffer before the book
    /// is escalated to targeted reconciliation, in milliseconds
    #[serde(default = "default_reorder_wait_ms")]
    pub reorder_wait_ms: u64,

    /// Per-book reorder buffer cap; overflowing it escalates immediately
    #[serde(default = "default_reorder_buffer_max")]
    pub reorder_buffer_max: usize,

    /// Full-snapshot reconciliation interval in seconds
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Consecutive divergent reconciliation cycles before a book is alerted
    /// and force-overridden from the authority
    #[serde(default = "default_divergence_alert_cycles")]
    pub divergence_alert_cycles: u32,

    /// Page size for snapshot fetches during reconciliation
    #[serde(default = "default_snapshot_page_size")]
    pub snapshot_page_size: usize,
}

fn default_outbox_drain_batch_size() -> usize { 100 }
fn default_outbox_drain_interval_ms() -> u64 { 200 }
fn default_reorder_wait_ms() -> u64 { 5_000 }
fn default_reorder_buffer_max() -> usize { 1024 }
fn default_reconcile_interval_secs() -> u64 { 30 }
fn default_divergence_alert_cycles() -> u32 { 3 }
fn default_snapshot_page_size() -> usize { 500 }

impl Default for CatalogSyncConfig {
    fn default() -> Self {
        Self {
            outbox_path: None,
            outbox_drain_batch_size: default_outbox_drain_batch_size(),
            outbox_drain_interval_ms: default_outbox_drain_interval_ms(),
            reorder_wait_ms: default_reorder_wait_ms(),
            reorder_buffer_max: default_reorder_buffer_max(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            divergence_alert_cycles: default_divergence_alert_cycles(),
            snapshot_page_size: default_snapshot_page_size(),
        }
    }
}
