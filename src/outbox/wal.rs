//! SQLite-backed outbox for crash-safe delivery.
//!
//! Events land here inside the mutation's commit boundary and survive process
//! restarts: on open, rows still marked undelivered are counted and the first
//! drain resumes them. This is NOT an event archive - delivered rows are
//! purged once the backlog clears.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::OutboxStore;
use crate::event::ChangeEvent;
use crate::resilience::retry::{retry, RetryConfig};
use crate::store::StoreError;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqliteOutbox {
    pool: AnyPool,
    path: String,
    pending_count: AtomicU64,
    total_appended: AtomicU64,
    total_delivered: AtomicU64,
}

impl SqliteOutbox {
    /// Open (or create) the outbox at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        install_drivers();

        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);

        info!(path = %path_str, "Opening outbox");

        let pool = retry("outbox_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        let outbox = Self {
            pool,
            path: path_str,
            pending_count: AtomicU64::new(0),
            total_appended: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
        };

        outbox.enable_wal_mode().await?;
        outbox.init_schema().await?;

        // Resume undelivered rows from a previous run
        let pending = outbox.count_undelivered().await?;
        if pending > 0 {
            warn!(pending, "Outbox has undelivered events from previous run, will resume drain");
        }
        outbox.pending_count.store(pending, Ordering::Release);

        Ok(outbox)
    }

    /// Enable WAL journal mode: a publish retry loop reads the outbox while
    /// the API path appends to it.
    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        retry("outbox_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS outbox_events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT NOT NULL UNIQUE,
                    book_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    produced_at INTEGER NOT NULL,
                    delivered INTEGER NOT NULL DEFAULT 0
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_undelivered
             ON outbox_events (delivered, book_id, version)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn count_undelivered(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM outbox_events WHERE delivered = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let n: i64 = row.try_get("n").unwrap_or(0);
        Ok(n as u64)
    }

    /// Delete delivered rows to keep the file small. Call after the backlog
    /// clears; losing delivered rows is always safe.
    pub async fn purge_delivered(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE delivered = 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, path = %self.path, "Purged delivered outbox rows");
        }
        Ok(purged)
    }

    /// Totals since startup: `(appended, delivered)`.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_appended.load(Ordering::Relaxed),
            self.total_delivered.load(Ordering::Relaxed),
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl OutboxStore for SqliteOutbox {
    async fn append(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        let body = event
            .encode()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let body = String::from_utf8(body).map_err(|e| StoreError::Backend(e.to_string()))?;

        // INSERT OR IGNORE keeps append idempotent on event_id, so a retried
        // write_atomic never double-queues.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO outbox_events (event_id, book_id, version, body, produced_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(&event.book_id)
        .bind(event.version as i64)
        .bind(&body)
        .bind(event.produced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() > 0 {
            self.pending_count.fetch_add(1, Ordering::Release);
            self.total_appended.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.event_id, book_id = %event.book_id, "Event appended to outbox");
        }

        Ok(())
    }

    async fn undelivered(&self, limit: usize) -> Result<Vec<ChangeEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM outbox_events WHERE delivered = 0
             ORDER BY book_id, version LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            // TEXT reads back as String on SQLite, bytes on other drivers
            let body: String = row
                .try_get::<String, _>("body")
                .ok()
                .or_else(|| {
                    row.try_get::<Vec<u8>, _>("body")
                        .ok()
                        .and_then(|bytes| String::from_utf8(bytes).ok())
                })
                .ok_or_else(|| StoreError::Backend("No body in outbox row".to_string()))?;

            match ChangeEvent::decode(body.as_bytes()) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // A row we cannot decode would wedge the drain forever;
                    // skip it and let reconciliation repair the gap.
                    warn!(error = %e, "Undecodable outbox row, skipping");
                }
            }
        }

        Ok(events)
    }

    async fn mark_delivered(&self, event_ids: &[String]) -> Result<(), StoreError> {
        if event_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut marked = 0u64;
        for event_id in event_ids {
            let result =
                sqlx::query("UPDATE outbox_events SET delivered = 1 WHERE event_id = ? AND delivered = 0")
                    .bind(event_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            marked += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        self.pending_count
            .fetch_sub(marked.min(self.pending_count.load(Ordering::Acquire)), Ordering::Release);
        self.total_delivered.fetch_add(marked, Ordering::Relaxed);

        Ok(())
    }

    async fn pending(&self) -> Result<u64, StoreError> {
        Ok(self.pending_count.load(Ordering::Acquire))
    }
}
