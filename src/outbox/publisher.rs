//! Background drain loop from the outbox to the channel.
//!
//! Undelivered events are read in `(book_id, version)` order, published one
//! at a time, and marked delivered only after the broker ack. A publish
//! failure stops the batch (publishing a later version of the same book past
//! a failed earlier one would break per-book ordering); the failed event
//! stays undelivered and the next attempt retries it with exponential
//! backoff. Nothing here ever surfaces to the caller of the original
//! mutation - its domain write already committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::OutboxStore;
use crate::channel::DurableChannel;
use crate::resilience::retry::RetryConfig;
use crate::store::StoreError;

pub struct OutboxPublisher {
    outbox: Arc<dyn OutboxStore>,
    channel: Arc<dyn DurableChannel>,
    batch_size: usize,
    backoff: RetryConfig,
    draining: AtomicBool,
}

/// Result of a single drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub published: usize,
    /// Whether the pass stopped early on a publish failure.
    pub stalled: bool,
}

impl OutboxPublisher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        channel: Arc<dyn DurableChannel>,
        batch_size: usize,
    ) -> Self {
        Self {
            outbox,
            channel,
            batch_size,
            backoff: RetryConfig::daemon(),
            draining: AtomicBool::new(false),
        }
    }

    /// Drain one batch. Safe to call from a timer tick; overlapping calls
    /// are coalesced.
    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Ok(DrainReport {
                published: 0,
                stalled: false,
            });
        }
        let _guard = DrainGuard(&self.draining);

        let batch = self.outbox.undelivered(self.batch_size).await?;
        if batch.is_empty() {
            return Ok(DrainReport {
                published: 0,
                stalled: false,
            });
        }

        let mut delivered_ids = Vec::with_capacity(batch.len());
        let mut stalled = false;

        for event in &batch {
            match self.channel.publish(&event.book_id, event).await {
                Ok(()) => {
                    delivered_ids.push(event.event_id.clone());
                    crate::metrics::record_event_published(event.kind.as_str());
                }
                Err(e) => {
                    // Transient delivery failure: leave this event (and the
                    // rest of the batch) undelivered and retry later.
                    warn!(
                        event_id = %event.event_id,
                        book_id = %event.book_id,
                        error = %e,
                        "Publish failed, event stays in outbox"
                    );
                    crate::metrics::record_publish_failure();
                    stalled = true;
                    break;
                }
            }
        }

        let published = delivered_ids.len();
        if published > 0 {
            self.outbox.mark_delivered(&delivered_ids).await?;
            debug!(published, "Outbox drain batch complete");
        }

        crate::metrics::set_outbox_pending(self.outbox.pending().await? as usize);

        Ok(DrainReport { published, stalled })
    }

    /// Standalone drain loop with exponential backoff on broker failure.
    /// Stops when `shutdown` flips to `true`; in-flight state is durable, so
    /// a restart resumes from the undelivered set.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, drain_interval: Duration) {
        info!("Outbox publisher running");
        let mut delay = drain_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.drain_once().await {
                Ok(report) if report.stalled => {
                    delay = (delay.mul_f64(self.backoff.factor)).min(self.backoff.max_delay);
                    warn!(next_retry = ?delay, "Outbox drain stalled on broker failure");
                }
                Ok(_) => {
                    delay = drain_interval;
                }
                Err(e) => {
                    delay = (delay.mul_f64(self.backoff.factor)).min(self.backoff.max_delay);
                    warn!(error = %e, next_retry = ?delay, "Outbox drain failed");
                }
            }
        }

        // Final best-effort flush so a clean shutdown leaves nothing behind
        // that the broker would have taken.
        if let Ok(report) = self.drain_once().await {
            if report.published > 0 {
                info!(published = report.published, "Final outbox flush on shutdown");
            }
        }
        info!("Outbox publisher stopped");
    }
}

/// RAII guard to reset draining flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
