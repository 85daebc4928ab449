//! # Catalog Sync
//!
//! An event-driven synchronization and borrow-availability engine for a
//! library catalog split across two independently owned stores.
//!
//! ## Architecture
//!
//! The admin store owns book metadata and lifecycle; the user store owns
//! borrowing. Neither calls the other synchronously: every cross-store fact
//! travels as a versioned event, and periodic reconciliation bounds the drift
//! that events alone cannot:
//!
//! ```text
//! ┌────────────────────────────┐        ┌────────────────────────────┐
//! │        Admin engine        │        │        User engine         │
//! │  add / update / remove     │        │  borrow / return           │
//! │                            │        │                            │
//! │  domain write + outbox     │        │  atomic borrow grant       │
//! │  event in one atomic unit  │        │  then write + outbox       │
//! └─────────────┬──────────────┘        └─────────────┬──────────────┘
//!               │ drain (at-least-once)               │ drain
//!               ▼                                     ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Durable Channel                          │
//! │  • ordered per routing key (book id), durable until consumed    │
//! │  • fans out to both consumer groups                             │
//! └─────────────┬───────────────────────────────────┬───────────────┘
//!               ▼                                   ▼
//! ┌────────────────────────────┐        ┌────────────────────────────┐
//! │   Idempotent projector     │        │   Idempotent projector     │
//! │  version gate + reorder    │        │  version gate + reorder    │
//! │  buffer + gap escalation   │        │  buffer + gap escalation   │
//! └─────────────┬──────────────┘        └─────────────┬──────────────┘
//!               │                                     │
//!               ▼            snapshot pulls           ▼
//! ┌────────────────────────────┐◄──────►┌────────────────────────────┐
//! │   Projection (DashMap)     │        │   Projection (DashMap)     │
//! │  books, borrows, derived   │        │  books, borrows, derived   │
//! │  availability state        │        │  availability state        │
//! └────────────────────────────┘        └────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use catalog_sync::{
//!     CatalogEngine, CatalogSyncConfig, InMemoryChannel, MemoryOutbox, MemoryStore, NewBook,
//!     StoreRole,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let channel = Arc::new(InMemoryChannel::new(&["admin", "user"]));
//!     let admin_outbox = Arc::new(MemoryOutbox::new());
//!     let user_outbox = Arc::new(MemoryOutbox::new());
//!     let admin_store = Arc::new(MemoryStore::new(admin_outbox.clone()));
//!     let user_store = Arc::new(MemoryStore::new(user_outbox.clone()));
//!
//!     let admin = CatalogEngine::new(
//!         "admin",
//!         CatalogSyncConfig::default(),
//!         admin_store.clone(),
//!         admin_outbox,
//!         channel.clone(),
//!         user_store.clone(),
//!         StoreRole::User,
//!     );
//!     let user = CatalogEngine::new(
//!         "user",
//!         CatalogSyncConfig::default(),
//!         user_store,
//!         user_outbox,
//!         channel,
//!         admin_store,
//!         StoreRole::Admin,
//!     );
//!
//!     let book = admin
//!         .add_book(NewBook {
//!             title: "Dune".into(),
//!             author: "Frank Herbert".into(),
//!             publisher: "Chilton".into(),
//!             category: "sf".into(),
//!             total_copies: 2,
//!         })
//!         .await
//!         .expect("add failed");
//!
//!     // Deterministic pumping; production runs `engine.run()` instead.
//!     admin.drain_outbox().await.expect("drain failed");
//!     user.process_pending().await.expect("apply failed");
//!
//!     let borrow = user.borrow(&book.id, "user-1", 7).await.expect("borrow failed");
//!     println!("due back at {}", borrow.due_at);
//! }
//! ```
//!
//! ## Guarantees
//!
//! - **Atomicity at the source**: a mutation's domain write and its outbox
//!   event commit together; delivery is at-least-once from there.
//! - **Per-book ordering**: events for one book apply in version order
//!   end-to-end; different books interleave freely and share no locks.
//! - **Idempotency**: duplicates and replays drop at the version gate.
//! - **No oversell**: the store grants a borrow and decrements availability
//!   in one atomic step, the single contended resource per book; concurrent
//!   borrows can never take more copies than exist.
//! - **Bounded drift**: reconciliation pulls authoritative snapshots,
//!   repairs divergence with synthetic corrections, and alerts when a book
//!   keeps diverging.
//!
//! ## Modules
//!
//! - [`engine`]: The [`CatalogEngine`] orchestrating one side of the catalog
//! - [`event`]: Event envelope and wire codec
//! - [`book`]: Domain model (books, borrows, projections)
//! - [`availability`]: The per-book availability state machine
//! - [`store`]: Local store contract and in-memory implementation
//! - [`outbox`]: Transactional outbox and the background publisher
//! - [`channel`]: Durable channel contract and in-process broker
//! - [`projector`]: Idempotent consumer with reorder buffer
//! - [`reconcile`]: Snapshot reconciliation and backfill
//! - [`resilience`]: Retry with exponential backoff

pub mod availability;
pub mod book;
pub mod channel;
pub mod config;
pub mod engine;
pub mod event;
pub mod metrics;
pub mod outbox;
pub mod projector;
pub mod reconcile;
pub mod resilience;
pub mod store;

pub use availability::AvailabilityState;
pub use book::{AvailabilityRecord, Book, BookPatch, BookProjection, BorrowRecord, NewBook};
pub use channel::{AckHandle, ChannelError, Delivery, DurableChannel, InMemoryChannel, Subscription};
pub use config::CatalogSyncConfig;
pub use engine::{CatalogEngine, EngineError, EngineState};
pub use event::{
    AvailabilityOverride, BookPayload, BorrowPayload, ChangeEvent, CodecError, EventKind,
    ReturnPayload,
};
pub use metrics::LatencyTimer;
pub use outbox::{MemoryOutbox, OutboxPublisher, OutboxStore, SqliteOutbox};
pub use projector::{ApplyOutcome, Projector};
pub use reconcile::{CycleReport, Reconciler, SnapshotSource, StoreRole};
pub use resilience::retry::RetryConfig;
pub use store::{DecrementOutcome, LocalStore, MemoryStore, SnapshotEntry, StoreError};
