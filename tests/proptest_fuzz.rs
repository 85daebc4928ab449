//! Property-based tests (fuzzing) for the event codec and the derived
//! availability state.
//!
//! Uses proptest to generate random/malformed inputs and verify the codec
//! never panics, only returns clean errors, and that the projection
//! invariants hold for arbitrary borrow sets.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

use catalog_sync::availability::{min_due, recompute};
use catalog_sync::{
    AvailabilityRecord, BorrowRecord, ChangeEvent, EventKind, LocalStore, MemoryOutbox,
    MemoryStore,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn event_kind_strategy() -> impl Strategy<Value = EventKind> {
    prop_oneof![
        Just(EventKind::BookAdded),
        Just(EventKind::BookUpdated),
        Just(EventKind::BookRemoved),
        Just(EventKind::Borrowed),
        Just(EventKind::Returned),
    ]
}

/// Generate arbitrary JSON values (including structures no payload schema
/// matches)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,  // depth
        64, // max nodes
        10, // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn valid_event_strategy() -> impl Strategy<Value = ChangeEvent> {
    (
        "[a-z]{1,8}(-[a-z0-9]{1,8}){0,3}", // book_id like "dune-1965"
        event_kind_strategy(),
        0u64..10_000,
        arbitrary_json_strategy(),
    )
        .prop_map(|(book_id, kind, version, payload)| {
            ChangeEvent::new(book_id, kind, version, payload)
        })
}

fn borrow_strategy() -> impl Strategy<Value = BorrowRecord> {
    (
        "br-[a-z0-9]{4}",
        0i64..1_000_000,
        1i64..1_000_000,
        prop::option::of(0i64..2_000_000),
    )
        .prop_map(|(id, borrowed_at, duration, returned_at)| BorrowRecord {
            id,
            user_id: "u-1".into(),
            book_id: "b-1".into(),
            borrowed_at,
            due_at: borrowed_at + duration,
            returned_at,
        })
}

// =============================================================================
// Codec fuzz tests
// =============================================================================

proptest! {
    /// Decoding should never panic on arbitrary bytes
    #[test]
    fn fuzz_decode_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..10000)) {
        // Should never panic, only return Err
        let _ = ChangeEvent::decode(&bytes);
    }

    /// Decoding should handle arbitrary JSON gracefully
    #[test]
    fn fuzz_decode_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let serialized = serde_json::to_vec(&json).unwrap();
        // Either parses (if the JSON happens to match the envelope shape) or
        // fails cleanly
        let _ = ChangeEvent::decode(&serialized);
    }

    /// Corrupted encoded events should fail gracefully
    #[test]
    fn fuzz_corrupted_event(
        event in valid_event_strategy(),
        corruption in prop::collection::vec(any::<u8>(), 1..50),
        position in 0usize..10000,
    ) {
        let encoded = event.encode().unwrap();
        prop_assume!(!encoded.is_empty());

        let mut corrupted = encoded.clone();
        let pos = position % corrupted.len();
        for (i, b) in corruption.iter().enumerate() {
            let idx = (pos + i) % corrupted.len();
            corrupted[idx] ^= b;
        }

        // Should never panic
        let _ = ChangeEvent::decode(&corrupted);
    }

    /// Encode/decode roundtrip preserves every envelope field
    #[test]
    fn prop_event_roundtrip(event in valid_event_strategy()) {
        let encoded = event.encode().unwrap();
        let decoded = ChangeEvent::decode(&encoded).unwrap();

        prop_assert_eq!(decoded.event_id, event.event_id);
        prop_assert_eq!(decoded.book_id, event.book_id);
        prop_assert_eq!(decoded.kind, event.kind);
        prop_assert_eq!(decoded.version, event.version);
        prop_assert_eq!(decoded.payload, event.payload);
        prop_assert_eq!(decoded.produced_at, event.produced_at);
    }

    /// Unrecognized kind strings decode to Unknown instead of erroring
    #[test]
    fn prop_unknown_kind_tolerated(kind in "[a-z_]{1,20}") {
        let known = ["book_added", "book_updated", "book_removed", "borrowed", "returned"];
        prop_assume!(!known.contains(&kind.as_str()));

        let wire = json!({
            "event_id": "e-1",
            "book_id": "b-1",
            "kind": kind,
            "version": 1,
            "payload": {},
            "produced_at": 0,
        });
        let event: ChangeEvent = serde_json::from_value(wire).unwrap();
        prop_assert_eq!(event.kind, EventKind::Unknown);
    }
}

// =============================================================================
// Availability invariants
// =============================================================================

proptest! {
    /// For any borrow set: available = total - active (clamped at zero), and
    /// unavailable_until is the earliest active due date exactly in the
    /// exhausted-with-borrows state
    #[test]
    fn prop_recompute_invariants(
        total in 0u32..20,
        borrows in prop::collection::vec(borrow_strategy(), 0..30),
    ) {
        let mut record = AvailabilityRecord::full("b-1", total);
        recompute(&mut record, total, &borrows);

        let active = borrows.iter().filter(|b| b.is_active()).count() as u32;
        prop_assert_eq!(record.available_copies, total.saturating_sub(active));

        if record.available_copies == 0 && active > 0 {
            let expected = borrows
                .iter()
                .filter(|b| b.is_active())
                .map(|b| b.due_at)
                .min();
            prop_assert_eq!(record.unavailable_until, expected);
        } else {
            prop_assert_eq!(record.unavailable_until, None);
        }
    }

    /// min_due never reports a closed borrow's due date
    #[test]
    fn prop_min_due_only_active(borrows in prop::collection::vec(borrow_strategy(), 0..30)) {
        match min_due(&borrows) {
            Some(due) => prop_assert!(
                borrows.iter().any(|b| b.is_active() && b.due_at == due)
            ),
            None => prop_assert!(borrows.iter().all(|b| !b.is_active())),
        }
    }
}

// =============================================================================
// Projection replay idempotency
// =============================================================================

/// Build a plausible per-book event history: metadata first, then an
/// arbitrary mix of borrows and returns with ascending versions.
fn history_strategy() -> impl Strategy<Value = Vec<ChangeEvent>> {
    (1u32..5, prop::collection::vec(any::<bool>(), 0..10)).prop_map(|(copies, ops)| {
        let mut events = vec![ChangeEvent::new(
            "b-1",
            EventKind::BookAdded,
            1,
            json!({
                "title": "Dune", "author": "Frank Herbert",
                "publisher": "Chilton", "category": "sf", "total_copies": copies,
            }),
        )];
        let mut open: Vec<usize> = Vec::new();
        for (i, is_borrow) in ops.iter().enumerate() {
            let version = events.len() as u64 + 1;
            if *is_borrow || open.is_empty() {
                events.push(ChangeEvent::new(
                    "b-1",
                    EventKind::Borrowed,
                    version,
                    json!({
                        "borrow_id": format!("br-{i}"),
                        "user_id": "u-1",
                        "borrowed_at": i as i64,
                        "due_at": 1000 + i as i64,
                    }),
                ));
                open.push(i);
            } else {
                let closed = open.remove(0);
                events.push(ChangeEvent::new(
                    "b-1",
                    EventKind::Returned,
                    version,
                    json!({"borrow_id": format!("br-{closed}"), "returned_at": 500 + i as i64}),
                ));
            }
        }
        events
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replaying a full history over an already-applied projection changes
    /// nothing: borrow ids dedupe, returns are idempotent, metadata is
    /// last-writer-wins
    #[test]
    fn prop_history_replay_is_idempotent(history in history_strategy()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = MemoryStore::new(Arc::new(MemoryOutbox::new()));
            for event in &history {
                store.upsert_projection(event).await.unwrap();
            }
            let first = store.read_projection("b-1").await.unwrap().unwrap();

            for event in &history {
                store.upsert_projection(event).await.unwrap();
            }
            let second = store.read_projection("b-1").await.unwrap().unwrap();

            assert_eq!(first.borrows, second.borrows);
            assert_eq!(first.availability, second.availability);
            assert_eq!(first.last_applied, second.last_applied);
            assert_eq!(first.tombstoned, second.tombstoned);
        });
    }
}
