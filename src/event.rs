// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change event envelope and wire codec.
//!
//! Every cross-store mutation travels as a [`ChangeEvent`]: a versioned,
//! uniquely identified envelope routed by `book_id`. The wire shape is JSON
//! and stable across versions:
//!
//! ```text
//! {
//!   "event_id":    "5a1e...",        # unique, used for deduplication
//!   "book_id":     "b-42",           # routing key (per-book ordering)
//!   "kind":        "borrowed",       # book_added | book_updated | book_removed
//!                                    #   | borrowed | returned
//!   "version":     7,                # source-side monotonic counter per book
//!   "payload":     { ... },          # kind-specific fields
//!   "produced_at": 1735776000000     # epoch millis
//! }
//! ```
//!
//! Unknown `kind` values decode to [`EventKind::Unknown`] and are ignored by
//! consumers rather than rejected, so newer producers can roll out first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Current epoch time in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Event kinds carried on the channel.
///
/// `Unknown` is the forward-compatibility catch-all: any kind string this
/// build does not recognize deserializes to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BookAdded,
    BookUpdated,
    BookRemoved,
    Borrowed,
    Returned,
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// String form used for the wire field and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BookAdded => "book_added",
            EventKind::BookUpdated => "book_updated",
            EventKind::BookRemoved => "book_removed",
            EventKind::Borrowed => "borrowed",
            EventKind::Returned => "returned",
            EventKind::Unknown => "unknown",
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The unit of cross-store communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique event id (uuid v4), used for deduplication and delivery audit.
    pub event_id: String,
    /// Routing key. All ordering guarantees are scoped to this.
    pub book_id: String,
    pub kind: EventKind,
    /// Source-side monotonic counter per `book_id`. Consumers apply events in
    /// non-decreasing version order; `version <= last-applied` is a duplicate.
    pub version: u64,
    /// Kind-specific fields. Kept as raw JSON so unknown kinds round-trip.
    pub payload: Value,
    /// Epoch millis at the producing store.
    pub produced_at: i64,
}

impl ChangeEvent {
    pub fn new(book_id: impl Into<String>, kind: EventKind, version: u64, payload: Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            book_id: book_id.into(),
            kind,
            version,
            payload,
            produced_at: now_millis(),
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Payload for `book_added` / `book_updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookPayload {
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub category: String,
    pub total_copies: u32,
    /// Present only on synthetic correction events emitted by reconciliation:
    /// forces the projecting side's availability to the authoritative value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_override: Option<AvailabilityOverride>,
}

/// Authoritative availability carried by a correction event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityOverride {
    pub available_copies: u32,
    pub unavailable_until: Option<i64>,
}

/// Payload for `borrowed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowPayload {
    pub borrow_id: String,
    pub user_id: String,
    pub borrowed_at: i64,
    pub due_at: i64,
}

/// Payload for `returned`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnPayload {
    pub borrow_id: String,
    pub returned_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip() {
        let event = ChangeEvent::new(
            "b-1",
            EventKind::Borrowed,
            3,
            json!({"borrow_id": "br-1", "user_id": "u-1", "borrowed_at": 1000, "due_at": 2000}),
        );

        let bytes = event.encode().unwrap();
        let decoded = ChangeEvent::decode(&bytes).unwrap();

        assert_eq!(decoded.event_id, event.event_id);
        assert_eq!(decoded.book_id, "b-1");
        assert_eq!(decoded.kind, EventKind::Borrowed);
        assert_eq!(decoded.version, 3);

        let payload: BorrowPayload = decoded.payload_as().unwrap();
        assert_eq!(payload.borrow_id, "br-1");
        assert_eq!(payload.due_at, 2000);
    }

    #[test]
    fn test_unknown_kind_decodes() {
        let wire = json!({
            "event_id": "e-1",
            "book_id": "b-1",
            "kind": "book_digitized",
            "version": 9,
            "payload": {"scanner": "v2"},
            "produced_at": 1735776000000i64,
        });

        let event: ChangeEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
        assert_eq!(event.version, 9);
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(EventKind::BookAdded).unwrap(),
            json!("book_added")
        );
        assert_eq!(
            serde_json::to_value(EventKind::Returned).unwrap(),
            json!("returned")
        );
    }

    #[test]
    fn test_malformed_bytes_rejected() {
        assert!(ChangeEvent::decode(b"not json").is_err());
        assert!(ChangeEvent::decode(b"{\"event_id\": 7}").is_err());
    }

    #[test]
    fn test_event_ids_unique() {
        let a = ChangeEvent::new("b", EventKind::BookAdded, 1, json!({}));
        let b = ChangeEvent::new("b", EventKind::BookAdded, 1, json!({}));
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_override_skipped_when_none() {
        let payload = BookPayload {
            title: "T".into(),
            author: "A".into(),
            publisher: "P".into(),
            category: "C".into(),
            total_copies: 2,
            availability_override: None,
        };
        let text = serde_json::to_string(&payload).unwrap();
        assert!(!text.contains("availability_override"));
    }
}
