//! In-memory event store for tests.
//!
//! This adapter keeps the whole log in process memory: a global append-only
//! `Vec` plus a per-stream index of log positions. It exists for unit tests
//! and examples; the `RwLock` keeps it memory-safe if shared, but it provides
//! none of the cross-process guarantees of the relational backend and must
//! not be used by concurrent production writers.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, RwLock},
};

use chrono::Utc;

use crate::{
    envelope::{EventEnvelope, EventEnvelopeBatch},
    store::{
        EventStore, EventStoreError, check_column_limits, check_since_range, check_stream_range,
    },
};

/// In-memory [`EventStore`] backed by a global log and a per-stream index.
///
/// Cloning is cheap and clones share the same log.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Global log. Index `i` holds the event with `global_seq == i + 1`.
    log: Vec<EventEnvelope>,
    /// Stream index: stream id to ascending log positions.
    streams: HashMap<String, Vec<usize>>,
    /// Every event id ever appended, for global duplicate detection.
    event_ids: HashSet<String>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_poisoned() -> EventStoreError {
        EventStoreError::unavailable(std::io::Error::other("in-memory store lock poisoned"))
    }

    fn append_sync(&self, batch: EventEnvelopeBatch) -> Result<Vec<EventEnvelope>, EventStoreError> {
        check_column_limits(&batch)?;

        let mut inner = self.inner.write().map_err(|_| Self::lock_poisoned())?;

        let tip = inner
            .streams
            .get(batch.stream_id())
            .and_then(|positions| positions.last())
            .and_then(|&position| inner.log.get(position))
            .map_or(0, EventEnvelope::version);
        let expected = tip + 1;
        if batch.starting_version() != expected {
            tracing::debug!(
                stream_id = batch.stream_id(),
                expected,
                actual = batch.starting_version(),
                "version mismatch, rejecting append"
            );
            return Err(EventStoreError::VersionConflict {
                stream_id: batch.stream_id().to_string(),
                expected,
                actual: batch.starting_version(),
            });
        }

        // Duplicate check before any mutation so a failed append leaves the
        // store untouched.
        for envelope in &batch {
            if inner.event_ids.contains(envelope.event_id()) {
                return Err(EventStoreError::DuplicateEventId {
                    event_id: envelope.event_id().to_string(),
                });
            }
        }

        let stream_id = batch.stream_id().to_string();
        let event_count = batch.len();
        let recorded_at = Utc::now();
        let mut recorded = Vec::with_capacity(event_count);
        for envelope in batch.into_envelopes() {
            let position = inner.log.len();
            let global_seq = position as i64 + 1;
            let timestamp = envelope.recorded_at().unwrap_or(recorded_at);
            let envelope = envelope
                .into_recorded(global_seq, timestamp)
                .map_err(|e| EventStoreError::invalid_envelope(e.to_string()))?;
            inner.event_ids.insert(envelope.event_id().to_string());
            inner
                .streams
                .entry(stream_id.clone())
                .or_default()
                .push(position);
            inner.log.push(envelope.clone());
            recorded.push(envelope);
        }
        drop(inner);
        tracing::debug!(stream_id, event_count, "events appended to stream");
        Ok(recorded)
    }

    fn read_stream_sync(
        &self,
        stream_id: &str,
        from_version: i64,
        to_version: Option<i64>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        check_stream_range(from_version, to_version)?;
        let inner = self.inner.read().map_err(|_| Self::lock_poisoned())?;
        let Some(positions) = inner.streams.get(stream_id) else {
            return Ok(Vec::new());
        };
        let events = positions
            .iter()
            .filter_map(|&position| inner.log.get(position))
            .filter(|envelope| {
                envelope.version() >= from_version
                    && to_version.is_none_or(|to| envelope.version() <= to)
            })
            .cloned()
            .collect();
        Ok(events)
    }

    fn read_since_sync(
        &self,
        after_global_seq: i64,
        limit: Option<i64>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        check_since_range(after_global_seq, limit)?;
        let inner = self.inner.read().map_err(|_| Self::lock_poisoned())?;
        let skip = usize::try_from(after_global_seq).unwrap_or(usize::MAX);
        let take = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let events = inner.log.iter().skip(skip).take(take).cloned().collect();
        Ok(events)
    }
}

impl EventStore for Store {
    #[tracing::instrument(
        skip(self, batch),
        fields(
            stream_id = batch.stream_id(),
            starting_version = batch.starting_version(),
            event_count = batch.len()
        )
    )]
    fn append(
        &self,
        batch: EventEnvelopeBatch,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, EventStoreError>> + Send {
        std::future::ready(self.append_sync(batch))
    }

    #[tracing::instrument(skip(self))]
    fn read_stream<'a>(
        &'a self,
        stream_id: &'a str,
        from_version: i64,
        to_version: Option<i64>,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, EventStoreError>> + Send + 'a {
        std::future::ready(self.read_stream_sync(stream_id, from_version, to_version))
    }

    #[tracing::instrument(skip(self))]
    fn read_since(
        &self,
        after_global_seq: i64,
        limit: Option<i64>,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, EventStoreError>> + Send {
        std::future::ready(self.read_since_sync(after_global_seq, limit))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::envelope::{JsonMap, NonEmpty};

    fn event_id(n: u32) -> String {
        format!("01J8ZQ6T5RWXYZABCDEF{n:06}")
    }

    fn envelope(stream_id: &str, version: i64, id: u32) -> EventEnvelope {
        let mut payload = JsonMap::new();
        payload.insert("frame".to_string(), Value::from(id));
        EventEnvelope::new(
            stream_id,
            "ObservationSession",
            version,
            event_id(id),
            "frame.classified",
            payload,
            None,
        )
        .unwrap()
    }

    fn batch(
        stream_id: &str,
        versions: std::ops::RangeInclusive<i64>,
        first_id: u32,
    ) -> EventEnvelopeBatch {
        let envelopes: Vec<_> = versions
            .enumerate()
            .map(|(offset, version)| envelope(stream_id, version, first_id + offset as u32))
            .collect();
        EventEnvelopeBatch::new(
            stream_id,
            "ObservationSession",
            NonEmpty::from_vec(envelopes).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn append_assigns_ascending_global_sequence() {
        let store = Store::new();
        let recorded = store.append(batch("S1", 1..=3, 1)).await.unwrap();

        let seqs: Vec<_> = recorded.iter().map(|e| e.global_seq()).collect();
        assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);
        assert!(recorded.iter().all(|e| e.recorded_at().is_some()));
    }

    #[tokio::test]
    async fn append_with_stale_version_conflicts_with_expected_and_actual() {
        let store = Store::new();
        store.append(batch("S1", 1..=2, 1)).await.unwrap();

        let err = store.append(batch("S1", 2..=2, 10)).await.unwrap_err();
        match err {
            EventStoreError::VersionConflict {
                stream_id,
                expected,
                actual,
            } => {
                assert_eq!(stream_id, "S1");
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("expected version conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_to_new_stream_must_start_at_one() {
        let store = Store::new();
        let err = store.append(batch("S1", 2..=2, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::VersionConflict { expected: 1, actual: 2, .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_event_id_across_streams_is_rejected_without_side_effects() {
        let store = Store::new();
        store.append(batch("S1", 1..=1, 7)).await.unwrap();

        // Same event id, different stream.
        let err = store.append(batch("S2", 1..=1, 7)).await.unwrap_err();
        assert!(matches!(err, EventStoreError::DuplicateEventId { .. }));

        // Prior state unchanged: S2 stays empty and the log has one event.
        assert!(store.read_stream("S2", 1, None).await.unwrap().is_empty());
        assert_eq!(store.read_since(0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_batch_is_not_partially_applied() {
        let store = Store::new();
        store.append(batch("S1", 1..=1, 1)).await.unwrap();

        // Second envelope collides with the already-stored id 1.
        let fresh = envelope("S2", 1, 2);
        let colliding = envelope("S2", 2, 1);
        let batch = EventEnvelopeBatch::new(
            "S2",
            "ObservationSession",
            NonEmpty::from_vec(vec![fresh, colliding]).unwrap(),
        )
        .unwrap();

        let err = store.append(batch).await.unwrap_err();
        assert!(matches!(err, EventStoreError::DuplicateEventId { .. }));
        assert!(store.read_stream("S2", 1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_stream_returns_versions_in_order() {
        let store = Store::new();
        store.append(batch("S1", 1..=3, 1)).await.unwrap();
        store.append(batch("S2", 1..=1, 10)).await.unwrap();
        store.append(batch("S1", 4..=5, 4)).await.unwrap();

        let events = store.read_stream("S1", 1, None).await.unwrap();
        let versions: Vec<_> = events.iter().map(EventEnvelope::version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);

        let tail = store.read_stream("S1", 2, Some(4)).await.unwrap();
        let versions: Vec<_> = tail.iter().map(EventEnvelope::version).collect();
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn read_stream_of_unknown_stream_is_empty() {
        let store = Store::new();
        assert!(store.read_stream("missing", 1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_stream_rejects_bad_range() {
        let store = Store::new();
        assert!(matches!(
            store.read_stream("S1", 0, None).await,
            Err(EventStoreError::InvalidRange { .. })
        ));
        assert!(matches!(
            store.read_stream("S1", 3, Some(2)).await,
            Err(EventStoreError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn read_since_is_strictly_greater_and_limited() {
        let store = Store::new();
        store.append(batch("S1", 1..=2, 1)).await.unwrap();
        store.append(batch("S2", 1..=1, 10)).await.unwrap();

        let all = store.read_since(0, None).await.unwrap();
        let seqs: Vec<_> = all.iter().map(EventEnvelope::global_seq).collect();
        assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);

        let after_one = store.read_since(1, None).await.unwrap();
        assert_eq!(after_one.len(), 2);
        assert_eq!(after_one[0].global_seq(), Some(2));

        let limited = store.read_since(0, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn read_since_rejects_bad_arguments() {
        let store = Store::new();
        assert!(matches!(
            store.read_since(-1, None).await,
            Err(EventStoreError::InvalidRange { .. })
        ));
        assert!(matches!(
            store.read_since(0, Some(0)).await,
            Err(EventStoreError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_stream_type_is_invalid_envelope() {
        let store = Store::new();
        let long_type = "t".repeat(crate::store::MAX_STREAM_TYPE_LEN + 1);
        let envelope = EventEnvelope::new(
            "S1",
            &long_type,
            1,
            event_id(1),
            "frame.classified",
            JsonMap::new(),
            None,
        )
        .unwrap();
        let batch =
            EventEnvelopeBatch::new("S1", &long_type, NonEmpty::singleton(envelope)).unwrap();
        assert!(matches!(
            store.append(batch).await,
            Err(EventStoreError::InvalidEnvelope { .. })
        ));
    }
}
