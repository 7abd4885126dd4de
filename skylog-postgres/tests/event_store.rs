//! Integration tests for the PostgreSQL event store.
//!
//! These tests require Docker to be running and will spin up a PostgreSQL
//! container using testcontainers.

use chrono::Utc;
use skylog_core::{
    envelope::{EventEnvelope, EventEnvelopeBatch, JsonMap, NonEmpty},
    store::{EventStore, EventStoreError},
};
use skylog_postgres::Store;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Test helper to set up a PostgreSQL container and connection pool.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }

    async fn store(&self) -> Store {
        let store = Store::new(self.pool.clone());
        store.migrate().await.unwrap();
        store
    }
}

fn event_id(n: u32) -> String {
    format!("01J8ZQ6T5RWXYZABCDEF{n:06}")
}

fn envelope(stream_id: &str, version: i64, id: u32) -> EventEnvelope {
    let mut payload = JsonMap::new();
    payload.insert("frame".to_string(), serde_json::Value::from(id));
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

fn batch(stream_id: &str, versions: std::ops::RangeInclusive<i64>, first_id: u32) -> EventEnvelopeBatch {
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
async fn migrate_is_idempotent() {
    let db = TestDb::new().await;
    let store = Store::new(db.pool.clone());

    store.migrate().await.unwrap();
    store.migrate().await.unwrap();

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM event_store")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(count.0, 0);
}

#[tokio::test]
async fn append_assigns_positions_and_timestamps_in_order() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let recorded = store.append(batch("S1", 1..=3, 1)).await.unwrap();

    let seqs: Vec<_> = recorded.iter().filter_map(EventEnvelope::global_seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(recorded.iter().all(|e| e.recorded_at().is_some()));
    let versions: Vec<_> = recorded.iter().map(EventEnvelope::version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn append_with_stale_starting_version_conflicts() {
    let db = TestDb::new().await;
    let store = db.store().await;

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

    // Retrying with the corrected starting version succeeds.
    store.append(batch("S1", 3..=3, 10)).await.unwrap();
}

#[tokio::test]
async fn new_stream_must_start_at_version_one() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let err = store.append(batch("S1", 5..=5, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        EventStoreError::VersionConflict {
            expected: 1,
            actual: 5,
            ..
        }
    ));
}

#[tokio::test]
async fn duplicate_event_id_across_streams_is_rejected() {
    let db = TestDb::new().await;
    let store = db.store().await;

    store.append(batch("S1", 1..=1, 7)).await.unwrap();

    let err = store.append(batch("S2", 1..=1, 7)).await.unwrap_err();
    match err {
        EventStoreError::DuplicateEventId { event_id: id } => assert_eq!(id, event_id(7)),
        other => panic!("expected duplicate event id, got {other:?}"),
    }

    // Prior state unchanged.
    assert!(store.read_stream("S2", 1, None).await.unwrap().is_empty());
    assert_eq!(store.read_since(0, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_batch_is_not_partially_applied() {
    let db = TestDb::new().await;
    let store = db.store().await;

    store.append(batch("S1", 1..=1, 1)).await.unwrap();

    // Second envelope collides with the already-stored id 1.
    let colliding = EventEnvelopeBatch::new(
        "S2",
        "ObservationSession",
        NonEmpty::from_vec(vec![envelope("S2", 1, 2), envelope("S2", 2, 1)]).unwrap(),
    )
    .unwrap();

    let err = store.append(colliding).await.unwrap_err();
    assert!(matches!(err, EventStoreError::DuplicateEventId { .. }));
    assert!(store.read_stream("S2", 1, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn read_stream_is_version_ordered_with_inclusive_bounds() {
    let db = TestDb::new().await;
    let store = db.store().await;

    store.append(batch("S1", 1..=3, 1)).await.unwrap();
    store.append(batch("S2", 1..=1, 10)).await.unwrap();
    store.append(batch("S1", 4..=5, 4)).await.unwrap();

    let events = store.read_stream("S1", 1, None).await.unwrap();
    let versions: Vec<_> = events.iter().map(EventEnvelope::version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    assert!(events.iter().all(|e| e.stream_id() == "S1"));

    let window = store.read_stream("S1", 2, Some(4)).await.unwrap();
    let versions: Vec<_> = window.iter().map(EventEnvelope::version).collect();
    assert_eq!(versions, vec![2, 3, 4]);

    assert!(store.read_stream("missing", 1, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn read_stream_rejects_malformed_ranges() {
    let db = TestDb::new().await;
    let store = db.store().await;

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
async fn read_since_is_globally_ordered_and_strictly_after() {
    let db = TestDb::new().await;
    let store = db.store().await;

    store.append(batch("S1", 1..=2, 1)).await.unwrap();
    store.append(batch("S2", 1..=1, 10)).await.unwrap();
    store.append(batch("S1", 3..=3, 3)).await.unwrap();

    let all = store.read_since(0, None).await.unwrap();
    let seqs: Vec<_> = all.iter().filter_map(EventEnvelope::global_seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    let after_two = store.read_since(2, None).await.unwrap();
    assert_eq!(after_two.len(), 2);
    assert_eq!(after_two[0].global_seq(), Some(3));

    let limited = store.read_since(0, Some(3)).await.unwrap();
    assert_eq!(limited.len(), 3);

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
async fn payload_and_metadata_round_trip() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let mut payload = JsonMap::new();
    payload.insert("filter".to_string(), serde_json::Value::from("H-alpha"));
    payload.insert("exposure_s".to_string(), serde_json::Value::from(120));
    let mut metadata = JsonMap::new();
    metadata.insert(
        "correlation_id".to_string(),
        serde_json::Value::from("req-42"),
    );

    let envelope = EventEnvelope::new(
        "S1",
        "ObservationSession",
        1,
        event_id(1),
        "session.registered",
        payload.clone(),
        Some(metadata.clone()),
    )
    .unwrap();
    let batch =
        EventEnvelopeBatch::new("S1", "ObservationSession", NonEmpty::singleton(envelope)).unwrap();
    store.append(batch).await.unwrap();

    let events = store.read_stream("S1", 1, None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload(), &payload);
    assert_eq!(events[0].metadata(), Some(&metadata));
    assert_eq!(events[0].event_type(), "session.registered");
}

#[tokio::test]
async fn update_and_delete_are_rejected_at_the_database() {
    let db = TestDb::new().await;
    let store = db.store().await;

    store.append(batch("S1", 1..=1, 1)).await.unwrap();

    let update = sqlx::query("UPDATE event_store SET event_type = 'tampered' WHERE stream_id = 'S1'")
        .execute(&db.pool)
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM event_store WHERE stream_id = 'S1'")
        .execute(&db.pool)
        .await;
    assert!(delete.is_err());

    // The row is intact.
    let events = store.read_stream("S1", 1, None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type(), "frame.classified");
}

#[tokio::test]
async fn concurrent_appends_to_one_stream_admit_exactly_one_winner() {
    let db = TestDb::new().await;
    let store = db.store().await;

    store.append(batch("S1", 1..=1, 1)).await.unwrap();

    // Both writers read tip = 1 and race to append version 2.
    let mut handles = Vec::new();
    for writer in 0..2u32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.append(batch("S1", 2..=2, 100 + writer)).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EventStoreError::VersionConflict { expected, actual, .. }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
                conflicts += 1;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);

    let events = store.read_stream("S1", 1, None).await.unwrap();
    let versions: Vec<_> = events.iter().map(EventEnvelope::version).collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn recorded_at_is_assigned_at_append_time() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let before = Utc::now();
    let recorded = store.append(batch("S1", 1..=1, 1)).await.unwrap();
    let after = Utc::now();

    let recorded_at = recorded[0].recorded_at().unwrap();
    assert!(recorded_at >= before && recorded_at <= after);
}
