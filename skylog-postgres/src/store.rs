//! PostgreSQL-backed event store.

use chrono::{DateTime, Utc};
use skylog_core::{
    envelope::{EventEnvelope, EventEnvelopeBatch, JsonMap},
    store::{
        EventStore, EventStoreError, check_column_limits, check_since_range, check_stream_range,
    },
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};

use crate::translate;

/// Columns selected whenever envelopes are materialized from the log.
const ENVELOPE_COLUMNS: &str = "stream_id, stream_type, version, event_id, event_type, \
                                recorded_at, payload, metadata";

/// A PostgreSQL-backed [`EventStore`].
///
/// Concurrency correctness lives in the schema, not in process memory, so
/// multiple service instances can write through separate pools: the stream
/// tip is locked with `FOR UPDATE` during an append, and writers that race
/// past the pre-check are arbitrated by the `(stream_id, version)` and
/// `event_id` unique constraints. The table itself is append-only, enforced
/// by a trigger that rejects `UPDATE` and `DELETE`.
///
/// The adapter holds only a pool handle; constructing one per unit of work
/// is cheap.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the event-store schema (idempotent).
    ///
    /// Uses `CREATE ... IF NOT EXISTS` style DDL so it can be run on
    /// startup. The column shapes and constraint names are a cross-language
    /// contract; other implementations interoperate on the same table.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS event_store (
                global_seq  BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                stream_id   VARCHAR(200) NOT NULL,
                stream_type VARCHAR(100) NOT NULL,
                version     INTEGER NOT NULL,
                event_id    VARCHAR(26) NOT NULL,
                event_type  VARCHAR(120) NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                payload     JSONB NOT NULL,
                metadata    JSONB NULL,
                CONSTRAINT event_store_version_check CHECK (version >= 1),
                CONSTRAINT event_store_event_id_len_check CHECK (char_length(event_id) = 26),
                CONSTRAINT event_store_event_id_key UNIQUE (event_id),
                CONSTRAINT event_store_stream_id_version_key UNIQUE (stream_id, version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS event_store_by_stream_type_event_type
              ON event_store (stream_type, event_type)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS event_store_by_stream_and_seq
              ON event_store (stream_id, global_seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS event_store_by_event_type
              ON event_store (event_type)",
        )
        .execute(&self.pool)
        .await?;

        // Append-only is a database-level contract: no out-of-band mutation
        // of persisted rows, no matter the client.
        sqlx::query(
            r"
            CREATE OR REPLACE FUNCTION event_store_append_only() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'event_store is append-only: % rejected', TG_OP;
            END;
            $$ LANGUAGE plpgsql
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(r"DROP TRIGGER IF EXISTS event_store_no_mutation ON event_store")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r"
            CREATE TRIGGER event_store_no_mutation
            BEFORE UPDATE OR DELETE ON event_store
            FOR EACH ROW EXECUTE FUNCTION event_store_append_only()
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Decide what a failed insert actually means.
    ///
    /// A unique violation on `(stream_id, version)` is a concurrent writer
    /// that won the race after our tip pre-check; the authoritative expected
    /// version comes from a fresh read, not from the failed transaction. A
    /// violation on `event_id` is a duplicate id somewhere in the store; the
    /// offending id is re-read the same way.
    async fn translate_append_failure(
        &self,
        err: sqlx::Error,
        batch: &EventEnvelopeBatch,
    ) -> EventStoreError {
        if translate::is_unique_violation(&err) {
            match translate::constraint(&err).as_deref() {
                Some(translate::STREAM_VERSION_UNIQUE) => {
                    let tip: i32 = match sqlx::query_scalar(
                        r"SELECT COALESCE(MAX(version), 0) FROM event_store WHERE stream_id = $1",
                    )
                    .bind(batch.stream_id())
                    .fetch_one(&self.pool)
                    .await
                    {
                        Ok(tip) => tip,
                        Err(read_err) => return translate::store_error(read_err),
                    };
                    return EventStoreError::VersionConflict {
                        stream_id: batch.stream_id().to_string(),
                        expected: i64::from(tip) + 1,
                        actual: batch.starting_version(),
                    };
                }
                Some(translate::EVENT_ID_UNIQUE) => {
                    let ids: Vec<String> =
                        batch.iter().map(|e| e.event_id().to_string()).collect();
                    // Best effort: if the re-read fails we still know it is a
                    // duplicate, so fall back to the first batch id.
                    let existing: Option<String> = sqlx::query_scalar(
                        r"SELECT event_id FROM event_store WHERE event_id = ANY($1) LIMIT 1",
                    )
                    .bind(&ids)
                    .fetch_optional(&self.pool)
                    .await
                    .ok()
                    .flatten();
                    let event_id = existing
                        .or_else(|| ids.into_iter().next())
                        .unwrap_or_default();
                    return EventStoreError::DuplicateEventId { event_id };
                }
                _ => {}
            }
        }
        translate::store_error(err)
    }
}

fn envelope_from_row(row: &PgRow) -> Result<EventEnvelope, EventStoreError> {
    let stream_id: String = row.try_get("stream_id").map_err(translate::store_error)?;
    let stream_type: String = row.try_get("stream_type").map_err(translate::store_error)?;
    let version: i32 = row.try_get("version").map_err(translate::store_error)?;
    let event_id: String = row.try_get("event_id").map_err(translate::store_error)?;
    let event_type: String = row.try_get("event_type").map_err(translate::store_error)?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(translate::store_error)?;
    let global_seq: i64 = row.try_get("global_seq").map_err(translate::store_error)?;
    let payload: sqlx::types::Json<JsonMap> =
        row.try_get("payload").map_err(translate::store_error)?;
    let metadata: Option<sqlx::types::Json<JsonMap>> =
        row.try_get("metadata").map_err(translate::store_error)?;

    EventEnvelope::recorded(
        stream_id,
        stream_type,
        i64::from(version),
        event_id,
        event_type,
        payload.0,
        metadata.map(|m| m.0),
        recorded_at,
        global_seq,
    )
    .map_err(|e| EventStoreError::invalid_envelope(e.to_string()))
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
    async fn append(
        &self,
        batch: EventEnvelopeBatch,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        check_column_limits(&batch)?;
        let mut versions = Vec::with_capacity(batch.len());
        for envelope in &batch {
            let version = i32::try_from(envelope.version()).map_err(|_| {
                EventStoreError::invalid_envelope(format!(
                    "version {} exceeds storage range",
                    envelope.version()
                ))
            })?;
            versions.push(version);
        }

        let mut tx = self.pool.begin().await.map_err(translate::store_error)?;

        // Lock the stream tip so same-stream appends serialize; a fresh
        // stream has nothing to lock and relies on the unique constraint to
        // arbitrate the race instead.
        let tip: Option<i32> = sqlx::query_scalar(
            r"
            SELECT version FROM event_store
            WHERE stream_id = $1
            ORDER BY version DESC
            LIMIT 1
            FOR UPDATE
            ",
        )
        .bind(batch.stream_id())
        .fetch_optional(&mut *tx)
        .await
        .map_err(translate::store_error)?;

        let expected = tip.map_or(1, |tip| i64::from(tip) + 1);
        if batch.starting_version() != expected {
            tracing::debug!(
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

        let fallback_recorded_at = Utc::now();
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO event_store (stream_id, stream_type, version, event_id, event_type, \
             recorded_at, payload, metadata) ",
        );
        qb.push_values(batch.iter().zip(versions), |mut b, (envelope, version)| {
            b.push_bind(envelope.stream_id());
            b.push_bind(envelope.stream_type());
            b.push_bind(version);
            b.push_bind(envelope.event_id());
            b.push_bind(envelope.event_type());
            b.push_bind(envelope.recorded_at().unwrap_or(fallback_recorded_at));
            b.push_bind(sqlx::types::Json(envelope.payload()));
            b.push_bind(envelope.metadata().map(sqlx::types::Json));
        });
        qb.push(" RETURNING global_seq, recorded_at");

        let rows: Vec<(i64, DateTime<Utc>)> = match qb
            .build_query_as()
            .fetch_all(&mut *tx)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                drop(tx);
                return Err(self.translate_append_failure(err, &batch).await);
            }
        };
        drop(qb);

        if rows.len() != batch.len() {
            return Err(EventStoreError::unavailable(RowCountMismatch {
                expected: batch.len(),
                actual: rows.len(),
            }));
        }

        tx.commit().await.map_err(translate::store_error)?;

        let event_count = batch.len();
        let mut recorded = Vec::with_capacity(event_count);
        for (envelope, (global_seq, recorded_at)) in batch.into_envelopes().into_iter().zip(rows) {
            let envelope = envelope
                .into_recorded(global_seq, recorded_at)
                .map_err(|e| EventStoreError::invalid_envelope(e.to_string()))?;
            recorded.push(envelope);
        }
        tracing::debug!(event_count, "events appended to stream");
        Ok(recorded)
    }

    #[tracing::instrument(skip(self))]
    async fn read_stream<'a>(
        &'a self,
        stream_id: &'a str,
        from_version: i64,
        to_version: Option<i64>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        check_stream_range(from_version, to_version)?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT global_seq, {ENVELOPE_COLUMNS} FROM event_store WHERE stream_id = "
        ));
        qb.push_bind(stream_id);
        qb.push(" AND version >= ").push_bind(from_version);
        if let Some(to_version) = to_version {
            qb.push(" AND version <= ").push_bind(to_version);
        }
        // Explicit order: insertion order for a stream is version order, and
        // physical layout is no substitute.
        qb.push(" ORDER BY version ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(translate::store_error)?;
        rows.iter().map(envelope_from_row).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn read_since(
        &self,
        after_global_seq: i64,
        limit: Option<i64>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        check_since_range(after_global_seq, limit)?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT global_seq, {ENVELOPE_COLUMNS} FROM event_store WHERE global_seq > "
        ));
        qb.push_bind(after_global_seq);
        qb.push(" ORDER BY global_seq ASC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(translate::store_error)?;
        rows.iter().map(envelope_from_row).collect()
    }
}

/// Insert returned a different number of rows than the batch carried.
#[derive(Debug, thiserror::Error)]
#[error("database returned {actual} inserted rows for a batch of {expected}")]
struct RowCountMismatch {
    expected: usize,
    actual: usize,
}
