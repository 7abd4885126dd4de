//! PostgreSQL-backed stream index.

use skylog_core::index::{IndexEntry, NaturalKey, StreamIndex, StreamIndexError};
use sqlx::PgPool;

use crate::translate;

/// A PostgreSQL-backed [`StreamIndex`].
///
/// Reservation does not lock and does not trust its own insert: the row is
/// inserted conflict-tolerantly (`ON CONFLICT DO NOTHING`), then the true
/// outcome is decided by authoritatively re-reading the table by natural key
/// and by stream id inside the same transaction. Under racing reservations
/// exactly one insert lands; every racer then reads the same winning row and
/// reaches the same verdict. A read-check-then-insert would reintroduce the
/// TOCTOU race this design exists to close.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the stream-index schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the schema query fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS stream_index (
                kind      VARCHAR(100) NOT NULL,
                key       VARCHAR(200) NOT NULL,
                stream_id VARCHAR(200) NOT NULL,
                version   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (kind, key),
                CONSTRAINT stream_index_stream_id_key UNIQUE (stream_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl StreamIndex for Store {
    #[tracing::instrument(skip(self, natural_key), fields(%natural_key))]
    async fn lookup<'a>(
        &'a self,
        natural_key: &'a NaturalKey,
    ) -> Result<Option<IndexEntry>, StreamIndexError> {
        let row: Option<(String, i32)> = sqlx::query_as(
            r"SELECT stream_id, version FROM stream_index WHERE kind = $1 AND key = $2",
        )
        .bind(&natural_key.kind)
        .bind(&natural_key.key)
        .fetch_optional(&self.pool)
        .await
        .map_err(translate::index_error)?;

        Ok(row.map(|(stream_id, version)| IndexEntry {
            natural_key: natural_key.clone(),
            stream_id,
            version: i64::from(version),
        }))
    }

    #[tracing::instrument(skip(self, natural_key), fields(%natural_key, stream_id))]
    async fn reserve<'a>(
        &'a self,
        natural_key: &'a NaturalKey,
        stream_id: &'a str,
    ) -> Result<(), StreamIndexError> {
        let mut tx = self.pool.begin().await.map_err(translate::index_error)?;

        // Conflict-tolerant insert: any uniqueness violation (natural key or
        // stream id) is swallowed here; the insert's own success flag is
        // never consulted.
        sqlx::query(
            r"
            INSERT INTO stream_index (kind, key, stream_id, version)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(&natural_key.kind)
        .bind(&natural_key.key)
        .bind(stream_id)
        .execute(&mut *tx)
        .await
        .map_err(translate::index_error)?;

        // Authoritative re-read by natural key: covers both "we inserted"
        // and "an identical reservation already existed".
        let by_key: Option<(String,)> = sqlx::query_as(
            r"SELECT stream_id FROM stream_index WHERE kind = $1 AND key = $2",
        )
        .bind(&natural_key.kind)
        .bind(&natural_key.key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(translate::index_error)?;

        match by_key {
            Some((existing,)) if existing == stream_id => {
                tx.commit().await.map_err(translate::index_error)?;
                tracing::debug!("natural key reserved");
                Ok(())
            }
            Some((existing,)) => Err(StreamIndexError::NaturalKeyAlreadyBound {
                natural_key: natural_key.clone(),
                existing_stream_id: existing,
            }),
            None => {
                // Our row is absent, so the insert collided on the stream-id
                // constraint; re-read the owning natural key.
                let by_stream: Option<(String, String)> = sqlx::query_as(
                    r"SELECT kind, key FROM stream_index WHERE stream_id = $1",
                )
                .bind(stream_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(translate::index_error)?;

                match by_stream {
                    Some((kind, key)) => Err(StreamIndexError::StreamIdAlreadyBound {
                        stream_id: stream_id.to_string(),
                        existing_key: NaturalKey { kind, key },
                    }),
                    // The conflicting row is gone again; treat as transient
                    // and let the caller retry.
                    None => Err(StreamIndexError::unavailable(ReservationNotVisible)),
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn update_version<'a>(
        &'a self,
        stream_id: &'a str,
        version: i64,
    ) -> Result<(), StreamIndexError> {
        let version = i32::try_from(version).map_err(|_| {
            StreamIndexError::unavailable(FencingVersionOutOfRange { version })
        })?;

        // Single atomic compare-and-set; zero rows affected means either an
        // unknown stream or a stale version, both silent no-ops.
        sqlx::query(
            r"UPDATE stream_index SET version = $2 WHERE stream_id = $1 AND version < $2",
        )
        .bind(stream_id)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(translate::index_error)?;

        Ok(())
    }
}

/// The reservation row vanished between insert and re-read.
#[derive(Debug, thiserror::Error)]
#[error("reservation not visible after conflict-tolerant insert; retry")]
struct ReservationNotVisible;

/// Fencing version too large for the storage column.
#[derive(Debug, thiserror::Error)]
#[error("fencing version {version} exceeds storage range")]
struct FencingVersionOutOfRange {
    version: i64,
}
