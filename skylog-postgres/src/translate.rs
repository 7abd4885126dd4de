//! Translation of sqlx failures into the port error taxonomies.
//!
//! No sqlx error type crosses the port boundary: conflicts are recognized by
//! constraint name, client-input problems by SQLSTATE class, and everything
//! else is carried as a transient `Unavailable` with the driver error as its
//! source.

use skylog_core::{index::StreamIndexError, store::EventStoreError};
use sqlx::error::ErrorKind;

/// Unique constraint on `event_store.event_id` (global id uniqueness).
pub(crate) const EVENT_ID_UNIQUE: &str = "event_store_event_id_key";
/// Unique constraint on `event_store (stream_id, version)` (per-stream
/// contiguity under races).
pub(crate) const STREAM_VERSION_UNIQUE: &str = "event_store_stream_id_version_key";

/// Constraint name carried by a database error, if any.
pub(crate) fn constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.constraint().map(str::to_string),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if matches!(db.kind(), ErrorKind::UniqueViolation))
}

/// Client-input classification: check violations, oversized values, and
/// unrepresentable text all mean the envelope cannot be stored as given.
fn invalid_input_reason(err: &sqlx::Error) -> Option<String> {
    let sqlx::Error::Database(db) = err else {
        return None;
    };
    if matches!(db.kind(), ErrorKind::CheckViolation) {
        return Some(db.message().to_string());
    }
    match db.code().as_deref() {
        // 22001 string_data_right_truncation, 22P02 invalid_text_representation
        Some("22001" | "22P02") => Some(db.message().to_string()),
        _ => None,
    }
}

pub(crate) fn store_error(err: sqlx::Error) -> EventStoreError {
    match invalid_input_reason(&err) {
        Some(reason) => EventStoreError::InvalidEnvelope { reason },
        None => EventStoreError::unavailable(err),
    }
}

pub(crate) fn index_error(err: sqlx::Error) -> StreamIndexError {
    StreamIndexError::unavailable(err)
}
