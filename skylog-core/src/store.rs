//! Event store port and its error taxonomy.
//!
//! [`EventStore`] is the storage contract for the append-only log: atomic
//! single-stream appends with optimistic concurrency, ordered per-stream
//! reads, and globally ordered catch-up reads. Backends differ only in where
//! the log lives; the error taxonomy maps 1:1 across all of them, so callers
//! never see a backend-specific failure type.

use std::future::Future;

use crate::envelope::{EventEnvelope, EventEnvelopeBatch};

pub mod inmemory;

/// Storage column limit for `stream_id`.
pub const MAX_STREAM_ID_LEN: usize = 200;
/// Storage column limit for `stream_type`.
pub const MAX_STREAM_TYPE_LEN: usize = 100;
/// Storage column limit for `event_type`.
pub const MAX_EVENT_TYPE_LEN: usize = 120;

/// Error raised by [`EventStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// The batch's starting version does not continue the stream tip.
    ///
    /// This is the designed optimistic-concurrency signal, an expected
    /// control-flow path: the caller re-reads the stream tip and retries
    /// with the corrected starting version.
    #[error(
        "version conflict on stream {stream_id:?}: expected starting version {expected}, got \
         {actual} (hint: re-read the stream tip and retry)"
    )]
    VersionConflict {
        stream_id: String,
        /// The starting version the store would have accepted (tip + 1).
        expected: i64,
        /// The starting version the batch actually carried.
        actual: i64,
    },
    /// An event id in the batch already exists somewhere in the store.
    ///
    /// Not retryable as-is: retrying with the same id repeats the failure.
    #[error("event id {event_id:?} already exists in the store")]
    DuplicateEventId { event_id: String },
    /// The envelope cannot be represented by the backend (field length
    /// limits, unrepresentable payload). A client-input problem.
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },
    /// Malformed read-range arguments. A programming error upstream, never
    /// retried.
    #[error("invalid read range: {reason}")]
    InvalidRange { reason: String },
    /// Transient backend failure (timeout, lock contention, lost
    /// connection). The only kind for which the caller may retry the whole
    /// operation, after re-checking the stream tip.
    #[error("event store unavailable: {source}")]
    Unavailable {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl EventStoreError {
    /// Wrap a backend failure as a transient-unavailability error.
    pub fn unavailable(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Unavailable {
            source: Box::new(source),
        }
    }

    pub fn invalid_envelope(reason: impl Into<String>) -> Self {
        Self::InvalidEnvelope {
            reason: reason.into(),
        }
    }
}

/// Check the shared column limits so both backends reject oversized fields
/// with the same [`EventStoreError::InvalidEnvelope`].
///
/// # Errors
///
/// Returns [`EventStoreError::InvalidEnvelope`] naming the offending field.
pub fn check_column_limits(batch: &EventEnvelopeBatch) -> Result<(), EventStoreError> {
    for envelope in batch {
        for (field, value, limit) in [
            ("stream_id", envelope.stream_id(), MAX_STREAM_ID_LEN),
            ("stream_type", envelope.stream_type(), MAX_STREAM_TYPE_LEN),
            ("event_type", envelope.event_type(), MAX_EVENT_TYPE_LEN),
        ] {
            let length = value.chars().count();
            if length > limit {
                return Err(EventStoreError::invalid_envelope(format!(
                    "{field} exceeds {limit} characters (got {length})"
                )));
            }
        }
    }
    Ok(())
}

/// Validate `read_stream` bounds: versions are 1-based and the range is
/// inclusive.
///
/// # Errors
///
/// Returns [`EventStoreError::InvalidRange`] if `from_version < 1` or
/// `to_version < from_version`.
pub fn check_stream_range(from_version: i64, to_version: Option<i64>) -> Result<(), EventStoreError> {
    if from_version < 1 {
        return Err(EventStoreError::InvalidRange {
            reason: format!("from_version must be >= 1, got {from_version}"),
        });
    }
    if let Some(to_version) = to_version
        && to_version < from_version
    {
        return Err(EventStoreError::InvalidRange {
            reason: format!("to_version {to_version} is below from_version {from_version}"),
        });
    }
    Ok(())
}

/// Validate `read_since` bounds: the cursor is 0-based-exclusive and the
/// limit, when given, must be at least 1.
///
/// # Errors
///
/// Returns [`EventStoreError::InvalidRange`] if `after_global_seq < 0` or
/// `limit < 1`.
pub fn check_since_range(after_global_seq: i64, limit: Option<i64>) -> Result<(), EventStoreError> {
    if after_global_seq < 0 {
        return Err(EventStoreError::InvalidRange {
            reason: format!("global_seq must be >= 0, got {after_global_seq}"),
        });
    }
    if let Some(limit) = limit
        && limit < 1
    {
        return Err(EventStoreError::InvalidRange {
            reason: format!("limit must be >= 1, got {limit}"),
        });
    }
    Ok(())
}

/// Abstraction over the append-only event log.
///
/// The store's only persistent state is the log itself, which only grows:
/// no update or delete operation is exposed, and relational backends reject
/// out-of-band mutation at the schema level.
///
/// Reads return materialized, version-ordered batches; restarting a read
/// means re-issuing the call.
pub trait EventStore: Send + Sync {
    /// Atomically append a batch to its stream.
    ///
    /// The batch's starting version must equal the stream tip plus one
    /// (or 1 for a new stream). On success every envelope is returned in
    /// input order with `global_seq` assigned in strictly ascending order
    /// and `recorded_at` set. Partial application is never observable.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::VersionConflict`] if the starting version does
    ///   not continue the tip
    /// - [`EventStoreError::DuplicateEventId`] if any event id already
    ///   exists anywhere in the store
    /// - [`EventStoreError::InvalidEnvelope`] if the backend cannot
    ///   represent an envelope
    /// - [`EventStoreError::Unavailable`] on transient backend failure
    fn append(
        &self,
        batch: EventEnvelopeBatch,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, EventStoreError>> + Send;

    /// Read one stream in ascending version order, inclusive bounds.
    ///
    /// An unknown or exhausted stream yields an empty sequence, not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidRange`] for malformed bounds, or
    /// [`EventStoreError::Unavailable`] on transient backend failure.
    fn read_stream<'a>(
        &'a self,
        stream_id: &'a str,
        from_version: i64,
        to_version: Option<i64>,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, EventStoreError>> + Send + 'a;

    /// Read events with `global_seq` strictly greater than
    /// `after_global_seq`, in ascending global order across all streams.
    ///
    /// `0` means "from the beginning". Used by downstream consumers for
    /// catch-up and replay.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidRange`] for malformed bounds, or
    /// [`EventStoreError::Unavailable`] on transient backend failure.
    fn read_since(
        &self,
        after_global_seq: i64,
        limit: Option<i64>,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, EventStoreError>> + Send;
}
