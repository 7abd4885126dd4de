//! Stream index port: natural-key reservation and version fencing.
//!
//! The index binds human-meaningful natural keys (a session code, a frame
//! set label) to opaque event-store stream ids, 1:1 for the lifetime of the
//! binding. Reservation is idempotent and race-free; the fencing version is
//! a monotonic counter advanced only by [`StreamIndex::update_version`].

use std::{fmt, future::Future};

use serde::{Deserialize, Serialize};

pub mod inmemory;

/// Composite business identifier for a domain concept, e.g.
/// `("ObservationSession", "FAC1-20240601-0002")`.
///
/// Keys with the same `kind` but different `key` (or vice versa) are
/// distinct index entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub kind: String,
    pub key: String,
}

impl NaturalKey {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// Point-in-time view of one index binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub natural_key: NaturalKey,
    /// The event-store stream this natural key resolves to.
    pub stream_id: String,
    /// Fencing counter: highest event version acknowledged for this stream
    /// by index consumers. Starts at 0, monotonically non-decreasing.
    pub version: i64,
}

/// Error raised by [`StreamIndex`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamIndexError {
    /// The natural key is already bound to a different stream.
    #[error(
        "natural key {natural_key} is already bound to stream {existing_stream_id:?}"
    )]
    NaturalKeyAlreadyBound {
        natural_key: NaturalKey,
        existing_stream_id: String,
    },
    /// The stream id is already bound to a different natural key.
    #[error("stream {stream_id:?} is already bound to natural key {existing_key}")]
    StreamIdAlreadyBound {
        stream_id: String,
        existing_key: NaturalKey,
    },
    /// Transient backend failure; safe to retry.
    #[error("stream index unavailable: {source}")]
    Unavailable {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl StreamIndexError {
    /// Wrap a backend failure as a transient-unavailability error.
    pub fn unavailable(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Unavailable {
            source: Box::new(source),
        }
    }
}

/// Concurrency-safe mapping from natural keys to stream ids.
///
/// An entry's lifecycle is `absent -> reserved(version = 0) ->
/// reserved(version = v, non-decreasing)`. Nothing in this contract deletes
/// an entry.
pub trait StreamIndex: Send + Sync {
    /// Resolve a natural key. Pure read; `None` means no binding exists.
    ///
    /// # Errors
    ///
    /// Returns [`StreamIndexError::Unavailable`] on transient backend
    /// failure.
    fn lookup<'a>(
        &'a self,
        natural_key: &'a NaturalKey,
    ) -> impl Future<Output = Result<Option<IndexEntry>, StreamIndexError>> + Send + 'a;

    /// Atomically bind `natural_key` to `stream_id` unless a binding exists.
    ///
    /// Reserving an existing identical binding is a no-op, so a crashed or
    /// timed-out attempt is safe to retry. Under concurrent callers racing
    /// for the same key, exactly one reservation wins; identical racers
    /// observe success and conflicting racers observe a conflict error.
    ///
    /// # Errors
    ///
    /// - [`StreamIndexError::NaturalKeyAlreadyBound`] if the key resolves to
    ///   a different stream
    /// - [`StreamIndexError::StreamIdAlreadyBound`] if the stream is bound
    ///   to a different key
    /// - [`StreamIndexError::Unavailable`] on transient backend failure
    fn reserve<'a>(
        &'a self,
        natural_key: &'a NaturalKey,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), StreamIndexError>> + Send + 'a;

    /// Advance the fencing counter for `stream_id` to `version`, only if
    /// strictly greater than the stored value; otherwise a no-op.
    ///
    /// An unknown `stream_id` is a silent no-op, never an error. The
    /// conditional update is a single atomic compare-and-set at the storage
    /// layer, safe under concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns [`StreamIndexError::Unavailable`] on transient backend
    /// failure.
    fn update_version<'a>(
        &'a self,
        stream_id: &'a str,
        version: i64,
    ) -> impl Future<Output = Result<(), StreamIndexError>> + Send + 'a;
}
