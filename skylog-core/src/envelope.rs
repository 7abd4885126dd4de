//! Immutable event envelopes and single-stream append batches.
//!
//! [`EventEnvelope`] is the wire format for one persisted fact;
//! [`EventEnvelopeBatch`] is the unit of atomic append. Both validate their
//! invariants at construction time, so an instance that exists is an instance
//! that is well-formed: stores never have to re-check field shape, only
//! concurrency and uniqueness.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
pub use nonempty::NonEmpty;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// JSON object type used for payloads and metadata.
pub type JsonMap = Map<String, Value>;

/// Canonical text length of a ULID, the required shape for event ids.
pub const EVENT_ID_LEN: usize = 26;

/// Error raised when an envelope or batch would violate its invariants.
///
/// These are construction-time programming errors, never retried: the caller
/// built malformed input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// A required string field was empty.
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
    /// The event id is not ULID-shaped (exactly 26 characters).
    #[error("event id must be exactly {EVENT_ID_LEN} characters, got {length}: {event_id:?}")]
    MalformedEventId { event_id: String, length: usize },
    /// Stream versions start at 1.
    #[error("version must be >= 1, got {version}")]
    VersionOutOfRange { version: i64 },
    /// Global sequence numbers start at 1.
    #[error("global sequence must be >= 1, got {global_seq}")]
    GlobalSeqOutOfRange { global_seq: i64 },
    /// An envelope carried a different stream identity than its batch.
    #[error("envelope belongs to stream {actual:?}, batch is for stream {expected:?}")]
    ForeignStream { expected: String, actual: String },
    /// An envelope carried a different stream type than its batch.
    #[error("envelope has stream type {actual:?}, batch is for stream type {expected:?}")]
    ForeignStreamType { expected: String, actual: String },
    /// Two envelopes in one batch shared an event id.
    #[error("duplicate event id {event_id:?} within batch")]
    DuplicateEventIdInBatch { event_id: String },
    /// Batches are pre-persistence; no envelope may carry a global sequence.
    #[error("envelope at version {version} already carries global sequence {global_seq}")]
    AlreadyRecorded { version: i64, global_seq: i64 },
    /// Batch versions must ascend by exactly one from the starting version.
    #[error("batch versions must be contiguous: expected {expected}, got {actual}")]
    NonContiguousVersions { expected: i64, actual: i64 },
}

/// One persisted (or to-be-persisted) event.
///
/// Fields are private; the only ways to obtain an envelope are
/// [`EventEnvelope::new`] (pre-persistence, no position assigned) and
/// [`EventEnvelope::recorded`] (rehydrated from storage). `recorded_at` and
/// `global_seq` are `None` until a store has accepted the envelope.
///
/// Timestamps are [`DateTime<Utc>`], so UTC-ness and timezone-awareness are
/// guaranteed by the type rather than checked at runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    stream_id: String,
    stream_type: String,
    version: i64,
    event_id: String,
    event_type: String,
    payload: JsonMap,
    metadata: Option<JsonMap>,
    recorded_at: Option<DateTime<Utc>>,
    global_seq: Option<i64>,
}

impl EventEnvelope {
    /// Build a pre-persistence envelope.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] if any identity field is empty, the event
    /// id is not exactly 26 characters, or the version is below 1.
    pub fn new(
        stream_id: impl Into<String>,
        stream_type: impl Into<String>,
        version: i64,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonMap,
        metadata: Option<JsonMap>,
    ) -> Result<Self, EnvelopeError> {
        let envelope = Self {
            stream_id: stream_id.into(),
            stream_type: stream_type.into(),
            version,
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload,
            metadata,
            recorded_at: None,
            global_seq: None,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Build an envelope rehydrated from storage, position and timestamp
    /// included.
    ///
    /// Store adapters use this when materializing rows; application code has
    /// no reason to call it.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] on the same field violations as
    /// [`EventEnvelope::new`], or if `global_seq` is below 1.
    #[allow(clippy::too_many_arguments)]
    pub fn recorded(
        stream_id: impl Into<String>,
        stream_type: impl Into<String>,
        version: i64,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonMap,
        metadata: Option<JsonMap>,
        recorded_at: DateTime<Utc>,
        global_seq: i64,
    ) -> Result<Self, EnvelopeError> {
        let envelope = Self::new(
            stream_id,
            stream_type,
            version,
            event_id,
            event_type,
            payload,
            metadata,
        )?;
        envelope.into_recorded(global_seq, recorded_at)
    }

    /// Consume a pre-persistence envelope and return its persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AlreadyRecorded`] if the envelope already
    /// carries a global sequence, or [`EnvelopeError::GlobalSeqOutOfRange`]
    /// if `global_seq` is below 1.
    pub fn into_recorded(
        mut self,
        global_seq: i64,
        recorded_at: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        if let Some(existing) = self.global_seq {
            return Err(EnvelopeError::AlreadyRecorded {
                version: self.version,
                global_seq: existing,
            });
        }
        if global_seq < 1 {
            return Err(EnvelopeError::GlobalSeqOutOfRange { global_seq });
        }
        self.global_seq = Some(global_seq);
        self.recorded_at = Some(recorded_at);
        Ok(self)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        for (field, value) in [
            ("stream_id", &self.stream_id),
            ("stream_type", &self.stream_type),
            ("event_type", &self.event_type),
        ] {
            if value.is_empty() {
                return Err(EnvelopeError::EmptyField { field });
            }
        }
        let length = self.event_id.chars().count();
        if length != EVENT_ID_LEN {
            return Err(EnvelopeError::MalformedEventId {
                event_id: self.event_id.clone(),
                length,
            });
        }
        if self.version < 1 {
            return Err(EnvelopeError::VersionOutOfRange {
                version: self.version,
            });
        }
        if let Some(global_seq) = self.global_seq
            && global_seq < 1
        {
            return Err(EnvelopeError::GlobalSeqOutOfRange { global_seq });
        }
        Ok(())
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    #[must_use]
    pub const fn version(&self) -> i64 {
        self.version
    }

    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    #[must_use]
    pub const fn payload(&self) -> &JsonMap {
        &self.payload
    }

    #[must_use]
    pub const fn metadata(&self) -> Option<&JsonMap> {
        self.metadata.as_ref()
    }

    /// Store-assigned (or store-confirmed) persistence timestamp.
    #[must_use]
    pub const fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }

    /// Store-assigned position in the global total order.
    #[must_use]
    pub const fn global_seq(&self) -> Option<i64> {
        self.global_seq
    }

    /// Whether this envelope has been accepted by a store.
    #[must_use]
    pub const fn is_recorded(&self) -> bool {
        self.global_seq.is_some()
    }
}

/// A non-empty, contiguous run of envelopes for one stream: the unit of
/// atomic append.
///
/// A batch is never persisted as an entity itself; it exists only to make the
/// single-stream append invariants hold before the store is ever involved:
///
/// - every envelope shares the batch's `stream_id` and `stream_type`
/// - event ids are unique within the batch
/// - no envelope carries a `global_seq` (batches are pre-persistence)
/// - versions ascend by exactly 1 from [`starting_version`]
///
/// [`starting_version`]: EventEnvelopeBatch::starting_version
#[derive(Debug, Clone)]
pub struct EventEnvelopeBatch {
    stream_id: String,
    stream_type: String,
    envelopes: NonEmpty<EventEnvelope>,
}

impl EventEnvelopeBatch {
    /// Build a batch, validating every cross-envelope invariant.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] if the stream identity is empty, an
    /// envelope belongs to a different stream, an event id repeats, an
    /// envelope is already recorded, or versions are not contiguous.
    pub fn new(
        stream_id: impl Into<String>,
        stream_type: impl Into<String>,
        envelopes: NonEmpty<EventEnvelope>,
    ) -> Result<Self, EnvelopeError> {
        let stream_id = stream_id.into();
        let stream_type = stream_type.into();
        if stream_id.is_empty() {
            return Err(EnvelopeError::EmptyField { field: "stream_id" });
        }
        if stream_type.is_empty() {
            return Err(EnvelopeError::EmptyField {
                field: "stream_type",
            });
        }

        let starting_version = envelopes.head.version;
        let mut seen_ids = HashSet::with_capacity(envelopes.tail.len() + 1);
        for (offset, envelope) in envelopes.iter().enumerate() {
            if envelope.stream_id != stream_id {
                return Err(EnvelopeError::ForeignStream {
                    expected: stream_id,
                    actual: envelope.stream_id.clone(),
                });
            }
            if envelope.stream_type != stream_type {
                return Err(EnvelopeError::ForeignStreamType {
                    expected: stream_type,
                    actual: envelope.stream_type.clone(),
                });
            }
            if let Some(global_seq) = envelope.global_seq {
                return Err(EnvelopeError::AlreadyRecorded {
                    version: envelope.version,
                    global_seq,
                });
            }
            if !seen_ids.insert(envelope.event_id.as_str()) {
                return Err(EnvelopeError::DuplicateEventIdInBatch {
                    event_id: envelope.event_id.clone(),
                });
            }
            let expected = starting_version + offset as i64;
            if envelope.version != expected {
                return Err(EnvelopeError::NonContiguousVersions {
                    expected,
                    actual: envelope.version,
                });
            }
        }

        Ok(Self {
            stream_id,
            stream_type,
            envelopes,
        })
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    /// Version of the first envelope; the store requires this to be the
    /// stream tip plus one.
    #[must_use]
    pub const fn starting_version(&self) -> i64 {
        self.envelopes.head.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.tail.len() + 1
    }

    /// A `NonEmpty` batch is never empty; this exists for clippy's benefit.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventEnvelope> {
        self.envelopes.iter()
    }

    /// Consume the batch, yielding its envelopes in order.
    #[must_use]
    pub fn into_envelopes(self) -> NonEmpty<EventEnvelope> {
        self.envelopes
    }
}

impl<'a> IntoIterator for &'a EventEnvelopeBatch {
    type IntoIter =
        std::iter::Chain<std::iter::Once<&'a EventEnvelope>, std::slice::Iter<'a, EventEnvelope>>;
    type Item = &'a EventEnvelope;

    fn into_iter(self) -> Self::IntoIter {
        std::iter::once(&self.envelopes.head).chain(self.envelopes.tail.iter())
    }
}
