//! In-memory stream index for tests.
//!
//! Keeps the forward (natural key to entry) and reverse (stream id to
//! natural key) maps in process memory behind an `RwLock`. Like the
//! in-memory event store, this is a test harness adapter: it offers no
//! cross-process coordination and must not be shared by concurrent
//! production writers.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

use crate::index::{IndexEntry, NaturalKey, StreamIndex, StreamIndexError};

/// In-memory [`StreamIndex`]. Cloning is cheap and clones share state.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<NaturalKey, IndexEntry>,
    by_stream: HashMap<String, NaturalKey>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_poisoned() -> StreamIndexError {
        StreamIndexError::unavailable(std::io::Error::other("in-memory index lock poisoned"))
    }

    fn reserve_sync(
        &self,
        natural_key: &NaturalKey,
        stream_id: &str,
    ) -> Result<(), StreamIndexError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_poisoned())?;

        if let Some(entry) = inner.by_key.get(natural_key) {
            if entry.stream_id == stream_id {
                // Idempotent retry of an earlier reservation.
                return Ok(());
            }
            return Err(StreamIndexError::NaturalKeyAlreadyBound {
                natural_key: natural_key.clone(),
                existing_stream_id: entry.stream_id.clone(),
            });
        }
        if let Some(existing_key) = inner.by_stream.get(stream_id) {
            return Err(StreamIndexError::StreamIdAlreadyBound {
                stream_id: stream_id.to_string(),
                existing_key: existing_key.clone(),
            });
        }

        inner.by_key.insert(
            natural_key.clone(),
            IndexEntry {
                natural_key: natural_key.clone(),
                stream_id: stream_id.to_string(),
                version: 0,
            },
        );
        inner
            .by_stream
            .insert(stream_id.to_string(), natural_key.clone());
        drop(inner);
        tracing::debug!(%natural_key, stream_id, "natural key reserved");
        Ok(())
    }

    fn update_version_sync(&self, stream_id: &str, version: i64) -> Result<(), StreamIndexError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_poisoned())?;
        let Some(natural_key) = inner.by_stream.get(stream_id).cloned() else {
            // Unknown stream: silent no-op by contract.
            return Ok(());
        };
        if let Some(entry) = inner.by_key.get_mut(&natural_key)
            && version > entry.version
        {
            entry.version = version;
        }
        Ok(())
    }
}

impl StreamIndex for Store {
    #[tracing::instrument(skip(self, natural_key), fields(%natural_key))]
    fn lookup<'a>(
        &'a self,
        natural_key: &'a NaturalKey,
    ) -> impl Future<Output = Result<Option<IndexEntry>, StreamIndexError>> + Send + 'a {
        let result = self
            .inner
            .read()
            .map_err(|_| Self::lock_poisoned())
            .map(|inner| inner.by_key.get(natural_key).cloned());
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, natural_key), fields(%natural_key, stream_id))]
    fn reserve<'a>(
        &'a self,
        natural_key: &'a NaturalKey,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), StreamIndexError>> + Send + 'a {
        std::future::ready(self.reserve_sync(natural_key, stream_id))
    }

    #[tracing::instrument(skip(self))]
    fn update_version<'a>(
        &'a self,
        stream_id: &'a str,
        version: i64,
    ) -> impl Future<Output = Result<(), StreamIndexError>> + Send + 'a {
        std::future::ready(self.update_version_sync(stream_id, version))
    }
}
