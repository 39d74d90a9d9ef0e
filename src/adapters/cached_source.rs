//! Read-through cache in front of an upstream source.

use crate::adapters::interval_cache::IntervalCacheStore;
use crate::domain::cache_key::CacheKey;
use crate::domain::error::TidemarkError;
use crate::domain::frame::Frame;
use crate::domain::range::TimeRange;
use crate::ports::source_port::SourcePort;
use tracing::{debug, warn};

/// Serves range queries from the [`IntervalCacheStore`] when a stored entry
/// covers them and writes upstream results back. Cache failures only cost a
/// round trip to the upstream source.
pub struct CachedSource<S> {
    inner: S,
    store: IntervalCacheStore,
}

impl<S: SourcePort> CachedSource<S> {
    pub fn new(inner: S, store: IntervalCacheStore) -> Self {
        Self { inner, store }
    }

    pub fn store(&self) -> &IntervalCacheStore {
        &self.store
    }

    fn cached(&self, key: &CacheKey) -> Option<Frame> {
        match self.store.contains(key).and_then(|hit| {
            if hit {
                self.store.get(key, None)
            } else {
                Ok(None)
            }
        }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, going upstream");
                None
            }
        }
    }
}

impl<S: SourcePort> SourcePort for CachedSource<S> {
    fn query(&self, table: &str, range: Option<TimeRange>) -> Result<Frame, TidemarkError> {
        let key = match range {
            Some(r) => CacheKey::range(table, r)?,
            None => CacheKey::version(table, None)?,
        };

        if let Some(frame) = self.cached(&key) {
            debug!(key = %key, rows = frame.len(), "cache hit");
            return Ok(frame);
        }

        let frame = self.inner.query(table, range)?;
        if let Err(e) = self.store.put(&frame, &key) {
            warn!(key = %key, error = %e, "cache write failed");
        }
        Ok(frame)
    }

    fn list_tables(&self) -> Result<Vec<String>, TidemarkError> {
        self.inner.list_tables()
    }
}
