//! Publishes dataset values into the shared object registry.
//!
//! Objects are immutable, so an update is delete-then-put under the same
//! identity-derived id. Deletion is reclaimed asynchronously by the store and
//! an object pinned by this process's own connection is never reclaimed, so
//! the publisher reconnects before deleting and then polls `contains` for a
//! bounded number of attempts.

use crate::domain::error::TidemarkError;
use crate::domain::object_id::ObjectId;
use crate::ports::registry_port::{ObjectRegistry, RegistryConnection};
use crate::service::stop::StopSignal;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub budget: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 120,
            interval: Duration::from_secs(1),
        }
    }
}

/// Registry state of one dataset identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCheck {
    pub identity: String,
    pub object_id: ObjectId,
    pub data_size: Option<u64>,
}

impl ObjectCheck {
    pub fn present(&self) -> bool {
        self.data_size.is_some()
    }
}

pub struct SharedObjectPublisher {
    registry: Arc<dyn ObjectRegistry>,
    retry: RetryPolicy,
    stop: StopSignal,
    conn: Mutex<Option<Box<dyn RegistryConnection>>>,
}

impl SharedObjectPublisher {
    pub fn new(registry: Arc<dyn ObjectRegistry>, retry: RetryPolicy, stop: StopSignal) -> Self {
        Self {
            registry,
            retry,
            stop,
            conn: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> String {
        self.registry.endpoint()
    }

    /// Runs `f` on the long-lived connection, connecting first if needed. A
    /// connection that reported the registry unavailable is discarded.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut dyn RegistryConnection) -> Result<T, TidemarkError>,
    ) -> Result<T, TidemarkError> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(self.registry.connect()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(TidemarkError::registry("connection lost"));
        };
        let result = f(conn.as_mut());
        if let Err(TidemarkError::RegistryUnavailable { .. }) = &result {
            *guard = None;
        }
        result
    }

    /// Drops the current connection, releasing everything it pinned.
    fn disconnect(&self) {
        self.conn.lock().take();
    }

    /// Non-blocking lookup of the published bytes.
    pub fn current_value(&self, identity: &str) -> Result<Option<Vec<u8>>, TidemarkError> {
        let id = ObjectId::from_identity(identity);
        self.with_conn(|c| c.get(&id, Duration::ZERO))
    }

    pub fn contains(&self, identity: &str) -> Result<bool, TidemarkError> {
        let id = ObjectId::from_identity(identity);
        self.with_conn(|c| c.contains(&id))
    }

    /// Publishes `bytes` as the value of `identity`, replacing any previous
    /// object. Fails with `RegistryFull` before touching the old object when
    /// the new one cannot fit.
    pub fn replace(&self, identity: &str, bytes: &[u8]) -> Result<ObjectId, TidemarkError> {
        let id = ObjectId::from_identity(identity);

        let (exists, existing_size, used, capacity) = self.with_conn(|c| {
            let objects = c.list()?;
            let capacity = c.capacity()?;
            let used: u64 = objects.values().map(|info| info.data_size).sum();
            let existing = objects.get(&id).map(|info| info.data_size);
            Ok((c.contains(&id)?, existing, used, capacity))
        })?;

        let needed = bytes.len() as u64;
        let available = capacity.saturating_sub(used) + existing_size.unwrap_or(0);
        if needed > available {
            return Err(TidemarkError::RegistryFull {
                needed,
                available,
                capacity,
            });
        }

        if exists {
            self.disconnect();
            self.delete_and_wait(identity, &id)?;
        }

        let stored = self.with_conn(|c| c.put(bytes, &id))?;
        info!(dataset = identity, object_id = %stored, bytes = needed, "published");
        Ok(stored)
    }

    /// Deletes the object of `identity`. Returns whether deletion was
    /// confirmed; `Ok(false)` also covers an already absent object.
    pub fn remove(&self, identity: &str) -> Result<bool, TidemarkError> {
        let id = ObjectId::from_identity(identity);
        if !self.with_conn(|c| c.contains(&id))? {
            return Ok(false);
        }
        self.disconnect();
        self.delete_and_wait(identity, &id)
    }

    fn delete_and_wait(&self, identity: &str, id: &ObjectId) -> Result<bool, TidemarkError> {
        self.with_conn(|c| c.delete(std::slice::from_ref(id)))?;

        for attempt in 1..=self.retry.budget {
            if !self.with_conn(|c| c.contains(id))? {
                debug!(dataset = identity, object_id = %id, attempt, "deletion confirmed");
                return Ok(true);
            }
            if self.stop.wait_timeout(self.retry.interval) {
                return Err(TidemarkError::Interrupted);
            }
        }

        if !self.with_conn(|c| c.contains(id))? {
            return Ok(true);
        }
        warn!(
            dataset = identity,
            object_id = %id,
            attempts = self.retry.budget,
            "deletion not confirmed, proceeding"
        );
        Ok(false)
    }

    /// Existence and size of each identity's object, read through a
    /// short-lived connection.
    pub fn self_check(&self, identities: &[String]) -> Result<Vec<ObjectCheck>, TidemarkError> {
        let mut conn = self.registry.connect()?;
        let objects = conn.list()?;
        Ok(identities
            .iter()
            .map(|identity| {
                let object_id = ObjectId::from_identity(identity);
                ObjectCheck {
                    identity: identity.clone(),
                    object_id,
                    data_size: objects.get(&object_id).map(|info| info.data_size),
                }
            })
            .collect())
    }
}
