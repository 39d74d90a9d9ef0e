//! Shared-memory object registry port.
//!
//! Mirrors the primitive set of a plasma-style object store: connections are
//! cheap, objects are immutable byte blobs under fixed-width ids, and deletion
//! may be reclaimed asynchronously, so `contains` can keep answering `true`
//! for a while after `delete` returns.

use crate::domain::error::TidemarkError;
use crate::domain::object_id::ObjectId;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub data_size: u64,
}

pub trait ObjectRegistry: Send + Sync {
    fn endpoint(&self) -> String;

    /// Opens a connection. Dropping it disconnects and releases every object
    /// reference it held.
    fn connect(&self) -> Result<Box<dyn RegistryConnection>, TidemarkError>;
}

pub trait RegistryConnection: Send {
    /// Waits up to `timeout` for the object. `Ok(None)` is the "not available"
    /// sentinel. A successful get pins the object for the life of the connection.
    fn get(&mut self, id: &ObjectId, timeout: Duration) -> Result<Option<Vec<u8>>, TidemarkError>;

    fn contains(&mut self, id: &ObjectId) -> Result<bool, TidemarkError>;

    /// Fails with `ObjectExists` if the id is still present and with
    /// `RegistryFull` if the value does not fit.
    fn put(&mut self, value: &[u8], id: &ObjectId) -> Result<ObjectId, TidemarkError>;

    fn delete(&mut self, ids: &[ObjectId]) -> Result<(), TidemarkError>;

    fn list(&mut self) -> Result<BTreeMap<ObjectId, ObjectInfo>, TidemarkError>;

    /// Total capacity in bytes.
    fn capacity(&mut self) -> Result<u64, TidemarkError>;
}
