//! Object registry on a shared directory, typically under `/dev/shm`.
//!
//! Every object is one file named by the hex form of its id. Writes go to a
//! temporary name first and are renamed into place, so readers in other
//! processes never observe a partial object.

use crate::domain::error::TidemarkError;
use crate::domain::object_id::ObjectId;
use crate::ports::registry_port::{ObjectInfo, ObjectRegistry, RegistryConnection};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const OBJECT_EXT: &str = "obj";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    capacity: u64,
}

#[derive(Debug, Clone)]
pub struct ShmDirRegistry {
    inner: Arc<Inner>,
}

impl ShmDirRegistry {
    pub fn new<P: AsRef<Path>>(dir: P, capacity: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.as_ref().to_path_buf(),
                capacity,
            }),
        }
    }
}

impl ObjectRegistry for ShmDirRegistry {
    fn endpoint(&self) -> String {
        self.inner.dir.display().to_string()
    }

    fn connect(&self) -> Result<Box<dyn RegistryConnection>, TidemarkError> {
        fs::create_dir_all(&self.inner.dir).map_err(|e| {
            TidemarkError::registry(format!("{}: {}", self.inner.dir.display(), e))
        })?;
        Ok(Box::new(ShmDirConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct ShmDirConnection {
    inner: Arc<Inner>,
}

impl ShmDirConnection {
    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.inner.dir.join(format!("{}.{OBJECT_EXT}", id.to_hex()))
    }

    fn temp_path(&self, id: &ObjectId) -> PathBuf {
        self.inner
            .dir
            .join(format!(".{}.{}.tmp", id.to_hex(), std::process::id()))
    }

    fn read(&self, id: &ObjectId) -> Result<Option<Vec<u8>>, TidemarkError> {
        match fs::read(self.object_path(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TidemarkError::registry(e)),
        }
    }

    fn scan(&self) -> Result<BTreeMap<ObjectId, ObjectInfo>, TidemarkError> {
        let entries = fs::read_dir(&self.inner.dir).map_err(TidemarkError::registry)?;
        let mut objects = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(TidemarkError::registry)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(OBJECT_EXT) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(ObjectId::from_hex)
            else {
                continue;
            };
            let data_size = entry.metadata().map_err(TidemarkError::registry)?.len();
            objects.insert(id, ObjectInfo { data_size });
        }
        Ok(objects)
    }
}

impl RegistryConnection for ShmDirConnection {
    fn get(&mut self, id: &ObjectId, timeout: Duration) -> Result<Option<Vec<u8>>, TidemarkError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(bytes) = self.read(id)? {
                return Ok(Some(bytes));
            }
            let pause = match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(None),
                Some(deadline) => POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())),
                None => POLL_INTERVAL,
            };
            thread::sleep(pause);
        }
    }

    fn contains(&mut self, id: &ObjectId) -> Result<bool, TidemarkError> {
        Ok(self.object_path(id).exists())
    }

    fn put(&mut self, value: &[u8], id: &ObjectId) -> Result<ObjectId, TidemarkError> {
        let path = self.object_path(id);
        if path.exists() {
            return Err(TidemarkError::ObjectExists {
                object_id: id.to_hex(),
            });
        }

        let used: u64 = self.scan()?.values().map(|info| info.data_size).sum();
        let needed = value.len() as u64;
        let available = self.inner.capacity.saturating_sub(used);
        if needed > available {
            return Err(TidemarkError::RegistryFull {
                needed,
                available,
                capacity: self.inner.capacity,
            });
        }

        let tmp = self.temp_path(id);
        fs::write(&tmp, value).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            TidemarkError::registry(e)
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            TidemarkError::registry(e)
        })?;
        debug!(object_id = %id, bytes = needed, "object sealed");
        Ok(*id)
    }

    fn delete(&mut self, ids: &[ObjectId]) -> Result<(), TidemarkError> {
        for id in ids {
            match fs::remove_file(self.object_path(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(TidemarkError::registry(e)),
            }
        }
        Ok(())
    }

    fn list(&mut self) -> Result<BTreeMap<ObjectId, ObjectInfo>, TidemarkError> {
        self.scan()
    }

    fn capacity(&mut self) -> Result<u64, TidemarkError> {
        Ok(self.inner.capacity)
    }
}
