//! Concrete implementations of the port traits.

pub mod cached_source;
pub mod clock_adapter;
pub mod csv_source;
pub mod file_config_adapter;
pub mod interval_cache;
pub mod memory_registry;
pub mod shm_dir_registry;
#[cfg(feature = "sqlite")]
pub mod sqlite_source;
