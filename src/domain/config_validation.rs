//! Configuration validation.
//!
//! Every section is checked up front and turned into typed settings so the
//! service never starts with a half-usable configuration.

use crate::domain::error::TidemarkError;
use crate::domain::object_id::ObjectId;
use crate::ports::config_port::ConfigPort;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DATASET_SECTION_PREFIX: &str = "dataset.";

const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 300;
const DEFAULT_DELETE_RETRY_BUDGET: u32 = 120;
const DEFAULT_DELETE_RETRY_INTERVAL_MS: u64 = 1000;
const DEFAULT_REGISTRY_CAPACITY_MB: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub update_interval: Duration,
    pub delete_retry_budget: u32,
    pub delete_retry_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS),
            delete_retry_budget: DEFAULT_DELETE_RETRY_BUDGET,
            delete_retry_interval: Duration::from_millis(DEFAULT_DELETE_RETRY_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Shm,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub kind: RegistryKind,
    pub path: Option<PathBuf>,
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Csv,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub path: PathBuf,
    pub cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    TableSeries,
    CorporateActions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSettings {
    pub identity: String,
    pub kind: DatasetKind,
    pub table: Option<String>,
    pub name: String,
    pub low_bound: NaiveDate,
    pub same_day: bool,
}

/// Validates the whole file; returns the first problem found.
pub fn validate_config(config: &dyn ConfigPort) -> Result<(), TidemarkError> {
    service_settings(config)?;
    registry_settings(config)?;
    cache_dir(config)?;
    source_settings(config)?;
    let datasets = dataset_settings(config)?;
    if datasets.is_empty() {
        return Err(TidemarkError::ConfigMissing {
            section: "dataset.<name>".to_string(),
            key: "kind".to_string(),
        });
    }

    let mut owners: BTreeMap<ObjectId, &str> = BTreeMap::new();
    for dataset in &datasets {
        let id = ObjectId::from_identity(&dataset.identity);
        if let Some(first) = owners.insert(id, &dataset.identity) {
            return Err(TidemarkError::ConfigInvalid {
                section: format!("{DATASET_SECTION_PREFIX}{}", dataset.identity),
                key: "<section>".to_string(),
                reason: format!(
                    "identity \"{}\" maps to the same registry object as \"{first}\"",
                    dataset.identity
                ),
            });
        }
    }
    Ok(())
}

pub fn service_settings(config: &dyn ConfigPort) -> Result<ServiceSettings, TidemarkError> {
    let interval = positive_int(
        config,
        "service",
        "update_interval_secs",
        DEFAULT_UPDATE_INTERVAL_SECS,
    )?;
    let budget = positive_int(
        config,
        "service",
        "delete_retry_budget",
        u64::from(DEFAULT_DELETE_RETRY_BUDGET),
    )?;
    let retry_ms = positive_int(
        config,
        "service",
        "delete_retry_interval_ms",
        DEFAULT_DELETE_RETRY_INTERVAL_MS,
    )?;

    Ok(ServiceSettings {
        update_interval: Duration::from_secs(interval),
        delete_retry_budget: u32::try_from(budget).map_err(|_| TidemarkError::ConfigInvalid {
            section: "service".to_string(),
            key: "delete_retry_budget".to_string(),
            reason: "delete_retry_budget is too large".to_string(),
        })?,
        delete_retry_interval: Duration::from_millis(retry_ms),
    })
}

pub fn registry_settings(config: &dyn ConfigPort) -> Result<RegistrySettings, TidemarkError> {
    let kind = match config.get_string("registry", "kind").as_deref().map(str::trim) {
        None | Some("shm") => RegistryKind::Shm,
        Some("memory") => RegistryKind::Memory,
        Some(other) => {
            return Err(TidemarkError::ConfigInvalid {
                section: "registry".to_string(),
                key: "kind".to_string(),
                reason: format!("unknown registry kind {other:?}, expected shm or memory"),
            });
        }
    };

    let path = non_empty(config, "registry", "path").map(PathBuf::from);
    if kind == RegistryKind::Shm && path.is_none() {
        return Err(TidemarkError::ConfigMissing {
            section: "registry".to_string(),
            key: "path".to_string(),
        });
    }

    let capacity_mb = positive_int(config, "registry", "capacity_mb", DEFAULT_REGISTRY_CAPACITY_MB)?;
    Ok(RegistrySettings {
        kind,
        path,
        capacity_bytes: capacity_mb.saturating_mul(1024 * 1024),
    })
}

pub fn cache_dir(config: &dyn ConfigPort) -> Result<PathBuf, TidemarkError> {
    non_empty(config, "cache", "dir")
        .map(PathBuf::from)
        .ok_or_else(|| TidemarkError::ConfigMissing {
            section: "cache".to_string(),
            key: "dir".to_string(),
        })
}

pub fn source_settings(config: &dyn ConfigPort) -> Result<SourceSettings, TidemarkError> {
    let kind = match non_empty(config, "source", "kind").as_deref() {
        Some("csv") => SourceKind::Csv,
        Some("sqlite") => SourceKind::Sqlite,
        Some(other) => {
            return Err(TidemarkError::ConfigInvalid {
                section: "source".to_string(),
                key: "kind".to_string(),
                reason: format!("unknown source kind {other:?}, expected csv or sqlite"),
            });
        }
        None => {
            return Err(TidemarkError::ConfigMissing {
                section: "source".to_string(),
                key: "kind".to_string(),
            });
        }
    };

    let path = non_empty(config, "source", "path")
        .map(PathBuf::from)
        .ok_or_else(|| TidemarkError::ConfigMissing {
            section: "source".to_string(),
            key: "path".to_string(),
        })?;

    Ok(SourceSettings {
        kind,
        path,
        cache: config.get_bool("source", "cache", true),
    })
}

pub fn holidays_path(config: &dyn ConfigPort) -> Option<PathBuf> {
    non_empty(config, "calendar", "holidays").map(PathBuf::from)
}

/// All `[dataset.NAME]` sections, sorted by identity.
pub fn dataset_settings(config: &dyn ConfigPort) -> Result<Vec<DatasetSettings>, TidemarkError> {
    let mut sections: Vec<String> = config
        .sections()
        .into_iter()
        .filter(|s| s.starts_with(DATASET_SECTION_PREFIX))
        .collect();
    sections.sort();

    sections
        .iter()
        .map(|section| parse_dataset(config, section))
        .collect()
}

fn parse_dataset(config: &dyn ConfigPort, section: &str) -> Result<DatasetSettings, TidemarkError> {
    let identity = section[DATASET_SECTION_PREFIX.len()..].to_string();
    if identity.is_empty() || identity.contains(':') || identity.contains('/') {
        return Err(TidemarkError::ConfigInvalid {
            section: section.to_string(),
            key: "<section>".to_string(),
            reason: "dataset identity must be non-empty and free of ':' and '/'".to_string(),
        });
    }

    let kind = match non_empty(config, section, "kind").as_deref() {
        Some("table_series") => DatasetKind::TableSeries,
        Some("corporate_actions") => DatasetKind::CorporateActions,
        Some(other) => {
            return Err(TidemarkError::ConfigInvalid {
                section: section.to_string(),
                key: "kind".to_string(),
                reason: format!(
                    "unknown dataset kind {other:?}, expected table_series or corporate_actions"
                ),
            });
        }
        None => {
            return Err(TidemarkError::ConfigMissing {
                section: section.to_string(),
                key: "kind".to_string(),
            });
        }
    };

    let table = non_empty(config, section, "table");
    if kind == DatasetKind::TableSeries && table.is_none() {
        return Err(TidemarkError::ConfigMissing {
            section: section.to_string(),
            key: "table".to_string(),
        });
    }

    let low_bound = match non_empty(config, section, "low_bound") {
        None => {
            return Err(TidemarkError::ConfigMissing {
                section: section.to_string(),
                key: "low_bound".to_string(),
            });
        }
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| {
            TidemarkError::ConfigInvalid {
                section: section.to_string(),
                key: "low_bound".to_string(),
                reason: "invalid low_bound format, expected YYYY-MM-DD".to_string(),
            }
        })?,
    };

    Ok(DatasetSettings {
        name: non_empty(config, section, "name").unwrap_or_else(|| identity.clone()),
        identity,
        kind,
        table,
        low_bound,
        same_day: config.get_bool(section, "same_day", false),
    })
}

fn non_empty(config: &dyn ConfigPort, section: &str, key: &str) -> Option<String> {
    config
        .get_string(section, key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn positive_int(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: u64,
) -> Result<u64, TidemarkError> {
    let Some(raw) = non_empty(config, section, key) else {
        return Ok(default);
    };
    match raw.parse::<u64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(TidemarkError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: format!("{key} must be a positive integer, got {raw:?}"),
        }),
    }
}
