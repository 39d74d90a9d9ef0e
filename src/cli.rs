//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::adapters::cached_source::CachedSource;
use crate::adapters::clock_adapter::SystemClock;
use crate::adapters::csv_source::CsvSource;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::interval_cache::IntervalCacheStore;
use crate::adapters::memory_registry::MemoryRegistry;
use crate::adapters::shm_dir_registry::ShmDirRegistry;
use crate::domain::calendar::{TradingCalendar, WeekdayCalendar};
use crate::domain::config_validation::{
    cache_dir, dataset_settings, holidays_path, registry_settings, service_settings,
    source_settings, validate_config, DatasetKind, DatasetSettings, RegistryKind, SourceKind,
};
use crate::domain::dataset::DatasetMeta;
use crate::domain::datasets::corporate_actions::CorporateActionDataset;
use crate::domain::datasets::table_series::TableSeriesDataset;
use crate::domain::error::TidemarkError;
use crate::domain::object_id::ObjectId;
use crate::ports::clock_port::Clock;
use crate::ports::config_port::ConfigPort;
use crate::ports::registry_port::ObjectRegistry;
use crate::ports::source_port::SourcePort;
use crate::service::client::{DataClient, PublishedObject};
use crate::service::sync::{SyncHandle, SyncOutcome, SyncService};

const WORKER_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "tidemark", about = "Keeps date-indexed datasets fresh in a shared object registry")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sync service
    Serve {
        #[arg(short, long)]
        config: PathBuf,
        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Run a single sync cycle and print each dataset's outcome
    SyncOnce {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show what the registry holds for each configured dataset
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List the cache entries stored for a table
    CacheKeys {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        table: String,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Serve { config, cycles } => run_serve(&config, cycles),
        Command::SyncOnce { config } => run_sync_once(&config),
        Command::Status { config } => run_status(&config),
        Command::CacheKeys { config, table } => run_cache_keys(&config, &table),
        Command::Validate { config } => run_validate(&config),
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| {
        eprintln!("error: {e}");
        ExitCode::from(&e)
    })
}

fn fail(e: &TidemarkError) -> ExitCode {
    eprintln!("error: {e}");
    e.into()
}

pub fn build_registry(config: &dyn ConfigPort) -> Result<Arc<dyn ObjectRegistry>, TidemarkError> {
    let settings = registry_settings(config)?;
    Ok(match (settings.kind, settings.path) {
        (RegistryKind::Shm, Some(path)) => Arc::new(ShmDirRegistry::new(path, settings.capacity_bytes)),
        (RegistryKind::Shm, None) => {
            return Err(TidemarkError::ConfigMissing {
                section: "registry".into(),
                key: "path".into(),
            });
        }
        (RegistryKind::Memory, _) => Arc::new(MemoryRegistry::new(settings.capacity_bytes)),
    })
}

pub fn build_calendar(config: &dyn ConfigPort) -> Result<Arc<dyn TradingCalendar>, TidemarkError> {
    Ok(match holidays_path(config) {
        Some(path) => Arc::new(WeekdayCalendar::from_file(path)?),
        None => Arc::new(WeekdayCalendar::new()),
    })
}

/// Upstream source, wrapped in the interval cache unless `[source] cache` is off.
pub fn build_source(config: &dyn ConfigPort) -> Result<Arc<dyn SourcePort>, TidemarkError> {
    let settings = source_settings(config)?;
    let store = if settings.cache {
        Some(IntervalCacheStore::new(cache_dir(config)?)?)
    } else {
        None
    };

    match settings.kind {
        SourceKind::Csv => Ok(wrap(CsvSource::new(settings.path), store)),
        #[cfg(feature = "sqlite")]
        SourceKind::Sqlite => {
            use crate::adapters::sqlite_source::SqliteSource;
            Ok(wrap(SqliteSource::open(&settings.path, 4)?, store))
        }
        #[cfg(not(feature = "sqlite"))]
        SourceKind::Sqlite => Err(TidemarkError::ConfigInvalid {
            section: "source".into(),
            key: "kind".into(),
            reason: "sqlite feature is required for sqlite sources".into(),
        }),
    }
}

fn wrap<S: SourcePort + 'static>(source: S, store: Option<IntervalCacheStore>) -> Arc<dyn SourcePort> {
    match store {
        Some(store) => Arc::new(CachedSource::new(source, store)),
        None => Arc::new(source),
    }
}

fn dataset_meta(settings: &DatasetSettings) -> DatasetMeta {
    DatasetMeta::new(
        &settings.identity,
        &settings.name,
        settings.low_bound,
        settings.same_day,
    )
}

/// Builds the service and registers every configured dataset.
pub fn build_service(
    config: &dyn ConfigPort,
    clock: Arc<dyn Clock>,
) -> Result<SyncService, TidemarkError> {
    validate_config(config)?;
    let registry = build_registry(config)?;
    let calendar = build_calendar(config)?;
    let source = build_source(config)?;
    let service = SyncService::new(registry, clock, &service_settings(config)?);

    for settings in dataset_settings(config)? {
        let meta = dataset_meta(&settings);
        let added = match (settings.kind, settings.table.as_deref()) {
            (DatasetKind::TableSeries, Some(table)) => service.add_dataset(TableSeriesDataset::new(
                meta,
                table,
                Arc::clone(&source),
                Arc::clone(&calendar),
            )),
            (DatasetKind::TableSeries, None) => {
                return Err(TidemarkError::ConfigMissing {
                    section: format!("dataset.{}", settings.identity),
                    key: "table".into(),
                });
            }
            (DatasetKind::CorporateActions, _) => service.add_dataset(CorporateActionDataset::new(
                meta,
                Arc::clone(&source),
                Arc::clone(&calendar),
            )),
        };
        if !added {
            return Err(TidemarkError::ConfigInvalid {
                section: format!("dataset.{}", settings.identity),
                key: "<section>".into(),
                reason: "dataset collides with a registered dataset".into(),
            });
        }
    }
    Ok(service)
}

/// Waits on `shutdown` while the worker runs. Stops the worker and returns
/// `true` when `shutdown` fires first; returns `false` once the worker ends
/// on its own.
pub fn supervise<F>(handle: &SyncHandle, shutdown: F) -> io::Result<bool>
where
    F: Future<Output = io::Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        tokio::pin!(shutdown);
        let mut poll = tokio::time::interval(WORKER_POLL);
        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    if let Err(e) = signal {
                        return Err(e);
                    }
                    info!("received shutdown signal, stopping sync service");
                    handle.stop();
                    return Ok(true);
                }
                _ = poll.tick() => {
                    if handle.is_finished() {
                        return Ok(false);
                    }
                }
            }
        }
    })
}

/// Resolves on Ctrl-C or SIGTERM.
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Published size of each configured dataset, matched by registry object id.
pub fn dataset_presence(
    datasets: &[DatasetSettings],
    objects: &[PublishedObject],
) -> Vec<(String, Option<u64>)> {
    datasets
        .iter()
        .map(|settings| {
            let id = ObjectId::from_identity(&settings.identity);
            let size = objects
                .iter()
                .find(|o| o.object_id == id)
                .map(|o| o.data_size);
            (settings.identity.clone(), size)
        })
        .collect()
}

fn run_serve(config_path: &Path, cycles: Option<u64>) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let service = match build_service(&config, Arc::new(SystemClock)) {
        Ok(s) => Arc::new(s),
        Err(e) => return fail(&e),
    };

    let handle = match service.spawn(cycles) {
        Ok(h) => h,
        Err(e) => return fail(&e),
    };
    if let Err(e) = supervise(&handle, shutdown_signal()) {
        warn!(error = %e, "shutdown signal handling unavailable");
    }
    match handle.join() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

fn run_sync_once(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let service = match build_service(&config, Arc::new(SystemClock)) {
        Ok(s) => s,
        Err(e) => return fail(&e),
    };

    let report = service.run_cycle();
    let mut healthy = true;
    for status in service.statuses() {
        println!(
            "{}\t{}\t{}",
            status.identity,
            status.last_outcome,
            status.interval.high_water_mark()
        );
        if let Some(err) = &status.last_error {
            eprintln!("  {}: {err}", status.identity);
        }
        healthy &= !matches!(
            status.last_outcome,
            SyncOutcome::Failed | SyncOutcome::RegistryFull
        );
    }
    if report.interrupted || !healthy {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn run_status(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let result = (|| {
        let registry = build_registry(&config)?;
        let datasets = dataset_settings(&config)?;
        let mut client = DataClient::connect(registry.as_ref())?;
        let capacity = client.capacity()?;
        let objects = client.list()?;

        println!("registry: {} ({} bytes)", registry.endpoint(), capacity);
        for (identity, size) in dataset_presence(&datasets, &objects) {
            match size {
                Some(bytes) => println!("{identity}\tpublished\t{bytes}"),
                None => println!("{identity}\tabsent"),
            }
        }
        Ok::<(), TidemarkError>(())
    })();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

fn run_cache_keys(config_path: &Path, table: &str) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let keys = cache_dir(&config)
        .and_then(IntervalCacheStore::new)
        .and_then(|store| store.keys(table));
    match keys {
        Ok(keys) => {
            for key in keys {
                println!("{key}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn run_validate(config_path: &Path) -> ExitCode {
    eprintln!("Validating config: {}", config_path.display());
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    if let Err(e) = validate_config(&config) {
        return fail(&e);
    }
    match dataset_settings(&config) {
        Ok(datasets) => {
            println!("Config is valid: {} dataset(s)", datasets.len());
            for d in datasets {
                println!("  {} ({:?}) from {}", d.identity, d.kind, d.low_bound);
            }
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::clock_adapter::FixedClock;
    use crate::domain::config_validation::ServiceSettings;
    use crate::service::sync::ServiceState;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn dataset(identity: &str) -> DatasetSettings {
        DatasetSettings {
            identity: identity.to_string(),
            kind: DatasetKind::CorporateActions,
            table: None,
            name: identity.to_string(),
            low_bound: d(2020, 1, 1),
            same_day: false,
        }
    }

    fn object(identity: &str, data_size: u64) -> PublishedObject {
        let object_id = ObjectId::from_identity(identity);
        PublishedObject {
            identity: object_id.identity(),
            object_id,
            data_size,
        }
    }

    #[test]
    fn presence_matches_long_and_padded_identities() {
        let datasets = vec![
            dataset("daily_bars_adjusted_for_splits"),
            dataset("bars_"),
            dataset("actions"),
        ];
        let objects = vec![
            object("daily_bars_adjusted_for_splits", 40),
            object("bars_", 7),
        ];
        assert_eq!(
            dataset_presence(&datasets, &objects),
            vec![
                ("daily_bars_adjusted_for_splits".to_string(), Some(40)),
                ("bars_".to_string(), Some(7)),
                ("actions".to_string(), None),
            ]
        );
    }

    #[test]
    fn shutdown_stops_a_running_worker() {
        let service = Arc::new(SyncService::new(
            Arc::new(MemoryRegistry::new(1 << 20)),
            Arc::new(FixedClock::new(d(2024, 1, 10))),
            &ServiceSettings {
                update_interval: Duration::from_secs(3600),
                ..ServiceSettings::default()
            },
        ));
        let handle = Arc::clone(&service).spawn(None).unwrap();

        assert!(supervise(&handle, async { Ok(()) }).unwrap());
        handle.join().unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[test]
    fn finished_worker_ends_supervision() {
        let service = Arc::new(SyncService::new(
            Arc::new(MemoryRegistry::new(1 << 20)),
            Arc::new(FixedClock::new(d(2024, 1, 10))),
            &ServiceSettings::default(),
        ));
        let handle = Arc::clone(&service).spawn(Some(1)).unwrap();

        let stopped = supervise(&handle, std::future::pending()).unwrap();
        assert!(!stopped);
        handle.join().unwrap();
    }
}
