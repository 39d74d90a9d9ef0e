//! Sync service: keeps every registered dataset's published value current.
//!
//! One cycle walks a snapshot of the registered datasets in identity order.
//! For each dataset it reads the published value, asks the dataset which
//! ranges are missing, fetches and folds them in, publishes the result and
//! advances the high-water mark. A failing dataset never stops the cycle.

use crate::domain::dataset::{DatasetMeta, TrackedDataset, TrackedInterval};
use crate::domain::error::TidemarkError;
use crate::domain::object_id::ObjectId;
use crate::domain::config_validation::ServiceSettings;
use crate::ports::clock_port::Clock;
use crate::ports::registry_port::ObjectRegistry;
use crate::service::publisher::{ObjectCheck, RetryPolicy, SharedObjectPublisher};
use crate::service::stop::StopSignal;
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Scanning,
    Checking,
    Fetching,
    Merging,
    Publishing,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Idle => "idle",
            ServiceState::Scanning => "scanning",
            ServiceState::Checking => "checking",
            ServiceState::Fetching => "fetching",
            ServiceState::Merging => "merging",
            ServiceState::Publishing => "publishing",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    NotRun,
    UpToDate,
    Published {
        object_id: ObjectId,
        merged: usize,
        failed: usize,
    },
    /// Skipped this cycle because the registry has no room.
    RegistryFull,
    Failed,
    Interrupted,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::NotRun => f.write_str("not run"),
            SyncOutcome::UpToDate => f.write_str("up to date"),
            SyncOutcome::Published { merged, failed, .. } => {
                write!(f, "published ({merged} merged, {failed} failed)")
            }
            SyncOutcome::RegistryFull => f.write_str("registry full"),
            SyncOutcome::Failed => f.write_str("failed"),
            SyncOutcome::Interrupted => f.write_str("interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStatus {
    pub identity: String,
    pub name: String,
    pub interval: TrackedInterval,
    pub object_id: ObjectId,
    pub last_outcome: SyncOutcome,
    pub last_error: Option<String>,
}

impl DatasetStatus {
    fn new(meta: &DatasetMeta) -> Self {
        Self {
            identity: meta.identity.clone(),
            name: meta.name.clone(),
            interval: meta.interval,
            object_id: ObjectId::from_identity(&meta.identity),
            last_outcome: SyncOutcome::NotRun,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(String, SyncOutcome)>,
    pub checks: Vec<ObjectCheck>,
    pub interrupted: bool,
}

impl CycleReport {
    pub fn outcome(&self, identity: &str) -> Option<&SyncOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == identity)
            .map(|(_, outcome)| outcome)
    }
}

/// Everything one dataset step needs from the service.
pub struct SyncContext<'a> {
    pub publisher: &'a SharedObjectPublisher,
    pub today: NaiveDate,
    pub stop: &'a StopSignal,
    state: &'a Mutex<ServiceState>,
}

impl SyncContext<'_> {
    fn enter(&self, state: ServiceState) {
        *self.state.lock() = state;
    }
}

/// Object-safe view of a [`TrackedDataset`] so datasets with different value
/// types can live in one registry.
pub trait SyncUnit: Send {
    fn meta(&self) -> &DatasetMeta;

    fn sync(&mut self, ctx: &SyncContext<'_>) -> Result<SyncOutcome, TidemarkError>;
}

impl<D: TrackedDataset> SyncUnit for D {
    fn meta(&self) -> &DatasetMeta {
        TrackedDataset::meta(self)
    }

    fn sync(&mut self, ctx: &SyncContext<'_>) -> Result<SyncOutcome, TidemarkError> {
        let identity = TrackedDataset::meta(self).identity.clone();

        ctx.enter(ServiceState::Checking);
        let current = match ctx.publisher.current_value(&identity)? {
            Some(bytes) => Some(self.deserialize(&bytes)?),
            None => None,
        };
        let missing = self.check(current.as_ref(), ctx.today)?;
        if missing.is_empty() {
            return Ok(SyncOutcome::UpToDate);
        }
        debug!(ranges = missing.len(), "missing ranges found");

        let mut acc = current;
        let mut last_end = None;
        let mut merged = 0;
        let mut failures = Vec::new();
        let mut interrupted = false;
        for range in missing {
            if ctx.stop.is_stopped() {
                interrupted = true;
                break;
            }
            ctx.enter(ServiceState::Fetching);
            let fetched = match self.fetch(range) {
                Ok(value) => value,
                Err(e) => {
                    warn!(range = %range, error = %e, "fetch failed, range skipped");
                    failures.push(e);
                    continue;
                }
            };

            ctx.enter(ServiceState::Merging);
            let next = match &acc {
                Some(old) => self.merge(old.clone(), fetched),
                None => Ok(fetched),
            };
            match next {
                Ok(value) => {
                    acc = Some(value);
                    last_end = Some(range.end());
                    merged += 1;
                }
                Err(e) => {
                    warn!(range = %range, error = %e, "merge failed, range skipped");
                    failures.push(e);
                }
            }
        }

        let (Some(value), Some(end)) = (acc, last_end) else {
            if interrupted {
                return Ok(SyncOutcome::Interrupted);
            }
            return Err(failures
                .pop()
                .unwrap_or_else(|| TidemarkError::integrity("no range fetched")));
        };

        ctx.enter(ServiceState::Publishing);
        let bytes = self.serialize(&value)?;
        let object_id = ctx.publisher.replace(&identity, &bytes)?;
        self.meta_mut().interval.advance(end);

        if interrupted {
            debug!(merged, "stop requested, merged ranges published");
            return Ok(SyncOutcome::Interrupted);
        }
        Ok(SyncOutcome::Published {
            object_id,
            merged,
            failed: failures.len(),
        })
    }
}

type SharedUnit = Arc<Mutex<Box<dyn SyncUnit>>>;

#[derive(Clone)]
struct Entry {
    unit: SharedUnit,
    status: Arc<Mutex<DatasetStatus>>,
}

pub struct SyncService {
    datasets: RwLock<BTreeMap<String, Entry>>,
    publisher: SharedObjectPublisher,
    clock: Arc<dyn Clock>,
    update_interval: Duration,
    stop: StopSignal,
    state: Mutex<ServiceState>,
}

impl SyncService {
    pub fn new(
        registry: Arc<dyn ObjectRegistry>,
        clock: Arc<dyn Clock>,
        settings: &ServiceSettings,
    ) -> Self {
        let stop = StopSignal::new();
        let retry = RetryPolicy {
            budget: settings.delete_retry_budget,
            interval: settings.delete_retry_interval,
        };
        Self {
            datasets: RwLock::new(BTreeMap::new()),
            publisher: SharedObjectPublisher::new(registry, retry, stop.clone()),
            clock,
            update_interval: settings.update_interval,
            stop,
            state: Mutex::new(ServiceState::Idle),
        }
    }

    /// Registers a dataset. Returns `false`, leaving the registered one in
    /// place, when the identity is already taken or maps to the same registry
    /// object as a registered identity.
    pub fn add_dataset<D>(&self, dataset: D) -> bool
    where
        D: TrackedDataset + 'static,
    {
        let meta = TrackedDataset::meta(&dataset);
        let identity = meta.identity.clone();
        let status = DatasetStatus::new(meta);

        let mut datasets = self.datasets.write();
        if datasets.contains_key(&identity) {
            warn!(dataset = %identity, "dataset already registered");
            return false;
        }
        let clash = datasets
            .iter()
            .find(|(_, entry)| entry.status.lock().object_id == status.object_id)
            .map(|(other, _)| other.clone());
        if let Some(other) = clash {
            warn!(
                dataset = %identity,
                registered = %other,
                object_id = %status.object_id,
                "dataset maps to a registered object id"
            );
            return false;
        }
        let unit: Box<dyn SyncUnit> = Box::new(dataset);
        datasets.insert(
            identity.clone(),
            Entry {
                unit: Arc::new(Mutex::new(unit)),
                status: Arc::new(Mutex::new(status)),
            },
        );
        info!(dataset = %identity, "dataset registered");
        true
    }

    /// Unregisters a dataset and deletes its published object.
    pub fn remove_dataset(&self, identity: &str) -> Result<bool, TidemarkError> {
        let removed = self.datasets.write().remove(identity).is_some();
        if removed {
            self.publisher.remove(identity)?;
            info!(dataset = identity, "dataset removed");
        }
        Ok(removed)
    }

    pub fn has_dataset(&self, identity: &str) -> bool {
        self.datasets.read().contains_key(identity)
    }

    pub fn dataset_ids(&self) -> Vec<String> {
        self.datasets.read().keys().cloned().collect()
    }

    pub fn status(&self, identity: &str) -> Option<DatasetStatus> {
        let entry = self.datasets.read().get(identity).cloned()?;
        let status = entry.status.lock().clone();
        Some(status)
    }

    pub fn statuses(&self) -> Vec<DatasetStatus> {
        let entries: Vec<Entry> = self.datasets.read().values().cloned().collect();
        entries.iter().map(|e| e.status.lock().clone()).collect()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn publisher(&self) -> &SharedObjectPublisher {
        &self.publisher
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    fn enter(&self, state: ServiceState) {
        *self.state.lock() = state;
    }

    /// One pass over every registered dataset followed by a registry self-check.
    pub fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        if self.stop.is_stopped() {
            self.enter(ServiceState::Stopped);
            report.interrupted = true;
            return report;
        }

        self.enter(ServiceState::Scanning);
        let snapshot: Vec<(String, Entry)> = self
            .datasets
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let today = self.clock.today();
        debug!(datasets = snapshot.len(), %today, "cycle started");

        for (identity, entry) in &snapshot {
            if self.stop.is_stopped() {
                report.interrupted = true;
                break;
            }
            let span = info_span!("dataset", dataset = %identity);
            let _guard = span.enter();

            let (result, interval) = {
                let mut unit = entry.unit.lock();
                let ctx = SyncContext {
                    publisher: &self.publisher,
                    today,
                    stop: &self.stop,
                    state: &self.state,
                };
                let result = unit.sync(&ctx);
                (result, unit.meta().interval)
            };

            let (outcome, last_error) = match result {
                Ok(outcome) => {
                    match &outcome {
                        SyncOutcome::Published {
                            object_id,
                            merged,
                            failed,
                        } => info!(
                            object_id = %object_id,
                            merged,
                            failed,
                            high_water_mark = %interval.high_water_mark(),
                            "dataset updated"
                        ),
                        other => debug!(outcome = %other, "dataset checked"),
                    }
                    (outcome, None)
                }
                Err(e @ TidemarkError::RegistryFull { .. }) => {
                    error!(error = %e, "registry full, dataset skipped this cycle");
                    (SyncOutcome::RegistryFull, Some(e.to_string()))
                }
                Err(TidemarkError::Interrupted) => (SyncOutcome::Interrupted, None),
                Err(e) => {
                    warn!(error = %e, transient = e.is_transient(), "dataset sync failed");
                    (SyncOutcome::Failed, Some(e.to_string()))
                }
            };

            if outcome == SyncOutcome::Interrupted {
                report.interrupted = true;
            }
            {
                let mut status = entry.status.lock();
                status.interval = interval;
                status.last_outcome = outcome.clone();
                status.last_error = last_error;
            }
            report.outcomes.push((identity.clone(), outcome));
            if report.interrupted {
                break;
            }
        }

        if !report.interrupted {
            let identities: Vec<String> = snapshot.iter().map(|(id, _)| id.clone()).collect();
            match self.publisher.self_check(&identities) {
                Ok(checks) => {
                    for check in checks.iter().filter(|c| !c.present()) {
                        let published = report.outcome(&check.identity).is_some_and(|o| {
                            matches!(o, SyncOutcome::Published { .. } | SyncOutcome::UpToDate)
                        });
                        if published {
                            warn!(dataset = %check.identity, object_id = %check.object_id, "published object missing from registry");
                        }
                    }
                    report.checks = checks;
                }
                Err(e) => warn!(error = %e, "registry self-check failed"),
            }
        }

        self.enter(if self.stop.is_stopped() {
            ServiceState::Stopped
        } else {
            ServiceState::Idle
        });
        report
    }

    /// Runs cycles until stopped or `max_cycles` have completed, sleeping the
    /// update interval in between.
    pub fn run(&self, max_cycles: Option<u64>) {
        info!(
            datasets = self.datasets.read().len(),
            registry = %self.publisher.endpoint(),
            interval_secs = self.update_interval.as_secs(),
            "sync service started"
        );
        let mut completed = 0u64;
        loop {
            let report = self.run_cycle();
            completed += 1;
            if report.interrupted || max_cycles.is_some_and(|max| completed >= max) {
                break;
            }
            if self.stop.wait_timeout(self.update_interval) {
                break;
            }
        }
        self.enter(ServiceState::Stopped);
        info!(cycles = completed, "sync service stopped");
    }

    /// Runs [`SyncService::run`] on a dedicated worker thread.
    pub fn spawn(self: Arc<Self>, max_cycles: Option<u64>) -> Result<SyncHandle, TidemarkError> {
        let worker = Arc::clone(&self);
        let handle = thread::Builder::new()
            .name("tidemark-sync".to_string())
            .spawn(move || worker.run(max_cycles))?;
        Ok(SyncHandle {
            service: self,
            handle,
        })
    }
}

pub struct SyncHandle {
    service: Arc<SyncService>,
    handle: JoinHandle<()>,
}

impl SyncHandle {
    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    pub fn stop(&self) {
        self.service.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<(), TidemarkError> {
        self.handle
            .join()
            .map_err(|_| TidemarkError::integrity("sync worker panicked"))
    }
}
