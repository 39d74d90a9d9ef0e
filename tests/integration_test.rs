//! Integration tests across the cache store, datasets, registry and sync loop.
//!
//! Tests cover:
//! - Cache store invariants under arbitrary write sequences (proptest)
//! - End-to-end publish of a table series and incremental refresh
//! - Read-through caching surviving a service restart
//! - Deletion retry against lagging and stuck registries
//! - Registry-full skip and failure isolation between datasets
//! - Corporate actions published and read back through the client
//! - Cross-process visibility through the shared-directory registry

mod common;

use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tidemark::adapters::cached_source::CachedSource;
use tidemark::adapters::interval_cache::IntervalCacheStore;
use tidemark::adapters::memory_registry::MemoryRegistry;
use tidemark::adapters::shm_dir_registry::ShmDirRegistry;
use tidemark::domain::cache_key::CacheKey;
use tidemark::domain::config_validation::ServiceSettings;
use tidemark::domain::dataset::DatasetMeta;
use tidemark::domain::datasets::corporate_actions::{
    ALLOTMENT_TABLE, CorporateActionDataset, DIVIDEND_TABLE,
};
use tidemark::domain::datasets::table_series::TableSeriesDataset;
use tidemark::domain::range::TimeRange;
use tidemark::ports::source_port::SourcePort;
use tidemark::service::client::DataClient;
use tidemark::service::sync::{SyncOutcome, SyncService};

fn settings(budget: u32) -> ServiceSettings {
    ServiceSettings {
        update_interval: Duration::from_millis(10),
        delete_retry_budget: budget,
        delete_retry_interval: Duration::from_millis(1),
    }
}

fn series(identity: &str, table: &str, source: Arc<dyn SourcePort>) -> TableSeriesDataset {
    TableSeriesDataset::new(
        DatasetMeta::new(identity, identity, d(2010, 1, 1), false),
        table,
        source,
        Arc::new(EveryDayCalendar),
    )
}

mod cache_store_invariants {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn stored_ranges_stay_disjoint_and_cover_every_write(
            writes in prop::collection::vec((0u64..200, 0u64..30), 1..8)
        ) {
            let dir = TempDir::new().unwrap();
            let store = IntervalCacheStore::new(dir.path()).unwrap();
            let ranges: Vec<TimeRange> = writes
                .iter()
                .map(|(start, len)| range(day(*start), day(start + len)))
                .collect();

            for r in &ranges {
                let frame = daily_closes("X", r.start(), r.end(), 1.0);
                store.put(&frame, &CacheKey::range("bars", *r).unwrap()).unwrap();
            }

            let mut stored: Vec<TimeRange> = store
                .keys("bars")
                .unwrap()
                .iter()
                .map(|k| CacheKey::parse(k).unwrap().time_range().unwrap())
                .collect();
            stored.sort();
            for pair in stored.windows(2) {
                prop_assert!(pair[0].end() < pair[1].start(), "{} overlaps {}", pair[0], pair[1]);
            }

            for r in &ranges {
                prop_assert!(stored.iter().any(|s| s.contains_range(r)));
                let key = CacheKey::range("bars", *r).unwrap();
                let frame = store.get(&key, None).unwrap().unwrap();
                let days = (r.end() - r.start()).num_days() + 1;
                prop_assert_eq!(frame.len() as i64, days);
            }
        }
    }
}

mod table_series_sync {
    use super::*;

    #[test]
    fn first_cycle_publishes_upstream_rows() {
        let source = Arc::new(
            MockSource::new().with_frame("bars", daily_closes("AAA", d(2020, 1, 1), d(2020, 1, 5), 10.0)),
        );
        let registry = MemoryRegistry::new(1 << 20);
        let service = SyncService::new(
            Arc::new(registry.clone()),
            clock(d(2020, 1, 6)),
            &settings(5),
        );
        service.add_dataset(series("bars", "bars", Arc::new(SharedSource(Arc::clone(&source)))));

        let report = service.run_cycle();
        assert!(matches!(
            report.outcome("bars"),
            Some(SyncOutcome::Published { merged: 1, failed: 0, .. })
        ));
        assert_eq!(
            source.ranges_for("bars"),
            vec![Some(range(d(2010, 1, 1), d(2020, 1, 5)))]
        );

        let reader = series("bars", "bars", Arc::new(MockSource::new()));
        let mut client = DataClient::connect(&registry).unwrap();
        let snapshot = client.get(&reader).unwrap().unwrap();
        assert_eq!(snapshot.frame.len(), 5);
        assert_eq!(snapshot.frame.rows()[0].date, d(2020, 1, 1));
        assert_eq!(snapshot.frame.rows()[4].date, d(2020, 1, 5));

        let status = service.status("bars").unwrap();
        assert_eq!(status.interval.high_water_mark(), d(2020, 1, 5));
        assert_eq!(status.interval.low_bound(), d(2010, 1, 1));
    }

    #[test]
    fn next_day_fetches_only_the_new_session() {
        let source = Arc::new(
            MockSource::new().with_frame("bars", daily_closes("AAA", d(2020, 1, 1), d(2020, 1, 10), 10.0)),
        );
        let registry = MemoryRegistry::new(1 << 20);
        let today = clock(d(2020, 1, 6));
        let service = SyncService::new(Arc::new(registry.clone()), today.clone(), &settings(5));
        service.add_dataset(series("bars", "bars", Arc::new(SharedSource(Arc::clone(&source)))));

        service.run_cycle();
        today.advance_days(1);
        let report = service.run_cycle();

        assert!(matches!(
            report.outcome("bars"),
            Some(SyncOutcome::Published { merged: 1, .. })
        ));
        assert_eq!(
            source.ranges_for("bars").last().copied().flatten(),
            Some(TimeRange::single(d(2020, 1, 6)))
        );

        let reader = series("bars", "bars", Arc::new(MockSource::new()));
        let snapshot = DataClient::connect(&registry)
            .unwrap()
            .get(&reader)
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.frame.len(), 6);
        assert_eq!(
            service.status("bars").unwrap().interval.high_water_mark(),
            d(2020, 1, 6)
        );
    }

    #[test]
    fn unchanged_day_is_up_to_date() {
        let source = Arc::new(
            MockSource::new().with_frame("bars", daily_closes("AAA", d(2020, 1, 1), d(2020, 1, 5), 10.0)),
        );
        let registry = MemoryRegistry::new(1 << 20);
        let service = SyncService::new(Arc::new(registry.clone()), clock(d(2020, 1, 6)), &settings(5));
        service.add_dataset(series("bars", "bars", Arc::new(SharedSource(Arc::clone(&source)))));

        service.run_cycle();
        let report = service.run_cycle();
        assert_eq!(report.outcome("bars"), Some(&SyncOutcome::UpToDate));
        assert_eq!(source.call_count("bars"), 1);
        assert_eq!(registry.put_count(), 1);
    }
}

mod read_through_cache {
    use super::*;

    #[test]
    fn restarted_service_reads_from_cache() {
        let cache_dir = TempDir::new().unwrap();
        let upstream = Arc::new(
            MockSource::new().with_frame("bars", daily_closes("AAA", d(2020, 1, 1), d(2020, 1, 5), 10.0)),
        );

        for _ in 0..2 {
            let store = IntervalCacheStore::new(cache_dir.path()).unwrap();
            let cached: Arc<dyn SourcePort> =
                Arc::new(CachedSource::new(SharedSource(Arc::clone(&upstream)), store));
            let registry = MemoryRegistry::new(1 << 20);
            let service = SyncService::new(Arc::new(registry.clone()), clock(d(2020, 1, 6)), &settings(5));
            service.add_dataset(series("bars", "bars", cached));

            let report = service.run_cycle();
            assert!(matches!(
                report.outcome("bars"),
                Some(SyncOutcome::Published { .. })
            ));
        }

        assert_eq!(upstream.call_count("bars"), 1);
        let store = IntervalCacheStore::new(cache_dir.path()).unwrap();
        assert_eq!(
            store.keys("bars").unwrap(),
            vec![CacheKey::range("bars", range(d(2010, 1, 1), d(2020, 1, 5)))
                .unwrap()
                .to_string()]
        );
    }
}

mod deletion_reconciliation {
    use super::*;

    fn two_day_service(registry: &MemoryRegistry, budget: u32) -> SyncService {
        let source = Arc::new(
            MockSource::new().with_frame("bars", daily_closes("AAA", d(2020, 1, 1), d(2020, 1, 10), 10.0)),
        );
        let today = clock(d(2020, 1, 6));
        let service = SyncService::new(Arc::new(registry.clone()), today.clone(), &settings(budget));
        service.add_dataset(series("bars", "bars", Arc::new(SharedSource(source))));
        service.run_cycle();
        today.advance_days(1);
        service
    }

    #[test]
    fn lagging_delete_is_waited_out() {
        let registry = MemoryRegistry::with_deletion_lag(1 << 20, 4);
        let service = two_day_service(&registry, 10);
        let report = service.run_cycle();
        assert!(matches!(
            report.outcome("bars"),
            Some(SyncOutcome::Published { .. })
        ));
        assert_eq!(registry.put_count(), 2);
    }

    #[test]
    fn stuck_delete_fails_within_budget() {
        let registry = MemoryRegistry::with_stuck_deletes(1 << 20);
        let service = two_day_service(&registry, 3);

        let started = Instant::now();
        let report = service.run_cycle();
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(report.outcome("bars"), Some(&SyncOutcome::Failed));
        let status = service.status("bars").unwrap();
        assert!(status.last_error.unwrap().contains("already exists"));
        assert_eq!(status.interval.high_water_mark(), d(2020, 1, 5));
        assert_eq!(registry.put_count(), 1);
    }
}

mod failure_isolation {
    use super::*;

    #[test]
    fn registry_full_skips_without_advancing() {
        let source = Arc::new(
            MockSource::new().with_frame("bars", daily_closes("AAA", d(2020, 1, 1), d(2020, 1, 5), 10.0)),
        );
        let registry = MemoryRegistry::new(16);
        let service = SyncService::new(Arc::new(registry.clone()), clock(d(2020, 1, 6)), &settings(5));
        service.add_dataset(series("bars", "bars", Arc::new(SharedSource(source))));

        let report = service.run_cycle();
        assert_eq!(report.outcome("bars"), Some(&SyncOutcome::RegistryFull));
        assert_eq!(registry.used_bytes(), 0);
        assert_eq!(
            service.status("bars").unwrap().interval.high_water_mark(),
            d(2010, 1, 1)
        );
    }

    #[test]
    fn failing_dataset_does_not_block_others() {
        let source = Arc::new(
            MockSource::new()
                .with_frame("bars", daily_closes("AAA", d(2020, 1, 1), d(2020, 1, 5), 10.0))
                .with_error("broken", "connection reset"),
        );
        let registry = MemoryRegistry::new(1 << 20);
        let service = SyncService::new(Arc::new(registry.clone()), clock(d(2020, 1, 6)), &settings(5));
        let shared: Arc<dyn SourcePort> = Arc::new(SharedSource(source));
        service.add_dataset(series("a_broken", "broken", Arc::clone(&shared)));
        service.add_dataset(series("b_bars", "bars", shared));

        let report = service.run_cycle();
        assert_eq!(report.outcome("a_broken"), Some(&SyncOutcome::Failed));
        assert!(matches!(
            report.outcome("b_bars"),
            Some(SyncOutcome::Published { .. })
        ));

        let broken = service.status("a_broken").unwrap();
        assert!(broken.last_error.unwrap().contains("connection reset"));
        let mut client = DataClient::connect(&registry).unwrap();
        assert!(!client.contains("a_broken").unwrap());
        assert!(client.contains("b_bars").unwrap());
    }
}

mod corporate_action_publishing {
    use super::*;

    #[test]
    fn published_actions_read_back_clipped() {
        let source = Arc::new(
            MockSource::new()
                .with_frame(
                    DIVIDEND_TABLE,
                    dividend_rows(&[
                        (d(2019, 6, 3), "AAA", 0.25),
                        (d(2019, 12, 2), "BBB", 0.40),
                        (d(2019, 12, 2), "BBB", 0.10),
                    ]),
                )
                .with_frame(ALLOTMENT_TABLE, Default::default()),
        );
        let registry = MemoryRegistry::new(1 << 20);
        let service = SyncService::new(Arc::new(registry.clone()), clock(d(2020, 1, 6)), &settings(5));
        service.add_dataset(CorporateActionDataset::new(
            DatasetMeta::new("actions", "Corporate actions", d(2019, 1, 1), false),
            Arc::new(SharedSource(Arc::clone(&source))),
            Arc::new(EveryDayCalendar),
        ));

        let report = service.run_cycle();
        assert!(matches!(
            report.outcome("actions"),
            Some(SyncOutcome::Published { .. })
        ));
        assert_eq!(source.call_count(DIVIDEND_TABLE), 1);
        assert_eq!(source.call_count(ALLOTMENT_TABLE), 1);

        let mut client = DataClient::connect(&registry).unwrap();
        let december = range(d(2019, 12, 1), d(2019, 12, 31));
        let actions = client.corporate_actions("actions", december).unwrap().unwrap();
        assert_eq!(actions.event_count(), 1);
        let bbb = actions.lookup(d(2019, 12, 2), "BBB").unwrap();
        approx::assert_relative_eq!(bbb.cash_dividend, 0.5);
        assert!(actions.lookup(d(2019, 6, 3), "AAA").is_none());
    }
}

mod shared_directory_registry {
    use super::*;

    #[test]
    fn objects_are_visible_to_a_second_process_view() {
        let shm = TempDir::new().unwrap();
        let source = Arc::new(
            MockSource::new().with_frame("bars", daily_closes("AAA", d(2020, 1, 1), d(2020, 1, 5), 10.0)),
        );
        let today = clock(d(2020, 1, 6));
        let service = SyncService::new(
            Arc::new(ShmDirRegistry::new(shm.path(), 1 << 20)),
            today.clone(),
            &settings(5),
        );
        service.add_dataset(series("bars", "bars", Arc::new(SharedSource(source))));
        service.run_cycle();
        today.advance_days(1);
        service.run_cycle();

        let consumer = ShmDirRegistry::new(shm.path(), 1 << 20);
        let mut client = DataClient::connect(&consumer).unwrap();
        let listed = client.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity, "bars");

        let reader = series("bars", "bars", Arc::new(MockSource::new()));
        let snapshot = client.get(&reader).unwrap().unwrap();
        assert_eq!(snapshot.frame.len(), 5);
        assert_eq!(
            service.status("bars").unwrap().interval.high_water_mark(),
            d(2020, 1, 6)
        );
    }
}
