mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kcvs_core::backend::StoreFeatures;
use kcvs_core::backend::inmemory::InMemoryStoreManager;
use kcvs_core::configuration::Configuration;
use kcvs_core::error::{BackendError, JobPhase, ScanError};
use kcvs_core::scan::{Metric, ScanState, ScannerTuning, StandardScanner};
use kcvs_model::{SliceQuery, StaticBuffer};

use support::backend::{Counters, SpyManager, eventually};
use support::jobs::{RecordingJob, seed};

const STORE: &str = "edgestore";
const WAIT: Duration = Duration::from_secs(30);

fn spy(keys: impl IntoIterator<Item = u64>, columns: &[u8], counters: Counters) -> Arc<SpyManager> {
    let inner = InMemoryStoreManager::new();
    seed(&inner.store(STORE), keys, columns);
    Arc::new(SpyManager::new(inner, counters))
}

fn scanner(manager: &Arc<SpyManager>) -> StandardScanner {
    support::init_tracing();
    StandardScanner::new(Arc::clone(manager) as _)
}

fn assert_rolled_back_once(manager: &SpyManager) {
    let (rollbacks, commits) = manager.tx_calls();
    assert_eq!(rollbacks, 1, "scan transaction is rolled back exactly once");
    assert_eq!(commits, 0, "scan transaction is never committed");
}

#[test]
fn single_slow_worker_neither_drops_nor_duplicates_keys() {
    let manager = spy(0..10_000, &[1, 2], Counters::default());
    let scanner = scanner(&manager).with_tuning(ScannerTuning {
        queue_capacity: 16,
        ..ScannerTuning::default()
    });
    let mut job = RecordingJob::full_scan();
    job.delay = Some(Duration::from_micros(20));
    let observed = Arc::clone(&job.observed);

    let handle = scanner
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_num_processing_threads(1)
        .execute()
        .expect("scan starts");
    let metrics = handle
        .wait_timeout(Duration::from_secs(120))
        .expect("scan finishes")
        .expect("scan succeeds");

    assert_eq!(metrics.get(Metric::Success), 10_000);
    assert_eq!(metrics.get(Metric::Failure), 0);
    assert_eq!(metrics.get_custom("visited"), 10_000);
    assert_eq!(observed.keys(), (0..10_000).collect::<Vec<_>>());
    assert_eq!(handle.state(), ScanState::Completed);
    assert_rolled_back_once(&manager);
}

#[test]
fn failing_rows_do_not_sink_the_scan() {
    const N: u64 = 1_000;
    let manager = spy(1..=N, &[1], Counters::default());
    let scanner = scanner(&manager);
    let mut job = RecordingJob::full_scan();
    job.fail_when = Some(|key| key % 7 == 0);

    let metrics = scanner
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_num_processing_threads(4)
        .execute()
        .expect("scan starts")
        .wait()
        .expect("row failures do not fail the scan");

    assert_eq!(metrics.get(Metric::Failure), N / 7);
    assert_eq!(metrics.get(Metric::Success), N - N / 7);
    assert_rolled_back_once(&manager);
}

#[test]
fn secondary_query_joins_on_the_grounding_key() {
    let inner = InMemoryStoreManager::new();
    let store = inner.store(STORE);
    seed(&store, [1, 2, 3], &[0x01]);
    seed(&store, [1, 3], &[0x05]);
    let manager = Arc::new(SpyManager::new(inner, Counters::default()));

    let secondary = SliceQuery::new(vec![0x05], vec![0x06]);
    let job = RecordingJob::new(vec![SliceQuery::full_range(1), secondary]);
    let observed = Arc::clone(&job.observed);

    scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .execute()
        .expect("scan starts")
        .wait()
        .expect("scan succeeds");

    let sizes = observed.map_sizes();
    assert_eq!(sizes.get(&1), Some(&2));
    assert_eq!(sizes.get(&2), Some(&1));
    assert_eq!(sizes.get(&3), Some(&2));
    assert_eq!(manager.counters.key_scans(), 2);
}

#[test]
fn sparse_secondary_streams_stay_aligned_with_the_grounding_query() {
    let inner = InMemoryStoreManager::new();
    let store = inner.store(STORE);
    seed(&store, 0..300, &[0x01]);
    seed(&store, (0..300).filter(|k| k % 3 == 0), &[0x07]);
    seed(&store, (0..300).filter(|k| k % 5 == 0), &[0x09]);
    let manager = Arc::new(SpyManager::new(inner, Counters::default()));

    let job = RecordingJob::new(vec![
        SliceQuery::full_range(1),
        SliceQuery::new(vec![0x07], vec![0x08]),
        SliceQuery::new(vec![0x09], vec![0x0A]),
    ]);
    let observed = Arc::clone(&job.observed);

    scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_num_processing_threads(3)
        .execute()
        .expect("scan starts")
        .wait()
        .expect("scan succeeds");

    let sizes = observed.map_sizes();
    assert_eq!(sizes.len(), 300);
    for (key, size) in sizes {
        let expected = 1 + usize::from(key % 3 == 0) + usize::from(key % 5 == 0);
        assert_eq!(size, expected, "key {key}");
    }
}

#[test]
fn ungrounded_multi_query_job_fails_before_touching_storage() {
    let manager = spy(0..10, &[1], Counters::default());
    let job = RecordingJob::new(vec![
        SliceQuery::new(vec![0x01], vec![0xFF]),
        SliceQuery::full_range(1),
    ]);
    let observed = Arc::clone(&job.observed);

    let handle = scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .execute()
        .expect("scan starts");
    let err = handle.wait().expect_err("precondition violated");

    assert!(matches!(err, ScanError::Configuration(_)), "{err}");
    assert_eq!(handle.state(), ScanState::Failed);
    assert_eq!(manager.counters.key_scans(), 0, "no puller was started");
    assert!(observed.keys().is_empty());
    assert_eq!(observed.setups(), 1);
    assert_eq!(observed.teardowns(), 1);
    assert_rolled_back_once(&manager);
}

#[test]
fn failed_setup_never_opens_iterators() {
    let manager = spy(0..10, &[1], Counters::default());
    let mut job = RecordingJob::full_scan();
    job.fail_setup = true;
    let observed = Arc::clone(&job.observed);
    let finished = Arc::new(AtomicU64::new(0));
    let callback = Arc::clone(&finished);

    let err = scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_finish_job(move |_| {
            callback.fetch_add(1, Ordering::AcqRel);
        })
        .execute()
        .expect("scan starts")
        .wait()
        .expect_err("setup fails");

    assert!(matches!(
        err,
        ScanError::Job {
            phase: JobPhase::Setup,
            ..
        }
    ));
    assert!(err.to_string().contains("index backend unreachable"));
    assert_eq!(manager.counters.key_scans(), 0);
    assert_eq!(observed.teardowns(), 0);
    assert_eq!(finished.load(Ordering::Acquire), 0);
    assert_rolled_back_once(&manager);
}

#[test]
fn panicking_coordinator_setup_still_rolls_back() {
    let manager = spy(0..10, &[1], Counters::default());
    let mut job = RecordingJob::full_scan();
    job.panic_setup_from = Some(0);
    let observed = Arc::clone(&job.observed);

    let handle = scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .execute()
        .expect("scan starts");
    let err = handle.wait().expect_err("setup panics");

    let ScanError::Job { phase, message } = &err else {
        panic!("expected a job error, got {err}");
    };
    assert_eq!(*phase, JobPhase::Setup);
    assert!(message.contains("side index corrupted"), "{message}");
    assert_eq!(handle.state(), ScanState::Failed);
    assert_eq!(manager.counters.key_scans(), 0);
    assert_eq!(observed.teardowns(), 0);
    assert_rolled_back_once(&manager);
}

#[test]
fn panicking_worker_setup_fails_the_scan() {
    let manager = spy(0..100, &[1], Counters::default());
    let mut job = RecordingJob::full_scan();
    job.panic_setup_from = Some(1);
    let observed = Arc::clone(&job.observed);

    let handle = scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_num_processing_threads(1)
        .execute()
        .expect("scan starts");
    let err = handle
        .wait_timeout(WAIT)
        .expect("scan finishes")
        .expect_err("worker setup panics");

    assert!(
        matches!(
            err,
            ScanError::Job {
                phase: JobPhase::WorkerSetup,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(handle.state(), ScanState::Failed);
    assert!(observed.keys().is_empty());
    assert_eq!(observed.teardowns(), 1, "coordinator instance is torn down");
    assert!(eventually(WAIT, || manager.counters.iterators_closed() == 1));
    assert_rolled_back_once(&manager);
}

#[test]
fn panicking_key_filter_fails_the_scan() {
    let manager = spy(0..100, &[1], Counters::default());
    let mut job = RecordingJob::full_scan();
    job.filter = Some(|key: &StaticBuffer| {
        if key.to_u64() == Some(50) {
            panic!("key codec rejected row 50");
        }
        true
    });

    let err = scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .execute()
        .expect("scan starts")
        .wait()
        .expect_err("a dead puller must not look like the end of the data");

    let ScanError::Backend(BackendError::Permanent(message)) = &err else {
        panic!("expected a backend failure, got {err}");
    };
    assert!(message.contains("key codec rejected row 50"), "{message}");
    assert_eq!(manager.counters.iterators_closed(), 1);
    assert_rolled_back_once(&manager);
}

#[test]
fn failing_teardown_fails_the_scan() {
    let manager = spy(0..20, &[1], Counters::default());
    let mut job = RecordingJob::full_scan();
    job.fail_teardown = true;

    let err = scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .execute()
        .expect("scan starts")
        .wait()
        .expect_err("teardown fails");

    assert!(matches!(err, ScanError::Job { .. }), "{err}");
    assert_rolled_back_once(&manager);
}

#[test]
fn cancel_stops_the_scan_and_releases_resources() {
    for supports_interruption in [true, false] {
        let counters = Counters {
            key_delay: Some(Duration::from_millis(1)),
            ..Counters::default()
        };
        let manager = spy(0..5_000, &[1], counters);
        let features = StoreFeatures {
            ordered_scan: true,
            unordered_scan: true,
            supports_interruption,
        };
        let manager = Arc::new(
            Arc::try_unwrap(manager)
                .expect("sole owner")
                .with_features(features),
        );
        let mut job = RecordingJob::full_scan();
        job.delay = Some(Duration::from_millis(2));

        let scanner = scanner(&manager);
        let handle = scanner
            .build()
            .set_job(job)
            .set_database_name(STORE)
            .execute()
            .expect("scan starts");

        let live = handle.intermediate_metrics();
        assert!(eventually(WAIT, || live.get(Metric::Success) >= 10));
        assert!(handle.cancel());

        let outcome = handle.wait_timeout(WAIT).expect("scan winds down");
        assert!(matches!(outcome, Err(ScanError::Interrupted)));
        assert_eq!(handle.state(), ScanState::Canceled);
        assert!(live.get(Metric::Success) < 5_000);
        assert!(
            eventually(WAIT, || manager.counters.iterators_closed() == 1),
            "puller closed its iterator (interruption supported: {supports_interruption})"
        );
        assert_rolled_back_once(&manager);
        assert!(!handle.cancel(), "finished scans cannot be canceled");
    }
}

#[test]
fn stalled_storage_times_out() {
    let counters = Counters {
        stall_after: Some(3),
        ..Counters::default()
    };
    let manager = spy(0..10, &[1], counters);
    let scanner = scanner(&manager).with_tuning(ScannerTuning {
        poll_interval_ms: 5,
        row_timeout_ms: 200,
        ..ScannerTuning::default()
    });

    let handle = scanner
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .execute()
        .expect("scan starts");
    let err = handle.wait_timeout(WAIT).expect("scan gives up").expect_err("timed out");

    assert!(matches!(err, ScanError::StorageTimeout { query: 0, .. }), "{err}");
    assert!(err.to_string().contains("storage error likely"));
    assert_rolled_back_once(&manager);

    manager.counters.release();
    assert!(eventually(WAIT, || manager.counters.iterators_closed() == 1));
}

#[test]
fn iterator_failure_surfaces_as_backend_error() {
    let counters = Counters {
        fail_after: Some(5),
        ..Counters::default()
    };
    let manager = spy(0..50, &[1], counters);

    let err = scanner(&manager)
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .execute()
        .expect("scan starts")
        .wait()
        .expect_err("backend failure");

    assert_eq!(
        err,
        ScanError::Backend(BackendError::Permanent("disk read failed".into()))
    );
    assert_eq!(manager.counters.iterators_closed(), 1);
    assert_rolled_back_once(&manager);
}

#[test]
fn key_filter_skips_rows() {
    let manager = spy(0..100, &[1], Counters::default());
    let mut job = RecordingJob::full_scan();
    job.filter = Some(|key: &StaticBuffer| key.to_u64().is_some_and(|k| k % 2 == 0));
    let observed = Arc::clone(&job.observed);

    let metrics = scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_num_processing_threads(2)
        .execute()
        .expect("scan starts")
        .wait()
        .expect("scan succeeds");

    assert_eq!(metrics.get(Metric::Success), 50);
    assert_eq!(observed.keys(), (0..100).step_by(2).collect::<Vec<_>>());
}

#[test]
fn work_blocks_recycle_job_instances() {
    let manager = spy(0..35, &[1], Counters::default());
    let job = RecordingJob::full_scan();
    let observed = Arc::clone(&job.observed);

    scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_num_processing_threads(1)
        .set_work_block_size(10)
        .execute()
        .expect("scan starts")
        .wait()
        .expect("scan succeeds");

    // One coordinator instance plus four worker blocks (10 + 10 + 10 + 5).
    assert_eq!(observed.setups(), 5);
    assert_eq!(observed.teardowns(), 5);
}

#[test]
fn empty_store_completes_without_worker_setup() {
    let manager = spy(std::iter::empty(), &[], Counters::default());
    let job = RecordingJob::full_scan();
    let observed = Arc::clone(&job.observed);

    let metrics = scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_num_processing_threads(4)
        .execute()
        .expect("scan starts")
        .wait()
        .expect("scan succeeds");

    assert_eq!(metrics.snapshot().processed(), 0);
    assert!(metrics.finished_at().is_some());
    assert_eq!(observed.setups(), 1);
    assert_eq!(observed.teardowns(), 1);
    assert_rolled_back_once(&manager);
}

#[test]
fn ordered_only_backend_is_scanned_by_key_range() {
    let manager = spy(0..64, &[1], Counters::default());
    let manager = Arc::new(
        Arc::try_unwrap(manager)
            .expect("sole owner")
            .with_features(StoreFeatures {
                ordered_scan: true,
                unordered_scan: false,
                supports_interruption: true,
            }),
    );
    let job = RecordingJob::full_scan();
    let observed = Arc::clone(&job.observed);

    scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .execute()
        .expect("scan starts")
        .wait()
        .expect("scan succeeds");

    assert_eq!(observed.keys(), (0..64).collect::<Vec<_>>());
}

#[test]
fn backend_without_scan_support_is_rejected_up_front() {
    let manager = spy(0..4, &[1], Counters::default());
    let manager = Arc::new(
        Arc::try_unwrap(manager)
            .expect("sole owner")
            .with_features(StoreFeatures::default()),
    );

    let err = scanner(&manager)
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .execute()
        .expect_err("no scan support");

    assert!(matches!(err, ScanError::Backend(BackendError::Unsupported(_))));
    assert!(manager.inner.transactions().is_empty(), "no transaction was opened");
}

#[test]
fn missing_job_or_database_is_a_configuration_error() {
    let manager = spy(0..4, &[1], Counters::default());
    let scanner = scanner(&manager);

    let err = scanner
        .build::<RecordingJob>()
        .set_database_name(STORE)
        .execute()
        .expect_err("no job");
    assert!(matches!(err, ScanError::Configuration(_)));

    let err = scanner
        .build()
        .set_job(RecordingJob::full_scan())
        .execute()
        .expect_err("no database");
    assert!(matches!(err, ScanError::Configuration(_)));

    let err = scanner
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .set_num_processing_threads(0)
        .execute()
        .expect_err("no threads");
    assert!(matches!(err, ScanError::Configuration(_)));
    assert!(manager.inner.transactions().is_empty());
}

#[test]
fn configuration_reaches_the_job_and_the_transaction() {
    let manager = spy(0..3, &[1], Counters::default());
    let job = RecordingJob::full_scan();
    let observed = Arc::clone(&job.observed);

    scanner(&manager)
        .build()
        .set_job(job)
        .set_database_name(STORE)
        .set_job_configuration(Configuration::new().with("label", "reindex"))
        .set_graph_configuration(Configuration::new().with("graph.name", "social"))
        .set_custom_tx_option("storage.read-consistency", "quorum")
        .execute()
        .expect("scan starts")
        .wait()
        .expect("scan succeeds");

    let seen = observed.seen_options.lock().clone();
    assert!(seen.contains(&"reindex".to_string()));
    assert!(seen.contains(&"social".to_string()));

    let txs = manager.inner.transactions();
    assert_eq!(txs.len(), 1);
    let config = kcvs_core::backend::StoreTransaction::config(txs[0].as_ref());
    assert!(config.read_only);
    assert_eq!(
        config
            .custom_options
            .get::<String>("storage.read-consistency")
            .as_deref(),
        Some("quorum")
    );
}

#[test]
fn finish_callback_sees_final_metrics() {
    let manager = spy(0..25, &[1], Counters::default());
    let reported = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&reported);

    scanner(&manager)
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .set_finish_job(move |metrics| {
            sink.store(metrics.get(Metric::Success), Ordering::Release);
        })
        .execute()
        .expect("scan starts")
        .wait()
        .expect("scan succeeds");

    assert_eq!(reported.load(Ordering::Acquire), 25);
}

#[test]
fn running_jobs_are_registered_by_id() {
    let counters = Counters {
        key_delay: Some(Duration::from_millis(2)),
        ..Counters::default()
    };
    let manager = spy(0..2_000, &[1], counters);
    let scanner = scanner(&manager);

    let handle = scanner
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .set_job_id("reindex")
        .execute()
        .expect("scan starts");
    assert_eq!(handle.id().as_str(), "reindex");

    let err = scanner
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .set_job_id("reindex")
        .execute()
        .expect_err("id is taken");
    assert_eq!(err, ScanError::DuplicateJob("reindex".into()));

    let running = scanner
        .get_running_job(&"reindex".into())
        .expect("registered");
    assert!(running.cancel());
    assert!(handle.wait_timeout(WAIT).is_some());
    assert!(scanner.get_running_job(&"reindex".into()).is_none());
    assert!(scanner.running_jobs().is_empty());

    let rerun = scanner
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name("other")
        .set_job_id("reindex")
        .execute()
        .expect("id is free again");
    rerun.wait().expect("empty store scans");
}

#[test]
fn closing_the_scanner_cancels_jobs_and_closes_stores() {
    let counters = Counters {
        key_delay: Some(Duration::from_millis(2)),
        ..Counters::default()
    };
    let manager = spy(0..2_000, &[1], counters);
    let scanner = scanner(&manager);

    let handle = scanner
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .execute()
        .expect("scan starts");

    scanner.close().expect("scanner closes");
    assert!(matches!(handle.try_result(), Some(Err(ScanError::Interrupted))));
    assert!(manager.inner.store(STORE).is_closed());
    assert_rolled_back_once(&manager);
}

#[tokio::test]
async fn handle_resolves_as_a_future() {
    let manager = spy(0..200, &[1], Counters::default());
    let scanner = scanner(&manager);
    let handle = scanner
        .build()
        .set_job(RecordingJob::full_scan())
        .set_database_name(STORE)
        .set_num_processing_threads(2)
        .execute()
        .expect("scan starts");

    let metrics = handle.clone().await.expect("scan succeeds");
    assert_eq!(metrics.get(Metric::Success), 200);
    assert_eq!(metrics.snapshot().custom.get("visited"), Some(&200));
    assert!(handle.is_done());
}
