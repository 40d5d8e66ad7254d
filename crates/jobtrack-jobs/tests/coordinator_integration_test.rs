//! Integration tests for job coordination.
//!
//! This test suite validates:
//! - Completion latch fires once under concurrent callers
//! - Recovery bootstrap is idempotent and never re-triggers remote jobs
//! - Late responses after a stop never reach the stopped episode
//! - Per-unit transient failures do not stall the other units
//! - The full scrape lifecycle (start, poll, finish, cleanup)
//! - Sites queued behind a running sibling do not age out
//! - Start rollback, start-while-running, fatal aborts, recovery age-out
//!
//! All tests run on a paused Tokio clock, so poll intervals elapse instantly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobtrack_client::{MockFailure, MockProgressService, MockResponse};
use jobtrack_jobs::{
    CoordinatorConfig, CoordinatorPhase, CoordinatorRegistry, Error, FinishReport, JobClass,
    PersistedRecord, ProgressSnapshot, RecoveryBootstrap, TrackedUnit, UnitOutcome,
};
use jobtrack_store::{MemoryStore, RecordStore};

struct Fixture {
    registry: CoordinatorRegistry,
    mock: MockProgressService,
    store: Arc<MemoryStore>,
    finished: Arc<Mutex<Vec<FinishReport>>>,
}

impl Fixture {
    fn new(mock: MockProgressService) -> Self {
        Self::with_config(mock, CoordinatorConfig::default().with_reset_on_finish(false))
    }

    fn new_with_store(mock: MockProgressService, store: Arc<MemoryStore>) -> Self {
        Self::with_store(
            mock,
            CoordinatorConfig::default().with_reset_on_finish(false),
            store,
        )
    }

    fn with_config(mock: MockProgressService, config: CoordinatorConfig) -> Self {
        Self::with_store(mock, config, Arc::new(MemoryStore::new()))
    }

    fn with_store(
        mock: MockProgressService,
        config: CoordinatorConfig,
        store: Arc<MemoryStore>,
    ) -> Self {
        let registry = CoordinatorRegistry::builder(Arc::new(mock.clone()), store.clone())
            .with_config(config)
            .build();

        let finished = Arc::new(Mutex::new(Vec::new()));
        for class in JobClass::ALL {
            let sink = finished.clone();
            registry.on_finish(class, move |report: &FinishReport| {
                sink.lock().unwrap().push(report.clone());
            });
        }

        Self {
            registry,
            mock,
            store,
            finished,
        }
    }

    fn records(&self) -> RecordStore {
        RecordStore::new(self.store.clone())
    }

    fn finished(&self) -> Vec<FinishReport> {
        self.finished.lock().unwrap().clone()
    }
}

fn sites() -> Vec<TrackedUnit> {
    vec![TrackedUnit::new(1, "siteA"), TrackedUnit::new(2, "siteB")]
}

fn seed_record(store: &Arc<MemoryStore>, job_class: JobClass, units: &[TrackedUnit]) {
    RecordStore::new(store.clone())
        .save(&PersistedRecord::active(job_class, units))
        .unwrap();
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// COMPLETION LATCH
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_latch_true_at_most_once_under_concurrency() {
    let fixture = Fixture::new(MockProgressService::new());
    let registry = Arc::new(fixture.registry);
    let wins = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let registry = registry.clone();
            let wins = wins.clone();
            tokio::spawn(async move {
                if registry.guard().try_latch(JobClass::SiteScrape) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1);
}

// =============================================================================
// RECOVERY
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_bootstrap_twice_yields_one_poller() {
    let store = Arc::new(MemoryStore::new());
    seed_record(&store, JobClass::SiteScrape, &sites());
    let mock = MockProgressService::new()
        .with_script(JobClass::SiteScrape, 1, vec![MockResponse::snapshot(1, 5, "en cours")])
        .with_script(JobClass::SiteScrape, 2, vec![MockResponse::snapshot(2, 5, "en cours")]);
    let fixture = Fixture::with_store(mock, CoordinatorConfig::default(), store);

    let first = RecoveryBootstrap::run(&fixture.registry);
    let second = RecoveryBootstrap::run(&fixture.registry);
    settle().await;

    assert_eq!(first.recovered, vec![JobClass::SiteScrape]);
    assert!(second.recovered.is_empty());
    assert_eq!(second.already_running, vec![JobClass::SiteScrape]);
    assert_eq!(fixture.registry.poller().active_loops(), 1);
    assert!(fixture.registry.status(JobClass::SiteScrape).running);

    // One query per unit per tick, so a second poller would double the count.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(fixture.mock.progress_call_count(JobClass::SiteScrape, 1), 3);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_terminal_on_first_tick() {
    let store = Arc::new(MemoryStore::new());
    seed_record(&store, JobClass::SiteScrape, &sites());
    let mock = MockProgressService::new()
        .with_script(JobClass::SiteScrape, 1, vec![MockResponse::snapshot(2, 2, "Terminé")])
        .with_script(JobClass::SiteScrape, 2, vec![MockResponse::snapshot(3, 3, "terminée")]);
    let fixture = Fixture::new_with_store(mock, store);

    RecoveryBootstrap::run(&fixture.registry);
    settle().await;

    let status = fixture.registry.status(JobClass::SiteScrape);
    assert_eq!(status.phase, CoordinatorPhase::Idle);
    assert_eq!(fixture.finished().len(), 1);
    assert!(fixture.finished()[0].recovered);
    assert_eq!(fixture.mock.trigger_call_count(), 0);
    assert_eq!(fixture.records().load(JobClass::SiteScrape).unwrap(), None);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fixture.finished().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_of_cleaned_up_job_ages_out() {
    let store = Arc::new(MemoryStore::new());
    let unit = TrackedUnit::implicit(JobClass::DocumentVectorization);
    seed_record(&store, JobClass::DocumentVectorization, &[unit]);
    let fixture = Fixture::new_with_store(MockProgressService::new(), store);

    RecoveryBootstrap::run(&fixture.registry);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(fixture.registry.status(JobClass::DocumentVectorization).running);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!fixture.registry.status(JobClass::DocumentVectorization).running);

    let finished = fixture.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].outcomes[&0], UnitOutcome::AgedOut);
    assert_eq!(finished[0].incomplete_units().len(), 1);
}

// =============================================================================
// CANCELLATION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_during_in_flight_query_discards_response() {
    let mock = MockProgressService::new()
        .with_gate()
        .with_script(JobClass::SiteScrape, 1, vec![MockResponse::snapshot(2, 2, "Terminé")]);
    let fixture = Fixture::new(mock);

    fixture
        .registry
        .start(JobClass::SiteScrape, vec![TrackedUnit::new(1, "siteA")])
        .await
        .unwrap();
    settle().await;
    assert_eq!(fixture.mock.in_flight(), 1);

    assert!(fixture.registry.stop(JobClass::SiteScrape).unwrap());
    fixture.mock.release(1);
    settle().await;

    let status = fixture.registry.status(JobClass::SiteScrape);
    assert_eq!(status.phase, CoordinatorPhase::Idle);
    assert_eq!(status.ticks, 0);
    assert!(status.snapshots.is_empty());
    assert!(fixture.finished().is_empty());
    assert_eq!(fixture.registry.poller().active_loops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_starting_cancels_start() {
    let mock = MockProgressService::new().with_trigger_latency(Duration::from_secs(2));
    let fixture = Fixture::new(mock);
    let coordinator = fixture.registry.coordinator(JobClass::SiteScrape).clone();

    let start = tokio::spawn(async move { coordinator.start(sites()).await });
    settle().await;
    assert_eq!(
        fixture.registry.status(JobClass::SiteScrape).phase,
        CoordinatorPhase::Starting
    );

    assert!(fixture.registry.stop(JobClass::SiteScrape).unwrap());
    let result = start.await.unwrap();

    assert!(matches!(result, Err(Error::Cancelled(_))));
    assert_eq!(
        fixture.registry.status(JobClass::SiteScrape).phase,
        CoordinatorPhase::Idle
    );
    assert_eq!(fixture.records().load(JobClass::SiteScrape).unwrap(), None);
    assert_eq!(fixture.registry.poller().active_loops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_is_a_new_episode() {
    let fixture = Fixture::new(MockProgressService::new());

    let first = fixture
        .registry
        .start(JobClass::CorpusVectorization, vec![])
        .await
        .unwrap();
    fixture.registry.stop(JobClass::CorpusVectorization).unwrap();
    let second = fixture
        .registry
        .start(JobClass::CorpusVectorization, vec![])
        .await
        .unwrap();
    settle().await;

    assert_ne!(first, second);
    assert_eq!(fixture.mock.trigger_call_count(), 2);
    assert_eq!(fixture.registry.poller().active_loops(), 1);
    assert_eq!(
        fixture.registry.status(JobClass::CorpusVectorization).episode_id,
        Some(second)
    );
}

// =============================================================================
// POLLING
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failure_keeps_polling_until_resolved() {
    let mock = MockProgressService::new()
        .with_script(
            JobClass::SiteScrape,
            1,
            vec![
                MockResponse::transient("HTTP 502"),
                MockResponse::malformed("unexpected EOF"),
                MockResponse::snapshot(4, 4, "Terminé"),
            ],
        )
        .with_script(JobClass::SiteScrape, 2, vec![MockResponse::snapshot(2, 2, "Terminé")]);
    let fixture = Fixture::new(mock);

    fixture
        .registry
        .start(JobClass::SiteScrape, sites())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = fixture.registry.status(JobClass::SiteScrape);
    assert!(status.running);
    assert!(!status.snapshots.contains_key(&1));
    assert!(status.snapshots.contains_key(&2));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!fixture.registry.status(JobClass::SiteScrape).running);
    assert_eq!(fixture.mock.progress_call_count(JobClass::SiteScrape, 1), 3);

    let finished = fixture.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].outcomes[&1], UnitOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_scrape_scenario() {
    let mock = MockProgressService::new()
        .with_script(
            JobClass::SiteScrape,
            1,
            vec![
                MockResponse::NotStarted,
                MockResponse::snapshot(1, 2, "Scraping en cours"),
                MockResponse::snapshot(2, 2, "terminée"),
            ],
        )
        .with_script(
            JobClass::SiteScrape,
            2,
            vec![
                MockResponse::NotStarted,
                MockResponse::NotStarted,
                MockResponse::snapshot(2, 2, "terminée"),
            ],
        );
    let fixture = Fixture::new(mock);
    let mut events = fixture.registry.events();

    fixture
        .registry
        .start(JobClass::SiteScrape, sites())
        .await
        .unwrap();
    assert!(fixture.records().load(JobClass::SiteScrape).unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = fixture.registry.status(JobClass::SiteScrape);
    assert!(status.running);
    assert_eq!(status.ticks, 2);
    assert_eq!(
        status.snapshots.get(&1),
        Some(&ProgressSnapshot::new(1, 2, "Scraping en cours"))
    );
    assert!(!status.snapshots.contains_key(&2));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = fixture.registry.status(JobClass::SiteScrape);
    assert_eq!(status.phase, CoordinatorPhase::Idle);
    assert_eq!(fixture.records().load(JobClass::SiteScrape).unwrap(), None);

    let finished = fixture.finished();
    assert_eq!(finished.len(), 1);
    let report = &finished[0];
    assert!(!report.recovered);
    assert_eq!(report.snapshots[&1], ProgressSnapshot::new(2, 2, "terminée"));
    assert_eq!(report.snapshots[&2], ProgressSnapshot::new(2, 2, "terminée"));
    assert!(report.incomplete_units().is_empty());

    let mut types = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        types.push(envelope.event_type);
    }
    assert_eq!(types.first().map(String::as_str), Some("job.started"));
    assert_eq!(types.last().map(String::as_str), Some("job.finished"));
    assert_eq!(types.iter().filter(|t| *t == "job.finished").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_site_ages_out_after_limit() {
    let mock = MockProgressService::new()
        .with_script(JobClass::SiteScrape, 1, vec![MockResponse::snapshot(1, 1, "done")]);
    let fixture = Fixture::with_config(
        mock,
        CoordinatorConfig::default()
            .with_reset_on_finish(false)
            .with_not_started_limit(5),
    );

    fixture
        .registry
        .start(JobClass::SiteScrape, sites())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(fixture.registry.status(JobClass::SiteScrape).running);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!fixture.registry.status(JobClass::SiteScrape).running);

    let report = &fixture.finished()[0];
    assert_eq!(report.outcomes[&1], UnitOutcome::Completed);
    assert_eq!(report.outcomes[&2], UnitOutcome::AgedOut);
}

/// SiteA reports `steps` running snapshots and then finishes; siteB stays
/// unstarted until then, as the remote side scrapes one site at a time.
fn sequential_sites(mock: MockProgressService, steps: u64) -> MockProgressService {
    let mut site_a: Vec<_> = (1..steps)
        .map(|i| MockResponse::snapshot(i, steps, "Scraping en cours"))
        .collect();
    site_a.push(MockResponse::snapshot(steps, steps, "Terminé"));

    let mut site_b = vec![MockResponse::NotStarted; steps as usize];
    site_b.push(MockResponse::snapshot(1, 3, "Scraping en cours"));
    site_b.push(MockResponse::snapshot(3, 3, "Terminé"));

    mock.with_script(JobClass::SiteScrape, 1, site_a)
        .with_script(JobClass::SiteScrape, 2, site_b)
}

#[tokio::test(start_paused = true)]
async fn test_queued_site_outlives_limit_while_sibling_runs() {
    let fixture = Fixture::new(sequential_sites(MockProgressService::new(), 40));

    fixture
        .registry
        .start(JobClass::SiteScrape, sites())
        .await
        .unwrap();

    // SiteA is terminal on tick 40, siteB on tick 42.
    tokio::time::sleep(Duration::from_millis(40_500)).await;
    assert!(fixture.registry.status(JobClass::SiteScrape).running);
    assert!(fixture.finished().is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!fixture.registry.status(JobClass::SiteScrape).running);

    let finished = fixture.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].outcomes[&1], UnitOutcome::Completed);
    assert_eq!(finished[0].outcomes[&2], UnitOutcome::Completed);
    assert_eq!(finished[0].snapshots[&2], ProgressSnapshot::new(3, 3, "Terminé"));
}

#[tokio::test(start_paused = true)]
async fn test_recovered_queued_site_waits_for_sibling() {
    let store = Arc::new(MemoryStore::new());
    seed_record(&store, JobClass::SiteScrape, &sites());
    let fixture = Fixture::new_with_store(sequential_sites(MockProgressService::new(), 10), store);

    RecoveryBootstrap::run(&fixture.registry);

    // SiteA is terminal on tick 10, siteB on tick 12.
    tokio::time::sleep(Duration::from_millis(8_500)).await;
    let status = fixture.registry.status(JobClass::SiteScrape);
    assert!(status.running);
    assert!(status.recovered);
    assert!(fixture.finished().is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!fixture.registry.status(JobClass::SiteScrape).running);

    let finished = fixture.finished();
    assert_eq!(finished.len(), 1);
    assert!(finished[0].incomplete_units().is_empty());
    assert_eq!(finished[0].outcomes[&2], UnitOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_recovered_site_ages_out_once_sibling_finishes() {
    let store = Arc::new(MemoryStore::new());
    seed_record(&store, JobClass::SiteScrape, &sites());
    let mock = MockProgressService::new().with_script(
        JobClass::SiteScrape,
        1,
        vec![
            MockResponse::snapshot(1, 3, "Scraping en cours"),
            MockResponse::snapshot(2, 3, "Scraping en cours"),
            MockResponse::snapshot(3, 3, "Terminé"),
        ],
    );
    let fixture = Fixture::new_with_store(mock, store);

    RecoveryBootstrap::run(&fixture.registry);

    // Counting starts on tick 3, the limit of 3 is reached on tick 5.
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert!(fixture.registry.status(JobClass::SiteScrape).running);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!fixture.registry.status(JobClass::SiteScrape).running);

    let report = &fixture.finished()[0];
    assert_eq!(report.outcomes[&1], UnitOutcome::Completed);
    assert_eq!(report.outcomes[&2], UnitOutcome::AgedOut);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_single_unit_job_waits_for_progress() {
    let fixture = Fixture::new(MockProgressService::new());
    fixture
        .registry
        .start(JobClass::DocumentVectorization, vec![])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(fixture.registry.status(JobClass::DocumentVectorization).running);
    assert!(fixture.finished().is_empty());
}

// =============================================================================
// START / ABORT
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_failure_rolls_back() {
    let mock =
        MockProgressService::new().with_trigger_failure(MockFailure::Rejected("HTTP 422".into()));
    let fixture = Fixture::new(mock);

    let err = fixture
        .registry
        .start(JobClass::SiteScrape, sites())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Rejected(_)));
    let status = fixture.registry.status(JobClass::SiteScrape);
    assert_eq!(status.phase, CoordinatorPhase::Idle);
    assert!(status.last_error.is_some());
    assert!(fixture.store.is_empty());
    assert_eq!(fixture.registry.poller().active_loops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_running_is_rejected() {
    let fixture = Fixture::new(MockProgressService::new());
    fixture
        .registry
        .start(JobClass::SiteScrape, sites())
        .await
        .unwrap();

    let err = fixture
        .registry
        .start(JobClass::SiteScrape, vec![TrackedUnit::new(9, "other")])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(fixture.mock.trigger_call_count(), 1);
    assert_eq!(
        fixture.registry.status(JobClass::SiteScrape).units,
        sites()
    );
}

#[tokio::test(start_paused = true)]
async fn test_fatal_observation_aborts_class() {
    let mock = MockProgressService::new().with_script(
        JobClass::SiteScrape,
        2,
        vec![MockResponse::unauthorized("HTTP 401")],
    );
    let fixture = Fixture::new(mock);
    let mut events = fixture.registry.events();

    fixture
        .registry
        .start(JobClass::SiteScrape, sites())
        .await
        .unwrap();
    settle().await;

    let status = fixture.registry.status(JobClass::SiteScrape);
    assert_eq!(status.phase, CoordinatorPhase::Idle);
    assert!(status.last_error.unwrap().contains("HTTP 401"));
    assert_eq!(fixture.records().load(JobClass::SiteScrape).unwrap(), None);
    assert!(fixture.finished().is_empty());

    let mut types = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        types.push(envelope.event_type);
    }
    assert_eq!(types, vec!["job.started", "job.aborted"]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_on_finish_clears_remote_progress() {
    let mock = MockProgressService::new().with_script(
        JobClass::CorpusVectorization,
        0,
        vec![MockResponse::snapshot(10, 10, "Vectorisation terminée")],
    );
    let fixture = Fixture::with_config(mock, CoordinatorConfig::default());

    fixture
        .registry
        .start(JobClass::CorpusVectorization, vec![])
        .await
        .unwrap();
    settle().await;

    assert_eq!(fixture.finished().len(), 1);
    // Once before the trigger, once after finishing.
    assert_eq!(fixture.mock.reset_call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_watch_reflects_lifecycle() {
    let mock = MockProgressService::new().with_script(
        JobClass::DocumentVectorization,
        0,
        vec![
            MockResponse::snapshot(1, 2, "en cours"),
            MockResponse::snapshot(2, 2, "Vectorisation terminée"),
        ],
    );
    let fixture = Fixture::new(mock);
    let mut watch = fixture
        .registry
        .coordinator(JobClass::DocumentVectorization)
        .watch();

    fixture
        .registry
        .start(JobClass::DocumentVectorization, vec![])
        .await
        .unwrap();
    assert!(watch.borrow_and_update().running);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = watch.borrow_and_update().clone();
    assert_eq!(status.phase, CoordinatorPhase::Idle);
    assert!(!status.running);
}

#[tokio::test(start_paused = true)]
async fn test_restart_waits_for_post_finish_reset() {
    let mock = MockProgressService::new()
        .with_script(
            JobClass::CorpusVectorization,
            0,
            vec![MockResponse::snapshot(10, 10, "Vectorisation terminée")],
        )
        .with_reset_latencies(vec![Duration::ZERO, Duration::from_secs(3)]);
    let fixture = Fixture::with_config(mock, CoordinatorConfig::default());

    fixture
        .registry
        .start(JobClass::CorpusVectorization, vec![])
        .await
        .unwrap();
    settle().await;
    assert_eq!(fixture.finished().len(), 1);
    assert_eq!(fixture.mock.call_order(), vec!["reset", "trigger"]);

    fixture
        .registry
        .start(JobClass::CorpusVectorization, vec![])
        .await
        .unwrap();

    // The slow reset of the first episode lands before the second trigger.
    assert_eq!(
        fixture.mock.call_order(),
        vec!["reset", "trigger", "reset", "reset", "trigger"]
    );
}
