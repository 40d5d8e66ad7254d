//! Per-class job coordinator.
//!
//! A [`JobCoordinator`] owns the lifecycle of one job class:
//! `Idle -> Starting -> Running -> Finishing -> Idle`. It starts the remote
//! job, persists the active record, merges poller ticks and runs the finish
//! side effects exactly once per episode.
//!
//! State lives behind a synchronous mutex that is never held across an
//! `.await`. Finish callbacks run outside the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use jobtrack_core::{
    defaults, CoordinatorEvent, CoordinatorPhase, CoordinatorStatus, Error, EventBus,
    EventEnvelope, FinishReport, JobClass, PersistedRecord, ProgressService, ProgressSnapshot,
    Result, TerminalMarkers, TrackedUnit, UnitObservation,
};
use jobtrack_store::RecordStore;

use crate::completion;
use crate::guard::CompletionGuard;
use crate::poller::{PollHandle, PollId, Poller, TickSink, TickVerdict};

/// Callback invoked once when an episode finishes.
pub type FinishCallback = Arc<dyn Fn(&FinishReport) + Send + Sync>;

/// Configuration shared by the coordinators of a registry.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delay between two polls of the same class.
    pub poll_interval: Duration,
    /// Consecutive "not started" ticks after which a unit ages out.
    pub not_started_limit: u32,
    /// Same, for episodes resumed after a restart.
    pub recovery_not_started_limit: u32,
    pub terminal_markers: TerminalMarkers,
    /// Clear server-side progress records after an episode finishes.
    pub reset_on_finish: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            not_started_limit: defaults::NOT_STARTED_LIMIT,
            recovery_not_started_limit: defaults::RECOVERY_NOT_STARTED_LIMIT,
            terminal_markers: TerminalMarkers::default(),
            reset_on_finish: defaults::RESET_ON_FINISH,
        }
    }
}

impl CoordinatorConfig {
    /// Create configuration from environment variables.
    ///
    /// - `JOBTRACK_POLL_INTERVAL_MS` (default 1000)
    /// - `JOBTRACK_NOT_STARTED_LIMIT` (default 30)
    /// - `JOBTRACK_RECOVERY_NOT_STARTED_LIMIT` (default 3)
    /// - `JOBTRACK_TERMINAL_MARKERS`, comma separated
    /// - `JOBTRACK_RESET_ON_FINISH` (default true)
    pub fn from_env() -> Self {
        let poll_interval_ms = std::env::var("JOBTRACK_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::POLL_INTERVAL_MS)
            .max(1);

        let not_started_limit = std::env::var("JOBTRACK_NOT_STARTED_LIMIT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::NOT_STARTED_LIMIT)
            .max(1);

        let recovery_not_started_limit = std::env::var("JOBTRACK_RECOVERY_NOT_STARTED_LIMIT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::RECOVERY_NOT_STARTED_LIMIT)
            .max(1);

        let terminal_markers = std::env::var("JOBTRACK_TERMINAL_MARKERS")
            .ok()
            .map(|v| TerminalMarkers::from_csv(&v))
            .filter(|m| !m.markers().is_empty())
            .unwrap_or_default();

        let reset_on_finish = std::env::var("JOBTRACK_RESET_ON_FINISH")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(defaults::RESET_ON_FINISH);

        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            not_started_limit,
            recovery_not_started_limit,
            terminal_markers,
            reset_on_finish,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Clamped to at least one tick.
    pub fn with_not_started_limit(mut self, limit: u32) -> Self {
        self.not_started_limit = limit.max(1);
        self
    }

    /// Clamped to at least one tick.
    pub fn with_recovery_not_started_limit(mut self, limit: u32) -> Self {
        self.recovery_not_started_limit = limit.max(1);
        self
    }

    pub fn with_terminal_markers(mut self, markers: TerminalMarkers) -> Self {
        self.terminal_markers = markers;
        self
    }

    pub fn with_reset_on_finish(mut self, enabled: bool) -> Self {
        self.reset_on_finish = enabled;
        self
    }
}

/// Mutable state of one class.
struct CoordinatorState {
    phase: CoordinatorPhase,
    episode_id: Option<Uuid>,
    poll: Option<PollHandle>,
    units: Vec<TrackedUnit>,
    snapshots: BTreeMap<u64, ProgressSnapshot>,
    not_started: HashMap<u64, u32>,
    ticks: u64,
    recovered: bool,
    started_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl CoordinatorState {
    fn idle() -> Self {
        Self {
            phase: CoordinatorPhase::Idle,
            episode_id: None,
            poll: None,
            units: Vec::new(),
            snapshots: BTreeMap::new(),
            not_started: HashMap::new(),
            ticks: 0,
            recovered: false,
            started_at: Utc::now(),
            last_error: None,
        }
    }

    /// Return to Idle, keeping only the last surfaced error.
    /// The poll handle is handed back so the caller can drop it.
    fn reset_to_idle(&mut self) -> Option<PollHandle> {
        let last_error = self.last_error.take();
        let poll = self.poll.take();
        *self = Self::idle();
        self.last_error = last_error;
        poll
    }

    fn begin_episode(&mut self, episode_id: Uuid, units: Vec<TrackedUnit>, recovered: bool) {
        self.episode_id = Some(episode_id);
        self.units = units;
        self.snapshots.clear();
        self.not_started.clear();
        self.ticks = 0;
        self.recovered = recovered;
        self.last_error = None;
    }

    fn is_episode(&self, phase: CoordinatorPhase, episode_id: Uuid) -> bool {
        self.phase == phase && self.episode_id == Some(episode_id)
    }
}

struct Inner {
    job_class: JobClass,
    config: CoordinatorConfig,
    service: Arc<dyn ProgressService>,
    records: RecordStore,
    poller: Poller,
    guard: Arc<CompletionGuard>,
    events: EventBus,
    state: Mutex<CoordinatorState>,
    status_tx: watch::Sender<CoordinatorStatus>,
    callbacks: Mutex<Vec<FinishCallback>>,
    /// Post-finish remote reset still in flight; the next start waits on it.
    pending_reset: Mutex<Option<JoinHandle<()>>>,
}

/// Coordinator for one job class. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

/// Poller sink that forwards ticks to a coordinator without keeping it alive.
struct CoordinatorSink(Weak<Inner>);

impl TickSink for CoordinatorSink {
    fn on_tick(&self, poll_id: PollId, observations: Vec<(u64, UnitObservation)>) -> TickVerdict {
        match self.0.upgrade() {
            Some(inner) => JobCoordinator { inner }.on_tick(poll_id, observations),
            None => TickVerdict::Stop,
        }
    }
}

impl JobCoordinator {
    pub fn new(
        job_class: JobClass,
        config: CoordinatorConfig,
        service: Arc<dyn ProgressService>,
        records: RecordStore,
        poller: Poller,
        guard: Arc<CompletionGuard>,
        events: EventBus,
    ) -> Self {
        let (status_tx, _) = watch::channel(CoordinatorStatus::idle(job_class));
        Self {
            inner: Arc::new(Inner {
                job_class,
                config,
                service,
                records,
                poller,
                guard,
                events,
                state: Mutex::new(CoordinatorState::idle()),
                status_tx,
                callbacks: Mutex::new(Vec::new()),
                pending_reset: Mutex::new(None),
            }),
        }
    }

    pub fn job_class(&self) -> JobClass {
        self.inner.job_class
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn status_of(&self, state: &CoordinatorState) -> CoordinatorStatus {
        CoordinatorStatus {
            job_class: self.inner.job_class,
            phase: state.phase,
            running: state.phase == CoordinatorPhase::Running,
            episode_id: state.episode_id,
            units: state.units.clone(),
            snapshots: state.snapshots.clone(),
            ticks: state.ticks,
            recovered: state.recovered,
            last_error: state.last_error.clone(),
        }
    }

    fn publish(&self, state: &CoordinatorState) -> CoordinatorStatus {
        let status = self.status_of(state);
        self.inner.status_tx.send_replace(status.clone());
        status
    }

    fn emit(&self, event: CoordinatorEvent) {
        self.inner.events.emit(event);
    }

    fn age_out_limit(&self, recovered: bool) -> Option<u32> {
        let config = &self.inner.config;
        match (self.inner.job_class.is_multi_unit(), recovered) {
            (_, true) => Some(config.recovery_not_started_limit),
            (true, false) => Some(config.not_started_limit),
            (false, false) => None,
        }
    }

    fn arm(&self, units: Vec<TrackedUnit>) -> Result<PollHandle> {
        let sink = Arc::new(CoordinatorSink(Arc::downgrade(&self.inner)));
        self.inner
            .poller
            .arm(self.inner.job_class, units, self.inner.config.poll_interval, sink)
    }

    /// Current status snapshot.
    pub fn status(&self) -> CoordinatorStatus {
        self.status_of(&self.state())
    }

    pub fn is_running(&self) -> bool {
        self.state().phase == CoordinatorPhase::Running
    }

    /// Receiver that always holds the latest status.
    pub fn watch(&self) -> watch::Receiver<CoordinatorStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to the shared event bus.
    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.events.subscribe()
    }

    /// Register a callback run once per finished episode.
    pub fn on_finish<F>(&self, callback: F)
    where
        F: Fn(&FinishReport) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Start the remote job over `units` and begin tracking it.
    ///
    /// The active record is persisted only after the trigger is acknowledged,
    /// so a failed start never leaves a record behind. Returns the episode id.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] when the class is not Idle
    /// - [`Error::InvalidInput`] for an empty or duplicated unit list
    /// - [`Error::Cancelled`] when [`stop`](Self::stop) was called meanwhile
    /// - any trigger error, and fatal reset errors
    #[instrument(skip(self, units), fields(job_class = %self.inner.job_class))]
    pub async fn start(&self, units: Vec<TrackedUnit>) -> Result<Uuid> {
        let job_class = self.inner.job_class;
        let units = job_class.normalize_units(units)?;
        let episode_id = Uuid::now_v7();

        {
            let mut state = self.state();
            if state.phase != CoordinatorPhase::Idle {
                return Err(Error::InvalidState(format!(
                    "{job_class} is already {}",
                    state.phase
                )));
            }
            state.phase = CoordinatorPhase::Starting;
            state.begin_episode(episode_id, units.clone(), false);
            self.publish(&state);
        }
        info!(%episode_id, units = units.len(), "Starting job");

        let pending = self
            .inner
            .pending_reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            debug!(%episode_id, "Waiting for the previous post-finish reset");
            if let Err(e) = pending.await {
                warn!(%episode_id, error = %e, "Post-finish reset task failed");
            }
        }

        if let Err(e) = self.inner.service.reset_progress(job_class, &units).await {
            if e.is_fatal() {
                return Err(self.abandon_start(episode_id, e));
            }
            warn!(%episode_id, error = %e, "Progress reset failed, starting anyway");
        }
        if !self.state().is_episode(CoordinatorPhase::Starting, episode_id) {
            info!(%episode_id, "Start cancelled before trigger");
            return Err(Error::Cancelled(format!("{job_class} was stopped while starting")));
        }

        let ack = match self.inner.service.trigger_job(job_class, &units).await {
            Ok(ack) => ack,
            Err(e) => return Err(self.abandon_start(episode_id, e)),
        };
        debug!(%episode_id, status = ?ack.status, message = ?ack.message, "Trigger acknowledged");

        let mut state = self.state();
        if !state.is_episode(CoordinatorPhase::Starting, episode_id) {
            warn!(%episode_id, "Job triggered remotely but stopped locally before activation");
            return Err(Error::Cancelled(format!("{job_class} was stopped while starting")));
        }

        state.snapshots.clear();
        state.not_started.clear();
        if let Err(e) = self
            .inner
            .records
            .save(&PersistedRecord::active(job_class, &units))
        {
            error!(%episode_id, error = %e, "Failed to persist active record; job will not survive a restart");
            state.last_error = Some(e.to_string());
        }
        state.started_at = Utc::now();
        self.inner.guard.reset(job_class);
        state.phase = CoordinatorPhase::Running;

        match self.arm(units.clone()) {
            Ok(handle) => state.poll = Some(handle),
            Err(e) => {
                error!(%episode_id, error = %e, "Failed to arm poller");
                if let Err(clear_err) = self.inner.records.clear(job_class) {
                    warn!(error = %clear_err, "Failed to clear record after arm failure");
                }
                state.last_error = Some(e.to_string());
                state.reset_to_idle();
                self.publish(&state);
                return Err(e);
            }
        }
        self.publish(&state);
        drop(state);

        info!(%episode_id, "Job running");
        self.emit(CoordinatorEvent::Started {
            job_class,
            episode_id,
            units,
            recovered: false,
        });
        Ok(episode_id)
    }

    /// Roll a failed start back to Idle and hand the error back.
    fn abandon_start(&self, episode_id: Uuid, e: Error) -> Error {
        let job_class = self.inner.job_class;
        let mut state = self.state();
        if state.is_episode(CoordinatorPhase::Starting, episode_id) {
            state.last_error = Some(e.to_string());
            state.reset_to_idle();
            self.publish(&state);
            drop(state);
            warn!(%job_class, %episode_id, error = %e, "Start failed, rolled back");
            self.emit(CoordinatorEvent::StartFailed {
                job_class,
                error: e.to_string(),
            });
        }
        e
    }

    /// Stop tracking the class without running finish callbacks.
    ///
    /// Clears the persisted record. Returns `false` when already Idle.
    #[instrument(skip(self), fields(job_class = %self.inner.job_class))]
    pub fn stop(&self) -> Result<bool> {
        let job_class = self.inner.job_class;
        let mut state = self.state();
        if state.phase == CoordinatorPhase::Idle {
            debug!("Stop requested while idle");
            return Ok(false);
        }

        let episode_id = state.episode_id;
        let poll = state.poll.take();
        drop(poll);
        let cleared = self.inner.records.clear(job_class);
        state.last_error = None;
        state.reset_to_idle();
        self.inner.guard.reset(job_class);
        self.publish(&state);
        drop(state);

        info!(episode_id = ?episode_id, "Job stopped");
        self.emit(CoordinatorEvent::Stopped {
            job_class,
            episode_id,
        });
        cleared.map(|_| true)
    }

    /// Resume tracking a job that was running before a restart.
    ///
    /// Does not reset or trigger anything remotely and keeps the persisted
    /// record as is. Returns `false` (no-op) when the class is not Idle.
    #[instrument(skip(self, record), fields(job_class = %self.inner.job_class))]
    pub fn recover(&self, record: PersistedRecord) -> Result<bool> {
        let job_class = self.inner.job_class;
        if record.job_class != job_class {
            return Err(Error::InvalidInput(format!(
                "record for {} given to the {job_class} coordinator",
                record.job_class
            )));
        }
        if !record.active {
            return Err(Error::InvalidInput(format!(
                "record for {job_class} is not active"
            )));
        }
        let units = job_class.normalize_units(record.units()?)?;

        let mut state = self.state();
        if state.phase != CoordinatorPhase::Idle {
            debug!(phase = %state.phase, "Already tracking, recovery skipped");
            return Ok(false);
        }

        let episode_id = Uuid::now_v7();
        state.begin_episode(episode_id, units.clone(), true);
        state.started_at = record.started_at;
        self.inner.guard.reset(job_class);
        state.phase = CoordinatorPhase::Running;

        match self.arm(units.clone()) {
            Ok(handle) => state.poll = Some(handle),
            Err(e) => {
                state.last_error = Some(e.to_string());
                state.reset_to_idle();
                self.publish(&state);
                return Err(e);
            }
        }
        self.publish(&state);
        drop(state);

        info!(%episode_id, units = units.len(), started_at = %record.started_at, "Recovered running job");
        self.emit(CoordinatorEvent::Started {
            job_class,
            episode_id,
            units,
            recovered: true,
        });
        Ok(true)
    }

    /// Disarm polling for process teardown.
    ///
    /// The persisted record is kept so the next process recovers the job.
    pub fn detach(&self) -> bool {
        let mut state = self.state();
        if state.phase == CoordinatorPhase::Idle {
            return false;
        }
        debug!(job_class = %self.inner.job_class, phase = %state.phase, "Detaching coordinator");
        drop(state.reset_to_idle());
        self.publish(&state);
        true
    }

    /// Merge one poller tick. Called by the poller; stale ticks (from a
    /// disarmed handle, or after the class left Running) are discarded.
    pub fn on_tick(&self, poll_id: PollId, observations: Vec<(u64, UnitObservation)>) -> TickVerdict {
        let job_class = self.inner.job_class;
        let mut state = self.state();

        let active = state.poll.as_ref().map(PollHandle::id);
        if state.phase != CoordinatorPhase::Running || active != Some(poll_id) {
            debug!(%job_class, %poll_id, phase = %state.phase, "Discarding stale tick");
            return TickVerdict::Stop;
        }
        state.ticks += 1;

        let progressing = completion::progressing(
            &state.units,
            &observations,
            &state.snapshots,
            &self.inner.config.terminal_markers,
        );

        let mut fatal = None;
        for (unit_id, observation) in observations {
            if !state.units.iter().any(|u| u.id == unit_id) {
                continue;
            }
            match observation {
                UnitObservation::Snapshot(snapshot) => {
                    state.not_started.remove(&unit_id);
                    state.snapshots.insert(unit_id, snapshot);
                }
                UnitObservation::NotStarted if progressing.iter().any(|id| *id != unit_id) => {
                    // Queued behind a unit that is still running.
                    state.not_started.remove(&unit_id);
                }
                UnitObservation::NotStarted => {
                    *state.not_started.entry(unit_id).or_default() += 1;
                }
                UnitObservation::Malformed(reason) => {
                    warn!(%job_class, unit_id, %reason, "Malformed progress payload");
                }
                UnitObservation::Transient(reason) => {
                    warn!(%job_class, unit_id, %reason, "Progress query failed, retrying next tick");
                }
                UnitObservation::Fatal(reason) => {
                    fatal.get_or_insert(reason);
                }
            }
        }

        if let Some(reason) = fatal {
            return self.abort(state, reason);
        }

        let outcomes = completion::evaluate(
            &state.units,
            &state.snapshots,
            &state.not_started,
            self.age_out_limit(state.recovered),
            &self.inner.config.terminal_markers,
        );
        let status = self.publish(&state);

        let Some(outcomes) = outcomes else {
            drop(state);
            self.emit(CoordinatorEvent::Progress { status });
            return TickVerdict::Continue;
        };

        if !self.inner.guard.try_latch(job_class) {
            debug!(%job_class, "Finish already claimed");
            return TickVerdict::Stop;
        }

        let Some(episode_id) = state.episode_id else {
            return TickVerdict::Stop;
        };
        state.phase = CoordinatorPhase::Finishing;
        let poll = state.poll.take();
        if let Err(e) = self.inner.records.clear(job_class) {
            warn!(%job_class, error = %e, "Failed to clear persisted record");
        }
        let report = FinishReport {
            job_class,
            episode_id,
            units: state.units.clone(),
            snapshots: state.snapshots.clone(),
            outcomes,
            recovered: state.recovered,
            started_at: state.started_at,
            finished_at: Utc::now(),
        };
        self.publish(&state);
        drop(state);
        drop(poll);

        self.emit(CoordinatorEvent::Progress { status });
        self.finish(report);
        TickVerdict::Stop
    }

    fn finish(&self, report: FinishReport) {
        let job_class = self.inner.job_class;
        let episode_id = report.episode_id;
        info!(
            %job_class,
            %episode_id,
            units = report.units.len(),
            incomplete = report.incomplete_units().len(),
            "Job finished"
        );

        if self.inner.config.reset_on_finish {
            self.spawn_post_finish_reset(report.units.clone());
        }

        {
            let mut state = self.state();
            if state.is_episode(CoordinatorPhase::Finishing, episode_id) {
                state.reset_to_idle();
                self.inner.guard.reset(job_class);
                self.publish(&state);
            }
        }

        let callbacks: Vec<FinishCallback> = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(&report);
        }

        self.emit(CoordinatorEvent::Finished { report });
    }

    /// Clear server-side progress of a finished episode in the background.
    /// The handle is kept so the next [`start`](Self::start) runs after it.
    fn spawn_post_finish_reset(&self, units: Vec<TrackedUnit>) {
        let job_class = self.inner.job_class;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%job_class, "No runtime, skipping post-finish progress reset");
            return;
        };
        let service = self.inner.service.clone();
        let handle = runtime.spawn(async move {
            if let Err(e) = service.reset_progress(job_class, &units).await {
                warn!(%job_class, error = %e, "Post-finish progress reset failed");
            }
        });
        *self
            .inner
            .pending_reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn abort(&self, mut state: MutexGuard<'_, CoordinatorState>, reason: String) -> TickVerdict {
        let job_class = self.inner.job_class;
        let episode_id = state.episode_id.unwrap_or_else(Uuid::nil);

        if let Err(e) = self.inner.records.clear(job_class) {
            warn!(%job_class, error = %e, "Failed to clear persisted record");
        }
        state.last_error = Some(reason.clone());
        let poll = state.reset_to_idle();
        self.inner.guard.reset(job_class);
        self.publish(&state);
        drop(state);
        drop(poll);

        error!(%job_class, %episode_id, error = %reason, "Job aborted");
        self.emit(CoordinatorEvent::Aborted {
            job_class,
            episode_id,
            error: reason,
        });
        TickVerdict::Stop
    }
}
