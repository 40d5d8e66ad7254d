//! Scripted progress service for deterministic testing.
//!
//! Each unit replays a script of responses, one per query, repeating the last
//! step once the script is exhausted. Unscripted units report
//! [`ProgressReading::NotStarted`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jobtrack_client::mock::{MockProgressService, MockResponse};
//!
//! let service = MockProgressService::new().with_script(
//!     JobClass::SiteScrape,
//!     1,
//!     vec![MockResponse::NotStarted, MockResponse::snapshot(2, 2, "Terminé")],
//! );
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use jobtrack_core::{
    Error, JobClass, ProgressReading, ProgressService, ProgressSnapshot, Result, TrackedUnit,
    TriggerAck,
};

/// A failure the mock can produce. Mirrors the remote error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    Request(String),
    Serialization(String),
    Unauthorized(String),
    Rejected(String),
}

impl MockFailure {
    fn to_error(&self) -> Error {
        match self {
            MockFailure::Request(m) => Error::Request(m.clone()),
            MockFailure::Serialization(m) => Error::Serialization(m.clone()),
            MockFailure::Unauthorized(m) => Error::Unauthorized(m.clone()),
            MockFailure::Rejected(m) => Error::Rejected(m.clone()),
        }
    }
}

/// One scripted answer to a progress query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    Snapshot(ProgressSnapshot),
    NotStarted,
    Fail(MockFailure),
}

impl MockResponse {
    pub fn snapshot(current: u64, total: u64, status: &str) -> Self {
        MockResponse::Snapshot(ProgressSnapshot::new(current, total, status))
    }

    pub fn transient(message: &str) -> Self {
        MockResponse::Fail(MockFailure::Request(message.to_string()))
    }

    pub fn malformed(message: &str) -> Self {
        MockResponse::Fail(MockFailure::Serialization(message.to_string()))
    }

    pub fn unauthorized(message: &str) -> Self {
        MockResponse::Fail(MockFailure::Unauthorized(message.to_string()))
    }
}

#[derive(Debug, Default)]
struct Script {
    steps: Vec<MockResponse>,
    cursor: usize,
}

impl Script {
    fn next(&mut self) -> MockResponse {
        let Some(last) = self.steps.len().checked_sub(1) else {
            return MockResponse::NotStarted;
        };
        let step = self.steps[self.cursor.min(last)].clone();
        self.cursor += 1;
        step
    }
}

#[derive(Debug, Default)]
struct MockState {
    scripts: HashMap<(JobClass, u64), Script>,
    progress_calls: HashMap<(JobClass, u64), usize>,
    trigger_calls: Vec<(JobClass, Vec<TrackedUnit>)>,
    reset_calls: Vec<(JobClass, Vec<TrackedUnit>)>,
    reset_latencies: Vec<Duration>,
    reset_started: usize,
    call_order: Vec<&'static str>,
    trigger_failure: Option<MockFailure>,
    reset_failure: Option<MockFailure>,
    trigger_ack: TriggerAck,
}

/// Mock progress service for testing.
///
/// Clones share state, so a test can keep one handle for assertions while the
/// coordinator owns another.
#[derive(Clone, Default)]
pub struct MockProgressService {
    state: Arc<Mutex<MockState>>,
    in_flight: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
    latency: Duration,
    trigger_latency: Duration,
}

impl MockProgressService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script the responses of one unit.
    pub fn with_script(self, job_class: JobClass, unit_id: u64, steps: Vec<MockResponse>) -> Self {
        self.set_script(job_class, unit_id, steps);
        self
    }

    /// Replace the script of one unit, restarting it from the first step.
    pub fn set_script(&self, job_class: JobClass, unit_id: u64, steps: Vec<MockResponse>) {
        self.state()
            .scripts
            .insert((job_class, unit_id), Script { steps, cursor: 0 });
    }

    /// Make every `trigger_job` call fail.
    pub fn with_trigger_failure(self, failure: MockFailure) -> Self {
        self.state().trigger_failure = Some(failure);
        self
    }

    /// Make every `reset_progress` call fail.
    pub fn with_reset_failure(self, failure: MockFailure) -> Self {
        self.state().reset_failure = Some(failure);
        self
    }

    pub fn with_trigger_ack(self, ack: TriggerAck) -> Self {
        self.state().trigger_ack = ack;
        self
    }

    /// Delay every progress query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay the n-th `reset_progress` call by the n-th latency. Calls past
    /// the end of the list are not delayed.
    pub fn with_reset_latencies(self, latencies: Vec<Duration>) -> Self {
        self.state().reset_latencies = latencies;
        self
    }

    /// Delay every `trigger_job` call by `latency`.
    pub fn with_trigger_latency(mut self, latency: Duration) -> Self {
        self.trigger_latency = latency;
        self
    }

    /// Hold progress queries until [`release`](Self::release) grants permits.
    pub fn with_gate(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` gated queries complete.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Progress queries currently waiting on the gate or latency.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn progress_call_count(&self, job_class: JobClass, unit_id: u64) -> usize {
        self.state()
            .progress_calls
            .get(&(job_class, unit_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_progress_calls(&self) -> usize {
        self.state().progress_calls.values().sum()
    }

    pub fn trigger_call_count(&self) -> usize {
        self.state().trigger_calls.len()
    }

    pub fn reset_call_count(&self) -> usize {
        self.state().reset_calls.len()
    }

    /// `"reset"` and `"trigger"`, in the order the calls completed.
    pub fn call_order(&self) -> Vec<&'static str> {
        self.state().call_order.clone()
    }

    /// Units passed to each `trigger_job` call, in call order.
    pub fn trigger_calls(&self) -> Vec<(JobClass, Vec<TrackedUnit>)> {
        self.state().trigger_calls.clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProgressService for MockProgressService {
    async fn get_progress(
        &self,
        job_class: JobClass,
        unit: &TrackedUnit,
    ) -> Result<ProgressReading> {
        let _in_flight = InFlight::enter(&self.in_flight);

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Internal("mock gate closed".to_string()))?;
            permit.forget();
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let step = {
            let mut state = self.state();
            *state
                .progress_calls
                .entry((job_class, unit.id))
                .or_default() += 1;
            state
                .scripts
                .get_mut(&(job_class, unit.id))
                .map(Script::next)
                .unwrap_or(MockResponse::NotStarted)
        };

        match step {
            MockResponse::Snapshot(s) => Ok(ProgressReading::Snapshot(s)),
            MockResponse::NotStarted => Ok(ProgressReading::NotStarted),
            MockResponse::Fail(f) => Err(f.to_error()),
        }
    }

    async fn reset_progress(&self, job_class: JobClass, units: &[TrackedUnit]) -> Result<()> {
        let latency = {
            let mut state = self.state();
            let latency = state.reset_latencies.get(state.reset_started).copied();
            state.reset_started += 1;
            latency.unwrap_or_default()
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.reset_calls.push((job_class, units.to_vec()));
        state.call_order.push("reset");
        match &state.reset_failure {
            Some(f) => Err(f.to_error()),
            None => Ok(()),
        }
    }

    async fn trigger_job(&self, job_class: JobClass, units: &[TrackedUnit]) -> Result<TriggerAck> {
        if !self.trigger_latency.is_zero() {
            tokio::time::sleep(self.trigger_latency).await;
        }
        let mut state = self.state();
        state.trigger_calls.push((job_class, units.to_vec()));
        state.call_order.push("trigger");
        match &state.trigger_failure {
            Some(f) => Err(f.to_error()),
            None => Ok(state.trigger_ack.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_repeats_last_step() {
        let unit = TrackedUnit::new(1, "a");
        let mock = MockProgressService::new().with_script(
            JobClass::SiteScrape,
            1,
            vec![MockResponse::NotStarted, MockResponse::snapshot(1, 2, "running")],
        );

        let r1 = mock.get_progress(JobClass::SiteScrape, &unit).await.unwrap();
        let r2 = mock.get_progress(JobClass::SiteScrape, &unit).await.unwrap();
        let r3 = mock.get_progress(JobClass::SiteScrape, &unit).await.unwrap();

        assert_eq!(r1, ProgressReading::NotStarted);
        assert_eq!(r2, r3);
        assert_eq!(mock.progress_call_count(JobClass::SiteScrape, 1), 3);
    }

    #[tokio::test]
    async fn test_unscripted_unit_not_started() {
        let mock = MockProgressService::new();
        let unit = TrackedUnit::implicit(JobClass::DocumentVectorization);
        let reading = mock
            .get_progress(JobClass::DocumentVectorization, &unit)
            .await
            .unwrap();
        assert_eq!(reading, ProgressReading::NotStarted);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let unit = TrackedUnit::new(2, "b");
        let mock = MockProgressService::new().with_script(
            JobClass::SiteScrape,
            2,
            vec![MockResponse::unauthorized("token expired")],
        );
        let err = mock.get_progress(JobClass::SiteScrape, &unit).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_trigger_and_reset_outcomes() {
        let units = vec![TrackedUnit::new(1, "a")];
        let mock = MockProgressService::new()
            .with_trigger_failure(MockFailure::Rejected("HTTP 422".into()));

        assert!(mock.reset_progress(JobClass::SiteScrape, &units).await.is_ok());
        assert!(matches!(
            mock.trigger_job(JobClass::SiteScrape, &units).await,
            Err(Error::Rejected(_))
        ));
        assert_eq!(mock.reset_call_count(), 1);
        assert_eq!(mock.trigger_calls()[0].1, units);
    }

    #[tokio::test]
    async fn test_gate_holds_queries() {
        let mock = MockProgressService::new().with_gate();
        let unit = TrackedUnit::new(1, "a");

        let task = {
            let mock = mock.clone();
            let unit = unit.clone();
            tokio::spawn(async move { mock.get_progress(JobClass::SiteScrape, &unit).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(mock.in_flight(), 1);
        assert_eq!(mock.total_progress_calls(), 0);

        mock.release(1);
        task.await.unwrap().unwrap();
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(mock.total_progress_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_latencies_apply_per_call() {
        let units = vec![TrackedUnit::new(1, "a")];
        let mock = MockProgressService::new()
            .with_reset_latencies(vec![Duration::ZERO, Duration::from_secs(3)]);

        let started = tokio::time::Instant::now();
        mock.reset_progress(JobClass::SiteScrape, &units).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        let slow = {
            let mock = mock.clone();
            let units = units.clone();
            tokio::spawn(async move { mock.reset_progress(JobClass::SiteScrape, &units).await })
        };
        tokio::task::yield_now().await;
        mock.trigger_job(JobClass::SiteScrape, &units).await.unwrap();
        slow.await.unwrap().unwrap();

        assert_eq!(mock.call_order(), vec!["reset", "trigger", "reset"]);
        assert_eq!(mock.reset_call_count(), 2);
    }
}
