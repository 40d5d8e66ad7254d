//! Periodic progress polling.
//!
//! [`Poller::arm`] spawns one task per job class. Each tick queries every
//! tracked unit concurrently, then hands the batch to a [`TickSink`]. The next
//! tick is only scheduled once the sink has returned, so ticks of one handle
//! never overlap.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use jobtrack_core::{Error, JobClass, ProgressService, Result, TrackedUnit, UnitObservation};

/// Identity of one armed polling loop. A fresh id is minted per arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollId(Uuid);

impl PollId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the sink wants the poller to do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    Continue,
    Stop,
}

/// Receiver of tick results.
pub trait TickSink: Send + Sync + 'static {
    /// Called once per tick with one observation per tracked unit id.
    fn on_tick(&self, poll_id: PollId, observations: Vec<(u64, UnitObservation)>) -> TickVerdict;
}

/// Handle to an armed polling loop.
///
/// Dropping the handle disarms the loop.
#[derive(Debug)]
pub struct PollHandle {
    id: PollId,
    job_class: JobClass,
    cancel: Option<oneshot::Sender<()>>,
}

impl PollHandle {
    pub fn id(&self) -> PollId {
        self.id
    }

    pub fn job_class(&self) -> JobClass {
        self.job_class
    }

    /// Stop the loop. No tick fires afterwards; a tick already in flight is
    /// abandoned and its result never reaches the sink.
    pub fn disarm(mut self) {
        self.cancel_loop();
    }

    fn cancel_loop(&mut self) {
        if let Some(tx) = self.cancel.take() {
            debug!(job_class = %self.job_class, poll_id = %self.id, "Disarming poller");
            let _ = tx.send(());
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel_loop();
    }
}

/// Spawns polling loops against a shared progress service.
#[derive(Clone)]
pub struct Poller {
    service: Arc<dyn ProgressService>,
    active: Arc<AtomicUsize>,
}

impl Poller {
    pub fn new(service: Arc<dyn ProgressService>) -> Self {
        Self {
            service,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn service(&self) -> &Arc<dyn ProgressService> {
        &self.service
    }

    /// Number of polling loops currently running.
    pub fn active_loops(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Start polling `units` every `interval`. The first tick fires
    /// immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(
        &self,
        job_class: JobClass,
        units: Vec<TrackedUnit>,
        interval: Duration,
        sink: Arc<dyn TickSink>,
    ) -> Result<PollHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("cannot arm poller outside a runtime: {e}")))?;

        let id = PollId::new();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let service = self.service.clone();
        let active = ActiveLoop::enter(self.active.clone());

        info!(
            job_class = %job_class,
            poll_id = %id,
            units = units.len(),
            interval_ms = interval.as_millis() as u64,
            "Poller armed"
        );

        runtime.spawn(async move {
            let _active = active;
            run_loop(service, job_class, units, interval, sink, id, cancel_rx).await;
        });

        Ok(PollHandle {
            id,
            job_class,
            cancel: Some(cancel_tx),
        })
    }
}

struct ActiveLoop(Arc<AtomicUsize>);

impl ActiveLoop {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveLoop {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_loop(
    service: Arc<dyn ProgressService>,
    job_class: JobClass,
    units: Vec<TrackedUnit>,
    interval: Duration,
    sink: Arc<dyn TickSink>,
    id: PollId,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel_rx => break,
            _ = ticker.tick() => {}
        }
        tick += 1;

        let queries = units.iter().map(|unit| {
            let service = service.clone();
            async move {
                let result = service.get_progress(job_class, unit).await;
                (unit.id, UnitObservation::from_query(result))
            }
        });

        let observations = tokio::select! {
            biased;
            _ = &mut cancel_rx => break,
            observations = join_all(queries) => observations,
        };

        // Cancelled between the last query and now.
        if !matches!(cancel_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            break;
        }

        debug!(job_class = %job_class, poll_id = %id, tick, "Poll tick complete");
        if sink.on_tick(id, observations) == TickVerdict::Stop {
            break;
        }
    }

    info!(job_class = %job_class, poll_id = %id, ticks = tick, "Poller stopped");
}
