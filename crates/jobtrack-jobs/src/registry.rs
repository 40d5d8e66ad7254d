//! Process-wide owner of the job coordinators.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use jobtrack_core::{
    CoordinatorStatus, EventBus, EventEnvelope, FinishReport, JobClass, PersistenceAdapter,
    ProgressService, Result, TrackedUnit,
};
use jobtrack_store::RecordStore;

use crate::coordinator::{CoordinatorConfig, JobCoordinator};
use crate::guard::CompletionGuard;
use crate::poller::Poller;

/// One coordinator per job class, sharing a poller, a completion guard and an
/// event bus.
pub struct CoordinatorRegistry {
    coordinators: [JobCoordinator; 3],
    records: RecordStore,
    poller: Poller,
    guard: Arc<CompletionGuard>,
    events: EventBus,
}

/// Builder for [`CoordinatorRegistry`].
pub struct RegistryBuilder {
    service: Arc<dyn ProgressService>,
    store: Arc<dyn PersistenceAdapter>,
    config: CoordinatorConfig,
    events: Option<EventBus>,
}

impl RegistryBuilder {
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing event bus instead of creating one.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> CoordinatorRegistry {
        let records = RecordStore::new(self.store);
        let poller = Poller::new(self.service.clone());
        let guard = Arc::new(CompletionGuard::new());
        let events = self.events.unwrap_or_default();

        let coordinators = JobClass::ALL.map(|job_class| {
            JobCoordinator::new(
                job_class,
                self.config.clone(),
                self.service.clone(),
                records.clone(),
                poller.clone(),
                guard.clone(),
                events.clone(),
            )
        });

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            not_started_limit = self.config.not_started_limit,
            recovery_not_started_limit = self.config.recovery_not_started_limit,
            reset_on_finish = self.config.reset_on_finish,
            "Coordinator registry ready"
        );

        CoordinatorRegistry {
            coordinators,
            records,
            poller,
            guard,
            events,
        }
    }
}

impl CoordinatorRegistry {
    pub fn builder(
        service: Arc<dyn ProgressService>,
        store: Arc<dyn PersistenceAdapter>,
    ) -> RegistryBuilder {
        RegistryBuilder {
            service,
            store,
            config: CoordinatorConfig::default(),
            events: None,
        }
    }

    pub fn coordinator(&self, job_class: JobClass) -> &JobCoordinator {
        &self.coordinators[job_class.index()]
    }

    pub fn coordinators(&self) -> impl Iterator<Item = &JobCoordinator> {
        self.coordinators.iter()
    }

    pub async fn start(&self, job_class: JobClass, units: Vec<TrackedUnit>) -> Result<Uuid> {
        self.coordinator(job_class).start(units).await
    }

    pub fn stop(&self, job_class: JobClass) -> Result<bool> {
        self.coordinator(job_class).stop()
    }

    pub fn status(&self, job_class: JobClass) -> CoordinatorStatus {
        self.coordinator(job_class).status()
    }

    pub fn statuses(&self) -> Vec<CoordinatorStatus> {
        self.coordinators.iter().map(JobCoordinator::status).collect()
    }

    pub fn on_finish<F>(&self, job_class: JobClass, callback: F)
    where
        F: Fn(&FinishReport) + Send + Sync + 'static,
    {
        self.coordinator(job_class).on_finish(callback);
    }

    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn guard(&self) -> &CompletionGuard {
        &self.guard
    }

    /// Detach every coordinator. Persisted records are kept so the next
    /// process can recover running jobs.
    pub fn shutdown(&self) {
        let detached = self.coordinators.iter().filter(|c| c.detach()).count();
        info!(detached, "Coordinator registry shut down");
    }
}
