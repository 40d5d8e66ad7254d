//! Coordinator event types and the event bus used to fan them out.
//!
//! Every lifecycle change of a job class is emitted once on the bus. Consumers
//! (CLI printers, notification hooks) subscribe independently; a slow
//! subscriber only lags itself.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{CoordinatorStatus, FinishReport, JobClass, TrackedUnit};

/// Domain events emitted by job coordinators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// A class entered Running, either from `start` or from recovery.
    Started {
        job_class: JobClass,
        episode_id: Uuid,
        units: Vec<TrackedUnit>,
        recovered: bool,
    },
    /// A polling tick was merged.
    Progress { status: CoordinatorStatus },
    /// The finish predicate held; emitted exactly once per episode.
    Finished { report: FinishReport },
    /// The caller stopped the class; no finish side effect ran.
    Stopped {
        job_class: JobClass,
        episode_id: Option<Uuid>,
    },
    /// A fatal remote error stopped the class.
    Aborted {
        job_class: JobClass,
        episode_id: Uuid,
        error: String,
    },
    /// `start` failed and was rolled back.
    StartFailed { job_class: JobClass, error: String },
}

impl CoordinatorEvent {
    /// Dot-namespaced event type (e.g. `"job.finished"`).
    pub fn event_type(&self) -> &'static str {
        match self {
            CoordinatorEvent::Started { .. } => "job.started",
            CoordinatorEvent::Progress { .. } => "job.progress",
            CoordinatorEvent::Finished { .. } => "job.finished",
            CoordinatorEvent::Stopped { .. } => "job.stopped",
            CoordinatorEvent::Aborted { .. } => "job.aborted",
            CoordinatorEvent::StartFailed { .. } => "job.start_failed",
        }
    }

    pub fn job_class(&self) -> JobClass {
        match self {
            CoordinatorEvent::Started { job_class, .. }
            | CoordinatorEvent::Stopped { job_class, .. }
            | CoordinatorEvent::Aborted { job_class, .. }
            | CoordinatorEvent::StartFailed { job_class, .. } => *job_class,
            CoordinatorEvent::Progress { status } => status.job_class,
            CoordinatorEvent::Finished { report } => report.job_class,
        }
    }
}

/// Envelope carrying an event plus its identity and timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: CoordinatorEvent,
}

impl EventEnvelope {
    pub fn new(event: CoordinatorEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            occurred_at: Utc::now(),
            payload: event,
        }
    }
}

/// Broadcast bus shared by all coordinators of a registry.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently if nobody listens.
    pub fn emit(&self, event: CoordinatorEvent) {
        let envelope = EventEnvelope::new(event);
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive events. Each subscriber gets its own stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
