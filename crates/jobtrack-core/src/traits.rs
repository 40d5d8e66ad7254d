//! Seams between the coordinator and its external collaborators.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{JobClass, ProgressReading, TrackedUnit, TriggerAck};

/// Remote service that runs the jobs and reports their progress.
#[async_trait]
pub trait ProgressService: Send + Sync {
    /// Current progress of one unit.
    ///
    /// Returns [`ProgressReading::NotStarted`] when no progress record exists,
    /// rather than an error.
    async fn get_progress(&self, job_class: JobClass, unit: &TrackedUnit)
        -> Result<ProgressReading>;

    /// Clear server-side progress records before (or after) a run.
    async fn reset_progress(&self, job_class: JobClass, units: &[TrackedUnit]) -> Result<()>;

    /// Start the remote job. The acknowledgement does not imply completion.
    async fn trigger_job(&self, job_class: JobClass, units: &[TrackedUnit]) -> Result<TriggerAck>;
}

/// Durable key/value store consulted synchronously at startup.
///
/// Implementations must make `write` atomic: a concurrent `read` sees either
/// the previous value or the new one, never a partial record.
pub trait PersistenceAdapter: Send + Sync {
    fn write(&self, key: &str, value: &str) -> Result<()>;

    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Removing an absent key succeeds.
    fn remove(&self, key: &str) -> Result<()>;
}
