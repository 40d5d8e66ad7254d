//! Resume tracking of jobs that were running before a restart.

use serde::Serialize;
use tracing::{info, warn};

use jobtrack_core::{Error, JobClass};

use crate::registry::CoordinatorRegistry;

/// Outcome of one bootstrap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Classes whose polling was re-armed.
    pub recovered: Vec<JobClass>,
    /// Classes that were already tracked by this process.
    pub already_running: Vec<JobClass>,
    /// Classes whose stored record was inactive or unreadable and was removed.
    pub discarded: Vec<JobClass>,
    /// Classes that could not be recovered; their record is kept.
    pub failed: Vec<(JobClass, String)>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty()
            && self.already_running.is_empty()
            && self.discarded.is_empty()
            && self.failed.is_empty()
    }
}

/// Startup pass over persisted records.
pub struct RecoveryBootstrap;

impl RecoveryBootstrap {
    /// Inspect every class's record and recover the active ones.
    ///
    /// Idempotent: classes already Running are reported, not re-armed.
    /// Must be called from within a Tokio runtime.
    pub fn run(registry: &CoordinatorRegistry) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let records = registry.records();

        for job_class in JobClass::ALL {
            let record = match records.load(job_class) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%job_class, error = %e, "Unreadable job record, discarding");
                    Self::discard(registry, job_class, &mut report);
                    continue;
                }
            };

            if !record.active {
                info!(%job_class, "Inactive job record, discarding");
                Self::discard(registry, job_class, &mut report);
                continue;
            }

            match registry.coordinator(job_class).recover(record) {
                Ok(true) => report.recovered.push(job_class),
                Ok(false) => report.already_running.push(job_class),
                Err(Error::InvalidInput(reason)) => {
                    warn!(%job_class, %reason, "Invalid job record, discarding");
                    Self::discard(registry, job_class, &mut report);
                }
                Err(e) => {
                    warn!(%job_class, error = %e, "Failed to recover job");
                    report.failed.push((job_class, e.to_string()));
                }
            }
        }

        info!(
            recovered = report.recovered.len(),
            already_running = report.already_running.len(),
            discarded = report.discarded.len(),
            failed = report.failed.len(),
            "Recovery bootstrap complete"
        );
        report
    }

    fn discard(registry: &CoordinatorRegistry, job_class: JobClass, report: &mut RecoveryReport) {
        if let Err(e) = registry.records().clear(job_class) {
            warn!(%job_class, error = %e, "Failed to remove job record");
        }
        report.discarded.push(job_class);
    }
}
