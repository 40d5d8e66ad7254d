//! Typed access to persisted coordinator records.

use std::sync::Arc;

use tracing::debug;

use jobtrack_core::defaults::STORAGE_KEY_PREFIX;
use jobtrack_core::{Error, JobClass, PersistedRecord, PersistenceAdapter, Result};

/// Stores one [`PersistedRecord`] per job class under `jobtrack:<class>`.
#[derive(Clone)]
pub struct RecordStore {
    adapter: Arc<dyn PersistenceAdapter>,
}

impl RecordStore {
    pub fn new(adapter: Arc<dyn PersistenceAdapter>) -> Self {
        Self { adapter }
    }

    /// Storage key used for a job class.
    pub fn key_for(job_class: JobClass) -> String {
        format!("{STORAGE_KEY_PREFIX}{}", job_class.as_str())
    }

    pub fn save(&self, record: &PersistedRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.adapter.write(&Self::key_for(record.job_class), &json)?;
        debug!(job_class = %record.job_class, units = record.unit_ids.len(), "Saved coordinator record");
        Ok(())
    }

    /// Load the record for a class.
    ///
    /// Returns `Ok(None)` when nothing is stored and `Error::Serialization`
    /// when the stored document cannot be decoded.
    pub fn load(&self, job_class: JobClass) -> Result<Option<PersistedRecord>> {
        let Some(raw) = self.adapter.read(&Self::key_for(job_class))? else {
            return Ok(None);
        };
        let record: PersistedRecord = serde_json::from_str(&raw)
            .map_err(|e| Error::Serialization(format!("record for {job_class}: {e}")))?;
        if record.job_class != job_class {
            return Err(Error::Serialization(format!(
                "record stored under {job_class} belongs to {}",
                record.job_class
            )));
        }
        Ok(Some(record))
    }

    pub fn clear(&self, job_class: JobClass) -> Result<()> {
        self.adapter.remove(&Self::key_for(job_class))
    }
}
