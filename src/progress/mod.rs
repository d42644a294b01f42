//! Job progress log
//!
//! Append-only, per-job events with strictly increasing sequence numbers. The pipeline
//! records through [`ProgressLog::emit_best_effort`]; a failed append never fails a step.

pub mod event;
pub mod store;

pub use event::{
    JobCreatedData, JobEndedData, ProgressEnvelope, ProgressEvent, QuotaRejectedData,
    StepEventData, StepFailedData,
};
pub use store::ProgressStore;

use crate::error::StorageError;
use serde::Serialize;
use tracing::warn;

#[derive(Clone)]
pub struct ProgressLog {
    store: ProgressStore,
}

impl ProgressLog {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            store: ProgressStore::new(db)?,
        })
    }

    pub fn emit<T: Serialize>(
        &self,
        job: &str,
        event_type: &str,
        data: &T,
    ) -> Result<ProgressEvent, StorageError> {
        let data = serde_json::to_value(data).map_err(|e| StorageError::Corrupt {
            key: job.to_string(),
            message: e.to_string(),
        })?;
        self.store
            .append(ProgressEnvelope::with_now(job, event_type, data))
    }

    pub fn emit_best_effort<T: Serialize>(&self, job: &str, event_type: &str, data: &T) {
        if let Err(err) = self.emit(job, event_type, data) {
            warn!(job_id = job, event_type, error = %err, "failed to record progress event");
        }
    }

    pub fn events(&self, job: &str) -> Result<Vec<ProgressEvent>, StorageError> {
        self.store.read_events(job)
    }

    pub fn events_after(&self, job: &str, after_seq: u64) -> Result<Vec<ProgressEvent>, StorageError> {
        self.store.read_events_after(job, after_seq)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.store.flush()
    }
}
