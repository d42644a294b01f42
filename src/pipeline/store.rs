//! Job and plan persistence
//!
//! Two sled trees keyed by job id: `jobs` holds [`GenerationJob`] records and `plans` holds
//! the matching [`PartialPlan`]. Status changes touch both in one transaction so the plan's
//! `generating_day` never disagrees with the job. Every mutation is flushed before returning;
//! a returned `Ok` is a durable checkpoint.

use crate::clock::Clock;
use crate::error::{ApiError, StorageError};
use crate::pipeline::model::{
    DayContent, FailureRecord, GenerationJob, JobId, JobStatus, PartialPlan, PlanMetadata,
};
use crate::store::{decode, encode, to_storage_io};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};
use std::sync::Arc;
use tracing::debug;

const TREE_JOBS: &str = "jobs";
const TREE_PLANS: &str = "plans";

pub trait JobStore: Send + Sync {
    /// Persist a new job together with its (possibly seeded) plan.
    fn create(&self, job: &GenerationJob, plan: &PartialPlan) -> Result<(), ApiError>;

    fn job(&self, job_id: &JobId) -> Result<Option<GenerationJob>, ApiError>;

    fn plan(&self, job_id: &JobId) -> Result<Option<PartialPlan>, ApiError>;

    /// All jobs, oldest first.
    fn jobs(&self) -> Result<Vec<GenerationJob>, ApiError>;

    fn put_metadata(&self, job_id: &JobId, metadata: &PlanMetadata) -> Result<PartialPlan, ApiError>;

    /// Insert or replace one day of the plan.
    fn put_day(&self, job_id: &JobId, day: &DayContent) -> Result<PartialPlan, ApiError>;

    /// Move the job to `to`. Rejects transitions that are not forward.
    fn advance(&self, job_id: &JobId, to: JobStatus) -> Result<GenerationJob, ApiError>;

    /// Move the job to `Error` and keep the failure on it.
    fn fail(&self, job_id: &JobId, failure: FailureRecord) -> Result<GenerationJob, ApiError>;

    /// Keep a failure on the job without touching its status.
    fn record_failure(&self, job_id: &JobId, failure: FailureRecord) -> Result<(), ApiError>;

    /// Set or clear the abort flag observed at step boundaries.
    fn set_abort(&self, job_id: &JobId, requested: bool) -> Result<GenerationJob, ApiError>;
}

pub struct SledJobStore {
    db: sled::Db,
    jobs: Tree,
    plans: Tree,
    clock: Arc<dyn Clock>,
}

impl SledJobStore {
    pub fn open(db: &sled::Db, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        Ok(Self {
            db: db.clone(),
            jobs: db.open_tree(TREE_JOBS).map_err(to_storage_io)?,
            plans: db.open_tree(TREE_PLANS).map_err(to_storage_io)?,
            clock,
        })
    }

    fn flush(&self) -> Result<(), ApiError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }

    fn read<T: serde::de::DeserializeOwned>(
        tree: &Tree,
        job_id: &JobId,
    ) -> Result<Option<T>, ApiError> {
        match tree.get(job_id.as_str().as_bytes()).map_err(to_storage_io)? {
            Some(raw) => Ok(Some(decode(job_id.as_str(), &raw)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write of one plan.
    fn update_plan<F>(&self, job_id: &JobId, apply: F) -> Result<PartialPlan, ApiError>
    where
        F: Fn(&mut PartialPlan),
    {
        let key = job_id.as_str();
        let now = self.clock.now();
        let outcome = self.plans.transaction(|plans| {
            let raw = plans.get(key.as_bytes())?.ok_or_else(|| {
                ConflictableTransactionError::Abort(ApiError::JobNotFound(key.to_string()))
            })?;
            let mut plan: PartialPlan = decode(key, &raw)
                .map_err(|e| ConflictableTransactionError::Abort(ApiError::from(e)))?;
            apply(&mut plan);
            plan.updated_at = now;
            let encoded = encode(key, &plan)
                .map_err(|e| ConflictableTransactionError::Abort(ApiError::from(e)))?;
            plans.insert(key.as_bytes(), encoded)?;
            Ok(plan)
        });
        let plan = unwrap_transaction(outcome)?;
        self.flush()?;
        Ok(plan)
    }

    /// Read-modify-write of a job and its plan.
    fn update_job<F>(&self, job_id: &JobId, apply: F) -> Result<GenerationJob, ApiError>
    where
        F: Fn(&mut GenerationJob, &mut PartialPlan) -> Result<(), ApiError>,
    {
        let key = job_id.as_str();
        let now = self.clock.now();
        let outcome = (&self.jobs, &self.plans).transaction(|(jobs, plans)| {
            let not_found =
                || ConflictableTransactionError::Abort(ApiError::JobNotFound(key.to_string()));
            let raw_job = jobs.get(key.as_bytes())?.ok_or_else(not_found)?;
            let raw_plan = plans.get(key.as_bytes())?.ok_or_else(not_found)?;
            let mut job: GenerationJob = decode(key, &raw_job)
                .map_err(|e| ConflictableTransactionError::Abort(ApiError::from(e)))?;
            let mut plan: PartialPlan = decode(key, &raw_plan)
                .map_err(|e| ConflictableTransactionError::Abort(ApiError::from(e)))?;

            apply(&mut job, &mut plan).map_err(ConflictableTransactionError::Abort)?;
            job.updated_at = now;
            plan.updated_at = now;

            let job_bytes = encode(key, &job)
                .map_err(|e| ConflictableTransactionError::Abort(ApiError::from(e)))?;
            let plan_bytes = encode(key, &plan)
                .map_err(|e| ConflictableTransactionError::Abort(ApiError::from(e)))?;
            jobs.insert(key.as_bytes(), job_bytes)?;
            plans.insert(key.as_bytes(), plan_bytes)?;
            Ok(job)
        });
        let job = unwrap_transaction(outcome)?;
        self.flush()?;
        Ok(job)
    }
}

fn unwrap_transaction<T>(outcome: Result<T, TransactionError<ApiError>>) -> Result<T, ApiError> {
    match outcome {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(to_storage_io(e).into()),
    }
}

impl JobStore for SledJobStore {
    fn create(&self, job: &GenerationJob, plan: &PartialPlan) -> Result<(), ApiError> {
        let key = job.job_id.as_str();
        let job_bytes = encode(key, job)?;
        let plan_bytes = encode(key, plan)?;
        let outcome = (&self.jobs, &self.plans).transaction(|(jobs, plans)| {
            if jobs.get(key.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(ApiError::InvalidRequest(
                    format!("job {} already exists", key),
                )));
            }
            jobs.insert(key.as_bytes(), job_bytes.clone())?;
            plans.insert(key.as_bytes(), plan_bytes.clone())?;
            Ok(())
        });
        unwrap_transaction(outcome)?;
        self.flush()?;
        debug!(job_id = key, owner = %job.owner_identity, "job created");
        Ok(())
    }

    fn job(&self, job_id: &JobId) -> Result<Option<GenerationJob>, ApiError> {
        Self::read(&self.jobs, job_id)
    }

    fn plan(&self, job_id: &JobId) -> Result<Option<PartialPlan>, ApiError> {
        Self::read(&self.plans, job_id)
    }

    fn jobs(&self) -> Result<Vec<GenerationJob>, ApiError> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter() {
            let (key, value) = item.map_err(to_storage_io)?;
            let key = String::from_utf8_lossy(&key);
            jobs.push(decode::<GenerationJob>(&key, &value)?);
        }
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(jobs)
    }

    fn put_metadata(&self, job_id: &JobId, metadata: &PlanMetadata) -> Result<PartialPlan, ApiError> {
        self.update_plan(job_id, |plan| plan.metadata = Some(metadata.clone()))
    }

    fn put_day(&self, job_id: &JobId, day: &DayContent) -> Result<PartialPlan, ApiError> {
        self.update_plan(job_id, |plan| plan.upsert_day(day.clone()))
    }

    fn advance(&self, job_id: &JobId, to: JobStatus) -> Result<GenerationJob, ApiError> {
        self.update_job(job_id, |job, plan| {
            if !job.status.can_transition_to(to) {
                return Err(ApiError::InvalidTransition {
                    job_id: job.job_id.to_string(),
                    from: job.status.to_string(),
                    to: to.to_string(),
                });
            }
            job.status = to;
            match to {
                JobStatus::DayPending(day) => plan.generating_day = Some(day),
                JobStatus::Complete => {
                    plan.generating_day = None;
                    plan.is_complete = true;
                }
                _ => {}
            }
            Ok(())
        })
    }

    fn fail(&self, job_id: &JobId, failure: FailureRecord) -> Result<GenerationJob, ApiError> {
        self.update_job(job_id, |job, plan| {
            if !job.status.can_transition_to(JobStatus::Error) {
                return Err(ApiError::InvalidTransition {
                    job_id: job.job_id.to_string(),
                    from: job.status.to_string(),
                    to: JobStatus::Error.to_string(),
                });
            }
            job.status = JobStatus::Error;
            job.failure = Some(failure.clone());
            plan.generating_day = None;
            Ok(())
        })
    }

    fn record_failure(&self, job_id: &JobId, failure: FailureRecord) -> Result<(), ApiError> {
        self.update_job(job_id, |job, _| {
            job.failure = Some(failure.clone());
            Ok(())
        })
        .map(|_| ())
    }

    fn set_abort(&self, job_id: &JobId, requested: bool) -> Result<GenerationJob, ApiError> {
        self.update_job(job_id, |job, _| {
            job.abort_requested = requested;
            Ok(())
        })
    }
}
