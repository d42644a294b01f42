//! Pipeline Orchestrator
//!
//! Drives a job through metadata and the seven day steps. Each step's output is written to
//! the store before the status moves past it, so a crash or store failure between the two
//! leaves the job at the step it was on and `resume` picks it up again.
//!
//! A job is driven by at most one task per process; the claim set is only locked to insert
//! or remove an id, never across a step.

use crate::clock::Clock;
use crate::error::{ApiError, QuotaError, StorageError};
use crate::pipeline::executor::{PreparedStep, StepExecutor};
use crate::pipeline::model::{
    DayContent, FailureRecord, GenerationJob, JobId, JobStatus, PartialPlan, PlanMetadata,
    PlanRequest, RunOutcome, Step, PLAN_DAYS,
};
use crate::pipeline::store::JobStore;
use crate::progress::event::{
    DAY_RERUN, JOB_ABORTED, JOB_COMPLETED, JOB_CREATED, QUOTA_REJECTED, STEP_COMMITTED,
    STEP_FAILED, STEP_STARTED,
};
use crate::progress::{
    JobCreatedData, JobEndedData, ProgressEvent, ProgressLog, QuotaRejectedData, StepEventData,
    StepFailedData,
};
use crate::quota::{QuotaLedger, Reservation};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    executor: Arc<StepExecutor>,
    clock: Arc<dyn Clock>,
    ledger: Option<Arc<QuotaLedger>>,
    progress: Option<ProgressLog>,
    active: Mutex<HashSet<JobId>>,
}

/// Held while a task drives a job; releases the id on drop.
struct JobClaim<'a> {
    active: &'a Mutex<HashSet<JobId>>,
    job_id: JobId,
}

impl Drop for JobClaim<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.job_id);
    }
}

/// Validated output of one step.
enum StepOutput {
    Metadata(PlanMetadata),
    Day(DayContent),
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<StepExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            ledger: None,
            progress: None,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Ledger charged per step when the pipeline config has `charge_quota` set.
    pub fn with_ledger(mut self, ledger: Arc<QuotaLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_progress(mut self, progress: ProgressLog) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn claim(&self, job_id: &JobId) -> Result<JobClaim<'_>, ApiError> {
        let mut active = self.active.lock();
        if !active.insert(job_id.clone()) {
            return Err(ApiError::JobBusy(job_id.to_string()));
        }
        Ok(JobClaim {
            active: &self.active,
            job_id: job_id.clone(),
        })
    }

    fn emit<T: Serialize>(&self, job_id: &JobId, event_type: &str, data: &T) {
        if let Some(progress) = &self.progress {
            progress.emit_best_effort(job_id.as_str(), event_type, data);
        }
    }

    fn require_job(&self, job_id: &JobId) -> Result<GenerationJob, ApiError> {
        self.store
            .job(job_id)?
            .ok_or_else(|| ApiError::JobNotFound(job_id.to_string()))
    }

    fn require_plan(&self, job_id: &JobId) -> Result<PartialPlan, ApiError> {
        self.store
            .plan(job_id)?
            .ok_or_else(|| ApiError::JobNotFound(job_id.to_string()))
    }

    fn validate_request(request: &PlanRequest) -> Result<(), ApiError> {
        if request.owner_identity.trim().is_empty() {
            return Err(ApiError::InvalidRequest(
                "owner identity cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn persist_new(
        &self,
        request: PlanRequest,
        seed: Option<(&JobId, &PartialPlan)>,
    ) -> Result<GenerationJob, ApiError> {
        Self::validate_request(&request)?;
        let now = self.clock.now();
        let job_id = JobId::generate();
        let mut job = GenerationJob::new(job_id.clone(), request, now);
        let plan = match seed {
            Some((seed_id, seed_plan)) => {
                job.seeded_from = Some(seed_id.clone());
                seed_plan.seed_for(job_id.clone(), now)
            }
            None => PartialPlan::new(job_id.clone(), now),
        };
        self.store.create(&job, &plan)?;
        info!(
            job_id = %job_id,
            owner = %job.owner_identity,
            seeded_days = plan.days.len(),
            "generation job created"
        );
        self.emit(
            &job_id,
            JOB_CREATED,
            &JobCreatedData {
                owner: job.owner_identity.clone(),
                seeded_from: job.seeded_from.as_ref().map(JobId::to_string),
            },
        );
        Ok(job)
    }

    /// Persist a new job in `Idle` without running it.
    pub fn create_job(&self, request: PlanRequest) -> Result<GenerationJob, ApiError> {
        self.persist_new(request, None)
    }

    /// Persist a new job carrying another job's metadata and contiguous committed days.
    pub fn create_seeded_job(
        &self,
        request: PlanRequest,
        seed: &JobId,
    ) -> Result<GenerationJob, ApiError> {
        let seed_plan = self.require_plan(seed)?;
        self.persist_new(request, Some((seed, &seed_plan)))
    }

    /// Move an `Idle` job to the first step its plan still lacks.
    fn begin(&self, job: GenerationJob) -> Result<GenerationJob, ApiError> {
        if job.status != JobStatus::Idle {
            return Ok(job);
        }
        let plan = self.require_plan(&job.job_id)?;
        self.store.advance(&job.job_id, plan.resume_status())
    }

    fn spawn_drive(self: &Arc<Self>, job: GenerationJob) -> Result<JobId, ApiError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            ApiError::InvalidRequest("background generation needs a tokio runtime".to_string())
        })?;
        let job = self.begin(job)?;
        let job_id = job.job_id.clone();
        let this = Arc::clone(self);
        let task_id = job_id.clone();
        handle.spawn(async move {
            match this.drive(&task_id).await {
                Ok(outcome) => debug!(job_id = %task_id, ?outcome, "background generation finished"),
                Err(err) => warn!(job_id = %task_id, error = %err, "background generation stopped"),
            }
        });
        Ok(job_id)
    }

    /// Create a job, move it to `MetadataPending` and drive it on a background task.
    pub fn start(self: &Arc<Self>, request: PlanRequest) -> Result<JobId, ApiError> {
        let job = self.create_job(request)?;
        self.spawn_drive(job)
    }

    /// As [`start`](Self::start), seeded from another job's committed content.
    pub fn start_seeded(
        self: &Arc<Self>,
        request: PlanRequest,
        seed: &JobId,
    ) -> Result<JobId, ApiError> {
        let job = self.create_seeded_job(request, seed)?;
        self.spawn_drive(job)
    }

    /// Create a job and drive it to an outcome on the current task.
    pub async fn run(&self, request: PlanRequest) -> Result<(JobId, RunOutcome), ApiError> {
        let job = self.create_job(request)?;
        let outcome = self.drive(&job.job_id).await?;
        Ok((job.job_id, outcome))
    }

    /// Continue a job left waiting on a step, clearing any earlier abort request.
    pub async fn resume(&self, job_id: &JobId) -> Result<RunOutcome, ApiError> {
        let job = self.require_job(job_id)?;
        match job.status {
            JobStatus::Complete => return Ok(RunOutcome::Completed),
            JobStatus::Error => {
                return Err(ApiError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.status.to_string(),
                    to: "resumed".to_string(),
                })
            }
            _ => {}
        }
        if job.abort_requested {
            self.store.set_abort(job_id, false)?;
        }
        info!(job_id = %job_id, status = %job.status, "resuming generation job");
        self.drive(job_id).await
    }

    /// Run steps until the job completes, fails, is aborted, or an error stops it.
    ///
    /// Quota rejections and store failures return `Err` and leave the job resumable.
    pub async fn drive(&self, job_id: &JobId) -> Result<RunOutcome, ApiError> {
        let _claim = self.claim(job_id)?;
        let mut job = self.begin(self.require_job(job_id)?)?;

        loop {
            match job.status {
                JobStatus::Complete => {
                    info!(job_id = %job_id, "generation job complete");
                    self.emit(
                        job_id,
                        JOB_COMPLETED,
                        &JobEndedData {
                            status: job.status.to_string(),
                            days: PLAN_DAYS,
                        },
                    );
                    return Ok(RunOutcome::Completed);
                }
                JobStatus::Error => {
                    return Ok(RunOutcome::Failed {
                        failure: job.failure,
                    })
                }
                _ => {}
            }

            if job.abort_requested {
                let days = self.require_plan(job_id)?.contiguous_days();
                info!(job_id = %job_id, status = %job.status, days, "generation job aborted");
                self.emit(
                    job_id,
                    JOB_ABORTED,
                    &JobEndedData {
                        status: job.status.to_string(),
                        days,
                    },
                );
                return Ok(RunOutcome::Aborted { status: job.status });
            }

            let step = job.status.pending_step().ok_or_else(|| ApiError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: "next step".to_string(),
            })?;
            let plan = self.require_plan(job_id)?;
            let prepared = self.prepare(&job, &plan, step)?;
            self.reserve(&job, &prepared)?;
            self.emit(
                job_id,
                STEP_STARTED,
                &StepEventData {
                    step: step.to_string(),
                    day: day_of(step),
                    estimated_tokens: Some(prepared.estimated_tokens),
                    duration_minutes: None,
                },
            );

            let output = match self.run_step(&prepared).await {
                Ok(output) => output,
                Err(record) => {
                    warn!(
                        job_id = %job_id,
                        step = %step,
                        kind = ?record.kind,
                        error = %record.message,
                        "generation step failed"
                    );
                    self.emit_failed(job_id, &record);
                    let job = self.store.fail(job_id, record)?;
                    return Ok(RunOutcome::Failed {
                        failure: job.failure,
                    });
                }
            };

            // Content first; the status only moves once it is durable.
            let (next, duration_minutes) = match &output {
                StepOutput::Metadata(metadata) => {
                    self.store.put_metadata(job_id, metadata)?;
                    (JobStatus::DayPending(1), None)
                }
                StepOutput::Day(day) => {
                    self.store.put_day(job_id, day)?;
                    (JobStatus::after_day(day.day), Some(day.duration_minutes))
                }
            };
            job = self.store.advance(job_id, next)?;
            info!(job_id = %job_id, step = %step, next = %job.status, "generation step committed");
            self.emit(
                job_id,
                STEP_COMMITTED,
                &StepEventData {
                    step: step.to_string(),
                    day: day_of(step),
                    estimated_tokens: None,
                    duration_minutes,
                },
            );
        }
    }

    fn prepare(
        &self,
        job: &GenerationJob,
        plan: &PartialPlan,
        step: Step,
    ) -> Result<PreparedStep, ApiError> {
        match step {
            Step::Metadata => Ok(self.executor.prepare_metadata(&job.context)),
            Step::Day(day) => {
                let metadata = plan
                    .metadata
                    .as_ref()
                    .ok_or_else(|| inconsistent(job, "metadata"))?;
                let previous = plan
                    .summaries_before(day)
                    .ok_or_else(|| inconsistent(job, "earlier days"))?;
                Ok(self
                    .executor
                    .prepare_day(day, &job.context, metadata, &previous))
            }
        }
    }

    async fn run_step(&self, prepared: &PreparedStep) -> Result<StepOutput, FailureRecord> {
        let result = match prepared.step {
            Step::Metadata => self
                .executor
                .run_metadata(prepared)
                .await
                .map(StepOutput::Metadata),
            Step::Day(_) => self.executor.run_day(prepared).await.map(StepOutput::Day),
        };
        result.map_err(|failure| FailureRecord::new(prepared.step, &failure, self.clock.now()))
    }

    fn reserve(&self, job: &GenerationJob, prepared: &PreparedStep) -> Result<Reservation, ApiError> {
        let Some(ledger) = self
            .ledger
            .as_ref()
            .filter(|_| self.executor.config().charge_quota)
        else {
            return Ok(Reservation::Disabled);
        };
        match ledger.reserve_for(
            &job.owner_identity,
            prepared.estimated_tokens,
            job.bypass_quota,
        ) {
            Ok(reservation) => Ok(reservation),
            Err(err) => {
                if let QuotaError::Exceeded {
                    identity,
                    used,
                    requested,
                    cap,
                } = &err
                {
                    self.emit(
                        &job.job_id,
                        QUOTA_REJECTED,
                        &QuotaRejectedData {
                            identity: identity.clone(),
                            used: *used,
                            requested: *requested,
                            cap: *cap,
                        },
                    );
                }
                Err(err.into())
            }
        }
    }

    fn emit_failed(&self, job_id: &JobId, record: &FailureRecord) {
        self.emit(
            job_id,
            STEP_FAILED,
            &StepFailedData {
                step: record.step.to_string(),
                kind: record.kind.as_str().to_string(),
                message: record.message.clone(),
            },
        );
    }

    /// Regenerate a committed day in place. The job's status does not change.
    pub async fn rerun_day(&self, job_id: &JobId, day: u8) -> Result<DayContent, ApiError> {
        if !(1..=PLAN_DAYS).contains(&day) {
            return Err(ApiError::InvalidRequest(format!(
                "day must be within 1..={}, got {}",
                PLAN_DAYS, day
            )));
        }
        let _claim = self.claim(job_id)?;
        let job = self.require_job(job_id)?;
        let plan = self.require_plan(job_id)?;
        if plan.day(day).is_none() {
            return Err(ApiError::InvalidRequest(format!(
                "day {} of job {} has not been generated",
                day, job_id
            )));
        }

        let step = Step::Day(day);
        let prepared = self.prepare(&job, &plan, step)?;
        self.reserve(&job, &prepared)?;
        self.emit(
            job_id,
            STEP_STARTED,
            &StepEventData {
                step: step.to_string(),
                day: Some(day),
                estimated_tokens: Some(prepared.estimated_tokens),
                duration_minutes: None,
            },
        );

        match self.executor.run_day(&prepared).await {
            Ok(content) => {
                self.store.put_day(job_id, &content)?;
                info!(job_id = %job_id, day, "day regenerated");
                self.emit(
                    job_id,
                    DAY_RERUN,
                    &StepEventData {
                        step: step.to_string(),
                        day: Some(day),
                        estimated_tokens: None,
                        duration_minutes: Some(content.duration_minutes),
                    },
                );
                Ok(content)
            }
            Err(failure) => {
                let record = FailureRecord::new(step, &failure, self.clock.now());
                warn!(job_id = %job_id, day, error = %failure, "day regeneration failed");
                self.emit_failed(job_id, &record);
                self.store.record_failure(job_id, record)?;
                Err(failure.into())
            }
        }
    }

    pub fn snapshot(&self, job_id: &JobId) -> Result<PartialPlan, ApiError> {
        self.require_plan(job_id)
    }

    pub fn job(&self, job_id: &JobId) -> Result<GenerationJob, ApiError> {
        self.require_job(job_id)
    }

    /// Jobs, oldest first, optionally limited to one owner.
    pub fn jobs(&self, owner: Option<&str>) -> Result<Vec<GenerationJob>, ApiError> {
        let jobs = self.store.jobs()?;
        Ok(match owner {
            Some(owner) => jobs
                .into_iter()
                .filter(|j| j.owner_identity == owner)
                .collect(),
            None => jobs,
        })
    }

    /// Ask a job to stop before its next step. Finished jobs are returned unchanged.
    pub fn abort(&self, job_id: &JobId) -> Result<GenerationJob, ApiError> {
        let job = self.require_job(job_id)?;
        if job.status.is_terminal() || job.abort_requested {
            return Ok(job);
        }
        let job = self.store.set_abort(job_id, true)?;
        info!(job_id = %job_id, status = %job.status, "abort requested");
        Ok(job)
    }

    pub fn events(&self, job_id: &JobId) -> Result<Vec<ProgressEvent>, ApiError> {
        match &self.progress {
            Some(progress) => Ok(progress.events(job_id.as_str())?),
            None => Ok(Vec::new()),
        }
    }
}

fn day_of(step: Step) -> Option<u8> {
    match step {
        Step::Day(day) => Some(day),
        Step::Metadata => None,
    }
}

fn inconsistent(job: &GenerationJob, missing: &str) -> ApiError {
    ApiError::StorageError(StorageError::Corrupt {
        key: job.job_id.to_string(),
        message: format!("status {} without {}", job.status, missing),
    })
}
