//! CLI route: single route table and run context.

use crate::catalog::{ContentCatalog, InMemoryCatalog};
use crate::cli::help::command_name;
use crate::cli::output::{
    format_duration, format_events, format_job, format_jobs, format_migration, format_outcome,
    format_reservation, format_usage,
};
use crate::cli::parse::{Commands, QuotaCommands};
use crate::clock::{Clock, SystemClock};
use crate::config::{CadenceConfig, ConfigLoader};
use crate::duration::{aggregate_minutes, ActivityEntry};
use crate::error::ApiError;
use crate::logging::LogThrottle;
use crate::pipeline::{
    GenerationContext, GenerationJob, JobId, JobStore, Orchestrator, PlanRequest, SledJobStore,
    StepExecutor,
};
use crate::progress::ProgressLog;
use crate::provider::{ChatMessage, ProviderFactory};
use crate::quota::QuotaLedger;
use crate::relay::{RelayEnd, RelayEvent, RelayRequest, StreamRelay};
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runtime context for CLI execution: configuration, the opened store and domain services.
pub struct RunContext {
    workspace_root: PathBuf,
    config: CadenceConfig,
    clock: Arc<dyn Clock>,
    throttle: Arc<LogThrottle>,
    ledger: Arc<QuotaLedger>,
    jobs: Arc<SledJobStore>,
    progress: ProgressLog,
}

impl RunContext {
    /// Load configuration, validate it and open the store.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = match &config_path {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        Self::from_config(workspace_root, config)
    }

    pub fn from_config(workspace_root: PathBuf, config: CadenceConfig) -> Result<Self, ApiError> {
        config.validate().map_err(|errors| {
            ApiError::ConfigError(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let store_path = config.storage.resolve_store_path(&workspace_root);
        let db = crate::store::open_db(&store_path)?;
        debug!(store = %store_path.display(), "store opened");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let throttle = Arc::new(LogThrottle::new(Duration::from_secs(
            config.logging.throttle_secs,
        )));
        let ledger = Arc::new(QuotaLedger::open(
            &db,
            config.quota.clone(),
            Arc::clone(&clock),
            Arc::clone(&throttle),
        )?);
        let jobs = Arc::new(SledJobStore::open(&db, Arc::clone(&clock))?);
        let progress = ProgressLog::open(&db)?;

        Ok(Self {
            workspace_root,
            config,
            clock,
            throttle,
            ledger,
            jobs,
            progress,
        })
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    fn catalog(&self) -> Result<Option<Arc<dyn ContentCatalog>>, ApiError> {
        match &self.config.catalog.path {
            Some(path) => {
                let catalog = InMemoryCatalog::load_json(&self.resolve(path))?;
                debug!(entries = catalog.len(), "catalog loaded");
                Ok(Some(Arc::new(catalog)))
            }
            None => Ok(None),
        }
    }

    /// The orchestrator needs a configured provider; only commands that generate build one.
    fn orchestrator(&self) -> Result<Orchestrator, ApiError> {
        let client = ProviderFactory::create_client(&self.config.provider)?;
        let executor = StepExecutor::new(client, self.catalog()?, self.config.pipeline.clone());
        Ok(Orchestrator::new(
            self.jobs.clone(),
            Arc::new(executor),
            Arc::clone(&self.clock),
        )
        .with_ledger(Arc::clone(&self.ledger))
        .with_progress(self.progress.clone()))
    }

    fn require_job(&self, job_id: &JobId) -> Result<GenerationJob, ApiError> {
        self.jobs
            .job(job_id)?
            .ok_or_else(|| ApiError::JobNotFound(job_id.to_string()))
    }

    fn runtime() -> Result<tokio::runtime::Runtime, ApiError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| ApiError::ConfigError(format!("Failed to create tokio runtime: {}", e)))
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        let started = Instant::now();
        let name = command_name(command);
        let result = self.execute_inner(command);
        match &result {
            Ok(_) => info!(
                command = %name,
                duration_ms = started.elapsed().as_millis() as u64,
                "command completed"
            ),
            Err(err) => warn!(
                command = %name,
                duration_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "command failed"
            ),
        }
        result
    }

    fn execute_inner(&self, command: &Commands) -> Result<String, ApiError> {
        match command {
            Commands::Generate {
                profile,
                identity,
                feedback,
                language,
                bypass_quota,
                seed_from,
            } => self.handle_generate(
                profile,
                identity,
                feedback.as_deref(),
                language,
                *bypass_quota,
                seed_from.as_deref(),
            ),
            Commands::Status { job, format } => {
                let job_id = JobId::from(job.as_str());
                let job = self.require_job(&job_id)?;
                let plan = self
                    .jobs
                    .plan(&job_id)?
                    .ok_or_else(|| ApiError::JobNotFound(job_id.to_string()))?;
                format_job(&job, &plan, format)
            }
            Commands::Jobs { owner, format } => {
                let jobs: Vec<_> = self
                    .jobs
                    .jobs()?
                    .into_iter()
                    .filter(|j| owner.as_deref().map_or(true, |o| j.owner_identity == o))
                    .collect();
                format_jobs(&jobs, format)
            }
            Commands::Events { job, after } => {
                let events = self.progress.events_after(job, *after)?;
                Ok(format_events(&events))
            }
            Commands::Abort { job } => {
                let job_id = JobId::from(job.as_str());
                let mut job = self.require_job(&job_id)?;
                if !job.status.is_terminal() {
                    job = self.jobs.set_abort(&job_id, true)?;
                }
                Ok(format!(
                    "Abort requested for {} (status {})",
                    job.job_id, job.status
                ))
            }
            Commands::Resume { job } => {
                let orchestrator = self.orchestrator()?;
                let job_id = JobId::from(job.as_str());
                let outcome = Self::runtime()?.block_on(orchestrator.resume(&job_id))?;
                let plan = orchestrator.snapshot(&job_id)?;
                Ok(format_outcome(&job_id, &outcome, &plan))
            }
            Commands::RerunDay { job, day } => {
                let orchestrator = self.orchestrator()?;
                let job_id = JobId::from(job.as_str());
                let content = Self::runtime()?.block_on(orchestrator.rerun_day(&job_id, *day))?;
                Ok(format!(
                    "Day {} of {} regenerated ({} minutes, {} activities)",
                    content.day,
                    job_id,
                    content.duration_minutes,
                    content.activities.len()
                ))
            }
            Commands::Quota { command } => self.handle_quota(command),
            Commands::Chat {
                identity,
                bypass_quota,
                message,
            } => self.handle_chat(identity, *bypass_quota, message),
            Commands::Duration { file } => {
                let entries: Vec<ActivityEntry> = read_json(&self.resolve(file))?;
                Ok(format_duration(&entries, aggregate_minutes(&entries)))
            }
        }
    }

    fn handle_generate(
        &self,
        profile: &Path,
        identity: &str,
        feedback: Option<&Path>,
        language: &str,
        bypass_quota: bool,
        seed_from: Option<&str>,
    ) -> Result<String, ApiError> {
        let mut context = GenerationContext::new(read_json(&self.resolve(profile))?);
        if let Some(path) = feedback {
            context.feedback = read_json(&self.resolve(path))?;
        }
        context.language = language.to_string();
        let request = PlanRequest {
            owner_identity: identity.to_string(),
            context,
            bypass_quota,
        };

        let orchestrator = self.orchestrator()?;
        let job = match seed_from {
            Some(seed) => orchestrator.create_seeded_job(request, &JobId::from(seed))?,
            None => orchestrator.create_job(request)?,
        };
        let job_id = job.job_id;
        info!(job_id = %job_id, "generating plan");

        let outcome = match Self::runtime()?.block_on(orchestrator.drive(&job_id)) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "generation stopped; resume the job to continue");
                return Err(err);
            }
        };
        let plan = orchestrator.snapshot(&job_id)?;
        Ok(format_outcome(&job_id, &outcome, &plan))
    }

    fn handle_quota(&self, command: &QuotaCommands) -> Result<String, ApiError> {
        match command {
            QuotaCommands::Show { identity, format } => {
                format_usage(&self.ledger.usage(identity)?, format)
            }
            QuotaCommands::Reserve {
                identity,
                tokens,
                bypass,
            } => {
                let reservation = self.ledger.reserve_for(identity, *tokens, *bypass)?;
                Ok(format_reservation(identity, *tokens, &reservation))
            }
            QuotaCommands::Migrate { anon_id, user_id } => {
                let outcome = self.ledger.migrate(anon_id, user_id)?;
                Ok(format_migration(anon_id, user_id, outcome))
            }
        }
    }

    fn handle_chat(&self, identity: &str, bypass_quota: bool, message: &str) -> Result<String, ApiError> {
        let client = ProviderFactory::create_client(&self.config.provider)?;
        let relay = StreamRelay::new(
            client,
            Some(Arc::clone(&self.ledger)),
            self.config.quota.estimated_response_tokens,
            Arc::clone(&self.throttle),
        );
        let request = RelayRequest {
            identity: identity.to_string(),
            bypass_quota,
            messages: vec![ChatMessage::user(message)],
            max_output_tokens: Some(self.config.pipeline.max_output_tokens),
        };

        let runtime = Self::runtime()?;
        let (summary, error) = runtime.block_on(async {
            let (tx, mut rx) = mpsc::channel(64);
            let forward = async {
                let mut error = None;
                let mut stdout = std::io::stdout();
                while let Some(event) = rx.recv().await {
                    match event {
                        RelayEvent::Delta { content } => {
                            let _ = write!(stdout, "{}", content);
                            let _ = stdout.flush();
                        }
                        RelayEvent::Error { message } => error = Some(message),
                        RelayEvent::Done => {}
                    }
                }
                error
            };
            let (summary, error) = tokio::join!(relay.relay(request, tx), forward);
            (summary, error)
        });
        let summary = summary?;
        if let Some(message) = error {
            return Err(ApiError::Provider(crate::error::ProviderError::RequestFailed(message)));
        }
        let ending = match summary.end {
            RelayEnd::Done => "done",
            RelayEnd::Error => "error",
            RelayEnd::Disconnected => "disconnected",
        };
        Ok(format!(
            "\n[{} fragments, {} tokens reserved, {}]",
            summary.fragments, summary.tokens_reserved, ending
        ))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ApiError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ApiError::InvalidRequest(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON in {}: {}", path.display(), e)))
}
