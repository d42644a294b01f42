//! Shared test utilities for integration tests
//!
//! A scripted generative client that answers each step from the request payload, a job store
//! wrapper that can be told to fail checkpoints, and fixtures for wiring an orchestrator over
//! a temporary sled database.

use async_trait::async_trait;
use cadence::clock::{Clock, ManualClock};
use cadence::error::{ApiError, ProviderError, StorageError};
use cadence::logging::LogThrottle;
use cadence::pipeline::{
    DayContent, FailureRecord, GenerationContext, GenerationJob, JobId, JobStatus, JobStore,
    Orchestrator, PartialPlan, PipelineConfig, PlanMetadata, PlanRequest, SledJobStore,
    StepExecutor,
};
use cadence::progress::ProgressLog;
use cadence::provider::{
    ChatMessage, CompletionOptions, CompletionResponse, CompletionStream, GenerativeClient,
    TokenUsage,
};
use cadence::quota::{QuotaConfig, QuotaLedger};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Step key used to script replies: "metadata" or "day N".
pub fn step_key(payload: &Value) -> String {
    match payload.get("step").and_then(Value::as_str) {
        Some("day") => format!(
            "day {}",
            payload
                .get("dayToGenerate")
                .and_then(Value::as_u64)
                .unwrap_or(0)
        ),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    }
}

pub fn metadata_reply() -> String {
    json!({
        "title": "Foundations week",
        "overview": "Build a base.",
        "summary": "Three strength days, two cardio, two rest.",
        "cautions": "Stop on sharp pain.",
        "weeklyPlan": [
            { "day": 1, "type": "strength", "intensity": "moderate", "focus": "lower body" },
            { "day": 2, "type": "cardio", "intensity": "low", "focus": "easy run" },
            { "day": 3, "type": "strength", "intensity": "high", "focus": "upper body" },
            { "day": 4, "type": "rest", "intensity": "low", "focus": "recovery" },
            { "day": 5, "type": "strength", "intensity": "moderate", "focus": "full body" },
            { "day": 6, "type": "cardio", "intensity": "moderate", "focus": "intervals" },
            { "day": 7, "type": "rest", "intensity": "low", "focus": "mobility" }
        ]
    })
    .to_string()
}

/// A valid day reply. `tag` ends up in the description so replaced days can be told apart.
pub fn day_reply(day: u64, tag: &str) -> String {
    json!({
        "type": "strength",
        "description": format!("Day {} ({})", day, tag),
        "activities": [
            { "refId": format!("squat-{}", day), "sets": 3, "repetitions": 10, "restSeconds": 60 },
            { "refId": "plank", "sets": 2, "holdSeconds": 30, "restSeconds": 30 }
        ]
    })
    .to_string()
}

/// How the scripted client answers a given step.
#[derive(Debug, Clone)]
pub enum Reply {
    Content(String),
    Fail(ProviderError),
}

/// Generative client driven by the request payload's step.
///
/// Unscripted steps get a valid default reply. Streaming replays `fragments`, then
/// `stream_error` if set.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<Vec<String>>,
    payloads: Mutex<Vec<Value>>,
    on_call: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    pub fragments: Mutex<Vec<String>>,
    pub stream_error: Mutex<Option<ProviderError>>,
    pub stream_open_error: Mutex<Option<ProviderError>>,
    tag: Mutex<String>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        let client = Self::default();
        *client.tag.lock() = "first".to_string();
        Arc::new(client)
    }

    /// Queue a reply for the next call on `step`; later calls fall back to the default.
    pub fn script(&self, step: &str, reply: Reply) {
        self.script
            .lock()
            .entry(step.to_string())
            .or_default()
            .push(reply);
    }

    /// Text mixed into default day replies from now on.
    pub fn set_tag(&self, tag: &str) {
        *self.tag.lock() = tag.to_string();
    }

    /// Run `hook` with the step key at the start of every completion.
    pub fn on_call(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_call.lock() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn payload_for(&self, step: &str) -> Option<Value> {
        self.payloads
            .lock()
            .iter()
            .rev()
            .find(|p| step_key(p) == step)
            .cloned()
    }

    fn next_reply(&self, key: &str) -> Reply {
        let mut script = self.script.lock();
        if let Some(queue) = script.get_mut(key) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        drop(script);
        if key == "metadata" {
            return Reply::Content(metadata_reply());
        }
        let day = key
            .strip_prefix("day ")
            .and_then(|d| d.parse().ok())
            .unwrap_or(0);
        Reply::Content(day_reply(day, &self.tag.lock()))
    }
}

#[async_trait]
impl GenerativeClient for ScriptedClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _options: CompletionOptions,
    ) -> Result<CompletionResponse, ProviderError> {
        let payload: Value = messages
            .last()
            .and_then(|m| serde_json::from_str(&m.content).ok())
            .unwrap_or(Value::Null);
        let key = step_key(&payload);
        if let Some(hook) = self.on_call.lock().as_ref() {
            hook(&key);
        }
        self.calls.lock().push(key.clone());
        self.payloads.lock().push(payload);
        match self.next_reply(&key) {
            Reply::Content(content) => Ok(CompletionResponse {
                content,
                model: "scripted".to_string(),
                usage: TokenUsage::default(),
                finish_reason: Some("stop".to_string()),
            }),
            Reply::Fail(err) => Err(err),
        }
    }

    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        _options: CompletionOptions,
    ) -> Result<CompletionStream, ProviderError> {
        if let Some(err) = self.stream_open_error.lock().clone() {
            return Err(err);
        }
        let mut items: Vec<Result<String, ProviderError>> =
            self.fragments.lock().iter().cloned().map(Ok).collect();
        if let Some(err) = self.stream_error.lock().clone() {
            items.push(Err(err));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Job store that fails `put_day` or `advance` while the matching switch is on.
pub struct FlakyStore {
    inner: SledJobStore,
    pub fail_put_day: AtomicBool,
    pub fail_advance: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: SledJobStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_put_day: AtomicBool::new(false),
            fail_advance: AtomicBool::new(false),
        })
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), ApiError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{} refused", what)).into());
        }
        Ok(())
    }
}

impl JobStore for FlakyStore {
    fn create(&self, job: &GenerationJob, plan: &PartialPlan) -> Result<(), ApiError> {
        self.inner.create(job, plan)
    }

    fn job(&self, job_id: &JobId) -> Result<Option<GenerationJob>, ApiError> {
        self.inner.job(job_id)
    }

    fn plan(&self, job_id: &JobId) -> Result<Option<PartialPlan>, ApiError> {
        self.inner.plan(job_id)
    }

    fn jobs(&self) -> Result<Vec<GenerationJob>, ApiError> {
        self.inner.jobs()
    }

    fn put_metadata(&self, job_id: &JobId, metadata: &PlanMetadata) -> Result<PartialPlan, ApiError> {
        self.inner.put_metadata(job_id, metadata)
    }

    fn put_day(&self, job_id: &JobId, day: &DayContent) -> Result<PartialPlan, ApiError> {
        Self::check(&self.fail_put_day, "put_day")?;
        self.inner.put_day(job_id, day)
    }

    fn advance(&self, job_id: &JobId, to: JobStatus) -> Result<GenerationJob, ApiError> {
        Self::check(&self.fail_advance, "advance")?;
        self.inner.advance(job_id, to)
    }

    fn fail(&self, job_id: &JobId, failure: FailureRecord) -> Result<GenerationJob, ApiError> {
        self.inner.fail(job_id, failure)
    }

    fn record_failure(&self, job_id: &JobId, failure: FailureRecord) -> Result<(), ApiError> {
        self.inner.record_failure(job_id, failure)
    }

    fn set_abort(&self, job_id: &JobId, requested: bool) -> Result<GenerationJob, ApiError> {
        self.inner.set_abort(job_id, requested)
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ))
}

pub fn throttle() -> Arc<LogThrottle> {
    Arc::new(LogThrottle::new(Duration::from_secs(60)))
}

pub fn plan_request(owner: &str) -> PlanRequest {
    PlanRequest {
        owner_identity: owner.to_string(),
        context: GenerationContext::new(json!({ "goal": "general fitness", "level": "beginner" })),
        bypass_quota: false,
    }
}

/// Everything a pipeline test needs, over one temporary database.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub client: Arc<ScriptedClient>,
    pub store: Arc<FlakyStore>,
    pub progress: ProgressLog,
    pub ledger: Option<Arc<QuotaLedger>>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None, PipelineConfig::default())
    }

    pub fn with_quota(config: QuotaConfig) -> Self {
        Self::build(Some(config), PipelineConfig::default())
    }

    /// Ledger attached and every step charged against it.
    pub fn with_charged_quota(config: QuotaConfig) -> Self {
        let pipeline = PipelineConfig {
            charge_quota: true,
            ..PipelineConfig::default()
        };
        Self::build(Some(config), pipeline)
    }

    fn build(quota: Option<QuotaConfig>, pipeline: PipelineConfig) -> Self {
        let db = cadence::store::open_temporary().unwrap();
        let clock = manual_clock();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let client = ScriptedClient::new();
        let store = FlakyStore::new(SledJobStore::open(&db, Arc::clone(&dyn_clock)).unwrap());
        let progress = ProgressLog::open(&db).unwrap();
        let executor = StepExecutor::new(client.clone(), None, pipeline);
        let mut orchestrator =
            Orchestrator::new(store.clone(), Arc::new(executor), Arc::clone(&dyn_clock))
                .with_progress(progress.clone());
        let ledger = quota.map(|config| {
            Arc::new(QuotaLedger::open(&db, config, dyn_clock, throttle()).unwrap())
        });
        if let Some(ledger) = &ledger {
            orchestrator = orchestrator.with_ledger(Arc::clone(ledger));
        }
        Self {
            clock,
            client,
            store,
            progress,
            ledger,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn event_types(&self, job_id: &JobId) -> Vec<String> {
        self.progress
            .events(job_id.as_str())
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}
