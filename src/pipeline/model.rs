//! Persisted pipeline types: jobs, statuses and the partial plan.

use crate::clock::new_id;
use crate::duration::{aggregate_minutes, ActivityEntry};
use crate::error::StepFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Days in a plan.
pub const PLAN_DAYS: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(new_id("job"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "day", rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    MetadataPending,
    DayPending(u8),
    Complete,
    Error,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Idle => 0,
            JobStatus::MetadataPending => 1,
            JobStatus::DayPending(day) => 1 + day,
            JobStatus::Complete => 2 + PLAN_DAYS,
            JobStatus::Error => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    /// Statuses only move forward; `Error` is reachable from any non-terminal status.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Error => true,
            JobStatus::DayPending(day) if !(1..=PLAN_DAYS).contains(&day) => false,
            _ => next.rank() > self.rank(),
        }
    }

    /// The step a job in this status is waiting to run.
    pub fn pending_step(self) -> Option<Step> {
        match self {
            JobStatus::MetadataPending => Some(Step::Metadata),
            JobStatus::DayPending(day) => Some(Step::Day(day)),
            _ => None,
        }
    }

    /// Status after `day` is committed.
    pub fn after_day(day: u8) -> JobStatus {
        if day >= PLAN_DAYS {
            JobStatus::Complete
        } else {
            JobStatus::DayPending(day + 1)
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Idle => f.write_str("idle"),
            JobStatus::MetadataPending => f.write_str("metadata_pending"),
            JobStatus::DayPending(day) => write!(f, "day_pending({})", day),
            JobStatus::Complete => f.write_str("complete"),
            JobStatus::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "day", rename_all = "snake_case")]
pub enum Step {
    Metadata,
    Day(u8),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Metadata => f.write_str("metadata"),
            Step::Day(day) => write!(f, "day {}", day),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Transport,
    RateLimited,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Transport => "transport",
            FailureKind::RateLimited => "rate_limited",
        }
    }
}

/// Why a step failed, kept on the job for callers inspecting an `Error` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub step: Step,
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(step: Step, failure: &StepFailure, at: DateTime<Utc>) -> Self {
        let (kind, message) = match failure {
            StepFailure::Validation(msg) => (FailureKind::Validation, msg.clone()),
            StepFailure::Transport(msg) => (FailureKind::Transport, msg.clone()),
            StepFailure::RateLimited(msg) => (FailureKind::RateLimited, msg.clone()),
        };
        Self {
            step,
            kind,
            message,
            at,
        }
    }
}

/// Immutable inputs shared by every step of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    /// Free-form caller profile (goals, experience, equipment, ...)
    pub profile: Value,
    /// Feedback accumulated from earlier plans
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

impl GenerationContext {
    pub fn new(profile: Value) -> Self {
        Self {
            profile,
            feedback: Vec::new(),
            language: default_language(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub owner_identity: String,
    pub context: GenerationContext,
    /// Subscribers are exempt from the daily quota
    #[serde(default)]
    pub bypass_quota: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: JobId,
    pub owner_identity: String,
    pub status: JobStatus,
    pub context: GenerationContext,
    #[serde(default)]
    pub bypass_quota: bool,
    /// Set by `abort`; observed before the next step starts
    #[serde(default)]
    pub abort_requested: bool,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    #[serde(default)]
    pub seeded_from: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn new(job_id: JobId, request: PlanRequest, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            owner_identity: request.owner_identity,
            status: JobStatus::Idle,
            context: request.context,
            bypass_quota: request.bypass_quota,
            abort_requested: false,
            failure: None,
            seeded_from: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayType {
    Strength,
    Cardio,
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    High,
    Moderate,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyPlanDay {
    pub day: u8,
    #[serde(rename = "type")]
    pub day_type: DayType,
    pub intensity: Intensity,
    #[serde(default)]
    pub focus: String,
}

/// Output of the metadata step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub title: String,
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub summary: String,
    /// Things the plan's owner should avoid
    #[serde(default)]
    pub cautions: String,
    #[serde(default)]
    pub weekly_plan: Vec<WeeklyPlanDay>,
}

impl PlanMetadata {
    pub fn outline_for(&self, day: u8) -> Option<&WeeklyPlanDay> {
        self.weekly_plan.iter().find(|d| d.day == day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayContent {
    pub day: u8,
    #[serde(rename = "type")]
    pub day_type: DayType,
    pub description: String,
    pub activities: Vec<ActivityEntry>,
    pub duration_minutes: u32,
}

impl DayContent {
    /// Build a day with its duration derived from the activities.
    pub fn new(
        day: u8,
        day_type: DayType,
        description: String,
        activities: Vec<ActivityEntry>,
    ) -> Self {
        let duration_minutes = aggregate_minutes(&activities);
        Self {
            day,
            day_type,
            description,
            activities,
            duration_minutes,
        }
    }

    pub fn summary(&self) -> DaySummary {
        DaySummary {
            day: self.day,
            day_type: self.day_type,
            ref_ids: self.activities.iter().map(|a| a.ref_id.clone()).collect(),
        }
    }
}

/// What later steps see of an earlier day: its type and referenced ids, never full content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub day: u8,
    #[serde(rename = "type")]
    pub day_type: DayType,
    pub ref_ids: Vec<String>,
}

/// The plan as it grows. Days are keyed by day number and never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialPlan {
    pub job_id: JobId,
    #[serde(default)]
    pub metadata: Option<PlanMetadata>,
    #[serde(default, with = "days_as_list")]
    pub days: BTreeMap<u8, DayContent>,
    #[serde(default)]
    pub generating_day: Option<u8>,
    #[serde(default)]
    pub is_complete: bool,
    pub updated_at: DateTime<Utc>,
}

impl PartialPlan {
    pub fn new(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            metadata: None,
            days: BTreeMap::new(),
            generating_day: None,
            is_complete: false,
            updated_at: now,
        }
    }

    pub fn day(&self, day: u8) -> Option<&DayContent> {
        self.days.get(&day)
    }

    /// Days in order.
    pub fn ordered_days(&self) -> impl Iterator<Item = &DayContent> {
        self.days.values()
    }

    /// Replace the entry for `content.day`, or insert it.
    pub fn upsert_day(&mut self, content: DayContent) {
        self.days.insert(content.day, content);
    }

    /// Number of days present without gaps from day 1.
    pub fn contiguous_days(&self) -> u8 {
        (1..=PLAN_DAYS)
            .take_while(|day| self.days.contains_key(day))
            .count() as u8
    }

    /// Summaries of days `1..day`, or `None` when any of them is missing.
    pub fn summaries_before(&self, day: u8) -> Option<Vec<DaySummary>> {
        (1..day)
            .map(|d| self.days.get(&d).map(DayContent::summary))
            .collect()
    }

    /// The status a fresh run over this content should start from.
    pub fn resume_status(&self) -> JobStatus {
        if self.metadata.is_none() {
            return JobStatus::MetadataPending;
        }
        match self.contiguous_days() {
            0 => JobStatus::DayPending(1),
            done => JobStatus::after_day(done),
        }
    }

    /// Copy of the metadata and contiguous days, for seeding another job.
    pub fn seed_for(&self, job_id: JobId, now: DateTime<Utc>) -> PartialPlan {
        let keep = self.contiguous_days();
        let days = if self.metadata.is_some() {
            self.days
                .iter()
                .filter(|(day, _)| **day <= keep)
                .map(|(day, content)| (*day, content.clone()))
                .collect()
        } else {
            BTreeMap::new()
        };
        PartialPlan {
            job_id,
            metadata: self.metadata.clone(),
            days,
            generating_day: None,
            is_complete: false,
            updated_at: now,
        }
    }
}

/// Days serialize as an ordered list; the map key is recovered from each entry.
mod days_as_list {
    use super::DayContent;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        days: &BTreeMap<u8, DayContent>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&DayContent> = days.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u8, DayContent>, D::Error> {
        let list = Vec::<DayContent>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|d| (d.day, d)).collect())
    }
}

/// How a drive over a job ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Stopped at a step boundary; `status` is where it stopped.
    Aborted { status: JobStatus },
    Failed { failure: Option<FailureRecord> },
}
