//! Event schema for job progress.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JOB_CREATED: &str = "job_created";
pub const STEP_STARTED: &str = "step_started";
pub const STEP_COMMITTED: &str = "step_committed";
pub const STEP_FAILED: &str = "step_failed";
pub const JOB_ABORTED: &str = "job_aborted";
pub const JOB_COMPLETED: &str = "job_completed";
pub const QUOTA_REJECTED: &str = "quota_rejected";
pub const DAY_RERUN: &str = "day_rerun";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Milliseconds since the Unix epoch
    pub ts: String,
    pub job: String,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// An event before the log assigns its sequence number.
#[derive(Debug, Clone)]
pub struct ProgressEnvelope {
    pub ts: String,
    pub job: String,
    pub event_type: String,
    pub data: Value,
}

impl ProgressEnvelope {
    pub fn with_now(job: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            ts: crate::clock::now_millis().to_string(),
            job: job.into(),
            event_type: event_type.into(),
            data,
        }
    }
}

impl ProgressEvent {
    pub fn from_envelope(envelope: ProgressEnvelope, seq: u64) -> Self {
        Self {
            ts: envelope.ts,
            job: envelope.job,
            seq,
            event_type: envelope.event_type,
            data: envelope.data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreatedData {
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeded_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEventData {
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRejectedData {
    pub identity: String,
    pub used: u64,
    pub requested: u64,
    pub cap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEndedData {
    pub status: String,
    pub days: u8,
}
