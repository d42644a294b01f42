//! Plan generation pipeline
//!
//! A job walks `Idle -> MetadataPending -> DayPending(1..=7) -> Complete`, with `Error` as the
//! only terminal detour. Each step is one call to the generative service; its output is
//! checkpointed before the status moves, so a reader never sees a status ahead of the content.

pub mod executor;
pub mod model;
pub mod orchestrator;
mod parse;
pub mod prompt;
pub mod store;

pub use executor::{PreparedStep, StepExecutor};
pub use model::{
    DayContent, DaySummary, DayType, FailureKind, FailureRecord, GenerationContext,
    GenerationJob, Intensity, JobId, JobStatus, PartialPlan, PlanMetadata, PlanRequest,
    RunOutcome, Step, WeeklyPlanDay, PLAN_DAYS,
};
pub use orchestrator::Orchestrator;
pub use store::{JobStore, SledJobStore};

use serde::{Deserialize, Serialize};

/// Pipeline configuration (`[pipeline]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Output cap sent with every step
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,

    /// Reserve each step's estimate from the owner's chat quota. Off by default: plan
    /// generation is not metered.
    #[serde(default)]
    pub charge_quota: bool,
}

fn default_max_output_tokens() -> u32 {
    2_000
}

fn default_temperature() -> Option<f32> {
    Some(0.7)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            charge_quota: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_output_tokens == 0 {
            return Err("max_output_tokens must be greater than zero".to_string());
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature {} is outside 0.0..=2.0", t));
            }
        }
        Ok(())
    }
}
