//! Generation Step Executor
//!
//! One step is one round trip to the generative service followed by parsing and validation.
//! No retries happen here; a failure is returned typed and the orchestrator decides.

use crate::catalog::ContentCatalog;
use crate::error::StepFailure;
use crate::pipeline::model::{DayContent, DaySummary, GenerationContext, PlanMetadata, Step};
use crate::pipeline::{parse, prompt, PipelineConfig};
use crate::provider::{ChatMessage, CompletionOptions, GenerativeClient};
use crate::quota::estimate_json_tokens;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A step ready to send, with the tokens it will be charged up front.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub step: Step,
    pub messages: Vec<ChatMessage>,
    /// Estimated request size plus the output cap
    pub estimated_tokens: u64,
}

pub struct StepExecutor {
    client: Arc<dyn GenerativeClient>,
    catalog: Option<Arc<dyn ContentCatalog>>,
    config: PipelineConfig,
}

impl StepExecutor {
    pub fn new(
        client: Arc<dyn GenerativeClient>,
        catalog: Option<Arc<dyn ContentCatalog>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            client,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn prepared(&self, step: Step, system: String, payload: serde_json::Value) -> PreparedStep {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(payload.to_string())];
        let estimated_tokens =
            estimate_json_tokens(&messages) + u64::from(self.config.max_output_tokens);
        PreparedStep {
            step,
            messages,
            estimated_tokens,
        }
    }

    pub fn prepare_metadata(&self, context: &GenerationContext) -> PreparedStep {
        self.prepared(
            Step::Metadata,
            prompt::METADATA_INSTRUCTIONS.to_string(),
            prompt::metadata_payload(context),
        )
    }

    pub fn prepare_day(
        &self,
        day: u8,
        context: &GenerationContext,
        metadata: &PlanMetadata,
        previous_days: &[DaySummary],
    ) -> PreparedStep {
        self.prepared(
            Step::Day(day),
            prompt::day_instructions(self.catalog.as_deref()),
            prompt::day_payload(day, context, metadata, previous_days),
        )
    }

    async fn round_trip(&self, prepared: &PreparedStep) -> Result<String, StepFailure> {
        let options = CompletionOptions {
            temperature: self.config.temperature,
            max_tokens: Some(self.config.max_output_tokens),
            json_response: true,
        };
        let started = Instant::now();
        let response = self
            .client
            .complete(prepared.messages.clone(), options)
            .await
            .map_err(|e| {
                warn!(step = %prepared.step, error = %e, "step request failed");
                StepFailure::from(e)
            })?;
        debug!(
            step = %prepared.step,
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "step response received"
        );
        Ok(response.content)
    }

    pub async fn run_metadata(&self, prepared: &PreparedStep) -> Result<PlanMetadata, StepFailure> {
        let raw = self.round_trip(prepared).await?;
        parse::parse_metadata(&raw)
    }

    pub async fn run_day(&self, prepared: &PreparedStep) -> Result<DayContent, StepFailure> {
        let Step::Day(day) = prepared.step else {
            return Err(StepFailure::Validation(format!(
                "{} is not a day step",
                prepared.step
            )));
        };
        let raw = self.round_trip(prepared).await?;
        parse::parse_day(&raw, day, self.catalog.as_deref())
    }

    pub async fn execute_metadata_step(
        &self,
        context: &GenerationContext,
    ) -> Result<PlanMetadata, StepFailure> {
        let prepared = self.prepare_metadata(context);
        self.run_metadata(&prepared).await
    }

    pub async fn execute_day_step(
        &self,
        day: u8,
        context: &GenerationContext,
        metadata: &PlanMetadata,
        previous_days: &[DaySummary],
    ) -> Result<DayContent, StepFailure> {
        let prepared = self.prepare_day(day, context, metadata, previous_days);
        self.run_day(&prepared).await
    }
}
