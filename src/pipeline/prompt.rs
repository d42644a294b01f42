//! Step instructions and request payloads.

use crate::catalog::ContentCatalog;
use crate::pipeline::model::{DaySummary, GenerationContext, PlanMetadata, PLAN_DAYS};
use serde_json::{json, Value};

pub const METADATA_INSTRUCTIONS: &str = r#"Return only one JSON object, with no Markdown and no commentary.

You are writing the outline of a personalised seven-day training plan. The individual days are generated separately; do not list activities here.

Use the profile and feedback in the request. Write all text in the requested language.

Fields:
- title: short name for the plan
- overview: what the plan is for and what the owner will achieve
- summary: one sentence describing the main focus
- cautions: activities to avoid, specific to the profile
- weeklyPlan: exactly 7 entries, one per day, each {"day": 1-7, "type": "strength" | "cardio" | "rest", "intensity": "high" | "moderate" | "low", "focus": short description}

Day 1 is always a training day. Spread rest days through the week and never place two high intensity days in a row."#;

pub const DAY_INSTRUCTIONS: &str = r#"Return only one JSON object, with no Markdown and no commentary.

You are writing a single day of a seven-day training plan. The request gives the day to write ("dayToGenerate"), the weekly outline and a summary of each earlier day.

Fields:
- type: "strength", "cardio" or "rest", matching the weekly outline for this day
- description: what the day involves and why
- activities: list of {"refId", "sets"?, "repetitions"?, "holdSeconds"?, "timedSeconds"?, "restSeconds"?, "isWarmup"?}

Each activity uses exactly one scheme: sets with repetitions, sets with holdSeconds, or a single timedSeconds block. Rest days may have no activities. Avoid repeating the exact activities of earlier days. Write all text in the requested language."#;

/// Day instructions, listing the catalog ids the service may reference.
pub fn day_instructions(catalog: Option<&dyn ContentCatalog>) -> String {
    let Some(catalog) = catalog else {
        return DAY_INSTRUCTIONS.to_string();
    };
    let entries = catalog.entries();
    if entries.is_empty() {
        return DAY_INSTRUCTIONS.to_string();
    }
    let mut out = String::from(DAY_INSTRUCTIONS);
    out.push_str("\n\nUse only these refIds:\n");
    for entry in entries {
        out.push_str(&format!("- {}: {}\n", entry.id, entry.name));
    }
    out
}

pub fn metadata_payload(context: &GenerationContext) -> Value {
    json!({
        "step": "metadata",
        "days": PLAN_DAYS,
        "profile": context.profile,
        "feedback": context.feedback,
        "language": context.language,
    })
}

/// Payload for day `day`. Earlier days travel as summaries only.
pub fn day_payload(
    day: u8,
    context: &GenerationContext,
    metadata: &PlanMetadata,
    previous_days: &[DaySummary],
) -> Value {
    json!({
        "step": "day",
        "dayToGenerate": day,
        "profile": context.profile,
        "feedback": context.feedback,
        "language": context.language,
        "title": metadata.title,
        "cautions": metadata.cautions,
        "weeklyPlan": metadata.weekly_plan,
        "previousDays": previous_days,
    })
}
