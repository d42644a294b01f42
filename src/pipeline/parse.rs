//! Parse and validate service output.
//!
//! Everything the service returns is untrusted. Each failure here becomes a
//! `StepFailure::Validation` carrying a message that names the offending field.

use crate::catalog::ContentCatalog;
use crate::duration::ActivityEntry;
use crate::error::StepFailure;
use crate::pipeline::model::{DayContent, DayType, Intensity, PlanMetadata, WeeklyPlanDay, PLAN_DAYS};
use serde::Deserialize;
use std::collections::HashSet;

/// Slice out the JSON object in a response, tolerating code fences and surrounding prose.
pub(crate) fn extract_json_object(raw: &str) -> Result<&str, StepFailure> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&raw[start..=end]),
        _ => Err(StepFailure::Validation(
            "response does not contain a JSON object".to_string(),
        )),
    }
}

fn parse_object<'a, T: Deserialize<'a>>(raw: &'a str, what: &str) -> Result<T, StepFailure> {
    let json = extract_json_object(raw)?;
    serde_json::from_str(json)
        .map_err(|e| StepFailure::Validation(format!("malformed {} response: {}", what, e)))
}

fn invalid(message: impl Into<String>) -> StepFailure {
    StepFailure::Validation(message.into())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "programOverview")]
    overview: String,
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "whatNotToDo")]
    cautions: String,
    #[serde(default)]
    weekly_plan: Vec<RawWeeklyDay>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWeeklyDay {
    day: i64,
    #[serde(rename = "type", alias = "dayType")]
    day_type: String,
    #[serde(default)]
    intensity: Option<String>,
    #[serde(default)]
    focus: String,
}

fn parse_day_type(raw: &str) -> Option<DayType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "strength" => Some(DayType::Strength),
        "cardio" => Some(DayType::Cardio),
        "rest" | "recovery" => Some(DayType::Rest),
        _ => None,
    }
}

fn parse_intensity(raw: &str) -> Option<Intensity> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "high" => Some(Intensity::High),
        "moderate" | "medium" => Some(Intensity::Moderate),
        "low" => Some(Intensity::Low),
        _ => None,
    }
}

fn day_number(raw: i64) -> Result<u8, StepFailure> {
    u8::try_from(raw)
        .ok()
        .filter(|d| (1..=PLAN_DAYS).contains(d))
        .ok_or_else(|| invalid(format!("day {} is outside 1..={}", raw, PLAN_DAYS)))
}

pub(crate) fn parse_metadata(raw: &str) -> Result<PlanMetadata, StepFailure> {
    let parsed: RawMetadata = parse_object(raw, "metadata")?;
    if parsed.title.trim().is_empty() {
        return Err(invalid("metadata is missing a title"));
    }

    let mut seen = HashSet::new();
    let mut weekly_plan = Vec::with_capacity(parsed.weekly_plan.len());
    for entry in parsed.weekly_plan {
        let day = day_number(entry.day)?;
        if !seen.insert(day) {
            return Err(invalid(format!("weekly plan lists day {} twice", day)));
        }
        let day_type = parse_day_type(&entry.day_type).ok_or_else(|| {
            invalid(format!("weekly plan day {} has unknown type '{}'", day, entry.day_type))
        })?;
        let intensity = match entry.intensity.as_deref() {
            Some(value) => parse_intensity(value).ok_or_else(|| {
                invalid(format!("weekly plan day {} has unknown intensity '{}'", day, value))
            })?,
            None => Intensity::Moderate,
        };
        weekly_plan.push(WeeklyPlanDay {
            day,
            day_type,
            intensity,
            focus: entry.focus,
        });
    }
    weekly_plan.sort_by_key(|d| d.day);

    Ok(PlanMetadata {
        title: parsed.title.trim().to_string(),
        overview: parsed.overview,
        summary: parsed.summary,
        cautions: parsed.cautions,
        weekly_plan,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDay {
    #[serde(default, rename = "type", alias = "dayType")]
    day_type: Option<String>,
    #[serde(default)]
    is_rest_day: bool,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "exercises")]
    activities: Vec<RawActivity>,
}

/// Activity as the service writes it. Older field names are still accepted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActivity {
    #[serde(default, alias = "exerciseId", alias = "id")]
    ref_id: String,
    #[serde(default)]
    sets: Option<u32>,
    #[serde(default, alias = "reps")]
    repetitions: Option<u32>,
    #[serde(default)]
    hold_seconds: Option<u32>,
    #[serde(default)]
    timed_seconds: Option<u32>,
    /// Single legacy duration: a hold when sets are given, a timed block otherwise.
    #[serde(default)]
    duration: Option<u32>,
    #[serde(default, alias = "restBetweenSets")]
    rest_seconds: Option<i64>,
    #[serde(default)]
    is_warmup: bool,
}

impl RawActivity {
    fn into_entry(self) -> ActivityEntry {
        let (hold_seconds, timed_seconds) = match (self.duration, self.sets) {
            (Some(d), Some(_)) => (self.hold_seconds.or(Some(d)), self.timed_seconds),
            (Some(d), None) => (self.hold_seconds, self.timed_seconds.or(Some(d))),
            (None, _) => (self.hold_seconds, self.timed_seconds),
        };
        ActivityEntry {
            ref_id: self.ref_id.trim().to_string(),
            sets: self.sets,
            repetitions: self.repetitions,
            hold_seconds,
            timed_seconds,
            rest_seconds: self.rest_seconds,
            is_warmup: self.is_warmup,
        }
    }
}

/// Parse a day response. The day number is always the requested one and the duration is
/// recomputed from the activities.
pub(crate) fn parse_day(
    raw: &str,
    day: u8,
    catalog: Option<&dyn ContentCatalog>,
) -> Result<DayContent, StepFailure> {
    let parsed: RawDay = parse_object(raw, "day")?;

    let day_type = match parsed.day_type.as_deref() {
        Some(value) => parse_day_type(value)
            .ok_or_else(|| invalid(format!("day {} has unknown type '{}'", day, value)))?,
        None if parsed.is_rest_day => DayType::Rest,
        None => return Err(invalid(format!("day {} is missing its type", day))),
    };

    let description = parsed.description.trim().to_string();
    if description.is_empty() {
        return Err(invalid(format!("day {} is missing a description", day)));
    }

    let activities: Vec<ActivityEntry> = parsed
        .activities
        .into_iter()
        .map(RawActivity::into_entry)
        .collect();
    if activities.is_empty() && day_type != DayType::Rest {
        return Err(invalid(format!("day {} has no activities", day)));
    }

    for (index, activity) in activities.iter().enumerate() {
        if activity.ref_id.is_empty() {
            return Err(invalid(format!(
                "day {} activity {} has an empty refId",
                day,
                index + 1
            )));
        }
        if let Some(catalog) = catalog {
            if !catalog.contains(&activity.ref_id) {
                return Err(invalid(format!(
                    "day {} references unknown catalog id '{}'",
                    day, activity.ref_id
                )));
            }
        }
    }

    Ok(DayContent::new(day, day_type, description, activities))
}
