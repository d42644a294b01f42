//! CLI output: error mapping and result formatting.

use crate::duration::{compute_seconds, ActivityEntry};
use crate::error::{ApiError, StorageError};
use crate::pipeline::{GenerationJob, JobId, JobStatus, PartialPlan, RunOutcome};
use crate::progress::ProgressEvent;
use crate::quota::{MigrationOutcome, QuotaUsage, Reservation};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::Serialize;

/// Map domain/service errors to a string for CLI output.
pub fn map_error(e: &ApiError) -> String {
    if e.is_quota_exceeded() {
        return format!("{} (try again once the window resets)", e);
    }
    if e.is_store_unavailable() {
        return format!("{} (the job can be resumed)", e);
    }
    e.to_string()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string_pretty(value).map_err(|e| {
        ApiError::StorageError(StorageError::Corrupt {
            key: "output".to_string(),
            message: e.to_string(),
        })
    })
}

fn colored_status(status: JobStatus) -> String {
    match status {
        JobStatus::Complete => status.to_string().green().to_string(),
        JobStatus::Error => status.to_string().red().to_string(),
        _ => status.to_string().yellow().to_string(),
    }
}

pub fn format_outcome(job_id: &JobId, outcome: &RunOutcome, plan: &PartialPlan) -> String {
    let days = plan.days.len();
    match outcome {
        RunOutcome::Completed => format!(
            "{} {} ({} days)",
            "Completed".green().bold(),
            job_id,
            days
        ),
        RunOutcome::Aborted { status } => format!(
            "{} {} at {} ({} days kept)",
            "Aborted".yellow().bold(),
            job_id,
            status,
            days
        ),
        RunOutcome::Failed { failure } => {
            let reason = failure
                .as_ref()
                .map(|f| format!("{} failed: {}", f.step, f.message))
                .unwrap_or_else(|| "unknown failure".to_string());
            format!(
                "{} {} ({} days kept): {}",
                "Failed".red().bold(),
                job_id,
                days,
                reason
            )
        }
    }
}

pub fn format_job(job: &GenerationJob, plan: &PartialPlan, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(&serde_json::json!({ "job": job, "plan": plan }));
    }
    let mut out = format!(
        "{}\n  Owner: {}\n  Status: {}\n",
        job.job_id.to_string().bold(),
        job.owner_identity,
        colored_status(job.status)
    );
    if job.abort_requested {
        out.push_str("  Abort requested\n");
    }
    if let Some(failure) = &job.failure {
        out.push_str(&format!(
            "  Last failure: {} ({}) {}\n",
            failure.step,
            failure.kind.as_str(),
            failure.message
        ));
    }
    if let Some(metadata) = &plan.metadata {
        out.push_str(&format!("  Title: {}\n", metadata.title));
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Day", "Type", "Minutes", "Activities"]);
    for day in plan.ordered_days() {
        table.add_row(vec![
            day.day.to_string(),
            format!("{:?}", day.day_type).to_lowercase(),
            day.duration_minutes.to_string(),
            day.activities
                .iter()
                .map(|a| a.ref_id.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        ]);
    }
    out.push_str(&table.to_string());
    Ok(out)
}

pub fn format_jobs(jobs: &[GenerationJob], format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(jobs);
    }
    if jobs.is_empty() {
        return Ok("No jobs.".to_string());
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Job", "Owner", "Status", "Created"]);
    for job in jobs {
        table.add_row(vec![
            job.job_id.to_string(),
            job.owner_identity.clone(),
            job.status.to_string(),
            job.created_at.to_rfc3339(),
        ]);
    }
    Ok(table.to_string())
}

pub fn format_events(events: &[ProgressEvent]) -> String {
    if events.is_empty() {
        return "No events.".to_string();
    }
    events
        .iter()
        .map(|e| format!("{:>4} {} {} {}", e.seq, e.ts, e.event_type.cyan(), e.data))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_usage(usage: &QuotaUsage, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(usage);
    }
    let resets = usage
        .resets_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    Ok(format!(
        "{}\n  Used: {} / {}\n  Remaining: {}\n  Resets: {}",
        usage.identity.bold(),
        usage.tokens_used,
        usage.cap,
        usage.remaining,
        resets
    ))
}

pub fn format_reservation(identity: &str, tokens: u64, reservation: &Reservation) -> String {
    match reservation {
        Reservation::Granted {
            tokens_used,
            remaining,
        } => format!(
            "Reserved {} tokens for {} ({} used, {} remaining)",
            tokens, identity, tokens_used, remaining
        ),
        Reservation::Bypassed => format!("Quota bypassed for {}", identity),
        Reservation::Disabled => "Quota enforcement is disabled".to_string(),
    }
}

pub fn format_migration(anon_id: &str, user_id: &str, outcome: MigrationOutcome) -> String {
    match outcome {
        MigrationOutcome::Applied => format!("Migrated {} onto {}", anon_id, user_id),
        MigrationOutcome::AlreadyApplied => {
            format!("{} was already migrated onto {}", anon_id, user_id)
        }
        MigrationOutcome::SameIdentity => "Nothing to migrate".to_string(),
    }
}

pub fn format_duration(entries: &[ActivityEntry], minutes: u32) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Activity", "Scheme", "Seconds"]);
    for entry in entries {
        let scheme = serde_json::to_value(entry.scheme())
            .ok()
            .and_then(|v| v.get("scheme").and_then(|s| s.as_str()).map(str::to_string))
            .unwrap_or_default();
        let scheme = if entry.is_ambiguous() {
            format!("{} (ambiguous)", scheme)
        } else {
            scheme
        };
        table.add_row(vec![
            entry.ref_id.clone(),
            scheme,
            compute_seconds(entry).to_string(),
        ]);
    }
    format!("{}\nTotal: {} minutes", table, minutes)
}
