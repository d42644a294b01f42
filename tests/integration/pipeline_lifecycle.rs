//! Integration tests for the generation pipeline: checkpoints, failures, abort and resume

use crate::integration::test_utils::{plan_request, Harness, Reply};
use cadence::error::{ApiError, ProviderError};
use cadence::pipeline::{FailureKind, JobStatus, JobStore, RunOutcome, Step};
use cadence::progress::event::{
    DAY_RERUN, JOB_ABORTED, JOB_COMPLETED, JOB_CREATED, QUOTA_REJECTED, STEP_COMMITTED,
    STEP_FAILED,
};
use cadence::quota::QuotaConfig;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn full_run_commits_metadata_and_seven_days() {
    let h = Harness::new();
    let (job_id, outcome) = h.orchestrator.run(plan_request("user-1")).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let job = h.orchestrator.job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert!(job.failure.is_none());

    let plan = h.orchestrator.snapshot(&job_id).unwrap();
    assert!(plan.is_complete);
    assert_eq!(plan.generating_day, None);
    assert_eq!(plan.metadata.as_ref().unwrap().title, "Foundations week");
    let days: Vec<u8> = plan.ordered_days().map(|d| d.day).collect();
    assert_eq!(days, vec![1, 2, 3, 4, 5, 6, 7]);
    // 3x10 reps plus two 60s rests, then 2x30s holds plus one 30s rest: 360s
    assert!(plan.ordered_days().all(|d| d.duration_minutes == 6));

    assert_eq!(
        h.client.calls(),
        vec!["metadata", "day 1", "day 2", "day 3", "day 4", "day 5", "day 6", "day 7"]
    );
}

#[tokio::test]
async fn later_days_see_summaries_of_earlier_days() {
    let h = Harness::new();
    h.orchestrator.run(plan_request("user-1")).await.unwrap();

    let payload = h.client.payload_for("day 3").unwrap();
    let previous = payload["previousDays"].as_array().unwrap();
    assert_eq!(previous.len(), 2);
    assert_eq!(previous[0]["day"], 1);
    assert_eq!(previous[1]["refIds"][0], "squat-2");
    assert!(previous[0].get("description").is_none());
    assert_eq!(payload["title"], "Foundations week");
    assert_eq!(payload["weeklyPlan"].as_array().unwrap().len(), 7);
}

#[tokio::test]
async fn progress_events_follow_the_run() {
    let h = Harness::new();
    let (job_id, _) = h.orchestrator.run(plan_request("user-1")).await.unwrap();

    let types = h.event_types(&job_id);
    assert_eq!(types.first().map(String::as_str), Some(JOB_CREATED));
    assert_eq!(types.last().map(String::as_str), Some(JOB_COMPLETED));
    assert_eq!(types.iter().filter(|t| *t == STEP_COMMITTED).count(), 8);

    let events = h.orchestrator.events(&job_id).unwrap();
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn invalid_day_fails_the_job_and_keeps_earlier_days() {
    let h = Harness::new();
    h.client
        .script("day 4", Reply::Content("Sorry, I can't do that.".to_string()));
    let (job_id, outcome) = h.orchestrator.run(plan_request("user-1")).await.unwrap();

    let RunOutcome::Failed { failure } = outcome else {
        panic!("expected a failed run, got {:?}", outcome);
    };
    let failure = failure.unwrap();
    assert_eq!(failure.step, Step::Day(4));
    assert_eq!(failure.kind, FailureKind::Validation);

    let job = h.orchestrator.job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Error);
    let plan = h.orchestrator.snapshot(&job_id).unwrap();
    assert_eq!(plan.days.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(!plan.is_complete);
    assert_eq!(h.orchestrator.snapshot(&job_id).unwrap(), plan);
    assert!(h.event_types(&job_id).contains(&STEP_FAILED.to_string()));

    let err = h.orchestrator.resume(&job_id).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidTransition { .. }));
}

#[tokio::test]
async fn transport_and_rate_limit_failures_are_typed() {
    let h = Harness::new();
    h.client.script(
        "metadata",
        Reply::Fail(ProviderError::RequestFailed("connection reset".to_string())),
    );
    let (_, outcome) = h.orchestrator.run(plan_request("user-1")).await.unwrap();
    let RunOutcome::Failed { failure } = outcome else {
        panic!("expected a failed run");
    };
    assert_eq!(failure.unwrap().kind, FailureKind::Transport);

    h.client.script(
        "day 2",
        Reply::Fail(ProviderError::RateLimit("429".to_string())),
    );
    let (job_id, outcome) = h.orchestrator.run(plan_request("user-1")).await.unwrap();
    let RunOutcome::Failed { failure } = outcome else {
        panic!("expected a failed run");
    };
    assert_eq!(failure.unwrap().kind, FailureKind::RateLimited);
    assert_eq!(h.orchestrator.snapshot(&job_id).unwrap().days.len(), 1);
}

#[tokio::test]
async fn rerun_day_replaces_only_that_day() {
    let h = Harness::new();
    let (job_id, _) = h.orchestrator.run(plan_request("user-1")).await.unwrap();

    h.client.set_tag("second");
    let content = h.orchestrator.rerun_day(&job_id, 3).await.unwrap();
    assert_eq!(content.day, 3);
    assert!(content.description.contains("second"));

    let plan = h.orchestrator.snapshot(&job_id).unwrap();
    assert_eq!(plan.days.len(), 7);
    for day in plan.ordered_days() {
        let expected = if day.day == 3 { "second" } else { "first" };
        assert!(day.description.contains(expected), "day {}", day.day);
    }
    assert_eq!(h.orchestrator.job(&job_id).unwrap().status, JobStatus::Complete);
    assert!(h.event_types(&job_id).contains(&DAY_RERUN.to_string()));

    // The rerun saw days 1 and 2 as context
    let payload = h.client.payload_for("day 3").unwrap();
    assert_eq!(payload["previousDays"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn rerun_day_rejects_out_of_range_and_missing_days() {
    let h = Harness::new();
    h.client
        .script("day 3", Reply::Content("{}".to_string()));
    let (job_id, _) = h.orchestrator.run(plan_request("user-1")).await.unwrap();

    for day in [0, 8] {
        let err = h.orchestrator.rerun_day(&job_id, day).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)), "day {}", day);
    }
    let err = h.orchestrator.rerun_day(&job_id, 5).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidRequest(_)));

    let err = h
        .orchestrator
        .rerun_day(&"job-missing".into(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::JobNotFound(_)));
}

#[tokio::test]
async fn failed_rerun_records_failure_and_keeps_day() {
    let h = Harness::new();
    let (job_id, _) = h.orchestrator.run(plan_request("user-1")).await.unwrap();
    let before = h.orchestrator.snapshot(&job_id).unwrap().day(2).cloned();

    h.client.script(
        "day 2",
        Reply::Fail(ProviderError::RequestFailed("timeout".to_string())),
    );
    let err = h.orchestrator.rerun_day(&job_id, 2).await.unwrap_err();
    assert!(matches!(err, ApiError::Step(_)));

    let job = h.orchestrator.job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.failure.unwrap().step, Step::Day(2));
    assert_eq!(h.orchestrator.snapshot(&job_id).unwrap().day(2).cloned(), before);
}

#[tokio::test]
async fn abort_stops_at_the_next_step_boundary_and_resume_finishes() {
    let h = Harness::new();
    let job = h.orchestrator.create_job(plan_request("user-1")).unwrap();
    let job_id = job.job_id.clone();

    let orchestrator = Arc::clone(&h.orchestrator);
    let target = job_id.clone();
    h.client.on_call(move |step| {
        if step == "day 4" {
            orchestrator.abort(&target).unwrap();
        }
    });

    let outcome = h.orchestrator.drive(&job_id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Aborted {
            status: JobStatus::DayPending(5)
        }
    );
    let plan = h.orchestrator.snapshot(&job_id).unwrap();
    assert_eq!(plan.days.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert!(h.event_types(&job_id).contains(&JOB_ABORTED.to_string()));
    assert!(h.orchestrator.job(&job_id).unwrap().abort_requested);

    h.client.on_call(|_| {});
    let outcome = h.orchestrator.resume(&job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(!h.orchestrator.job(&job_id).unwrap().abort_requested);
    assert_eq!(h.orchestrator.snapshot(&job_id).unwrap().days.len(), 7);

    let calls = h.client.calls();
    assert_eq!(calls.iter().filter(|c| *c == "day 4").count(), 1);
    assert_eq!(calls.last().map(String::as_str), Some("day 7"));
}

#[tokio::test]
async fn abort_on_finished_job_is_a_no_op() {
    let h = Harness::new();
    let (job_id, _) = h.orchestrator.run(plan_request("user-1")).await.unwrap();
    let job = h.orchestrator.abort(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert!(!job.abort_requested);
    assert_eq!(h.orchestrator.resume(&job_id).await.unwrap(), RunOutcome::Completed);
}

#[tokio::test]
async fn unavailable_store_leaves_job_resumable() {
    let h = Harness::new();
    h.store.fail_put_day.store(true, Ordering::SeqCst);
    let job = h.orchestrator.create_job(plan_request("user-1")).unwrap();

    let err = h.orchestrator.drive(&job.job_id).await.unwrap_err();
    assert!(err.is_store_unavailable());
    let stored = h.store.job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::DayPending(1));
    let plan = h.orchestrator.snapshot(&job.job_id).unwrap();
    assert!(plan.metadata.is_some());
    assert!(plan.days.is_empty());

    h.store.fail_put_day.store(false, Ordering::SeqCst);
    let outcome = h.orchestrator.resume(&job.job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(h.orchestrator.snapshot(&job.job_id).unwrap().days.len(), 7);
}

#[tokio::test]
async fn content_is_durable_before_the_status_moves() {
    let h = Harness::new();
    let store = Arc::clone(&h.store);
    h.client.on_call(move |step| {
        if step == "day 2" {
            store.fail_advance.store(true, Ordering::SeqCst);
        }
    });
    let job = h.orchestrator.create_job(plan_request("user-1")).unwrap();
    let err = h.orchestrator.drive(&job.job_id).await.unwrap_err();
    assert!(err.is_store_unavailable());

    // Day 2 was written, but the job still points at it
    let stored = h.store.job(&job.job_id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::DayPending(2));
    let plan = h.orchestrator.snapshot(&job.job_id).unwrap();
    assert_eq!(plan.days.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

    h.client.on_call(|_| {});
    h.store.fail_advance.store(false, Ordering::SeqCst);
    assert_eq!(
        h.orchestrator.resume(&job.job_id).await.unwrap(),
        RunOutcome::Completed
    );
    let calls = h.client.calls();
    assert_eq!(calls.iter().filter(|c| *c == "day 2").count(), 2);
}

#[tokio::test]
async fn seeded_job_continues_from_committed_days() {
    let h = Harness::new();
    h.client
        .script("day 4", Reply::Content("not a plan".to_string()));
    let (seed_id, outcome) = h.orchestrator.run(plan_request("user-1")).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    let seed_plan = h.orchestrator.snapshot(&seed_id).unwrap();

    let job = h
        .orchestrator
        .create_seeded_job(plan_request("user-1"), &seed_id)
        .unwrap();
    assert_eq!(job.seeded_from.as_ref(), Some(&seed_id));
    let calls_before = h.client.calls().len();

    let outcome = h.orchestrator.drive(&job.job_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let new_calls = h.client.calls()[calls_before..].to_vec();
    assert_eq!(new_calls, vec!["day 4", "day 5", "day 6", "day 7"]);
    let plan = h.orchestrator.snapshot(&job.job_id).unwrap();
    assert_eq!(plan.metadata, seed_plan.metadata);
    for day in 1..=3 {
        assert_eq!(plan.day(day), seed_plan.day(day));
    }
    // The seed is untouched
    assert_eq!(
        h.orchestrator.job(&seed_id).unwrap().status,
        JobStatus::Error
    );
}

#[tokio::test]
async fn concurrent_drive_of_one_job_is_rejected() {
    let h = Harness::new();
    let job = h.orchestrator.create_job(plan_request("user-1")).unwrap();

    let second: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let orchestrator = Arc::clone(&h.orchestrator);
    let target = job.job_id.clone();
    let seen = Arc::clone(&second);
    h.client.on_call(move |step| {
        if step == "day 1" {
            let result = futures::executor::block_on(orchestrator.drive(&target));
            *seen.lock() = Some(matches!(result, Err(ApiError::JobBusy(_))));
        }
    });

    assert_eq!(
        h.orchestrator.drive(&job.job_id).await.unwrap(),
        RunOutcome::Completed
    );
    assert_eq!(*second.lock(), Some(true));
}

#[tokio::test]
async fn start_drives_the_job_in_the_background() {
    let h = Harness::new();
    let job_id = h.orchestrator.start(plan_request("user-1")).unwrap();

    let mut status = h.orchestrator.job(&job_id).unwrap().status;
    assert_ne!(status, JobStatus::Idle);
    for _ in 0..500 {
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = h.orchestrator.job(&job_id).unwrap().status;
    }
    assert_eq!(status, JobStatus::Complete);
}

#[tokio::test]
async fn jobs_can_be_listed_per_owner() {
    let h = Harness::new();
    let (a, _) = h.orchestrator.run(plan_request("user-1")).await.unwrap();
    let (b, _) = h.orchestrator.run(plan_request("user-2")).await.unwrap();

    let mine = h.orchestrator.jobs(Some("user-1")).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].job_id, a);
    let all = h.orchestrator.jobs(None).unwrap();
    assert!(all.iter().any(|j| j.job_id == b));

    let err = h.orchestrator.create_job(plan_request("  ")).unwrap_err();
    assert!(matches!(err, ApiError::InvalidRequest(_)));
}

#[tokio::test]
async fn quota_exhaustion_mid_run_leaves_job_resumable() {
    // Measure what the first two steps cost with enforcement off.
    let probe = Harness::new();
    let (probe_id, _) = probe.orchestrator.run(plan_request("user-1")).await.unwrap();
    let estimates: Vec<u64> = probe
        .orchestrator
        .events(&probe_id)
        .unwrap()
        .into_iter()
        .filter_map(|e| e.data.get("estimated_tokens").and_then(|v| v.as_u64()))
        .collect();
    let cap = estimates[0] + estimates[1] + 1;

    let h = Harness::with_charged_quota(QuotaConfig {
        daily_tokens: cap,
        ..QuotaConfig::default()
    });
    let job = h.orchestrator.create_job(plan_request("user-1")).unwrap();
    let err = h.orchestrator.drive(&job.job_id).await.unwrap_err();
    assert!(err.is_quota_exceeded());

    let stored = h.orchestrator.job(&job.job_id).unwrap();
    assert_eq!(stored.status, JobStatus::DayPending(2));
    assert!(stored.failure.is_none());
    assert_eq!(h.orchestrator.snapshot(&job.job_id).unwrap().days.len(), 1);
    assert_eq!(
        h.event_types(&job.job_id).last().map(String::as_str),
        Some(QUOTA_REJECTED)
    );

    // A fresh window covers as many of the remaining days as fit under the cap.
    let mut used = 0;
    let fit = estimates[2..]
        .iter()
        .take_while(|e| {
            used += **e;
            used <= cap
        })
        .count();
    assert!(fit >= 1 && fit < 6);

    h.clock.advance(chrono::Duration::hours(25));
    let err = h.orchestrator.resume(&job.job_id).await.unwrap_err();
    assert!(err.is_quota_exceeded());
    let stored = h.orchestrator.job(&job.job_id).unwrap();
    assert_eq!(stored.status, JobStatus::DayPending(2 + fit as u8));
    assert!(stored.failure.is_none());
    assert_eq!(
        h.orchestrator.snapshot(&job.job_id).unwrap().days.len(),
        1 + fit
    );
}

#[tokio::test]
async fn default_quota_does_not_meter_plan_generation() {
    let h = Harness::with_quota(QuotaConfig::default());
    let (job_id, outcome) = h.orchestrator.run(plan_request("free-user")).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(h.orchestrator.snapshot(&job_id).unwrap().is_complete);
    assert!(!h.event_types(&job_id).contains(&QUOTA_REJECTED.to_string()));

    let ledger = h.ledger.as_ref().unwrap();
    assert_eq!(ledger.usage("free-user").unwrap().tokens_used, 0);
}

#[tokio::test]
async fn bypass_skips_the_quota() {
    let h = Harness::with_charged_quota(QuotaConfig {
        daily_tokens: 1,
        ..QuotaConfig::default()
    });
    let mut request = plan_request("subscriber-1");
    request.bypass_quota = true;
    let (_, outcome) = h.orchestrator.run(request).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let err = h.orchestrator.run(plan_request("anon-1")).await.unwrap_err();
    assert!(err.is_quota_exceeded());
}
