//! End-to-end behaviour of the sync engine against fake rsync scripts.

mod common;

use std::time::{Duration, Instant};

use chrono::Utc;
use common::*;
use mirsd::core::{
    EngineError, FailureKind, HealthStatus, JobStatus, RetentionPolicy, SyncJob, TargetStatus,
    TargetUpdate, TriggerOrigin,
};
use mirsd::db;

#[tokio::test]
async fn manual_sync_completes_and_records_stats() {
    let h = harness(RSYNC_OK).await;

    let pending = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert_eq!(pending.origin, TriggerOrigin::manual("alice"));

    h.engine.wait_idle().await;

    let job = h.engine.get_job(&pending.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.files_transferred, Some(12));
    assert_eq!(job.bytes_transferred, Some(64_000));
    assert!(job.error_message.is_none());
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    assert!(job.output.unwrap().contains("README.TXT"));

    let target = h.engine.get_target("freebsd").await.unwrap();
    assert_eq!(target.status, TargetStatus::Active);
    assert_eq!(target.file_count, Some(1204));
    assert_eq!(target.total_size_bytes, Some(5_000_000));
    assert!(target.last_sync_completed.is_some());
    assert!(target.local_path.is_dir());

    let args = h.invocations();
    assert_eq!(args.len(), 1);
    assert!(args[0].starts_with("-avHz --delete --delete-delay --delay-updates --partial --stats"));
    assert!(args[0].ends_with(&format!(
        "rsync://ftp.freebsd.org/FreeBSD/ {}",
        target.local_path.display()
    )));
    assert!(!args[0].contains("--bwlimit"));
}

#[tokio::test]
async fn trigger_on_busy_target_creates_no_job() {
    let h = harness(RSYNC_SLOW).await;

    let first = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    let err = h.engine.trigger_sync("freebsd", "bob").await.unwrap_err();
    assert!(matches!(err, EngineError::TargetBusy(ref name) if name == "freebsd"));

    let jobs = h.engine.list_jobs("freebsd", None).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, first.id);

    // Other targets are independent.
    h.engine.trigger_sync("netbsd", "alice").await.unwrap();

    h.engine.shutdown().await;
}

#[tokio::test]
async fn concurrent_manual_triggers_yield_one_job() {
    let h = harness(RSYNC_SLOW).await;

    let (a, b) = tokio::join!(
        h.engine.trigger_sync("freebsd", "alice"),
        h.engine.trigger_sync("freebsd", "bob"),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::TargetBusy(_))))
            .count(),
        1
    );
    assert_eq!(h.engine.list_jobs("freebsd", None).await.unwrap().len(), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_interrupts_running_jobs() {
    let h = harness(RSYNC_SLOW).await;
    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    assert!(!h.engine.status().await.unwrap().shutting_down);

    h.engine.shutdown().await;
    assert!(h.engine.status().await.unwrap().shutting_down);

    let job = h.engine.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Interrupted));
    assert!(!h.ctx.locks.is_locked("freebsd"));
    assert_eq!(
        h.engine.get_target("freebsd").await.unwrap().status,
        TargetStatus::Error
    );
    assert!(matches!(
        h.engine.trigger_sync("freebsd", "alice").await,
        Err(EngineError::ShuttingDown)
    ));
}

#[tokio::test]
async fn timeout_fails_the_job_and_releases_the_lock() {
    let h = harness(RSYNC_SLOW).await;
    h.set("sync_timeout", "1").await;

    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;

    let job = h.engine.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Timeout));
    assert!(job.error_message.unwrap().contains("timed out"));

    let target = h.engine.get_target("freebsd").await.unwrap();
    assert_eq!(target.status, TargetStatus::Error);
    assert!(target.last_sync_error.is_some());

    let lease = h.ctx.locks.try_acquire("freebsd").await.unwrap();
    lease.release(TargetStatus::Active).await.unwrap();
}

#[tokio::test]
async fn sigterm_is_followed_by_sigkill() {
    let h = harness(RSYNC_STUBBORN).await;
    h.set("sync_timeout", "1").await;

    let started = Instant::now();
    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;

    // 1s timeout + 1s grace, far below the script's 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(15));
    let job = h.engine.get_job(&job.id).await.unwrap();
    assert_eq!(job.failure_kind, Some(FailureKind::Timeout));
    assert!(!h.ctx.locks.is_locked("freebsd"));
}

#[tokio::test]
async fn timeout_stops_processes_the_transfer_spawned() {
    let h = harness(RSYNC_FORKING).await;
    h.set("sync_timeout", "1").await;

    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;
    assert_eq!(
        h.engine.get_job(&job.id).await.unwrap().failure_kind,
        Some(FailureKind::Timeout)
    );

    // Well past the point where an orphaned child would have written.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!h.dir.path().join("survivor").exists());
}

#[tokio::test]
async fn nonzero_exit_keeps_the_diagnostic() {
    let h = harness(RSYNC_FAIL).await;

    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;

    let job = h.engine.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::ExitCode));
    assert_eq!(job.exit_code, Some(5));
    let message = job.error_message.unwrap();
    assert!(message.contains("status 5"));
    assert!(message.contains("@ERROR: Unknown module 'FreeBSD'"));

    let target = h.engine.get_target("freebsd").await.unwrap();
    assert_eq!(target.status, TargetStatus::Error);
    assert!(target.last_sync_error.unwrap().contains("Unknown module"));
    assert!(target.last_sync_completed.is_none());
}

#[tokio::test]
async fn missing_binary_is_a_spawn_failure() {
    let h = harness_with(RSYNC_OK, |config| {
        config.rsync_binary = "/nonexistent/bin/rsync".into();
    })
    .await;

    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;

    let job = h.engine.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Spawn));
    assert!(job.exit_code.is_none());
    // The tool never ran, so the job went straight from pending to failed.
    assert!(job.started_at.is_none());
    assert!(job.completed_at.is_some());
    assert!(!h.ctx.locks.is_locked("freebsd"));
    assert_eq!(
        h.engine.get_target("freebsd").await.unwrap().status,
        TargetStatus::Error
    );
}

#[tokio::test]
async fn bandwidth_change_applies_to_the_next_job_only() {
    let h = harness(RSYNC_BRIEF).await;

    h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.set("sync_bandwidth_limit", "512").await;
    h.engine.wait_idle().await;

    h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;

    let args = h.invocations();
    assert_eq!(args.len(), 2);
    // The first run may have read settings before or after the update.
    assert!(args[1].contains("--bwlimit=512"));

    let jobs = h.engine.list_jobs("freebsd", None).await.unwrap();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn running_job_keeps_its_bandwidth() {
    let h = harness(RSYNC_BRIEF).await;
    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();

    // Once running, the job's command line is fixed.
    for _ in 0..200 {
        let current = h.engine.get_job(&job.id).await.unwrap();
        if current.status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.set("sync_bandwidth_limit", "256").await;
    h.engine.wait_idle().await;

    let args = h.invocations();
    assert_eq!(args.len(), 1);
    assert!(!args[0].contains("--bwlimit"));
}

#[tokio::test]
async fn captured_output_is_bounded() {
    let h = harness(RSYNC_NOISY).await;

    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;

    let output = h.engine.get_job(&job.id).await.unwrap().output.unwrap();
    assert!(output.len() <= 4096 + 64);
    assert!(output.starts_with('['));
    assert!(output.contains("earlier lines truncated"));
    assert!(output.contains("pub/file-1999.tgz"));
    assert!(!output.contains("pub/file-0.tgz\n"));
}

#[tokio::test]
async fn disabled_and_unknown_targets_are_refused() {
    let h = harness(RSYNC_OK).await;

    h.engine
        .update_target(
            "netbsd",
            TargetUpdate {
                enabled: Some(false),
                ..TargetUpdate::default()
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        h.engine.trigger_sync("netbsd", "alice").await,
        Err(EngineError::TargetDisabled(_))
    ));
    assert!(matches!(
        h.engine.trigger_sync("plan9", "alice").await,
        Err(EngineError::TargetNotFound(_))
    ));
    assert!(matches!(
        h.engine.trigger_sync("freebsd", "  ").await,
        Err(EngineError::Validation { .. })
    ));
    assert!(h.engine.list_jobs("netbsd", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn upstream_change_is_refused_while_syncing_but_disable_is_not() {
    let h = harness(RSYNC_SLOW).await;
    h.engine.trigger_sync("freebsd", "alice").await.unwrap();

    let err = h
        .engine
        .update_target(
            "freebsd",
            TargetUpdate {
                upstream_url: Some("rsync://mirror.example.org/FreeBSD/".into()),
                enabled: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TargetBusy(_)));

    let target = h
        .engine
        .update_target(
            "freebsd",
            TargetUpdate {
                upstream_url: None,
                enabled: Some(false),
            },
        )
        .await
        .unwrap();
    assert!(!target.enabled);
    assert_eq!(target.status, TargetStatus::Syncing);

    h.engine.shutdown().await;

    let target = h.engine.get_target("freebsd").await.unwrap();
    assert_eq!(target.status, TargetStatus::Disabled);
    assert_eq!(target.upstream_url, "rsync://ftp.freebsd.org/FreeBSD/");
}

#[tokio::test]
async fn upstream_is_validated_and_updated_when_idle() {
    let h = harness(RSYNC_OK).await;

    let err = h
        .engine
        .update_target(
            "netbsd",
            TargetUpdate {
                upstream_url: Some("ftp://ftp.netbsd.org/pub/NetBSD/".into()),
                enabled: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { ref key, .. } if key == "upstream_url"));

    let target = h
        .engine
        .update_target(
            "netbsd",
            TargetUpdate {
                upstream_url: Some("https://cdn.netbsd.org/pub/NetBSD/".into()),
                enabled: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(target.upstream_url, "https://cdn.netbsd.org/pub/NetBSD/");
    assert_eq!(target.status, TargetStatus::Active);
}

#[tokio::test]
async fn settings_round_trip_and_reject_bad_values() {
    let h = harness(RSYNC_OK).await;

    let before = h.engine.get_settings().await.unwrap();
    let seeded = before.iter().find(|s| s.key == "sync_schedule").unwrap().clone();
    assert_eq!(seeded.value, "0 4 * * *");

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.set("sync_schedule", "0 4 * * *").await;
    let after = h.engine.get_settings().await.unwrap();
    let updated = after.iter().find(|s| s.key == "sync_schedule").unwrap();
    assert_eq!(updated.value, "0 4 * * *");
    assert!(updated.updated_at > seeded.updated_at);

    let mut bogus = std::collections::HashMap::new();
    bogus.insert("sync_schedule".to_string(), "bogus".to_string());
    assert!(matches!(
        h.engine.update_settings(&bogus).await,
        Err(EngineError::Validation { .. })
    ));
    let unchanged = h.engine.get_settings().await.unwrap();
    assert_eq!(
        unchanged.iter().find(|s| s.key == "sync_schedule").unwrap(),
        updated
    );
}

#[tokio::test]
async fn bootstrap_recovers_from_a_crash() {
    let h = harness(RSYNC_OK).await;

    // Leave state behind the way a killed daemon would.
    let orphan = SyncJob::new("freebsd", TriggerOrigin::Schedule);
    db::jobs::append(&h.ctx.db, &orphan).await.unwrap();
    db::jobs::mark_running(&h.ctx.db, orphan.id.clone(), Utc::now())
        .await
        .unwrap();
    db::targets::mark_syncing(&h.ctx.db, "freebsd".into(), Utc::now())
        .await
        .unwrap();

    let report = h.engine.bootstrap().await.unwrap();
    assert_eq!(report.jobs_recovered, 1);
    assert_eq!(report.targets_recovered, 1);
    assert_eq!(report.settings_seeded, 0);
    assert_eq!(report.targets_seeded, 0);

    let job = h.engine.get_job(&orphan.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Interrupted));

    let target = h.engine.get_target("freebsd").await.unwrap();
    assert_eq!(target.status, TargetStatus::Error);

    h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;
    assert_eq!(
        h.engine.get_target("freebsd").await.unwrap().status,
        TargetStatus::Active
    );
}

#[tokio::test]
async fn history_is_listed_newest_first_and_pruned() {
    let h = harness(RSYNC_OK).await;

    for _ in 0..3 {
        h.engine.trigger_sync("freebsd", "alice").await.unwrap();
        h.engine.wait_idle().await;
    }

    let jobs = h.engine.list_jobs("freebsd", Some(2)).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs[0].created_at >= jobs[1].created_at);
    assert!(jobs.iter().all(|j| j.output.is_none()));

    assert!(matches!(
        h.engine.prune_jobs(RetentionPolicy::default()).await,
        Err(EngineError::Validation { .. })
    ));
    let removed = h
        .engine
        .prune_jobs(RetentionPolicy {
            keep_per_target: Some(1),
            older_than_days: None,
        })
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(h.engine.list_jobs("freebsd", None).await.unwrap().len(), 1);

    assert!(matches!(
        h.engine.get_job("missing").await,
        Err(EngineError::JobNotFound(_))
    ));
    assert!(matches!(
        h.engine.list_jobs("plan9", None).await,
        Err(EngineError::TargetNotFound(_))
    ));
}

#[tokio::test]
async fn out_of_range_retention_is_rejected() {
    let h = harness(RSYNC_OK).await;
    h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    h.engine.wait_idle().await;

    let err = h
        .engine
        .prune_jobs(RetentionPolicy {
            keep_per_target: None,
            older_than_days: Some(100_000_000),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { ref key, .. } if key == "older_than_days"));

    // Storage is still usable afterwards.
    assert_eq!(h.engine.list_jobs("freebsd", None).await.unwrap().len(), 1);
    let removed = h
        .engine
        .prune_jobs(RetentionPolicy {
            keep_per_target: None,
            older_than_days: Some(mirsd::core::engine::MAX_RETENTION_DAYS),
        })
        .await
        .unwrap();
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn reports_follow_targets_and_history() {
    let h = harness(RSYNC_OK).await;

    assert_eq!(h.engine.health().await.unwrap().status, HealthStatus::Healthy);
    let summary = h.engine.summary().await.unwrap();
    assert_eq!(summary.total_targets, 2);
    assert_eq!(summary.enabled_targets, 2);
    assert_eq!(summary.total_size_bytes, 0);
    let activity = h.engine.sync_activity(None).await.unwrap();
    assert_eq!(activity.days, 7);
    assert_eq!(activity.totals.total_jobs, 0);

    for name in ["freebsd", "netbsd"] {
        h.engine.trigger_sync(name, "alice").await.unwrap();
        h.engine.wait_idle().await;
    }

    let summary = h.engine.summary().await.unwrap();
    assert_eq!(summary.total_size_bytes, 10_000_000);
    assert_eq!(summary.total_files, 2_408);

    let activity = h.engine.sync_activity(Some(1)).await.unwrap();
    assert_eq!(activity.totals.total_jobs, 2);
    assert_eq!(activity.totals.count(JobStatus::Completed), 2);
    assert_eq!(activity.totals.count(JobStatus::Failed), 0);
    assert_eq!(activity.totals.bytes_transferred, 128_000);
    assert_eq!(activity.totals.files_transferred, 24);
    assert_eq!(activity.recent.len(), 2);
    assert_eq!(activity.recent[0].target, "netbsd");

    let lease = h.ctx.locks.try_acquire("netbsd").await.unwrap();
    assert_eq!(h.engine.health().await.unwrap().status, HealthStatus::Updating);
    lease.release(TargetStatus::Error).await.unwrap();
    assert_eq!(h.engine.health().await.unwrap().status, HealthStatus::Degraded);

    h.engine
        .update_target(
            "netbsd",
            TargetUpdate {
                enabled: Some(false),
                ..TargetUpdate::default()
            },
        )
        .await
        .unwrap();
    let health = h.engine.health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.targets.len(), 1);
    assert_eq!(h.engine.summary().await.unwrap().enabled_targets, 1);

    for days in [0, 40_000] {
        assert!(matches!(
            h.engine.sync_activity(Some(days)).await,
            Err(EngineError::Validation { ref key, .. }) if key == "days"
        ));
    }
}

#[tokio::test]
async fn simulated_engine_runs_without_rsync() {
    let h = harness_with(RSYNC_FAIL, |config| config.simulation = true).await;

    let job = h.engine.trigger_sync("freebsd", "alice").await.unwrap();
    let progress = h.engine.active_progress().await;
    assert!(progress.len() <= 1);

    h.engine.wait_idle().await;
    let job = h.engine.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(h.invocations().is_empty());
    assert!(h.engine.active_progress().await.is_empty());
}
