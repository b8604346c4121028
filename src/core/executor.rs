//! Runs one sync job from `pending` to a terminal state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::error::{EngineError, EngineResult};
use super::lock::TargetLease;
use super::models::{FailureKind, JobStatus, MirrorTarget, SyncJob, TargetStatus};
use super::progress::{JobProgress, ProgressTracker};
use super::settings::{SettingsStore, SyncSettings};
use super::transfer_engine::{TransferEngine, TransferEvent, TransferReport, TransferRequest};
use crate::db;
use crate::db::targets::SyncOutcome;
use crate::logging::LogThrottle;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// The finished job and the status its target landed on.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: SyncJob,
    pub target_status: TargetStatus,
}

#[derive(Clone)]
pub struct JobExecutor {
    db: Connection,
    settings: SettingsStore,
    engine: Arc<dyn TransferEngine>,
    progress: ProgressTracker,
}

impl JobExecutor {
    pub fn new(
        db: Connection,
        settings: SettingsStore,
        engine: Arc<dyn TransferEngine>,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            db,
            settings,
            engine,
            progress,
        }
    }

    /// Run `job` under `lease`. The lease is released on every path,
    /// including internal errors, which also fail the job.
    pub async fn run(
        &self,
        lease: TargetLease,
        job: SyncJob,
        cancel: CancellationToken,
    ) -> EngineResult<JobResult> {
        if lease.target() != job.target {
            let err = EngineError::Precondition(format!(
                "job {} is for `{}` but the lease is for `{}`",
                job.id,
                job.target,
                lease.target()
            ));
            lease.release(TargetStatus::Error).await?;
            return Err(err);
        }

        let span = info_span!("sync_job", job_id = %job.id, target = %job.target, origin = %job.origin);
        async move {
            match self.execute(&job, cancel).await {
                Ok(finished) => {
                    let status = if finished.status == JobStatus::Completed {
                        TargetStatus::Active
                    } else {
                        TargetStatus::Error
                    };
                    let target_status = lease.release(status).await?;
                    Ok(JobResult {
                        job: finished,
                        target_status,
                    })
                }
                Err(e) => {
                    error!(error = %e, "Sync job aborted");
                    self.abandon(&job, &e).await;
                    lease.release(TargetStatus::Error).await?;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: &SyncJob, cancel: CancellationToken) -> EngineResult<SyncJob> {
        let settings = self.settings.snapshot().await?;
        let target = db::targets::get(&self.db, job.target.clone())
            .await?
            .ok_or_else(|| EngineError::TargetNotFound(job.target.clone()))?;

        let stored = db::jobs::get(&self.db, job.id.clone())
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job.id.clone()))?;
        if stored.status != JobStatus::Pending {
            return Err(EngineError::Precondition(format!(
                "job {} is {}, not pending",
                job.id, stored.status
            )));
        }

        let mut job = job.clone();
        let clock = Instant::now();
        self.progress
            .start(JobProgress::new(&job.id, &job.target, job.origin.clone()))
            .await;
        let (report, started_at) = self.transfer(&job, &target, &settings, cancel).await;
        self.progress.remove(&job.id).await;

        // A tool that never started leaves the job pending until now.
        job.started_at = started_at;
        let completed_at = Utc::now();
        job.completed_at = Some(completed_at);
        job.output = Some(report.output);
        job.exit_code = report.exit_code;
        job.bytes_transferred = report.stats.bytes_transferred;
        job.files_transferred = report.stats.files_transferred;

        let outcome = match report.result {
            Ok(()) => {
                job.status = JobStatus::Completed;
                info!(
                    bytes = ?job.bytes_transferred,
                    files = ?job.files_transferred,
                    elapsed_secs = clock.elapsed().as_secs(),
                    "Sync completed"
                );
                SyncOutcome {
                    completed_at: Some(completed_at),
                    error: None,
                    total_size_bytes: report.stats.total_size,
                    file_count: report.stats.total_files,
                }
            }
            Err(e) => {
                let message = e.to_string();
                job.status = JobStatus::Failed;
                job.failure_kind = Some(e.kind());
                job.error_message = Some(message.clone());
                warn!(
                    kind = e.kind().as_str(),
                    exit_code = ?job.exit_code,
                    elapsed_secs = clock.elapsed().as_secs(),
                    error = %message,
                    "Sync failed"
                );
                SyncOutcome {
                    error: Some(message),
                    ..SyncOutcome::default()
                }
            }
        };

        if !db::jobs::finish(&self.db, &job).await? {
            warn!("Job was already terminal; result not stored");
        }
        db::targets::record_outcome(&self.db, job.target.clone(), outcome).await?;
        Ok(job)
    }

    /// Run the transfer. The job moves to `running` when the tool reports
    /// that it started; the returned timestamp is `None` if it never did.
    async fn transfer(
        &self,
        job: &SyncJob,
        target: &MirrorTarget,
        settings: &SyncSettings,
        cancel: CancellationToken,
    ) -> (TransferReport, Option<DateTime<Utc>>) {
        let req = TransferRequest {
            job_id: job.id.clone(),
            source: target.upstream_url.clone(),
            destination: target.local_path.clone(),
            bandwidth_limit_kbps: settings.bandwidth_limit,
            timeout: settings.timeout,
        };

        let cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(256);
        let db = self.db.clone();
        let progress = self.progress.clone();
        let job_id = job.id.clone();
        let stop = cancel.clone();
        let forward = tokio::spawn(
            async move {
                let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
                let mut started_at = None;
                while let Some(event) = rx.recv().await {
                    match event {
                        TransferEvent::Started { pid } => {
                            debug!(pid = ?pid, "Transfer started");
                            if let Some(pid) = pid {
                                progress.set_pid(&job_id, pid).await;
                            }
                            let at = Utc::now();
                            match db::jobs::mark_running(&db, job_id.clone(), at).await {
                                Ok(true) => started_at = Some(at),
                                Ok(false) => {
                                    error!("Job left pending state before its transfer started; stopping it");
                                    stop.cancel();
                                }
                                Err(e) => error!(error = %e, "Failed to mark job running"),
                            }
                        }
                        TransferEvent::Output(line) => {
                            progress.observe_line(&job_id, &line).await;
                            if throttle.should_log() {
                                debug!(line = %line, "Transfer progress");
                            }
                        }
                    }
                }
                started_at
            }
            .in_current_span(),
        );

        let report = self.engine.transfer(&req, tx, cancel).await;
        let started_at = match forward.await {
            Ok(started_at) => started_at,
            Err(e) => {
                warn!(error = %e, "Progress forwarder ended abnormally");
                None
            }
        };
        (report, started_at)
    }

    /// Best-effort terminal write for a job whose run hit an internal error.
    async fn abandon(&self, job: &SyncJob, cause: &EngineError) {
        let message = format!("sync aborted: {}", cause);
        let mut failed = job.clone();
        failed.status = JobStatus::Failed;
        failed.completed_at = Some(Utc::now());
        failed.failure_kind = Some(FailureKind::Interrupted);
        failed.error_message = Some(message.clone());

        if let Err(e) = db::jobs::finish(&self.db, &failed).await {
            error!(error = %e, "Failed to record aborted job");
        }
        let outcome = SyncOutcome {
            error: Some(message),
            ..SyncOutcome::default()
        };
        if let Err(e) = db::targets::record_outcome(&self.db, job.target.clone(), outcome).await {
            error!(error = %e, "Failed to record aborted sync on target");
        }
    }
}
