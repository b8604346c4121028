//! `MirrorEngine`: the facade the daemon, the control server and tests
//! drive the sync engine through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::error::{EngineError, EngineResult};
use super::executor::JobExecutor;
use super::models::{
    MirrorTarget, RetentionPolicy, Setting, SyncJob, TargetUpdate, TriggerOrigin,
    validate_upstream_url,
};
use super::progress::JobProgress;
use super::report::{
    DEFAULT_ACTIVITY_DAYS, HealthReport, MirrorSummary, RECENT_ACTIVITY_LIMIT, SyncActivity,
};
use super::scheduler::{Dispatcher, Scheduler};
use super::transfer_engine::{TransferEngine, create_engine};
use crate::context::AppContext;
use crate::db;

/// Default page size for job history.
pub const DEFAULT_JOB_LIMIT: u32 = 10;

/// Largest `older_than_days` accepted by [`MirrorEngine::prune_jobs`].
pub const MAX_RETENTION_DAYS: u32 = 36_500;

const RESTART_REASON: &str = "interrupted by daemon restart";

/// What [`MirrorEngine::bootstrap`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootReport {
    pub settings_seeded: usize,
    pub targets_seeded: usize,
    pub jobs_recovered: usize,
    pub targets_recovered: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub simulation: bool,
    pub targets: usize,
    /// Targets currently holding a lock.
    pub syncing: Vec<String>,
    pub running_jobs: usize,
    /// New jobs are refused once shutdown has begun.
    pub shutting_down: bool,
}

#[derive(Clone)]
pub struct MirrorEngine {
    ctx: AppContext,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl MirrorEngine {
    pub fn new(ctx: AppContext) -> Self {
        let engine = create_engine(&ctx.config);
        Self::with_transfer_engine(ctx, engine)
    }

    pub fn with_transfer_engine(ctx: AppContext, engine: Arc<dyn TransferEngine>) -> Self {
        let executor = JobExecutor::new(
            ctx.db.clone(),
            ctx.settings.clone(),
            engine,
            ctx.progress.clone(),
        );
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            ctx.db.clone(),
            ctx.locks.clone(),
            executor,
            shutdown.clone(),
        );

        Self {
            ctx,
            dispatcher,
            shutdown,
            started_at: Utc::now(),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Recover from an unclean stop, then seed settings and declared
    /// targets. Must run before the scheduler starts.
    pub async fn bootstrap(&self) -> EngineResult<BootReport> {
        let db = &self.ctx.db;
        let jobs_recovered =
            db::jobs::recover_interrupted(db, RESTART_REASON.to_string(), Utc::now()).await?;
        let targets_recovered = db::targets::recover_syncing(db, RESTART_REASON.to_string()).await?;
        if jobs_recovered > 0 || targets_recovered > 0 {
            info!(jobs_recovered, targets_recovered, "Recovered state from previous run");
        }

        let settings_seeded = self.ctx.settings.seed().await?;

        let mut targets_seeded = 0;
        for target in self.ctx.config.targets() {
            let name = target.name.clone();
            if db::targets::insert_if_missing(db, target).await? {
                info!(target = %name, "Registered mirror target");
                targets_seeded += 1;
            }
        }

        Ok(BootReport {
            settings_seeded,
            targets_seeded,
            jobs_recovered,
            targets_recovered,
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.ctx.db.clone(),
            self.ctx.settings.clone(),
            self.dispatcher.clone(),
            Duration::from_secs(self.ctx.config.tick_interval_secs),
        )
    }

    /// Run the scheduler loop in the background until [`Self::shutdown`].
    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler();
        tokio::spawn(scheduler.run(self.shutdown.clone()))
    }

    /// Stop dispatching, cancel running jobs and wait for them to record
    /// their outcome and release their locks.
    pub async fn shutdown(&self) {
        info!(running = self.dispatcher.running_tasks(), "Shutting down sync engine");
        self.shutdown.cancel();
        self.dispatcher.wait_idle().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for every job dispatched so far to finish.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    pub async fn status(&self) -> EngineResult<DaemonStatus> {
        let targets = db::targets::list(&self.ctx.db).await?;
        Ok(DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            simulation: self.ctx.config.simulation,
            targets: targets.len(),
            syncing: self.ctx.locks.held(),
            running_jobs: self.ctx.progress.active_count().await,
            shutting_down: self.is_shutting_down(),
        })
    }

    pub async fn list_targets(&self) -> EngineResult<Vec<MirrorTarget>> {
        Ok(db::targets::list(&self.ctx.db).await?)
    }

    pub async fn get_target(&self, name: &str) -> EngineResult<MirrorTarget> {
        db::targets::get(&self.ctx.db, name.to_string())
            .await?
            .ok_or_else(|| EngineError::TargetNotFound(name.to_string()))
    }

    /// Change a target's upstream and/or enabled flag. Changing the
    /// upstream of a syncing target is refused; toggling `enabled` is not.
    pub async fn update_target(&self, name: &str, update: TargetUpdate) -> EngineResult<MirrorTarget> {
        let current = self.get_target(name).await?;

        let upstream_url = match update.upstream_url {
            Some(url) => {
                let url = url.trim().to_string();
                validate_upstream_url(&url)
                    .map_err(|reason| EngineError::validation("upstream_url", reason))?;
                (url != current.upstream_url).then_some(url)
            }
            None => None,
        };
        let enabled = update.enabled.filter(|&e| e != current.enabled);

        if upstream_url.is_none() && enabled.is_none() {
            return Ok(current);
        }

        // Held across the write so a run cannot start against the old upstream.
        let _reservation = match upstream_url {
            Some(_) => Some(self.ctx.locks.reserve(name)?),
            None => None,
        };

        let updated = db::targets::update_admin(&self.ctx.db, name.to_string(), upstream_url, enabled)
            .await?
            .ok_or_else(|| EngineError::TargetNotFound(name.to_string()))?;

        info!(
            target = name,
            upstream = %updated.upstream_url,
            enabled = updated.enabled,
            status = %updated.status,
            "Mirror target updated"
        );
        Ok(updated)
    }

    /// Start a manual sync. Fails fast with `TargetBusy` if one is running.
    pub async fn trigger_sync(&self, name: &str, actor: &str) -> EngineResult<SyncJob> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(EngineError::validation("actor", "must not be empty"));
        }
        self.dispatcher
            .dispatch(name, TriggerOrigin::manual(actor))
            .await
    }

    pub async fn list_jobs(&self, name: &str, limit: Option<u32>) -> EngineResult<Vec<SyncJob>> {
        self.get_target(name).await?;
        let limit = limit.unwrap_or(DEFAULT_JOB_LIMIT);
        Ok(db::jobs::list(&self.ctx.db, name.to_string(), limit).await?)
    }

    pub async fn get_job(&self, id: &str) -> EngineResult<SyncJob> {
        db::jobs::get(&self.ctx.db, id.to_string())
            .await?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    /// Delete finished jobs outside `policy`. Returns how many were removed.
    pub async fn prune_jobs(&self, policy: RetentionPolicy) -> EngineResult<usize> {
        if policy.keep_per_target.is_none() && policy.older_than_days.is_none() {
            return Err(EngineError::validation(
                "policy",
                "set keep_per_target and/or older_than_days",
            ));
        }
        if policy.older_than_days.is_some_and(|days| days > MAX_RETENTION_DAYS) {
            return Err(EngineError::validation(
                "older_than_days",
                format!("must be at most {}", MAX_RETENTION_DAYS),
            ));
        }

        let removed = db::jobs::prune(&self.ctx.db, policy.clone(), Utc::now()).await?;
        info!(
            removed,
            keep_per_target = ?policy.keep_per_target,
            older_than_days = ?policy.older_than_days,
            "Pruned job history"
        );
        Ok(removed)
    }

    pub async fn get_settings(&self) -> EngineResult<Vec<Setting>> {
        self.ctx.settings.all().await
    }

    /// Validate and store every entry, or none of them.
    pub async fn update_settings(&self, changes: &HashMap<String, String>) -> EngineResult<Vec<Setting>> {
        self.ctx.settings.update_many(changes).await
    }

    pub async fn active_progress(&self) -> Vec<JobProgress> {
        self.ctx.progress.get_all().await
    }

    /// Healthy, updating or degraded, judged from the enabled targets.
    pub async fn health(&self) -> EngineResult<HealthReport> {
        let targets = db::targets::list(&self.ctx.db).await?;
        Ok(HealthReport::from_targets(&targets, Utc::now()))
    }

    pub async fn summary(&self) -> EngineResult<MirrorSummary> {
        let targets = db::targets::list(&self.ctx.db).await?;
        Ok(MirrorSummary::from_targets(&targets))
    }

    /// Job activity over the last `days` days (default a week).
    pub async fn sync_activity(&self, days: Option<u32>) -> EngineResult<SyncActivity> {
        let days = days.unwrap_or(DEFAULT_ACTIVITY_DAYS);
        if days == 0 || days > MAX_RETENTION_DAYS {
            return Err(EngineError::validation(
                "days",
                format!("must be between 1 and {}", MAX_RETENTION_DAYS),
            ));
        }
        let since = Utc::now() - ChronoDuration::days(i64::from(days));

        let totals = db::jobs::activity(&self.ctx.db, since).await?;
        let recent = db::jobs::recent(&self.ctx.db, since, RECENT_ACTIVITY_LIMIT).await?;
        Ok(SyncActivity {
            days,
            since,
            totals,
            recent,
        })
    }
}
