//! Cron-driven and manual dispatch of sync jobs.
//!
//! Both paths go through [`Dispatcher::dispatch`]: take the target's lock,
//! record a pending job, then hand both to a job task. Losing the lock race
//! is reported as `TargetBusy` and creates no job.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::time::MissedTickBehavior;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::cron::CronSchedule;
use super::error::{EngineError, EngineResult};
use super::executor::JobExecutor;
use super::lock::LockManager;
use super::models::{SyncJob, TargetStatus, TriggerOrigin};
use super::settings::SettingsStore;
use crate::db;

#[derive(Clone)]
pub struct Dispatcher {
    db: Connection,
    locks: LockManager,
    executor: JobExecutor,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        db: Connection,
        locks: LockManager,
        executor: JobExecutor,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            locks,
            executor,
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    /// Start a job for `target` in the background and return it as recorded
    /// (still `pending`).
    pub async fn dispatch(&self, target: &str, origin: TriggerOrigin) -> EngineResult<SyncJob> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let lease = self.locks.try_acquire(target).await?;
        let job = SyncJob::new(target, origin);

        if let Err(e) = db::jobs::append(&self.db, &job).await {
            error!(target, error = %e, "Failed to record job; releasing lock");
            if let Err(release_err) = lease.release(TargetStatus::Error).await {
                error!(target, error = %release_err, "Failed to release lock");
            }
            return Err(e.into());
        }

        info!(target, job_id = %job.id, origin = %job.origin, "Sync job dispatched");

        let executor = self.executor.clone();
        let cancel = self.shutdown.child_token();
        let pending = job.clone();
        self.tasks.spawn(async move {
            let job_id = job.id.clone();
            if let Err(e) = executor.run(lease, job, cancel).await {
                error!(job_id = %job_id, error = %e, "Sync job ended with an engine error");
            }
        });

        Ok(pending)
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every dispatched job task has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        if !self.shutdown.is_cancelled() {
            self.tasks.reopen();
        }
    }
}

/// Decides when each enabled target is due and dispatches it.
pub struct Scheduler {
    db: Connection,
    settings: SettingsStore,
    dispatcher: Dispatcher,
    tick: Duration,
    schedule: Option<String>,
    cron: Option<CronSchedule>,
    next_fire: HashMap<String, DateTime<Local>>,
    started: bool,
}

impl Scheduler {
    pub fn new(
        db: Connection,
        settings: SettingsStore,
        dispatcher: Dispatcher,
        tick: Duration,
    ) -> Self {
        Self {
            db,
            settings,
            dispatcher,
            tick,
            schedule: None,
            cron: None,
            next_fire: HashMap::new(),
            started: false,
        }
    }

    /// When `target` is next due, if it is tracked.
    pub fn next_fire(&self, target: &str) -> Option<DateTime<Local>> {
        self.next_fire.get(target).copied()
    }

    /// Poll until `shutdown` fires. The first tick runs immediately.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_secs = self.tick.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Local::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// One scheduling pass at `now`. Returns the jobs it dispatched.
    pub async fn tick(&mut self, now: DateTime<Local>) -> EngineResult<Vec<SyncJob>> {
        let settings = self.settings.snapshot().await?;
        self.reload_schedule(&settings.schedule, now);

        let first_tick = !self.started;
        self.started = true;

        let targets = db::targets::list(&self.db).await?;
        let enabled: HashSet<&str> = targets
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.name.as_str())
            .collect();
        // Targets re-enabled later start from their next cron fire.
        self.next_fire.retain(|name, _| enabled.contains(name.as_str()));

        let mut dispatched = Vec::new();
        for target in targets.iter().filter(|t| t.enabled) {
            let due_at = match self.next_fire.get(&target.name) {
                Some(at) => *at,
                None => {
                    let first = if first_tick && settings.on_startup {
                        Some(now)
                    } else {
                        self.cron.as_ref().and_then(|c| c.next_after(&now))
                    };
                    match first {
                        Some(at) => {
                            debug!(target = %target.name, next = %at, "Next sync scheduled");
                            self.next_fire.insert(target.name.clone(), at);
                            at
                        }
                        None => continue,
                    }
                }
            };

            if due_at > now {
                continue;
            }

            match self
                .dispatcher
                .dispatch(&target.name, TriggerOrigin::Schedule)
                .await
            {
                Ok(job) => {
                    dispatched.push(job);
                    self.advance(&target.name, now);
                }
                Err(EngineError::TargetBusy(_)) => {
                    debug!(target = %target.name, "Target busy; will retry next tick");
                }
                Err(EngineError::TargetDisabled(_)) | Err(EngineError::TargetNotFound(_)) => {
                    self.advance(&target.name, now);
                }
                Err(EngineError::ShuttingDown) => break,
                Err(e) => {
                    warn!(target = %target.name, error = %e, "Scheduled dispatch failed; will retry next tick");
                }
            }
        }

        Ok(dispatched)
    }

    fn advance(&mut self, target: &str, now: DateTime<Local>) {
        match self.cron.as_ref().and_then(|c| c.next_after(&now)) {
            Some(next) => {
                debug!(target, next = %next, "Next sync scheduled");
                self.next_fire.insert(target.to_string(), next);
            }
            None => {
                self.next_fire.remove(target);
            }
        }
    }

    /// Re-parse the cron expression when it changed. Fire times still in
    /// the future are dropped and recomputed; targets already due (such as
    /// one that lost a lock race) stay due.
    fn reload_schedule(&mut self, expr: &str, now: DateTime<Local>) {
        if self.schedule.as_deref() == Some(expr) {
            return;
        }

        match CronSchedule::parse(expr) {
            Ok(cron) => {
                if cron.next_after(&Local::now()).is_none() {
                    warn!(schedule = %cron, "Sync schedule never fires");
                } else {
                    info!(schedule = %cron, "Sync schedule loaded");
                }
                self.cron = Some(cron);
            }
            Err(e) => {
                warn!(schedule = expr, error = %e, "Unusable sync schedule; no scheduled syncs will run");
                self.cron = None;
            }
        }
        self.schedule = Some(expr.to_string());
        self.next_fire.retain(|_, due_at| *due_at <= now);
    }
}
