//! Per-target mutual exclusion.
//!
//! A target is `syncing` in storage exactly while a [`TargetLease`] for it is
//! alive. Only [`LockManager::try_acquire`] moves a target into `syncing`
//! and only the lease moves it back out.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio_rusqlite::Connection;
use tracing::{debug, error, warn};

use super::error::{EngineError, EngineResult};
use super::models::TargetStatus;
use crate::db;

type HeldSet = Arc<Mutex<HashSet<String>>>;

fn lock_set(held: &HeldSet) -> MutexGuard<'_, HashSet<String>> {
    // Critical sections never panic mid-update, so a poisoned set is still consistent.
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct LockManager {
    db: Connection,
    held: HeldSet,
}

impl LockManager {
    pub fn new(db: Connection) -> Self {
        Self {
            db,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Take the target's lock and mark it `syncing`. The loser of a race
    /// gets `TargetBusy` immediately; nothing is queued.
    pub async fn try_acquire(&self, name: &str) -> EngineResult<TargetLease> {
        let target = db::targets::get(&self.db, name.to_string())
            .await?
            .ok_or_else(|| EngineError::TargetNotFound(name.to_string()))?;

        if !lock_set(&self.held).insert(name.to_string()) {
            return Err(EngineError::TargetBusy(name.to_string()));
        }

        if !target.enabled {
            lock_set(&self.held).remove(name);
            return Err(EngineError::TargetDisabled(name.to_string()));
        }

        if let Err(e) = db::targets::mark_syncing(&self.db, name.to_string(), Utc::now()).await {
            lock_set(&self.held).remove(name);
            return Err(e.into());
        }

        debug!(target = name, "Lock acquired");
        Ok(TargetLease {
            target: name.to_string(),
            db: self.db.clone(),
            held: self.held.clone(),
            released: false,
        })
    }

    /// Hold the target's slot without touching its status, for
    /// administrative changes that must not overlap a run.
    pub fn reserve(&self, name: &str) -> EngineResult<Reservation> {
        if !lock_set(&self.held).insert(name.to_string()) {
            return Err(EngineError::TargetBusy(name.to_string()));
        }
        Ok(Reservation {
            target: name.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_locked(&self, name: &str) -> bool {
        lock_set(&self.held).contains(name)
    }

    /// Names of all currently locked targets, sorted.
    pub fn held(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_set(&self.held).iter().cloned().collect();
        names.sort();
        names
    }
}

/// Scoped ownership of one target's lock.
///
/// Call [`TargetLease::release`] on every exit path. A lease dropped without
/// release frees its slot only after resetting the target to `error`.
pub struct TargetLease {
    target: String,
    db: Connection,
    held: HeldSet,
    released: bool,
}

impl std::fmt::Debug for TargetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetLease")
            .field("target", &self.target)
            .field("released", &self.released)
            .finish()
    }
}

impl TargetLease {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Move the target out of `syncing` and free the lock. Returns the
    /// status actually stored, which is `disabled` if the target was
    /// disabled while the lease was held.
    pub async fn release(mut self, status: TargetStatus) -> EngineResult<TargetStatus> {
        if status == TargetStatus::Syncing {
            return Err(EngineError::Precondition(format!(
                "lease for `{}` released with status syncing",
                self.target
            )));
        }

        let landed = db::targets::release_status(&self.db, self.target.clone(), status)
            .await?
            .ok_or_else(|| EngineError::TargetNotFound(self.target.clone()))?;

        lock_set(&self.held).remove(&self.target);
        self.released = true;
        debug!(target = %self.target, status = %landed, "Lock released");
        Ok(landed)
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(target = %self.target, "Lease dropped without release; resetting target to error");
        let target = self.target.clone();
        let held = self.held.clone();
        let db = self.db.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) =
                        db::targets::release_status(&db, target.clone(), TargetStatus::Error).await
                    {
                        error!(target = %target, error = %e, "Failed to reset target status");
                    }
                    lock_set(&held).remove(&target);
                });
            }
            Err(_) => {
                lock_set(&held).remove(&target);
            }
        }
    }
}

/// Slot held by [`LockManager::reserve`]. Freed on drop.
pub struct Reservation {
    target: String,
    held: HeldSet,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        lock_set(&self.held).remove(&self.target);
    }
}
