//! Read-only rollups over targets and job history for dashboards and the
//! CLI.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{JobStatus, MirrorTarget, SyncJob, TargetStatus};

/// Window used when a caller does not pick one.
pub const DEFAULT_ACTIVITY_DAYS: u32 = 7;

/// How many of the newest jobs an activity report lists.
pub const RECENT_ACTIVITY_LIMIT: u32 = 10;

/// Overall state of the enabled targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Updating,
    Degraded,
    Unknown,
}

impl HealthStatus {
    /// Any failed target degrades the rollup; otherwise a sync in flight
    /// means updating. Disabled targets are not counted.
    pub fn rollup(targets: &[MirrorTarget]) -> Self {
        let statuses: Vec<TargetStatus> = targets
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.status)
            .collect();

        if statuses.contains(&TargetStatus::Error) {
            Self::Degraded
        } else if statuses.contains(&TargetStatus::Syncing) {
            Self::Updating
        } else if statuses.iter().all(|s| *s == TargetStatus::Active) {
            Self::Healthy
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Updating => "updating",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line per target in the summary and health reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetBrief {
    pub name: String,
    pub status: TargetStatus,
    pub enabled: bool,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub total_size_bytes: Option<u64>,
}

impl From<&MirrorTarget> for TargetBrief {
    fn from(target: &MirrorTarget) -> Self {
        Self {
            name: target.name.clone(),
            status: target.status,
            enabled: target.enabled,
            last_sync_completed: target.last_sync_completed,
            total_size_bytes: target.total_size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Enabled targets only.
    pub targets: Vec<TargetBrief>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_targets(targets: &[MirrorTarget], checked_at: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::rollup(targets),
            targets: targets.iter().filter(|t| t.enabled).map(TargetBrief::from).collect(),
            checked_at,
        }
    }
}

/// Totals across every registered target. Sizes come from each target's
/// last successful sync; targets never synced count as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSummary {
    pub total_targets: usize,
    pub enabled_targets: usize,
    pub total_size_bytes: u64,
    pub total_files: u64,
    pub targets: Vec<TargetBrief>,
}

impl MirrorSummary {
    pub fn from_targets(targets: &[MirrorTarget]) -> Self {
        Self {
            total_targets: targets.len(),
            enabled_targets: targets.iter().filter(|t| t.enabled).count(),
            total_size_bytes: targets
                .iter()
                .filter_map(|t| t.total_size_bytes)
                .fold(0, u64::saturating_add),
            total_files: targets
                .iter()
                .filter_map(|t| t.file_count)
                .fold(0, u64::saturating_add),
            targets: targets.iter().map(TargetBrief::from).collect(),
        }
    }
}

/// Job counts and transfer volume over a window of history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityTotals {
    pub total_jobs: u64,
    /// Every job status appears, with zero when there were none.
    pub by_status: BTreeMap<String, u64>,
    /// Completed jobs only.
    pub bytes_transferred: u64,
    pub files_transferred: u64,
}

impl ActivityTotals {
    pub fn empty() -> Self {
        let by_status = [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();

        Self {
            by_status,
            ..Self::default()
        }
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncActivity {
    pub days: u32,
    pub since: DateTime<Utc>,
    #[serde(flatten)]
    pub totals: ActivityTotals,
    /// Newest first, without captured output.
    pub recent: Vec<SyncJob>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target(name: &str, status: TargetStatus, enabled: bool) -> MirrorTarget {
        let now = Utc::now();
        MirrorTarget {
            name: name.to_string(),
            kind: name.to_string(),
            upstream_url: format!("rsync://mirror.example.org/{}/", name),
            local_path: PathBuf::from("/srv/mirror").join(name),
            enabled,
            status,
            last_sync_started: None,
            last_sync_completed: None,
            last_sync_error: None,
            total_size_bytes: None,
            file_count: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn errors_outrank_running_syncs() {
        let targets = [
            target("freebsd", TargetStatus::Syncing, true),
            target("netbsd", TargetStatus::Error, true),
            target("openbsd", TargetStatus::Active, true),
        ];
        assert_eq!(HealthStatus::rollup(&targets), HealthStatus::Degraded);
        assert_eq!(HealthStatus::rollup(&targets[..1]), HealthStatus::Updating);
        assert_eq!(HealthStatus::rollup(&targets[2..]), HealthStatus::Healthy);
    }

    #[test]
    fn disabled_targets_do_not_affect_health() {
        let mut failed = target("netbsd", TargetStatus::Error, false);
        let targets = [target("freebsd", TargetStatus::Active, true), failed.clone()];
        let report = HealthReport::from_targets(&targets, Utc::now());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.targets.len(), 1);
        assert_eq!(report.targets[0].name, "freebsd");

        // An enabled target in a state outside the rollup's vocabulary.
        failed.enabled = true;
        failed.status = TargetStatus::Disabled;
        assert_eq!(HealthStatus::rollup(&[failed]), HealthStatus::Unknown);
    }

    #[test]
    fn summary_adds_up_known_sizes() {
        let mut freebsd = target("freebsd", TargetStatus::Active, true);
        freebsd.total_size_bytes = Some(5_000_000);
        freebsd.file_count = Some(1_204);
        let mut netbsd = target("netbsd", TargetStatus::Disabled, false);
        netbsd.total_size_bytes = Some(1_000);
        netbsd.file_count = Some(6);
        let openbsd = target("openbsd", TargetStatus::Active, true);

        let summary = MirrorSummary::from_targets(&[freebsd, netbsd, openbsd]);
        assert_eq!(summary.total_targets, 3);
        assert_eq!(summary.enabled_targets, 2);
        assert_eq!(summary.total_size_bytes, 5_001_000);
        assert_eq!(summary.total_files, 1_210);
        assert_eq!(summary.targets[2].total_size_bytes, None);
    }

    #[test]
    fn empty_totals_list_every_status() {
        let totals = ActivityTotals::empty();
        assert_eq!(totals.by_status.len(), 4);
        assert_eq!(totals.count(JobStatus::Failed), 0);
    }
}
