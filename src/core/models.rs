use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

pub const MAX_UPSTREAM_URL_LEN: usize = 500;

static UPSTREAM_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(rsync|https?)://\S+$").expect("valid regex"));

/// Error returned when a stored enum value is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Active,
    Syncing,
    Error,
    Disabled,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Syncing => "syncing",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for TargetStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "syncing" => Ok(Self::Syncing),
            "error" => Ok(Self::Error),
            "disabled" => Ok(Self::Disabled),
            other => Err(ParseEnumError::new("target status", other)),
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream distribution tree mirrored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorTarget {
    pub name: String,
    pub kind: String,
    pub upstream_url: String,
    pub local_path: PathBuf,
    pub enabled: bool,
    pub status: TargetStatus,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub total_size_bytes: Option<u64>,
    pub file_count: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A target declared in the daemon config, inserted into the registry on boot.
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub name: String,
    pub kind: String,
    pub upstream_url: String,
    pub local_path: PathBuf,
    pub enabled: bool,
}

/// Administrative change to a target. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetUpdate {
    #[serde(default)]
    pub upstream_url: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("job status", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a job: the cron schedule or a named operator.
///
/// Stored and serialized as `schedule` or `manual:<actor>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TriggerOrigin {
    Schedule,
    Manual(String),
}

impl TriggerOrigin {
    pub fn manual(actor: impl Into<String>) -> Self {
        Self::Manual(actor.into())
    }
}

impl fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schedule => f.write_str("schedule"),
            Self::Manual(actor) => write!(f, "manual:{}", actor),
        }
    }
}

impl FromStr for TriggerOrigin {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "schedule" => Ok(Self::Schedule),
            Some(("manual", actor)) if !actor.is_empty() => Ok(Self::Manual(actor.to_string())),
            _ => Err(ParseEnumError::new("trigger origin", s)),
        }
    }
}

impl From<TriggerOrigin> for String {
    fn from(origin: TriggerOrigin) -> Self {
        origin.to_string()
    }
}

impl TryFrom<String> for TriggerOrigin {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The transfer exceeded `sync_timeout` and was killed.
    Timeout,
    /// The transfer tool exited nonzero or was killed by a signal.
    ExitCode,
    /// The transfer tool could not be started.
    Spawn,
    /// The run was cut short by a daemon shutdown or restart.
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ExitCode => "exit_code",
            Self::Spawn => "spawn",
            Self::Interrupted => "interrupted",
        }
    }
}

impl FromStr for FailureKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(Self::Timeout),
            "exit_code" => Ok(Self::ExitCode),
            "spawn" => Ok(Self::Spawn),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(ParseEnumError::new("failure kind", other)),
        }
    }
}

/// One attempted synchronization run for a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub target: String,
    pub status: JobStatus,
    pub origin: TriggerOrigin,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub bytes_transferred: Option<u64>,
    pub files_transferred: Option<u64>,
    /// Captured tool output. Omitted from history listings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub exit_code: Option<i32>,
}

impl SyncJob {
    pub fn new(target: &str, origin: TriggerOrigin) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            target: target.to_string(),
            status: JobStatus::Pending,
            origin,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            bytes_transferred: None,
            files_transferred: None,
            output: None,
            error_message: None,
            failure_kind: None,
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

/// Which finished jobs to keep when pruning history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many finished jobs per target (newest first).
    #[serde(default)]
    pub keep_per_target: Option<u32>,
    /// Drop finished jobs created more than this many days ago.
    #[serde(default)]
    pub older_than_days: Option<u32>,
}

/// Check an upstream address: `rsync://`, `http://` or `https://`, no
/// whitespace, at most [`MAX_UPSTREAM_URL_LEN`] characters.
pub fn validate_upstream_url(url: &str) -> Result<(), String> {
    if url.chars().count() > MAX_UPSTREAM_URL_LEN {
        return Err(format!("must be at most {} characters", MAX_UPSTREAM_URL_LEN));
    }
    if !UPSTREAM_URL.is_match(url) {
        return Err("must start with rsync://, http:// or https://".to_string());
    }
    Ok(())
}
