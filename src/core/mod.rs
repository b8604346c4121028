pub mod buffer;
pub mod cron;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lock;
pub mod models;
pub mod progress;
pub mod report;
pub mod scheduler;
pub mod settings;
pub mod stats;
pub mod transfer_engine;

pub use cron::{CronError, CronSchedule};
pub use engine::{BootReport, DaemonStatus, MirrorEngine};
pub use error::{EngineError, EngineResult};
pub use executor::{JobExecutor, JobResult};
pub use lock::{LockManager, TargetLease};
pub use models::{
    FailureKind, JobStatus, MirrorTarget, NewTarget, RetentionPolicy, Setting, SyncJob,
    TargetStatus, TargetUpdate, TriggerOrigin,
};
pub use progress::{JobProgress, ProgressTracker};
pub use report::{
    ActivityTotals, HealthReport, HealthStatus, MirrorSummary, SyncActivity, TargetBrief,
};
pub use scheduler::{Dispatcher, Scheduler};
pub use settings::{SettingKey, SettingsStore, SyncSettings};
pub use stats::TransferStats;
pub use transfer_engine::{
    RsyncEngine, SimulatedEngine, TransferEngine, TransferError, TransferEvent, TransferReport,
    TransferRequest,
};
