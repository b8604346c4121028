//! The seam between the executor and the tool that moves bytes.

pub mod rsync;
pub mod simulated;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::models::FailureKind;
use super::stats::TransferStats;
use crate::config::AppConfig;

pub use rsync::RsyncEngine;
pub use simulated::SimulatedEngine;

/// rsync flags used for every mirror run. Delta transfer and `--partial`
/// make an interrupted run resumable by the next attempt.
pub const RSYNC_BASE_ARGS: &[&str] = &[
    "-avHz",
    "--delete",
    "--delete-delay",
    "--delay-updates",
    "--partial",
    "--stats",
    "--timeout=600",
];

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub job_id: String,
    pub source: String,
    pub destination: PathBuf,
    /// KiB/s; 0 means unlimited.
    pub bandwidth_limit_kbps: u64,
    pub timeout: Duration,
}

/// Events streamed to the executor while a transfer runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started { pid: Option<u32> },
    Output(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("transfer tool exited with {}:\n{diagnostic}", exit_label(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("failed to start transfer: {0}")]
    Spawn(String),

    #[error("transfer cancelled")]
    Cancelled,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (killed by signal)".to_string(),
    }
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Failed { .. } => FailureKind::ExitCode,
            Self::Spawn(_) => FailureKind::Spawn,
            Self::Cancelled => FailureKind::Interrupted,
        }
    }
}

/// Everything a finished transfer hands back, successful or not.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Captured output, bounded by the engine's buffer.
    pub output: String,
    pub stats: TransferStats,
    pub exit_code: Option<i32>,
    pub result: Result<(), TransferError>,
}

impl TransferReport {
    /// A transfer that never got as far as running the tool.
    pub fn not_started(reason: String) -> Self {
        Self {
            output: String::new(),
            stats: TransferStats::default(),
            exit_code: None,
            result: Err(TransferError::Spawn(reason)),
        }
    }
}

pub trait TransferEngine: Send + Sync {
    /// Run one transfer to completion. Never returns early: cancellation
    /// and timeouts are reported through [`TransferReport::result`] once
    /// the tool has been stopped.
    fn transfer(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TransferReport> + Send>>;
}

/// Command-line arguments for a mirror run, excluding the binary.
pub fn rsync_args(req: &TransferRequest) -> Vec<String> {
    let mut args: Vec<String> = RSYNC_BASE_ARGS.iter().map(|a| a.to_string()).collect();
    if req.bandwidth_limit_kbps > 0 {
        args.push(format!("--bwlimit={}", req.bandwidth_limit_kbps));
    }
    args.push(req.source.clone());
    args.push(req.destination.to_string_lossy().into_owned());
    args
}

pub fn create_engine(config: &AppConfig) -> Arc<dyn TransferEngine> {
    if config.simulation {
        Arc::new(SimulatedEngine::default())
    } else {
        Arc::new(RsyncEngine::from_config(config))
    }
}
