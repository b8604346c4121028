use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::buffer::OutputBuffer;
use crate::core::stats::TransferStats;
use crate::core::transfer_engine::{
    TransferEngine, TransferError, TransferEvent, TransferReport, TransferRequest,
};

/// Pretends to mirror a tree without touching the network or the disk.
/// Used for dry runs with `simulation = true`.
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    pub files: u32,
    pub file_size: u64,
    /// Pause between emitted file lines.
    pub delay: Duration,
    /// When set, the run ends like rsync exiting with this status.
    pub fail_with: Option<i32>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self {
            files: 20,
            file_size: 4 * 1024 * 1024,
            delay: Duration::from_millis(250),
            fail_with: None,
        }
    }
}

impl TransferEngine for SimulatedEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TransferReport> + Send>> {
        let sim = self.clone();
        let req = req.clone();

        Box::pin(async move {
            let mut buffer = OutputBuffer::new(64 * 1024);
            let mut lines = vec!["receiving incremental file list".to_string()];
            lines.extend((0..sim.files).map(|i| format!("simulated/file-{:04}.dat", i)));

            let _ = tx.send(TransferEvent::Started { pid: None }).await;

            let run = async {
                for line in &lines {
                    buffer.push_line(line);
                    let _ = tx.send(TransferEvent::Output(line.clone())).await;
                    sleep(sim.delay).await;
                }
            };

            let stopped = tokio::select! {
                _ = run => None,
                _ = sleep(req.timeout) => Some(TransferError::Timeout(req.timeout)),
                _ = cancel.cancelled() => Some(TransferError::Cancelled),
            };

            if let Some(err) = stopped {
                return TransferReport {
                    output: buffer.contents(),
                    stats: TransferStats::default(),
                    exit_code: None,
                    result: Err(err),
                };
            }

            if let Some(code) = sim.fail_with {
                let line = format!("rsync error: simulated failure (code {})", code);
                buffer.push_line(&line);
                return TransferReport {
                    output: buffer.contents(),
                    stats: TransferStats::default(),
                    exit_code: Some(code),
                    result: Err(TransferError::Failed {
                        exit_code: Some(code),
                        diagnostic: line,
                    }),
                };
            }

            let total = u64::from(sim.files) * sim.file_size;
            let summary = [
                String::new(),
                format!("Number of files: {}", sim.files),
                format!("Number of regular files transferred: {}", sim.files),
                format!("Total file size: {} bytes", total),
                format!("Total transferred file size: {} bytes", total),
            ];
            let mut stats = TransferStats::default();
            for line in &summary {
                stats.observe_line(line);
                buffer.push_line(line);
                let _ = tx.send(TransferEvent::Output(line.clone())).await;
            }

            TransferReport {
                output: buffer.contents(),
                stats,
                exit_code: Some(0),
                result: Ok(()),
            }
        })
    }
}
