use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::buffer::OutputBuffer;
use crate::core::stats::TransferStats;
use crate::core::transfer_engine::{
    TransferEngine, TransferError, TransferEvent, TransferReport, TransferRequest, rsync_args,
};

/// Longest run of bytes kept as a single line before it is flushed.
const MAX_LINE_BYTES: usize = 16 * 1024;
/// How long to keep reading output once the process is gone. A grandchild
/// can hold the pipes open after rsync itself exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervises an rsync subprocess.
#[derive(Debug, Clone)]
pub struct RsyncEngine {
    pub binary: PathBuf,
    /// SIGTERM to SIGKILL delay when a run is stopped.
    pub grace: Duration,
    pub buffer_bytes: usize,
    pub diagnostic_lines: usize,
}

impl RsyncEngine {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            binary: config.rsync_binary.clone(),
            grace: Duration::from_secs(config.termination_grace_secs),
            buffer_bytes: config.output_buffer_bytes,
            diagnostic_lines: config.diagnostic_lines,
        }
    }
}

impl Default for RsyncEngine {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Output sink shared by the main loop and the final drain.
struct Capture {
    buffer: OutputBuffer,
    stats: TransferStats,
    tx: mpsc::Sender<TransferEvent>,
}

impl Capture {
    async fn record(&mut self, line: String) {
        self.stats.observe_line(&line);
        self.buffer.push_line(&line);
        let _ = self.tx.send(TransferEvent::Output(line)).await;
    }
}

impl TransferEngine for RsyncEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TransferReport> + Send>> {
        let engine = self.clone();
        let req = req.clone();
        Box::pin(async move { engine.supervise(req, tx, cancel).await })
    }
}

impl RsyncEngine {
    async fn supervise(
        self,
        req: TransferRequest,
        tx: mpsc::Sender<TransferEvent>,
        cancel: CancellationToken,
    ) -> TransferReport {
        if let Err(e) = tokio::fs::create_dir_all(&req.destination).await {
            return TransferReport::not_started(format!(
                "cannot create destination {}: {}",
                req.destination.display(),
                e
            ));
        }

        let args = rsync_args(&req);
        info!(
            job_id = %req.job_id,
            binary = %self.binary.display(),
            source = %req.source,
            destination = %req.destination.display(),
            bwlimit_kbps = req.bandwidth_limit_kbps,
            "Starting rsync"
        );

        let mut child = match Command::new(&self.binary)
            .args(&args)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return TransferReport::not_started(format!(
                    "failed to spawn {}: {}",
                    self.binary.display(),
                    e
                ));
            }
        };

        let _ = tx.send(TransferEvent::Started { pid: child.id() }).await;

        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut capture = Capture {
            buffer: OutputBuffer::new(self.buffer_bytes),
            stats: TransferStats::default(),
            tx,
        };

        let deadline = tokio::time::sleep(req.timeout);
        tokio::pin!(deadline);
        let mut lines_open = true;

        let exit = loop {
            tokio::select! {
                line = line_rx.recv(), if lines_open => match line {
                    Some(line) => capture.record(line).await,
                    None => lines_open = false,
                },
                status = child.wait() => break Exit::Exited(status),
                _ = &mut deadline => break Exit::TimedOut,
                _ = cancel.cancelled() => break Exit::Cancelled,
            }
        };

        if matches!(exit, Exit::TimedOut | Exit::Cancelled) {
            terminate(&mut child, self.grace, &req.job_id).await;
        }

        let drain = async {
            while let Some(line) = line_rx.recv().await {
                capture.record(line).await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(job_id = %req.job_id, "Output pipes still open after exit; giving up on drain");
        }

        let (exit_code, result) = match exit {
            Exit::Exited(Ok(status)) if status.success() => (status.code(), Ok(())),
            Exit::Exited(Ok(status)) => {
                let mut diagnostic = capture.buffer.tail(self.diagnostic_lines);
                if diagnostic.is_empty() {
                    diagnostic = status.to_string();
                }
                (
                    status.code(),
                    Err(TransferError::Failed {
                        exit_code: status.code(),
                        diagnostic,
                    }),
                )
            }
            Exit::Exited(Err(e)) => (
                None,
                Err(TransferError::Failed {
                    exit_code: None,
                    diagnostic: format!("failed to wait for rsync: {}", e),
                }),
            ),
            Exit::TimedOut => (None, Err(TransferError::Timeout(req.timeout))),
            Exit::Cancelled => (None, Err(TransferError::Cancelled)),
        };

        TransferReport {
            output: capture.buffer.contents(),
            stats: capture.stats,
            exit_code,
            result,
        }
    }
}

/// Stop rsync and every helper it forked. rsync runs in its own process
/// group, so the group id is its pid.
async fn terminate(child: &mut Child, grace: Duration, job_id: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    let group = match i32::try_from(pid) {
        Ok(raw) => Pid::from_raw(raw),
        Err(_) => {
            warn!(job_id, pid, "Pid out of range for signalling; killing rsync only");
            if let Err(e) = child.kill().await {
                warn!(job_id, pid, error = %e, "Failed to kill rsync");
            }
            return;
        }
    };

    signal_group(group, Signal::SIGTERM, job_id);

    let exited = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(job_id, pid, %status, "rsync stopped after SIGTERM");
            true
        }
        Ok(Err(e)) => {
            warn!(job_id, pid, error = %e, "Failed waiting for rsync after SIGTERM");
            false
        }
        Err(_) => {
            warn!(job_id, pid, grace_secs = grace.as_secs(), "rsync ignored SIGTERM; killing");
            false
        }
    };

    // Receiver and generator processes can outlive the parent.
    signal_group(group, Signal::SIGKILL, job_id);
    if !exited {
        if let Err(e) = child.kill().await {
            warn!(job_id, pid, error = %e, "Failed to kill rsync");
        }
    }
}

fn signal_group(group: Pid, signal: Signal, job_id: &str) {
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(
            job_id,
            pgid = group.as_raw(),
            signal = signal.as_str(),
            error = %e,
            "Failed to signal rsync process group"
        ),
    }
}

/// Forward one output stream as lines. rsync rewrites progress in place
/// with `\r`, so both `\r` and `\n` end a line.
async fn pump_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut chunk = [0u8; 8192];
    let mut line = Vec::new();

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for &b in &chunk[..n] {
            if b == b'\r' || b == b'\n' {
                if !line.is_empty() && !flush(&mut line, &tx).await {
                    return;
                }
            } else {
                line.push(b);
                if line.len() >= MAX_LINE_BYTES && !flush(&mut line, &tx).await {
                    return;
                }
            }
        }
    }

    if !line.is_empty() {
        flush(&mut line, &tx).await;
    }
}

async fn flush(line: &mut Vec<u8>, tx: &mpsc::Sender<String>) -> bool {
    let text = String::from_utf8_lossy(line).into_owned();
    line.clear();
    tx.send(text).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_splits_on_carriage_returns_and_newlines() {
        let input: &[u8] = b"file list\r  1,024  10%\r  2,048  20%\nlast";
        let (tx, mut rx) = mpsc::channel(16);
        pump_lines(input, tx).await;

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["file list", "  1,024  10%", "  2,048  20%", "last"]);
    }

    #[tokio::test]
    async fn pump_flushes_very_long_lines() {
        let input = vec![b'x'; MAX_LINE_BYTES + 10];
        let (tx, mut rx) = mpsc::channel(16);
        pump_lines(&input[..], tx).await;

        assert_eq!(rx.recv().await.map(|l| l.len()), Some(MAX_LINE_BYTES));
        assert_eq!(rx.recv().await.map(|l| l.len()), Some(10));
        assert!(rx.recv().await.is_none());
    }
}
