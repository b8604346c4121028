//! Shared setup for the integration tests: an engine on an in-memory
//! database whose "rsync" is a small shell script.

#![allow(dead_code)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use mirsd::config::{AppConfig, MirrorConfig};
use mirsd::context::AppContext;
use mirsd::core::MirrorEngine;
use mirsd::db;
use tempfile::TempDir;

/// Prints a realistic `--stats` summary and exits 0.
pub const RSYNC_OK: &str = r#"
echo "receiving incremental file list"
echo "README.TXT"
echo "releases/amd64/CHECKSUM.SHA256"
echo ""
echo "Number of files: 1,204 (reg: 1,000, dir: 204)"
echo "Number of regular files transferred: 12"
echo "Total file size: 5,000,000 bytes"
echo "Total transferred file size: 64,000 bytes"
exit 0
"#;

/// Runs until stopped.
pub const RSYNC_SLOW: &str = "echo \"receiving incremental file list\"\nexec sleep 30";

/// Leaves a background child that writes `survivor` next to the script
/// unless it is killed first.
pub const RSYNC_FORKING: &str = r#"
d=$(dirname "$0")
(sleep 3; touch "$d/survivor") &
exec sleep 30
"#;

/// Ignores SIGTERM, so only SIGKILL stops it.
pub const RSYNC_STUBBORN: &str = "trap '' TERM\nexec sleep 30";

/// Fails like rsync does when the upstream module is missing.
pub const RSYNC_FAIL: &str = r#"
echo "receiving incremental file list"
echo "@ERROR: Unknown module 'FreeBSD'" >&2
echo "rsync error: error starting client-server protocol (code 5)" >&2
exit 5
"#;

/// Prints far more output than the test buffer holds.
pub const RSYNC_NOISY: &str = r#"
i=0
while [ $i -lt 2000 ]; do
  echo "pub/file-$i.tgz"
  i=$((i+1))
done
exit 0
"#;

/// Takes a moment, so settings can change while it runs.
pub const RSYNC_BRIEF: &str = "sleep 1\nexit 0";

pub struct Harness {
    pub dir: TempDir,
    pub engine: MirrorEngine,
    pub ctx: AppContext,
}

impl Harness {
    /// Every argument list the fake rsync was started with, one per run.
    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("args.log"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub async fn set(&self, key: &str, value: &str) {
        let mut changes = HashMap::new();
        changes.insert(key.to_string(), value.to_string());
        self.engine.update_settings(&changes).await.unwrap();
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let log = dir.join("args.log");
    std::fs::write(
        &path,
        format!("#!/bin/sh\nprintf '%s\\n' \"$*\" >> '{}'\n{}\n", log.display(), body),
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn mirror(name: &str, upstream: &str) -> MirrorConfig {
    MirrorConfig {
        name: name.to_string(),
        kind: name.to_string(),
        upstream: upstream.to_string(),
        dir: None,
        local_path: None,
        enabled: true,
    }
}

/// Engine with two targets (`freebsd`, `netbsd`), bootstrapped.
pub async fn harness(rsync_body: &str) -> Harness {
    harness_with(rsync_body, |_| {}).await
}

pub async fn harness_with(rsync_body: &str, configure: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.mirror_root = dir.path().join("mirrors");
    config.rsync_binary = write_script(dir.path(), "rsync", rsync_body);
    config.termination_grace_secs = 1;
    config.output_buffer_bytes = 4096;
    config.mirrors = vec![
        mirror("freebsd", "rsync://ftp.freebsd.org/FreeBSD/"),
        mirror("netbsd", "rsync://ftp.netbsd.org/pub/NetBSD/"),
    ];
    configure(&mut config);

    let conn = db::open_in_memory().await.unwrap();
    let ctx = AppContext::new(config, conn);
    let engine = MirrorEngine::new(ctx.clone());
    engine.bootstrap().await.unwrap();

    Harness { dir, engine, ctx }
}
