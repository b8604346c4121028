//! Daemon configuration.
//!
//! Layered with figment: built-in defaults, then the TOML config file, then
//! `MIRSD_*` environment variables (nested keys use `__`, e.g.
//! `MIRSD_DEFAULTS__SYNC_SCHEDULE`), then command-line overrides.
//!
//! Sync settings (`[defaults]`) only seed the settings table on first boot;
//! afterwards the stored values win and are changed through the engine.

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::core::models::{NewTarget, validate_upstream_url};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mirsd/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub rpc_bind: SocketAddr,
    /// Parent directory for mirrors declared without an explicit `local_path`.
    pub mirror_root: PathBuf,
    pub rsync_binary: PathBuf,
    pub tick_interval_secs: u64,
    /// Time between SIGTERM and SIGKILL when a transfer is stopped.
    pub termination_grace_secs: u64,
    /// Ceiling on captured transfer output per job.
    pub output_buffer_bytes: usize,
    /// Trailing output lines copied into a failed job's error message.
    pub diagnostic_lines: usize,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub defaults: SettingDefaults,
    pub mirrors: Vec<MirrorConfig>,
}

/// Initial values for the settings table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingDefaults {
    pub sync_schedule: String,
    pub sync_bandwidth_limit: u64,
    pub sync_timeout: u64,
    pub sync_on_startup: bool,
}

impl Default for SettingDefaults {
    fn default() -> Self {
        Self {
            sync_schedule: "0 4 * * *".to_string(),
            sync_bandwidth_limit: 0,
            sync_timeout: 6 * 60 * 60,
            sync_on_startup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub name: String,
    pub kind: String,
    pub upstream: String,
    /// Directory under `mirror_root`; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Absolute path, overriding `mirror_root` and `dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl MirrorConfig {
    fn bsd(name: &str, dir: &str, upstream: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: name.to_string(),
            upstream: upstream.to_string(),
            dir: Some(dir.to_string()),
            local_path: None,
            enabled: true,
        }
    }

    pub fn to_target(&self, mirror_root: &Path) -> NewTarget {
        let local_path = self
            .local_path
            .clone()
            .unwrap_or_else(|| mirror_root.join(self.dir.as_deref().unwrap_or(&self.name)));

        NewTarget {
            name: self.name.clone(),
            kind: self.kind.clone(),
            upstream_url: self.upstream.clone(),
            local_path,
            enabled: self.enabled,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/mirsd/mirsd.db"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            mirror_root: PathBuf::from("/data/mirrors"),
            rsync_binary: PathBuf::from("rsync"),
            tick_interval_secs: 10,
            termination_grace_secs: 10,
            output_buffer_bytes: 64 * 1024,
            diagnostic_lines: 20,
            simulation: false,
            verbose: false,
            json_logs: false,
            defaults: SettingDefaults::default(),
            mirrors: vec![
                MirrorConfig::bsd("freebsd", "FreeBSD", "rsync://ftp.freebsd.org/FreeBSD/"),
                MirrorConfig::bsd("netbsd", "NetBSD", "rsync://ftp.netbsd.org/pub/NetBSD/"),
                MirrorConfig::bsd("openbsd", "OpenBSD", "rsync://ftp.openbsd.org/pub/OpenBSD/"),
            ],
        }
    }
}

impl AppConfig {
    /// Load the configuration. `overrides` is any serializable set of
    /// command-line values; `None` fields should be skipped when serializing.
    pub fn new<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MIRSD_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration ({})", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be at least 1");
        }
        if self.output_buffer_bytes < 1024 {
            bail!("output_buffer_bytes must be at least 1024");
        }

        let mut seen = std::collections::HashSet::new();
        for mirror in &self.mirrors {
            if mirror.name.trim().is_empty() {
                bail!("mirror names must not be empty");
            }
            if !seen.insert(mirror.name.as_str()) {
                bail!("mirror `{}` is declared twice", mirror.name);
            }
            if let Err(reason) = validate_upstream_url(&mirror.upstream) {
                bail!("mirror `{}`: upstream {}", mirror.name, reason);
            }
        }
        Ok(())
    }

    pub fn targets(&self) -> Vec<NewTarget> {
        self.mirrors
            .iter()
            .map(|m| m.to_target(&self.mirror_root))
            .collect()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
