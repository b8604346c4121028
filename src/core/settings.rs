//! Typed, validated sync settings backed by the `settings` table.
//!
//! Every key has a fixed validator; values are normalized before they are
//! stored. The scheduler and executor call [`SettingsStore::snapshot`] each
//! cycle, so a write is picked up by the next tick without any restart.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use tokio_rusqlite::Connection;
use tracing::{info, warn};

use crate::config::SettingDefaults;
use crate::core::cron::CronSchedule;
use crate::core::error::{EngineError, EngineResult};
use crate::core::models::Setting;
use crate::db;

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    SyncSchedule,
    SyncBandwidthLimit,
    SyncTimeout,
    SyncOnStartup,
}

impl SettingKey {
    pub const ALL: [SettingKey; 4] = [
        SettingKey::SyncSchedule,
        SettingKey::SyncBandwidthLimit,
        SettingKey::SyncTimeout,
        SettingKey::SyncOnStartup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncSchedule => "sync_schedule",
            Self::SyncBandwidthLimit => "sync_bandwidth_limit",
            Self::SyncTimeout => "sync_timeout",
            Self::SyncOnStartup => "sync_on_startup",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::SyncSchedule => "Cron expression controlling when mirrors are synced",
            Self::SyncBandwidthLimit => "Transfer bandwidth cap in KiB/s (0 = unlimited)",
            Self::SyncTimeout => "Maximum duration of a single sync in seconds",
            Self::SyncOnStartup => "Sync every enabled mirror when the daemon starts",
        }
    }

    /// Validate `raw` and return the normalized value to store.
    pub fn validate(&self, raw: &str) -> Result<String, String> {
        let raw = raw.trim();
        match self {
            Self::SyncSchedule => CronSchedule::parse(raw)
                .map(|cron| cron.as_str().to_string())
                .map_err(|e| e.to_string()),
            Self::SyncBandwidthLimit => raw
                .parse::<u64>()
                .map(|v| v.to_string())
                .map_err(|_| "must be a non-negative integer".to_string()),
            Self::SyncTimeout => {
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| "must be a whole number of seconds".to_string())?;
                if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
                    return Err(format!(
                        "must be between {} and {} seconds",
                        MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
                    ));
                }
                Ok(secs.to_string())
            }
            Self::SyncOnStartup => parse_bool(raw)
                .map(|v| v.to_string())
                .ok_or_else(|| "must be true or false".to_string()),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// The settings as the scheduler and executor consume them.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub schedule: String,
    /// KiB/s; 0 disables the cap.
    pub bandwidth_limit: u64,
    pub timeout: Duration,
    pub on_startup: bool,
}

impl SyncSettings {
    pub fn from_defaults(defaults: &SettingDefaults) -> Self {
        Self {
            schedule: defaults.sync_schedule.clone(),
            bandwidth_limit: defaults.sync_bandwidth_limit,
            timeout: Duration::from_secs(defaults.sync_timeout),
            on_startup: defaults.sync_on_startup,
        }
    }

    /// Overlay stored values. Values that fail validation keep the fallback.
    fn apply(&mut self, key: SettingKey, raw: &str) {
        let value = match key.validate(raw) {
            Ok(v) => v,
            Err(reason) => {
                warn!(key = key.as_str(), value = raw, %reason, "Ignoring invalid stored setting");
                return;
            }
        };

        match key {
            SettingKey::SyncSchedule => self.schedule = value,
            SettingKey::SyncBandwidthLimit => {
                self.bandwidth_limit = value.parse().unwrap_or(self.bandwidth_limit)
            }
            SettingKey::SyncTimeout => {
                if let Ok(secs) = value.parse() {
                    self.timeout = Duration::from_secs(secs);
                }
            }
            SettingKey::SyncOnStartup => self.on_startup = value == "true",
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_defaults(&SettingDefaults::default())
    }
}

fn default_value(defaults: &SettingDefaults, key: SettingKey) -> String {
    match key {
        SettingKey::SyncSchedule => defaults.sync_schedule.clone(),
        SettingKey::SyncBandwidthLimit => defaults.sync_bandwidth_limit.to_string(),
        SettingKey::SyncTimeout => defaults.sync_timeout.to_string(),
        SettingKey::SyncOnStartup => defaults.sync_on_startup.to_string(),
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    db: Connection,
    defaults: SettingDefaults,
}

impl SettingsStore {
    pub fn new(db: Connection, defaults: SettingDefaults) -> Self {
        Self { db, defaults }
    }

    /// Insert any recognised key that is missing, using the configured
    /// defaults. Existing values are never overwritten.
    pub async fn seed(&self) -> EngineResult<usize> {
        let mut rows = Vec::with_capacity(SettingKey::ALL.len());
        for key in SettingKey::ALL {
            let raw = default_value(&self.defaults, key);
            let value = key
                .validate(&raw)
                .map_err(|reason| EngineError::validation(key.as_str(), reason))?;
            rows.push((key.as_str().to_string(), value, key.description().to_string()));
        }

        let inserted = db::settings::insert_missing(&self.db, rows, Utc::now()).await?;
        if inserted > 0 {
            info!(inserted, "Seeded default settings");
        }
        Ok(inserted)
    }

    /// Current value of `key`, or its default if it has never been stored.
    pub async fn get(&self, key: &str) -> EngineResult<String> {
        let setting_key = SettingKey::from_key(key)
            .ok_or_else(|| EngineError::validation(key, "unknown setting"))?;

        match db::settings::get(&self.db, key.to_string()).await? {
            Some(setting) => Ok(setting.value),
            None => Ok(default_value(&self.defaults, setting_key)),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> EngineResult<Setting> {
        let mut changes = HashMap::new();
        changes.insert(key.to_string(), value.to_string());
        self.update_many(&changes).await?;

        db::settings::get(&self.db, key.to_string())
            .await?
            .ok_or_else(|| EngineError::Precondition(format!("setting `{}` vanished after write", key)))
    }

    /// Validate every entry, then write them all in one transaction. Any
    /// invalid entry rejects the whole batch and nothing is stored.
    pub async fn update_many(&self, changes: &HashMap<String, String>) -> EngineResult<Vec<Setting>> {
        // BTreeMap keeps the write order (and the first reported error) stable.
        let ordered: BTreeMap<&String, &String> = changes.iter().collect();
        let mut rows = Vec::with_capacity(ordered.len());
        for (key, raw) in ordered {
            let setting_key = SettingKey::from_key(key)
                .ok_or_else(|| EngineError::validation(key.as_str(), "unknown setting"))?;
            let value = setting_key
                .validate(raw)
                .map_err(|reason| EngineError::validation(key.as_str(), reason))?;
            rows.push((key.clone(), value, setting_key.description().to_string()));
        }

        if !rows.is_empty() {
            let keys: Vec<&str> = rows.iter().map(|(k, _, _)| k.as_str()).collect();
            info!(keys = ?keys, "Updating settings");
            db::settings::upsert(&self.db, rows, Utc::now()).await?;
        }

        self.all().await
    }

    pub async fn all(&self) -> EngineResult<Vec<Setting>> {
        Ok(db::settings::list(&self.db).await?)
    }

    /// Typed view of the current settings, read fresh from storage.
    pub async fn snapshot(&self) -> EngineResult<SyncSettings> {
        let mut settings = SyncSettings::from_defaults(&self.defaults);
        for setting in db::settings::list(&self.db).await? {
            if let Some(key) = SettingKey::from_key(&setting.key) {
                settings.apply(key, &setting.value);
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SettingsStore {
        let db = db::open_in_memory().await.unwrap();
        let store = SettingsStore::new(db, SettingDefaults::default());
        store.seed().await.unwrap();
        store
    }

    #[test]
    fn validators_normalize_and_reject() {
        assert_eq!(
            SettingKey::SyncSchedule.validate(" 0  4 * * * ").unwrap(),
            "0 4 * * *"
        );
        assert!(SettingKey::SyncSchedule.validate("bogus").is_err());
        assert_eq!(SettingKey::SyncBandwidthLimit.validate("0").unwrap(), "0");
        assert!(SettingKey::SyncBandwidthLimit.validate("-5").is_err());
        assert!(SettingKey::SyncBandwidthLimit.validate("fast").is_err());
        assert!(SettingKey::SyncTimeout.validate("0").is_err());
        assert!(SettingKey::SyncTimeout.validate("99999999").is_err());
        assert_eq!(SettingKey::SyncTimeout.validate("3600").unwrap(), "3600");
        assert_eq!(SettingKey::SyncOnStartup.validate("YES").unwrap(), "true");
        assert!(SettingKey::SyncOnStartup.validate("maybe").is_err());
    }

    #[tokio::test]
    async fn seed_is_idempotent_and_keeps_existing_values() {
        let store = store().await;
        store.set("sync_bandwidth_limit", "512").await.unwrap();

        assert_eq!(store.seed().await.unwrap(), 0);
        assert_eq!(store.get("sync_bandwidth_limit").await.unwrap(), "512");
        assert_eq!(store.all().await.unwrap().len(), SettingKey::ALL.len());
    }

    #[tokio::test]
    async fn rejected_batch_changes_nothing() {
        let store = store().await;
        let mut changes = HashMap::new();
        changes.insert("sync_bandwidth_limit".to_string(), "100".to_string());
        changes.insert("sync_schedule".to_string(), "bogus".to_string());

        let err = store.update_many(&changes).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref key, .. } if key == "sync_schedule"));
        assert_eq!(store.get("sync_bandwidth_limit").await.unwrap(), "0");
        assert_eq!(store.get("sync_schedule").await.unwrap(), "0 4 * * *");
    }

    #[tokio::test]
    async fn unknown_keys_are_rejected() {
        let store = store().await;
        assert!(matches!(
            store.set("sync_colour", "blue").await,
            Err(EngineError::Validation { .. })
        ));
        assert!(store.get("sync_colour").await.is_err());
    }

    #[tokio::test]
    async fn snapshot_reflects_latest_writes() {
        let store = store().await;
        assert_eq!(store.snapshot().await.unwrap(), SyncSettings::default());

        store.set("sync_timeout", "120").await.unwrap();
        store.set("sync_on_startup", "on").await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.timeout, Duration::from_secs(120));
        assert!(snapshot.on_startup);
    }
}
