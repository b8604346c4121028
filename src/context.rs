use crate::config::AppConfig;
use crate::core::{LockManager, ProgressTracker, SettingsStore};
use tokio_rusqlite::Connection;

/// Shared handles every part of the daemon works from.
#[derive(Clone)]
pub struct AppContext {
    pub config: std::sync::Arc<AppConfig>,
    pub db: Connection,
    pub progress: ProgressTracker,
    pub locks: LockManager,
    pub settings: SettingsStore,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Self {
        let settings = SettingsStore::new(db.clone(), config.defaults.clone());
        Self {
            locks: LockManager::new(db.clone()),
            settings,
            config: std::sync::Arc::new(config),
            db,
            progress: ProgressTracker::new(),
        }
    }
}
