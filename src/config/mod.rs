//! Daemon configuration: data-dir layout and environment.
//!
//! Runtime settings (boss identity, timezone, policy) live in the store's
//! `config` table; this module owns everything decided before the store
//! exists, plus typed accessors over the well-known keys.

use crate::errors::{HibossError, HibossResult};
use crate::store::Store;
use crate::time::detect_host_timezone;
use chrono_tz::Tz;
use std::path::PathBuf;

/// Environment variable naming the data root. Default: `~/hiboss`.
pub const ENV_DATA_DIR: &str = "HIBOSS_DIR";
/// Environment variable carrying the default token for CLI operations.
pub const ENV_TOKEN: &str = "HIBOSS_TOKEN";

/// Well-known `config` table keys.
pub mod keys {
    pub const SETUP_COMPLETED: &str = "setup_completed";
    pub const BOSS_NAME: &str = "boss_name";
    pub const BOSS_TIMEZONE: &str = "boss_timezone";
    pub const BOSS_TOKEN_HASH: &str = "boss_token_hash";
    pub const DEFAULT_PROVIDER: &str = "default_provider";
    pub const PERMISSION_POLICY: &str = "permission_policy";

    /// Per-adapter boss identity, e.g. `adapter_boss_id_telegram`.
    pub fn adapter_boss_id(adapter_type: &str) -> String {
        format!("adapter_boss_id_{}", adapter_type)
    }
}

/// Filesystem layout under the data root.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub daemon_dir: PathBuf,
    pub db_path: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
    pub log_history_dir: PathBuf,
    pub media_dir: PathBuf,
    pub agents_dir: PathBuf,
}

impl DataPaths {
    pub fn from_root(root: PathBuf) -> Self {
        let daemon_dir = root.join(".daemon");
        Self {
            db_path: daemon_dir.join("hiboss.db"),
            socket_path: daemon_dir.join("daemon.sock"),
            pid_path: daemon_dir.join("daemon.pid"),
            log_path: daemon_dir.join("daemon.log"),
            log_history_dir: daemon_dir.join("log_history"),
            media_dir: root.join("media"),
            agents_dir: root.join("agents"),
            daemon_dir,
            root,
        }
    }

    /// Resolve the data root from `$HIBOSS_DIR`, defaulting to `~/hiboss`.
    pub fn resolve() -> HibossResult<Self> {
        if let Some(dir) = std::env::var_os(ENV_DATA_DIR) {
            return Ok(Self::from_root(PathBuf::from(dir)));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            HibossError::Internal(anyhow::anyhow!("could not determine home directory"))
        })?;
        Ok(Self::from_root(home.join("hiboss")))
    }

    pub fn ensure_layout(&self) -> HibossResult<()> {
        for dir in [
            &self.root,
            &self.daemon_dir,
            &self.log_history_dir,
            &self.media_dir,
            &self.agents_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn agent_internal_space(&self, agent_name: &str) -> PathBuf {
        self.agents_dir.join(agent_name).join("internal_space")
    }
}

/// Default token for CLI operations.
pub fn token_from_env() -> Option<String> {
    std::env::var(ENV_TOKEN).ok().filter(|t| !t.is_empty())
}

/// The boss timezone: configured value, else the host zone, else UTC.
pub fn boss_timezone(store: &Store) -> Tz {
    if let Ok(Some(name)) = store.get_config(keys::BOSS_TIMEZONE) {
        if let Ok(tz) = name.parse() {
            return tz;
        }
    }
    detect_host_timezone()
        .and_then(|name| name.parse().ok())
        .unwrap_or(Tz::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted() {
        let paths = DataPaths::from_root(PathBuf::from("/data/hiboss"));
        assert_eq!(paths.db_path, PathBuf::from("/data/hiboss/.daemon/hiboss.db"));
        assert_eq!(
            paths.socket_path,
            PathBuf::from("/data/hiboss/.daemon/daemon.sock")
        );
        assert_eq!(
            paths.agent_internal_space("nex"),
            PathBuf::from("/data/hiboss/agents/nex/internal_space")
        );
    }

    #[test]
    fn boss_timezone_falls_back() {
        let store = Store::open_in_memory().unwrap();
        // No config set: host zone or UTC, but never a panic
        let _ = boss_timezone(&store);
        store.set_config(keys::BOSS_TIMEZONE, "Asia/Tokyo").unwrap();
        assert_eq!(boss_timezone(&store), "Asia/Tokyo".parse::<Tz>().unwrap());
        store.set_config(keys::BOSS_TIMEZONE, "Not/AZone").unwrap();
        let _ = boss_timezone(&store);
    }
}
