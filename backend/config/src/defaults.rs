//! Default values for fields missing from the config file.

use std::path::{Path, PathBuf};

use crate::schema::{LabVmConfig, RegistryBackend};

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8088;

pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_IMAGE: &str = "cyberlab-vm:latest";
pub const DEFAULT_CPU_QUOTA: f64 = 0.5;
pub const DEFAULT_MEMORY_LIMIT: &str = "2g";
pub const DEFAULT_RESOLUTION: &str = "1280x720";
pub const DEFAULT_DESKTOP_PASSWORD: &str = "labvm";

/// 24 hours.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

pub const DEFAULT_IDLE_PAUSE_MINUTES: u64 = 10;
pub const DEFAULT_IDLE_STOP_MINUTES: u64 = 30;
pub const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RECLAIM_STARTUP_DELAY_SECS: u64 = 120;

/// SQLite file name inside the config directory.
pub const REGISTRY_FILE_NAME: &str = "sessions.db";

/// Fill values that depend on where the config was loaded from.
pub fn apply_all_defaults(mut config: LabVmConfig, config_dir: &Path) -> LabVmConfig {
    if config.registry.backend == RegistryBackend::Sqlite && config.registry.path.is_none() {
        config.registry.path = Some(default_registry_path(config_dir));
    }
    config
}

pub fn default_registry_path(config_dir: &Path) -> PathBuf {
    config_dir.join(REGISTRY_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_registry_lands_in_config_dir() {
        let cfg = apply_all_defaults(LabVmConfig::default(), Path::new("/srv/labvm"));
        assert_eq!(
            cfg.registry.path.as_deref(),
            Some(Path::new("/srv/labvm/sessions.db"))
        );
    }

    #[test]
    fn explicit_registry_path_is_kept() {
        let mut cfg = LabVmConfig::default();
        cfg.registry.path = Some(PathBuf::from("/var/lib/labvm/registry.db"));
        let cfg = apply_all_defaults(cfg, Path::new("/srv/labvm"));
        assert_eq!(
            cfg.registry.path.as_deref(),
            Some(Path::new("/var/lib/labvm/registry.db"))
        );
    }

    #[test]
    fn memory_registry_needs_no_path() {
        let mut cfg = LabVmConfig::default();
        cfg.registry.backend = RegistryBackend::Memory;
        let cfg = apply_all_defaults(cfg, Path::new("/srv/labvm"));
        assert!(cfg.registry.path.is_none());
    }
}
