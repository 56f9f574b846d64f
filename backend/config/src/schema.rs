//! labvm runtime configuration schema.
//!
//! Every section is optional in the file; missing keys take the values in
//! [`crate::defaults`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::defaults;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabVmConfig {
    /// HTTP listener
    pub server: ServerConfig,

    /// Sandbox engine adapter
    pub runtime: RuntimeConfig,

    /// Template every lab sandbox is created from
    pub sandbox: SandboxConfig,

    /// Host port ranges for display and proxy bindings
    pub ports: PortsConfig,

    /// Session registry backing store
    pub registry: RegistryConfig,

    /// Idle reclamation thresholds and loop timing
    pub reclamation: ReclamationConfig,

    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: defaults::DEFAULT_BIND.to_string(),
            port: defaults::DEFAULT_PORT,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    /// Process-local fake engine for demos and tests.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub docker_binary: String,
    /// Upper bound for one engine call.
    pub call_timeout_secs: u64,
    /// Grace period before a stop kills the sandbox.
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            docker_binary: "docker".to_string(),
            call_timeout_secs: defaults::DEFAULT_CALL_TIMEOUT_SECS,
            stop_timeout_secs: defaults::DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub image: String,
    /// Fraction of one CPU core.
    pub cpu_quota: f64,
    /// Engine memory limit string, e.g. `2g`.
    pub memory_limit: String,
    pub resolution: String,
    /// Desktop password when the caller supplies none.
    pub default_password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: defaults::DEFAULT_IMAGE.to_string(),
            cpu_quota: defaults::DEFAULT_CPU_QUOTA,
            memory_limit: defaults::DEFAULT_MEMORY_LIMIT.to_string(),
            resolution: defaults::DEFAULT_RESOLUTION.to_string(),
            default_password: defaults::DEFAULT_DESKTOP_PASSWORD.to_string(),
            restart_policy: Some("unless-stopped".to_string()),
            extra_env: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortsConfig {
    pub display_start: u16,
    pub display_end: u16,
    pub proxy_start: u16,
    pub proxy_end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            display_start: 6000,
            display_end: 6999,
            proxy_start: 7000,
            proxy_end: 7999,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    /// SQLite file; defaults to `sessions.db` in the config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Lifetime of a session entry, refreshed on every write.
    pub ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::default(),
            path: None,
            ttl_secs: defaults::DEFAULT_SESSION_TTL_SECS,
        }
    }
}

// ---------------------------------------------------------------------------
// Reclamation
// ---------------------------------------------------------------------------

/// Handling of running sandboxes with no recorded activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnobservedMode {
    Skip,
    #[default]
    FirstSeen,
    CreatedAt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReclamationConfig {
    pub enabled: bool,
    pub idle_pause_minutes: u64,
    pub idle_stop_minutes: u64,
    pub interval_secs: u64,
    pub startup_delay_secs: u64,
    pub unobserved: UnobservedMode,
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_pause_minutes: defaults::DEFAULT_IDLE_PAUSE_MINUTES,
            idle_stop_minutes: defaults::DEFAULT_IDLE_STOP_MINUTES,
            interval_secs: defaults::DEFAULT_RECLAIM_INTERVAL_SECS,
            startup_delay_secs: defaults::DEFAULT_RECLAIM_STARTUP_DELAY_SECS,
            unobserved: UnobservedMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: String, // "pretty" | "json"
    /// Directory for the rolling JSON log file; console only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            dir: None,
        }
    }
}
