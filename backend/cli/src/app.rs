//! Wires config into the runtime, registry, manager and optimizer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use labvm_config::{
    LabVmConfig, PortsConfig, ReclamationConfig, RegistryBackend, RegistryConfig, RuntimeConfig,
    RuntimeKind, SandboxConfig, UnobservedMode,
};
use labvm_core::{KvStore, SandboxRuntime, SystemClock};
use labvm_lifecycle::{ActivityTracker, LifecycleManager, PortAllocator, SandboxTemplate, SessionRegistry};
use labvm_sandbox::{DockerRuntime, DockerRuntimeConfig, InMemoryRuntime};
use labvm_scheduler::{Optimizer, ReclamationPolicy, UnobservedPolicy};
use labvm_store::{InMemoryKvStore, SqliteKvStore};

pub struct Services {
    pub manager: Arc<LifecycleManager>,
    pub optimizer: Arc<Optimizer>,
    /// Present when the registry is SQLite-backed, for periodic purging.
    pub sqlite: Option<Arc<SqliteKvStore>>,
}

pub fn build_runtime(config: &RuntimeConfig) -> Arc<dyn SandboxRuntime> {
    match config.kind {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new(DockerRuntimeConfig {
            binary: config.docker_binary.clone(),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        })),
        RuntimeKind::Memory => Arc::new(InMemoryRuntime::new()),
    }
}

pub fn sandbox_template(config: &SandboxConfig) -> SandboxTemplate {
    SandboxTemplate {
        image: config.image.clone(),
        cpu_quota: config.cpu_quota,
        memory_limit: config.memory_limit.clone(),
        resolution: config.resolution.clone(),
        default_password: config.default_password.clone(),
        restart_policy: config.restart_policy.clone(),
        extra_env: config.extra_env.clone(),
    }
}

pub fn port_allocator(config: &PortsConfig) -> PortAllocator {
    PortAllocator::new(
        config.display_start..=config.display_end,
        config.proxy_start..=config.proxy_end,
    )
}

pub fn reclamation_policy(config: &ReclamationConfig) -> Result<ReclamationPolicy> {
    let policy = ReclamationPolicy {
        idle_pause_threshold: Duration::from_secs(config.idle_pause_minutes * 60),
        idle_stop_threshold: Duration::from_secs(config.idle_stop_minutes * 60),
        interval: Duration::from_secs(config.interval_secs),
        startup_delay: Duration::from_secs(config.startup_delay_secs),
        unobserved: match config.unobserved {
            UnobservedMode::Skip => UnobservedPolicy::Skip,
            UnobservedMode::FirstSeen => UnobservedPolicy::FirstSeen,
            UnobservedMode::CreatedAt => UnobservedPolicy::CreatedAt,
        },
    };
    policy.validate()?;
    Ok(policy)
}

fn build_store(config: &RegistryConfig) -> Result<(Arc<dyn KvStore>, Option<Arc<SqliteKvStore>>)> {
    match config.backend {
        RegistryBackend::Memory => Ok((Arc::new(InMemoryKvStore::new()), None)),
        RegistryBackend::Sqlite => {
            let path = config
                .path
                .as_deref()
                .context("registry.path is required for the sqlite backend")?;
            let store = Arc::new(SqliteKvStore::open(path)?);
            Ok((store.clone(), Some(store)))
        }
    }
}

pub fn build_services(config: &LabVmConfig) -> Result<Services> {
    let runtime = build_runtime(&config.runtime);
    let (store, sqlite) = build_store(&config.registry)?;
    let registry = SessionRegistry::new(store, Duration::from_secs(config.registry.ttl_secs));
    let activity = Arc::new(ActivityTracker::new(Arc::new(SystemClock)));

    let manager = LifecycleManager::new(runtime, registry, activity)
        .with_template(sandbox_template(&config.sandbox))
        .with_ports(port_allocator(&config.ports))
        .with_stop_timeout(Duration::from_secs(config.runtime.stop_timeout_secs));
    let manager = Arc::new(manager);

    let optimizer = Arc::new(Optimizer::new(
        manager.clone(),
        reclamation_policy(&config.reclamation)?,
    ));

    info!(
        runtime = manager.runtime().name(),
        registry = ?config.registry.backend,
        image = %config.sandbox.image,
        "Lifecycle services ready"
    );
    Ok(Services {
        manager,
        optimizer,
        sqlite,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvm_core::SessionKey;
    use labvm_lifecycle::StartRequest;

    fn memory_config() -> LabVmConfig {
        let mut config = LabVmConfig::default();
        config.runtime.kind = RuntimeKind::Memory;
        config.registry.backend = RegistryBackend::Memory;
        config
    }

    #[test]
    fn reclamation_minutes_become_durations() {
        let mut cfg = ReclamationConfig::default();
        cfg.idle_pause_minutes = 5;
        cfg.idle_stop_minutes = 20;
        cfg.unobserved = UnobservedMode::CreatedAt;
        let policy = reclamation_policy(&cfg).unwrap();
        assert_eq!(policy.idle_pause_threshold, Duration::from_secs(300));
        assert_eq!(policy.idle_stop_threshold, Duration::from_secs(1200));
        assert_eq!(policy.unobserved, UnobservedPolicy::CreatedAt);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut cfg = ReclamationConfig::default();
        cfg.idle_pause_minutes = 30;
        cfg.idle_stop_minutes = 10;
        assert!(reclamation_policy(&cfg).is_err());
    }

    #[test]
    fn template_carries_sandbox_section() {
        let mut cfg = SandboxConfig::default();
        cfg.image = "cyberlab-vm:exam".into();
        cfg.extra_env.insert("LAB_MODE".into(), "exam".into());
        let template = sandbox_template(&cfg);
        assert_eq!(template.image, "cyberlab-vm:exam");
        assert_eq!(template.extra_env["LAB_MODE"], "exam");
    }

    #[test]
    fn sqlite_backend_needs_a_path() {
        let mut config = memory_config();
        config.registry.backend = RegistryBackend::Sqlite;
        assert!(build_services(&config).is_err());
    }

    #[tokio::test]
    async fn memory_services_start_sessions_in_configured_ranges() {
        let mut config = memory_config();
        config.ports.display_start = 16000;
        config.ports.display_end = 16009;
        config.ports.proxy_start = 17000;
        config.ports.proxy_end = 17009;
        let services = build_services(&config).unwrap();
        assert!(services.sqlite.is_none());
        assert_eq!(services.manager.runtime().name(), "memory");

        let key = SessionKey::new("alice", "sqli").unwrap();
        let outcome = services
            .manager
            .ensure_started(&key, &StartRequest::default())
            .await
            .unwrap();
        assert!((16000..=16009).contains(&outcome.session.display_port));
        assert!((17000..=17009).contains(&outcome.session.proxy_port));
    }
}
