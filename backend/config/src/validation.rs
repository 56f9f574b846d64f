//! Config validation: semantic checks serde cannot express.

use crate::schema::{LabVmConfig, RegistryBackend};
use thiserror::Error;

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// All errors and warnings found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &LabVmConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_server(config, &mut report);
    validate_runtime(config, &mut report);
    validate_sandbox(config, &mut report);
    validate_ports(config, &mut report);
    validate_registry(config, &mut report);
    validate_reclamation(config, &mut report);
    validate_logging(config, &mut report);
    report
}

fn validate_server(config: &LabVmConfig, report: &mut ValidationReport) {
    let server = &config.server;
    if server.bind.trim().is_empty() {
        report.error("server.bind", "Bind address cannot be empty");
    }
    if server.port == 0 {
        report.error("server.port", "Port must be > 0");
    } else if server.port < 1024 {
        report.warn(
            "server.port",
            format!("Port {} requires elevated privileges; consider using a port >= 1024", server.port),
        );
    }
}

fn validate_runtime(config: &LabVmConfig, report: &mut ValidationReport) {
    let runtime = &config.runtime;
    if runtime.docker_binary.trim().is_empty() {
        report.error("runtime.dockerBinary", "Docker binary cannot be empty");
    }
    if runtime.call_timeout_secs == 0 {
        report.error("runtime.callTimeoutSecs", "callTimeoutSecs must be >= 1");
    }
}

fn validate_sandbox(config: &LabVmConfig, report: &mut ValidationReport) {
    let sandbox = &config.sandbox;
    if sandbox.image.trim().is_empty() {
        report.error("sandbox.image", "Sandbox image is required");
    }
    if sandbox.cpu_quota.is_nan() || sandbox.cpu_quota <= 0.0 {
        report.error("sandbox.cpuQuota", "cpuQuota must be > 0");
    }
    if sandbox.default_password.is_empty() {
        report.warn(
            "sandbox.defaultPassword",
            "Empty default password; desktops without a caller password are unprotected",
        );
    }
}

fn validate_ports(config: &LabVmConfig, report: &mut ValidationReport) {
    let ports = &config.ports;
    let display = ports.display_start..=ports.display_end;
    let proxy = ports.proxy_start..=ports.proxy_end;
    if display.is_empty() {
        report.error("ports.displayStart", "Display port range is empty");
    }
    if proxy.is_empty() {
        report.error("ports.proxyStart", "Proxy port range is empty");
    }
    if !display.is_empty()
        && !proxy.is_empty()
        && ports.display_start <= ports.proxy_end
        && ports.proxy_start <= ports.display_end
    {
        report.error("ports", "Display and proxy port ranges overlap");
    }
    if display.contains(&config.server.port) || proxy.contains(&config.server.port) {
        report.error("server.port", "API port falls inside a sandbox port range");
    }
}

fn validate_registry(config: &LabVmConfig, report: &mut ValidationReport) {
    let registry = &config.registry;
    if registry.ttl_secs == 0 {
        report.error("registry.ttlSecs", "ttlSecs must be >= 1");
    }
    match registry.backend {
        RegistryBackend::Sqlite if registry.path.is_none() => {
            report.error("registry.path", "SQLite registry needs a path");
        }
        RegistryBackend::Memory => {
            report.warn("registry.backend", "Sessions are lost on restart with the memory registry");
        }
        _ => {}
    }
}

fn validate_reclamation(config: &LabVmConfig, report: &mut ValidationReport) {
    let r = &config.reclamation;
    if r.idle_pause_minutes == 0 {
        report.error("reclamation.idlePauseMinutes", "idlePauseMinutes must be >= 1");
    }
    if r.idle_stop_minutes <= r.idle_pause_minutes {
        report.error(
            "reclamation.idleStopMinutes",
            "idleStopMinutes must be greater than idlePauseMinutes",
        );
    }
    if r.interval_secs == 0 {
        report.error("reclamation.intervalSecs", "intervalSecs must be >= 1");
    }
    if r.enabled && r.interval_secs > r.idle_pause_minutes * 60 {
        report.warn(
            "reclamation.intervalSecs",
            "Interval is longer than the pause threshold; reclamation will lag",
        );
    }
}

fn validate_logging(config: &LabVmConfig, report: &mut ValidationReport) {
    let format = config.logging.format.as_str();
    if !matches!(format, "pretty" | "json") {
        report.error(
            "logging.format",
            format!("Unknown log format '{format}'. Use 'pretty' or 'json'"),
        );
    }
    if config.logging.level.trim().is_empty() {
        report.error("logging.level", "Log level cannot be empty");
    }
}
