//! `labvm-config`: labvm runtime configuration management.
//!
//! Provides:
//! - Typed config schema with per-field defaults
//! - YAML read/write
//! - `${ENV_VAR}` substitution and `LABVM_*` overrides
//! - Config redaction for safe display
//! - Semantic validation

pub mod defaults;
pub mod env;
pub mod io;
pub mod redact;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{
    apply_env_overrides, apply_env_overrides_with, collect_referenced_vars, resolve_env_vars,
    resolve_env_vars_with, MissingEnvVarError,
};
pub use io::{config_dir, config_file_path, load_raw, write_config};
pub use redact::redact;
pub use schema::{
    LabVmConfig, LoggingConfig, PortsConfig, ReclamationConfig, RegistryBackend, RegistryConfig,
    RuntimeConfig, RuntimeKind, SandboxConfig, ServerConfig, UnobservedMode,
};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Load a config file, substitute env vars, apply defaults and overrides,
/// and validate it. Validation errors fail the load; warnings are logged.
pub async fn load_and_prepare(path: &Path) -> Result<LabVmConfig> {
    let raw = load_raw(path).await?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    prepare(raw, dir, &std::env::vars().collect())
}

/// The pure half of [`load_and_prepare`].
pub fn prepare(raw: Value, config_dir: &Path, env: &HashMap<String, String>) -> Result<LabVmConfig> {
    let value = resolve_env_vars_with(&raw, env).context("Failed to resolve env vars in config")?;

    let config: LabVmConfig =
        serde_json::from_value(value).context("Failed to deserialize config")?;
    let config = apply_all_defaults(config, config_dir);
    let config = apply_env_overrides_with(config, env)?;

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if let Some(first) = report.errors.first() {
        bail!("invalid config ({} error(s)); first: {first}", report.errors.len());
    }

    Ok(config)
}
