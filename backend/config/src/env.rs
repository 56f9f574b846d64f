//! Environment variable substitution and overrides for config values.
//!
//! Supports `${VAR_NAME}` syntax in string values, resolved at load time.
//! Only uppercase `[A-Z_][A-Z0-9_]*` variable names are matched.
//! `$${VAR}` escapes to a literal `${VAR}`.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::schema::LabVmConfig;

/// `$${NAME}` (escaped) or `${NAME}`.
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$?\$\{([A-Z_][A-Z0-9_]*)\}").unwrap());

pub const PORT_OVERRIDE: &str = "LABVM_PORT";
pub const BIND_OVERRIDE: &str = "LABVM_BIND";

/// Error returned for missing env vars.
#[derive(Debug, thiserror::Error)]
#[error("Missing env var \"{var_name}\" referenced at config path: {config_path}")]
pub struct MissingEnvVarError {
    pub var_name: String,
    pub config_path: String,
}

/// Substitute `${VAR}` references in a config value tree from the process
/// environment. Unset or empty variables are an error.
pub fn resolve_env_vars(value: &Value) -> Result<Value> {
    substitute_value(value, &std::env::vars().collect(), "")
}

/// Substitute env vars using a provided map.
pub fn resolve_env_vars_with(value: &Value, env: &HashMap<String, String>) -> Result<Value> {
    substitute_value(value, env, "")
}

fn substitute_value(value: &Value, env: &HashMap<String, String>, path: &str) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(substitute_string(s, env, path)?)),
        Value::Array(arr) => {
            let result: Result<Vec<_>> = arr
                .iter()
                .enumerate()
                .map(|(i, v)| substitute_value(v, env, &format!("{path}[{i}]")))
                .collect();
            Ok(Value::Array(result?))
        }
        Value::Object(map) => {
            let mut result = serde_json::Map::new();
            for (k, v) in map {
                let child_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                result.insert(k.clone(), substitute_value(v, env, &child_path)?);
            }
            Ok(Value::Object(result))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_string(s: &str, env: &HashMap<String, String>, path: &str) -> Result<String> {
    if !s.contains('$') {
        return Ok(s.to_string());
    }

    let mut missing: Option<MissingEnvVarError> = None;
    let substituted = ENV_VAR_PATTERN.replace_all(s, |caps: &regex::Captures| {
        let whole = &caps[0];
        let var_name = &caps[1];
        if whole.starts_with("$$") {
            return format!("${{{var_name}}}");
        }
        match env.get(var_name) {
            Some(val) if !val.is_empty() => val.clone(),
            _ => {
                missing.get_or_insert_with(|| MissingEnvVarError {
                    var_name: var_name.to_string(),
                    config_path: path.to_string(),
                });
                String::new()
            }
        }
    });

    if let Some(err) = missing {
        bail!(err);
    }
    Ok(substituted.into_owned())
}

/// Collect all env var names referenced in a config value tree.
pub fn collect_referenced_vars(value: &Value) -> Vec<String> {
    let mut vars = Vec::new();
    collect_vars_recursive(value, &mut vars);
    vars.sort();
    vars.dedup();
    vars
}

fn collect_vars_recursive(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in ENV_VAR_PATTERN.captures_iter(s) {
                if !caps[0].starts_with("$$") {
                    out.push(caps[1].to_string());
                }
            }
        }
        Value::Array(arr) => arr.iter().for_each(|v| collect_vars_recursive(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_vars_recursive(v, out)),
        _ => {}
    }
}

/// Apply `LABVM_PORT` / `LABVM_BIND` from the process environment.
pub fn apply_env_overrides(config: LabVmConfig) -> Result<LabVmConfig> {
    apply_env_overrides_with(config, &std::env::vars().collect())
}

pub fn apply_env_overrides_with(
    mut config: LabVmConfig,
    env: &HashMap<String, String>,
) -> Result<LabVmConfig> {
    if let Some(port) = env.get(PORT_OVERRIDE).filter(|v| !v.trim().is_empty()) {
        config.server.port = port
            .trim()
            .parse()
            .with_context(|| format!("{PORT_OVERRIDE}={port} is not a valid port"))?;
    }
    if let Some(bind) = env.get(BIND_OVERRIDE).filter(|v| !v.trim().is_empty()) {
        config.server.bind = bind.trim().to_string();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_nested_var() {
        let v = json!({"sandbox": {"defaultPassword": "${LAB_DESKTOP_PASSWORD}"}});
        let env = env(&[("LAB_DESKTOP_PASSWORD", "s3cret")]);
        let result = resolve_env_vars_with(&v, &env).unwrap();
        assert_eq!(result["sandbox"]["defaultPassword"], "s3cret");
    }

    #[test]
    fn error_names_missing_var_and_path() {
        let v = json!({"registry": {"path": "${STATE_DIR}/sessions.db"}});
        let err = resolve_env_vars_with(&v, &HashMap::new()).unwrap_err().to_string();
        assert!(err.contains("STATE_DIR"));
        assert!(err.contains("registry.path"));
    }

    #[test]
    fn escaped_reference_is_literal() {
        let v = json!({"x": "$${HOME} and ${USER_NAME}"});
        let env = env(&[("USER_NAME", "lab")]);
        let result = resolve_env_vars_with(&v, &env).unwrap();
        assert_eq!(result["x"], "${HOME} and lab");
        assert_eq!(collect_referenced_vars(&v), vec!["USER_NAME".to_string()]);
    }

    #[test]
    fn non_string_leaves_pass_through() {
        let v = json!({"server": {"port": 8088}, "reclamation": {"enabled": true}});
        assert_eq!(resolve_env_vars_with(&v, &HashMap::new()).unwrap(), v);
    }

    #[test]
    fn port_and_bind_overrides() {
        let env = env(&[(PORT_OVERRIDE, "9100"), (BIND_OVERRIDE, "0.0.0.0")]);
        let cfg = apply_env_overrides_with(LabVmConfig::default(), &env).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.bind, "0.0.0.0");
    }

    #[test]
    fn bad_port_override_is_an_error() {
        let env = env(&[(PORT_OVERRIDE, "eighty")]);
        assert!(apply_env_overrides_with(LabVmConfig::default(), &env).is_err());
    }
}
