//! Config redaction: mask secrets before a config is printed or logged.

use serde_json::Value;

static SENSITIVE_KEYS: &[&str] = &["defaultPassword", "password", "vncPassword", "secret", "token"];

/// Replace every sensitive string with `"***"`.
pub fn redact(value: &Value) -> Value {
    redact_recursive(value, "")
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
        || key.to_ascii_uppercase().contains("PASSWORD")
        || key.to_ascii_uppercase().contains("SECRET")
}

fn redact_recursive(value: &Value, key: &str) -> Value {
    match value {
        Value::String(s) if !s.is_empty() && is_sensitive_key(key) => Value::String("***".into()),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| redact_recursive(v, key)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_recursive(v, k)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_default_password_and_secret_env() {
        let v = json!({
            "sandbox": {
                "image": "cyberlab-vm:latest",
                "defaultPassword": "labvm",
                "extraEnv": {"FLAG_SECRET": "ctf{x}", "LAB_MODE": "exam"}
            }
        });
        let r = redact(&v);
        assert_eq!(r["sandbox"]["defaultPassword"], "***");
        assert_eq!(r["sandbox"]["extraEnv"]["FLAG_SECRET"], "***");
        assert_eq!(r["sandbox"]["extraEnv"]["LAB_MODE"], "exam");
        assert_eq!(r["sandbox"]["image"], "cyberlab-vm:latest");
    }

    #[test]
    fn passthrough_non_sensitive() {
        let v = json!({ "logging": { "level": "debug" }, "server": { "port": 8088 } });
        assert_eq!(redact(&v), v);
    }
}
