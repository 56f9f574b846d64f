//! Log Redaction Layer
//!
//! Scrubs sandbox credentials and bearer tokens from strings prior to logging.

use regex::Regex;
use std::sync::LazyLock;

static CREDENTIAL_ENV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b((?:VNC_)?PASSWORD|SECRET|TOKEN)=([^\s,]+)").unwrap()
});
static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Bearer\s+[a-zA-Z0-9\-\._~+/]+=*").unwrap());

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    // `-e PASSWORD=...` in engine command lines
    let redacted = CREDENTIAL_ENV_RE.replace_all(input, "$1=[REDACTED]");
    BEARER_RE.replace_all(&redacted, "[REDACTED_TOKEN]").to_string()
}
