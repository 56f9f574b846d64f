use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LabVmError, LabVmResult};

/// Container-internal port of the remote display server (VNC).
pub const DISPLAY_CONTAINER_PORT: u16 = 5901;

/// Container-internal port of the web proxy companion (noVNC).
pub const PROXY_CONTAINER_PORT: u16 = 6080;

/// Every lab sandbox name starts with this prefix.
pub const SANDBOX_NAME_PREFIX: &str = "lab_";

pub const LABEL_USER: &str = "labvm.user";
pub const LABEL_LAB: &str = "labvm.lab";
pub const LABEL_MANAGED: &str = "labvm.managed";

/// Container port -> host port.
pub type PortMap = BTreeMap<u16, u16>;

// ---------------------------------------------------------------------------
// Session identity
// ---------------------------------------------------------------------------

/// Composite key identifying one user's session for one lab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub lab_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, lab_id: impl Into<String>) -> LabVmResult<Self> {
        let user_id = user_id.into();
        let lab_id = lab_id.into();
        if user_id.trim().is_empty() {
            return Err(LabVmError::InvalidRequest("user id cannot be empty".into()));
        }
        if lab_id.trim().is_empty() {
            return Err(LabVmError::InvalidRequest("lab id cannot be empty".into()));
        }
        Ok(Self { user_id, lab_id })
    }

    /// Deterministic runtime name, `lab_{lab}_{user}_{tag}`.
    ///
    /// Sanitizing is lossy and both parts may contain `_`, so the tag (a
    /// digest of the raw key) keeps distinct keys on distinct names.
    pub fn sandbox_name(&self) -> String {
        format!(
            "{SANDBOX_NAME_PREFIX}{}_{}_{}",
            sanitize_name_part(&self.lab_id),
            sanitize_name_part(&self.user_id),
            self.name_tag()
        )
    }

    fn name_tag(&self) -> String {
        // Length-prefixed so no separator choice can make two keys collide.
        let raw = format!("{}:{}:{}", self.user_id.len(), self.user_id, self.lab_id);
        let digest = Sha256::digest(raw.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.lab_id)
    }
}

fn sanitize_name_part(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Short sandbox reference handed to API callers.
pub fn sandbox_ref(sandbox_id: &str) -> String {
    sandbox_id.chars().take(12).collect()
}

/// One user's sandbox instance for one lab, as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub sandbox_id: String,
    pub sandbox_name: String,
    pub user_id: String,
    pub lab_id: String,
    pub display_port: u16,
    pub proxy_port: u16,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            user_id: self.user_id.clone(),
            lab_id: self.lab_id.clone(),
        }
    }

    pub fn sandbox_ref(&self) -> String {
        sandbox_ref(&self.sandbox_id)
    }

    /// Overwrite stored ports with the runtime's actual bindings.
    /// Returns `true` when anything changed.
    pub fn reconcile_ports(&mut self, actual: &PortMap) -> bool {
        let mut changed = false;
        if let Some(&port) = actual.get(&DISPLAY_CONTAINER_PORT) {
            if port != self.display_port {
                self.display_port = port;
                changed = true;
            }
        }
        if let Some(&port) = actual.get(&PROXY_CONTAINER_PORT) {
            if port != self.proxy_port {
                self.proxy_port = port;
                changed = true;
            }
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// Runtime-facing types
// ---------------------------------------------------------------------------

/// Observed state of a runtime sandbox. `Missing` is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Running,
    Paused,
    Exited,
    Missing,
}

impl SandboxState {
    /// Map a container-engine status string onto the state set.
    pub fn from_runtime(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" => SandboxState::Created,
            "running" | "restarting" => SandboxState::Running,
            "paused" => SandboxState::Paused,
            "exited" | "dead" | "removing" => SandboxState::Exited,
            _ => SandboxState::Missing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Created => "created",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Exited => "exited",
            SandboxState::Missing => "missing",
        }
    }

    /// Running or paused: the sandbox still holds the user's desktop.
    pub fn is_live(&self) -> bool {
        matches!(self, SandboxState::Running | SandboxState::Paused)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to expose a container port on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub container_port: u16,
    pub host_port: u16,
}

/// Everything the runtime needs to create a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    /// Fraction of one CPU core.
    pub cpu_quota: f64,
    /// Engine memory string, e.g. `2g`.
    pub memory_limit: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortRequest>,
    pub restart_policy: Option<String>,
}

/// Result of inspecting a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub name: String,
    pub state: SandboxState,
    pub ports: PortMap,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl SandboxInfo {
    /// Owning session key, from labels first and the deterministic name second.
    pub fn owner(&self) -> Option<SessionKey> {
        owner_of(&self.name, &self.labels)
    }

    /// Whether the ownership labels name exactly `key`. Unlabelled
    /// sandboxes belong to nobody.
    pub fn labelled_for(&self, key: &SessionKey) -> bool {
        self.labels.get(LABEL_USER) == Some(&key.user_id)
            && self.labels.get(LABEL_LAB) == Some(&key.lab_id)
    }
}

/// One row from a runtime listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSummary {
    pub id: String,
    pub name: String,
    pub state: SandboxState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl SandboxSummary {
    pub fn owner(&self) -> Option<SessionKey> {
        owner_of(&self.name, &self.labels)
    }
}

fn owner_of(name: &str, labels: &BTreeMap<String, String>) -> Option<SessionKey> {
    if let (Some(user), Some(lab)) = (labels.get(LABEL_USER), labels.get(LABEL_LAB)) {
        return SessionKey::new(user.clone(), lab.clone()).ok();
    }
    // lab_{lab}_{user}_{tag}: accept a split only if it reproduces the name.
    let name = name.trim_start_matches('/');
    let rest = name.strip_prefix(SANDBOX_NAME_PREFIX)?;
    let (head, _tag) = rest.rsplit_once('_')?;
    head.match_indices('_')
        .filter_map(|(at, _)| SessionKey::new(&head[at + 1..], &head[..at]).ok())
        .find(|key| key.sandbox_name() == name)
}

/// Filter for runtime listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxFilter {
    pub name_prefix: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Include sandboxes that are not running.
    pub all: bool,
}

impl SandboxFilter {
    /// All sandboxes created by this manager.
    pub fn managed(all: bool) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        Self {
            name_prefix: Some(SANDBOX_NAME_PREFIX.to_string()),
            labels,
            all,
        }
    }

    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        if let Some(prefix) = &self.name_prefix {
            if !name.trim_start_matches('/').starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
    }
}

/// Point-in-time resource snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub cpu_percent: f64,
    pub mem_used: u64,
    pub mem_limit: u64,
    pub mem_percent: f64,
    pub net_rx: u64,
    pub net_tx: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key_parts() {
        assert!(SessionKey::new("", "lab1").is_err());
        assert!(SessionKey::new("u1", "  ").is_err());
    }

    #[test]
    fn sandbox_name_is_deterministic_and_sanitized() {
        let key = SessionKey::new("42", "web exploit/1").unwrap();
        let name = key.sandbox_name();
        assert!(name.starts_with("lab_web-exploit-1_42_"), "{name}");
        assert_eq!(name.len(), "lab_web-exploit-1_42_".len() + 12);
        assert_eq!(name, key.sandbox_name());
    }

    #[test]
    fn distinct_keys_get_distinct_names() {
        let pairs = [
            (("b_c", "a"), ("c", "a_b")),
            (("u1", "a b"), ("u1", "a-b")),
            (("u1", "x/y"), ("u1", "x?y")),
        ];
        for ((u1, l1), (u2, l2)) in pairs {
            let a = SessionKey::new(u1, l1).unwrap();
            let b = SessionKey::new(u2, l2).unwrap();
            assert_ne!(a.sandbox_name(), b.sandbox_name(), "{a} vs {b}");
        }
    }

    #[test]
    fn labelled_for_requires_both_labels() {
        let key = SessionKey::new("b_c", "a").unwrap();
        let mut info = SandboxInfo {
            id: "abc".into(),
            name: key.sandbox_name(),
            state: SandboxState::Running,
            ports: PortMap::new(),
            created_at: None,
            labels: BTreeMap::new(),
        };
        assert!(!info.labelled_for(&key));

        info.labels.insert(LABEL_USER.to_string(), "b_c".to_string());
        info.labels.insert(LABEL_LAB.to_string(), "a".to_string());
        assert!(info.labelled_for(&key));
        assert!(!info.labelled_for(&SessionKey::new("c", "a_b").unwrap()));
    }

    #[test]
    fn owner_from_labels_wins_over_name() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_USER.to_string(), "alice".to_string());
        labels.insert(LABEL_LAB.to_string(), "net_basics".to_string());
        let owner = owner_of("lab_net_basics_alice", &labels).unwrap();
        assert_eq!(owner.user_id, "alice");
        assert_eq!(owner.lab_id, "net_basics");
    }

    #[test]
    fn owner_from_name_when_unlabelled() {
        let key = SessionKey::new("b_c", "net_basics").unwrap();
        let name = format!("/{}", key.sandbox_name());
        assert_eq!(owner_of(&name, &BTreeMap::new()), Some(key));

        // Names this manager never generates have no owner.
        assert!(owner_of("/lab_sqli_7", &BTreeMap::new()).is_none());
        assert!(owner_of("postgres", &BTreeMap::new()).is_none());
    }

    #[test]
    fn runtime_status_mapping() {
        assert_eq!(SandboxState::from_runtime("running"), SandboxState::Running);
        assert_eq!(SandboxState::from_runtime("Paused"), SandboxState::Paused);
        assert_eq!(SandboxState::from_runtime("dead"), SandboxState::Exited);
        assert!(!SandboxState::Exited.is_live());
        assert!(SandboxState::Paused.is_live());
    }

    #[test]
    fn reconcile_ports_reports_divergence() {
        let mut session = Session {
            sandbox_id: "abcdef0123456789".into(),
            sandbox_name: "lab_l_u".into(),
            user_id: "u".into(),
            lab_id: "l".into(),
            display_port: 6010,
            proxy_port: 7010,
            created_at: Utc::now(),
        };
        let mut actual = PortMap::new();
        actual.insert(DISPLAY_CONTAINER_PORT, 6010);
        actual.insert(PROXY_CONTAINER_PORT, 7010);
        assert!(!session.reconcile_ports(&actual));

        actual.insert(PROXY_CONTAINER_PORT, 7999);
        assert!(session.reconcile_ports(&actual));
        assert_eq!(session.proxy_port, 7999);
        assert_eq!(session.sandbox_ref(), "abcdef012345");
    }

    #[test]
    fn managed_filter_requires_prefix_and_label() {
        let filter = SandboxFilter::managed(false);
        let mut labels = BTreeMap::new();
        assert!(!filter.matches("lab_x_y", &labels));
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        assert!(filter.matches("lab_x_y", &labels));
        assert!(!filter.matches("redis", &labels));
    }
}
