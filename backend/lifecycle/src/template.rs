use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use labvm_core::{
    DISPLAY_CONTAINER_PORT, LABEL_LAB, LABEL_MANAGED, LABEL_USER, PROXY_CONTAINER_PORT,
    PortRequest, SandboxSpec, SessionKey,
};

/// Caller-supplied knobs for a new sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// Desktop login name. Defaults to the user id.
    #[serde(default)]
    pub username: Option<String>,
    /// Desktop and VNC password. Defaults to the configured one.
    #[serde(default)]
    pub password: Option<String>,
}

/// Fixed part of every sandbox: image, limits, desktop settings.
#[derive(Debug, Clone)]
pub struct SandboxTemplate {
    pub image: String,
    pub cpu_quota: f64,
    pub memory_limit: String,
    pub resolution: String,
    pub default_password: String,
    pub restart_policy: Option<String>,
    pub extra_env: BTreeMap<String, String>,
}

impl Default for SandboxTemplate {
    fn default() -> Self {
        Self {
            image: "cyberlab-vm:latest".to_string(),
            cpu_quota: 0.5,
            memory_limit: "2g".to_string(),
            resolution: "1280x720".to_string(),
            default_password: "labvm".to_string(),
            restart_policy: Some("unless-stopped".to_string()),
            extra_env: BTreeMap::new(),
        }
    }
}

impl SandboxTemplate {
    pub fn build(
        &self,
        key: &SessionKey,
        request: &StartRequest,
        display_port: u16,
        proxy_port: u16,
    ) -> SandboxSpec {
        let password = request
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.default_password.clone());
        let username = request
            .username
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| key.user_id.clone());

        let mut env = self.extra_env.clone();
        env.insert("USER".to_string(), username);
        env.insert("PASSWORD".to_string(), password.clone());
        env.insert("VNC_PASSWORD".to_string(), password);
        env.insert("RESOLUTION".to_string(), self.resolution.clone());

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_USER.to_string(), key.user_id.clone());
        labels.insert(LABEL_LAB.to_string(), key.lab_id.clone());
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        SandboxSpec {
            name: key.sandbox_name(),
            image: self.image.clone(),
            cpu_quota: self.cpu_quota,
            memory_limit: self.memory_limit.clone(),
            env,
            labels,
            ports: vec![
                PortRequest { container_port: DISPLAY_CONTAINER_PORT, host_port: display_port },
                PortRequest { container_port: PROXY_CONTAINER_PORT, host_port: proxy_port },
            ],
            restart_policy: self.restart_policy.clone(),
        }
    }
}
