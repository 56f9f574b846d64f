//! Docker-backed sandbox runtime.
//!
//! Drives the engine through the `docker` CLI. Every invocation is bounded
//! by `call_timeout`; a timed-out call is `RuntimeUnavailable`, never
//! `NotFound`.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use labvm_core::{
    LabVmError, LabVmResult, SandboxFilter, SandboxInfo, SandboxRuntime, SandboxSpec,
    SandboxStats, SandboxSummary,
};
use labvm_logging::redact_sensitive_data;

use crate::parse;

/// Configuration for the docker CLI adapter.
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Path or name of the docker binary.
    pub binary: String,
    /// Upper bound for any single engine call.
    pub call_timeout: Duration,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub struct DockerRuntime {
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    pub fn new(config: DockerRuntimeConfig) -> Self {
        Self { config }
    }

    /// Run one docker command, returning stdout on success.
    /// `extra` extends the timeout for calls that wait by design (stop).
    async fn docker(&self, args: &[String], extra: Duration) -> LabVmResult<String> {
        let verb = args.first().cloned().unwrap_or_default();
        let budget = self.config.call_timeout + extra;
        debug!(cmd = %redact_sensitive_data(&args.join(" ")), "docker call");

        let result = tokio::time::timeout(budget, async {
            tokio::process::Command::new(&self.config.binary)
                .args(args)
                .kill_on_drop(true)
                .output()
                .await
        })
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let err = classify_failure(&verb, stderr.trim());
                warn!(
                    verb = %verb,
                    code = err.code(),
                    stderr = %redact_sensitive_data(stderr.trim()),
                    "docker call failed"
                );
                Err(err)
            }
            Ok(Err(e)) => Err(LabVmError::RuntimeUnavailable(format!(
                "failed to run {}: {e}",
                self.config.binary
            ))),
            Err(_) => Err(LabVmError::RuntimeUnavailable(format!(
                "docker {verb} timed out after {}s",
                budget.as_secs()
            ))),
        }
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new(DockerRuntimeConfig::default())
    }
}

/// Build `docker create` arguments for a spec.
pub fn create_args(spec: &SandboxSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    for (key, val) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={val}"));
    }

    for (key, val) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={val}"));
    }

    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}/tcp", port.host_port, port.container_port));
    }

    if !spec.memory_limit.is_empty() {
        args.push("-m".to_string());
        args.push(spec.memory_limit.clone());
    }

    if spec.cpu_quota > 0.0 {
        // Fraction of one core over a 100ms period.
        let quota = (spec.cpu_quota * 100_000.0) as i64;
        args.push("--cpu-period=100000".to_string());
        args.push(format!("--cpu-quota={quota}"));
    }

    if let Some(policy) = &spec.restart_policy {
        args.push("--restart".to_string());
        args.push(policy.clone());
    }

    args.push(spec.image.clone());
    args
}

static NOT_FOUND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)no such (container|object)").unwrap());

static IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(unable to find image|no such image|pull access denied|manifest unknown|repository does not exist)")
        .unwrap()
});

static INVALID_STATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(is not running|is already paused|is not paused|is paused|cannot (pause|unpause|start|stop))")
        .unwrap()
});

static CONFLICT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)conflict.*(name|already in use)").unwrap());

static EXHAUSTED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(port is already allocated|address already in use|cannot allocate memory|insufficient|no space left|out of memory)")
        .unwrap()
});

/// Map docker CLI stderr onto the error taxonomy.
pub fn classify_failure(verb: &str, stderr: &str) -> LabVmError {
    let detail = format!("docker {verb}: {}", redact_sensitive_data(stderr));
    // Image errors mention "No such image", check them before containers.
    if IMAGE_RE.is_match(stderr) {
        LabVmError::ImageNotFound(detail)
    } else if NOT_FOUND_RE.is_match(stderr) {
        LabVmError::NotFound(detail)
    } else if CONFLICT_RE.is_match(stderr) {
        LabVmError::Conflict(detail)
    } else if EXHAUSTED_RE.is_match(stderr) {
        LabVmError::ResourceExhausted(detail)
    } else if INVALID_STATE_RE.is_match(stderr) {
        LabVmError::InvalidState(detail)
    } else {
        LabVmError::RuntimeUnavailable(detail)
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, spec: &SandboxSpec) -> LabVmResult<String> {
        info!(name = %spec.name, image = %spec.image, "Creating sandbox container");
        let out = self.docker(&create_args(spec), Duration::ZERO).await?;
        let id = out.trim().lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(LabVmError::RuntimeUnavailable(
                "docker create returned no container id".into(),
            ));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> LabVmResult<()> {
        self.docker(&["start".to_string(), id.to_string()], Duration::ZERO)
            .await
            .map(|_| ())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> LabVmResult<()> {
        let args = [
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            id.to_string(),
        ];
        self.docker(&args, timeout).await.map(|_| ())
    }

    async fn pause(&self, id: &str) -> LabVmResult<()> {
        self.docker(&["pause".to_string(), id.to_string()], Duration::ZERO)
            .await
            .map(|_| ())
    }

    async fn unpause(&self, id: &str) -> LabVmResult<()> {
        self.docker(&["unpause".to_string(), id.to_string()], Duration::ZERO)
            .await
            .map(|_| ())
    }

    async fn remove(&self, id: &str, force: bool) -> LabVmResult<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id.to_string());
        self.docker(&args, Duration::ZERO).await.map(|_| ())
    }

    async fn inspect(&self, id: &str) -> LabVmResult<SandboxInfo> {
        let args = [
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            id.to_string(),
        ];
        let out = self.docker(&args, Duration::ZERO).await?;
        parse::parse_inspect(&out).map_err(LabVmError::Internal)
    }

    async fn stats(&self, id: &str) -> LabVmResult<SandboxStats> {
        let args = [
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            id.to_string(),
        ];
        let out = self.docker(&args, Duration::ZERO).await?;
        parse::parse_stats(&out).map_err(LabVmError::Internal)
    }

    async fn list(&self, filter: &SandboxFilter) -> LabVmResult<Vec<SandboxSummary>> {
        let mut args = vec![
            "ps".to_string(),
            "--no-trunc".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        if filter.all {
            args.push("-a".to_string());
        }
        if let Some(prefix) = &filter.name_prefix {
            args.push("--filter".to_string());
            args.push(format!("name={prefix}"));
        }
        for (key, val) in &filter.labels {
            args.push("--filter".to_string());
            args.push(format!("label={key}={val}"));
        }

        let out = self.docker(&args, Duration::ZERO).await?;
        let mut rows = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            match parse::parse_ps_line(line) {
                // The engine's name filter is a substring match.
                Ok(row) if filter.matches(&row.name, &row.labels) => rows.push(row),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unparseable docker ps row"),
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use labvm_core::PortRequest;

    use super::*;

    fn spec() -> SandboxSpec {
        let mut env = BTreeMap::new();
        env.insert("PASSWORD".to_string(), "hunter2".to_string());
        let mut labels = BTreeMap::new();
        labels.insert("labvm.managed".to_string(), "true".to_string());
        SandboxSpec {
            name: "lab_sqli_42".into(),
            image: "cyberlab-vm:latest".into(),
            cpu_quota: 0.5,
            memory_limit: "2g".into(),
            env,
            labels,
            ports: vec![
                PortRequest { container_port: 5901, host_port: 6010 },
                PortRequest { container_port: 6080, host_port: 7010 },
            ],
            restart_policy: Some("unless-stopped".into()),
        }
    }

    #[test]
    fn create_args_carry_limits_ports_and_image_last() {
        let args = create_args(&spec());
        assert_eq!(args[0], "create");
        assert!(args.contains(&"--cpu-quota=50000".to_string()));
        assert!(args.contains(&"6010:5901/tcp".to_string()));
        assert!(args.contains(&"7010:6080/tcp".to_string()));
        assert!(args.contains(&"labvm.managed=true".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("cyberlab-vm:latest"));
    }

    #[test]
    fn classifies_engine_errors() {
        assert!(matches!(
            classify_failure("inspect", "Error: No such container: abc"),
            LabVmError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("create", "Unable to find image 'cyberlab-vm:latest' locally"),
            LabVmError::ImageNotFound(_)
        ));
        assert!(matches!(
            classify_failure("pause", "Error response from daemon: container abc is not running"),
            LabVmError::InvalidState(_)
        ));
        assert!(matches!(
            classify_failure("start", "Bind for 0.0.0.0:6010 failed: port is already allocated"),
            LabVmError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_failure("create", "Conflict. The container name \"/lab_x_u\" is already in use"),
            LabVmError::Conflict(_)
        ));
        assert!(matches!(
            classify_failure("ps", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            LabVmError::RuntimeUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable_not_not_found() {
        let runtime = DockerRuntime::new(DockerRuntimeConfig {
            binary: "/nonexistent/labvm-docker".into(),
            call_timeout: Duration::from_secs(2),
        });
        let err = runtime.inspect("abc").await.unwrap_err();
        assert!(matches!(err, LabVmError::RuntimeUnavailable(_)));
    }
}
