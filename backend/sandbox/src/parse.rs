//! Parsers for the container engine's JSON and human-readable output.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use labvm_core::{PortMap, SandboxInfo, SandboxState, SandboxStats, SandboxSummary};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDoc {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: Option<String>,
    state: InspectState,
    #[serde(default)]
    config: Option<InspectConfig>,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
    #[serde(default)]
    host_config: Option<InspectHostConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<HostBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    port_bindings: Option<HashMap<String, Option<Vec<HostBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostBinding {
    #[serde(default)]
    host_port: String,
}

/// Parse `docker inspect` output (a JSON array with one element).
pub fn parse_inspect(raw: &str) -> Result<SandboxInfo> {
    let docs: Vec<InspectDoc> =
        serde_json::from_str(raw).context("Failed to parse docker inspect output")?;
    let doc = docs
        .into_iter()
        .next()
        .context("docker inspect returned an empty array")?;

    // Live bindings first; a stopped container only has the requested ones.
    let mut ports = doc
        .network_settings
        .and_then(|n| n.ports)
        .map(|p| port_map(&p))
        .unwrap_or_default();
    if ports.is_empty() {
        ports = doc
            .host_config
            .and_then(|h| h.port_bindings)
            .map(|p| port_map(&p))
            .unwrap_or_default();
    }

    let created_at = doc
        .created
        .as_deref()
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc));

    Ok(SandboxInfo {
        id: doc.id,
        name: doc.name.trim_start_matches('/').to_string(),
        state: SandboxState::from_runtime(&doc.state.status),
        ports,
        created_at,
        labels: doc.config.and_then(|c| c.labels).unwrap_or_default(),
    })
}

fn port_map(raw: &HashMap<String, Option<Vec<HostBinding>>>) -> PortMap {
    let mut ports = PortMap::new();
    for (container, bindings) in raw {
        let Some(container_port) = container
            .split('/')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let host_port = bindings
            .iter()
            .flatten()
            .find_map(|b| b.host_port.parse::<u16>().ok().filter(|p| *p != 0));
        if let Some(host_port) = host_port {
            ports.insert(container_port, host_port);
        }
    }
    ports
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

/// Parse one line of `docker ps --format '{{json .}}'`.
pub fn parse_ps_line(line: &str) -> Result<SandboxSummary> {
    let row: PsLine = serde_json::from_str(line).context("Failed to parse docker ps row")?;
    Ok(SandboxSummary {
        id: row.id,
        name: row.names.split(',').next().unwrap_or_default().to_string(),
        state: SandboxState::from_runtime(&row.state),
        labels: parse_labels(&row.labels),
    })
}

/// `a=b,c=d` -> map.
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
}

/// Parse `docker stats --no-stream --format '{{json .}}'` output.
pub fn parse_stats(raw: &str) -> Result<SandboxStats> {
    let line = raw
        .lines()
        .find(|l| !l.trim().is_empty())
        .context("docker stats returned no rows")?;
    let row: StatsLine = serde_json::from_str(line).context("Failed to parse docker stats row")?;

    let (mem_used, mem_limit) = split_pair(&row.mem_usage);
    let (net_rx, net_tx) = split_pair(&row.net_io);

    Ok(SandboxStats {
        cpu_percent: parse_percent(&row.cpu_perc),
        mem_used,
        mem_limit,
        mem_percent: parse_percent(&row.mem_perc),
        net_rx,
        net_tx,
    })
}

fn split_pair(raw: &str) -> (u64, u64) {
    let mut parts = raw.split('/');
    let a = parts.next().and_then(parse_size).unwrap_or(0);
    let b = parts.next().and_then(parse_size).unwrap_or(0);
    (a, b)
}

/// `"12.5%"` -> 12.5; anything unparseable is 0.
pub fn parse_percent(raw: &str) -> f64 {
    raw.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Human size (`25.2MiB`, `1.2kB`, `0B`) -> bytes.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT_RUNNING: &str = r#"[{
        "Id": "4f1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c",
        "Created": "2025-03-01T10:15:30.123456789Z",
        "Name": "/lab_sqli_42",
        "State": {"Status": "running", "Running": true},
        "Config": {"Labels": {"labvm.user": "42", "labvm.lab": "sqli", "labvm.managed": "true"}},
        "NetworkSettings": {"Ports": {
            "5901/tcp": [{"HostIp": "0.0.0.0", "HostPort": "6010"}, {"HostIp": "::", "HostPort": "6010"}],
            "6080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "7010"}],
            "22/tcp": null
        }},
        "HostConfig": {"PortBindings": {"5901/tcp": [{"HostIp": "", "HostPort": "6010"}]}}
    }]"#;

    #[test]
    fn inspect_reads_state_ports_and_labels() {
        let info = parse_inspect(INSPECT_RUNNING).unwrap();
        assert_eq!(info.name, "lab_sqli_42");
        assert_eq!(info.state, SandboxState::Running);
        assert_eq!(info.ports.get(&5901), Some(&6010));
        assert_eq!(info.ports.get(&6080), Some(&7010));
        assert!(!info.ports.contains_key(&22));
        assert_eq!(info.owner().unwrap().user_id, "42");
        assert!(info.created_at.is_some());
    }

    #[test]
    fn inspect_falls_back_to_requested_bindings_when_stopped() {
        let raw = r#"[{
            "Id": "abc",
            "Name": "/lab_x_u",
            "State": {"Status": "exited"},
            "NetworkSettings": {"Ports": {}},
            "HostConfig": {"PortBindings": {"5901/tcp": [{"HostIp": "", "HostPort": "6123"}]}}
        }]"#;
        let info = parse_inspect(raw).unwrap();
        assert_eq!(info.state, SandboxState::Exited);
        assert_eq!(info.ports.get(&5901), Some(&6123));
    }

    #[test]
    fn ps_row_parses_labels() {
        let line = r#"{"ID":"deadbeef","Names":"lab_net_7","State":"paused","Labels":"labvm.managed=true,labvm.user=7"}"#;
        let row = parse_ps_line(line).unwrap();
        assert_eq!(row.state, SandboxState::Paused);
        assert_eq!(row.labels.get("labvm.user").map(String::as_str), Some("7"));
    }

    #[test]
    fn stats_row_converts_units() {
        let raw = r#"{"CPUPerc":"12.50%","MemUsage":"512MiB / 2GiB","MemPerc":"25.00%","NetIO":"1.5kB / 648B"}"#;
        let stats = parse_stats(raw).unwrap();
        assert_eq!(stats.cpu_percent, 12.5);
        assert_eq!(stats.mem_used, 512 * 1024 * 1024);
        assert_eq!(stats.mem_limit, 2 * 1024 * 1024 * 1024);
        assert_eq!(stats.net_rx, 1500);
        assert_eq!(stats.net_tx, 648);
    }

    #[test]
    fn size_parser_rejects_unknown_units() {
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("3furlongs"), None);
        assert_eq!(parse_percent("--"), 0.0);
    }
}
