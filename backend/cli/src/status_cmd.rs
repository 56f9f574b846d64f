//! CLI Status Command
//!
//! Reports server health and the last optimizer tick.

use anyhow::Result;
use serde_json::Value;

use crate::client::ApiClient;
use crate::terminal_output::{note_error, note_info, note_success};

pub async fn run(client: &ApiClient) -> Result<()> {
    let health = match client.get("/api/health").await {
        Ok(body) => body,
        Err(e) => {
            note_error(&format!("{e:#}"));
            return Ok(());
        }
    };
    note_success(&format!(
        "{} {} is up at {}",
        health["service"].as_str().unwrap_or("labvm"),
        health["version"].as_str().unwrap_or("?"),
        client.base_url()
    ));

    let optimizer = client.get("/api/vm/admin/optimizer").await?;
    println!("{}", describe_policy(&optimizer["policy"]));
    println!("{}", describe_last_tick(&optimizer["last_tick"]));

    let sessions = client.get("/api/vm/admin/all-sessions").await?;
    note_info(&format!("{} active session(s)", sessions["total"].as_u64().unwrap_or(0)));
    Ok(())
}

fn describe_policy(policy: &Value) -> String {
    let minutes = |field: &str| policy[field].as_u64().unwrap_or(0) / 60;
    format!(
        "Reclamation: pause after {}m idle, stop after {}m, every {}s",
        minutes("idle_pause_threshold"),
        minutes("idle_stop_threshold"),
        policy["interval"].as_u64().unwrap_or(0)
    )
}

fn describe_last_tick(tick: &Value) -> String {
    if tick.is_null() {
        return "Last tick: none yet".to_string();
    }
    let at = tick["finished_at"].as_str().unwrap_or("?");
    if let Some(err) = tick["error"].as_str() {
        return format!("Last tick at {at} failed: {err}");
    }
    let report = &tick["report"];
    let count = |field: &str| report[field].as_u64().unwrap_or(0);
    format!(
        "Last tick at {at}: running={} paused={} stopped={} skipped={} errors={}",
        count("running"),
        count("paused"),
        count("stopped"),
        count("skipped"),
        count("errors")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn describes_policy_in_minutes() {
        let policy = json!({"idle_pause_threshold": 600, "idle_stop_threshold": 1800, "interval": 60});
        assert_eq!(
            describe_policy(&policy),
            "Reclamation: pause after 10m idle, stop after 30m, every 60s"
        );
    }

    #[test]
    fn describes_tick_states() {
        assert_eq!(describe_last_tick(&Value::Null), "Last tick: none yet");
        let failed = json!({"finished_at": "2024-05-01T10:00:00Z", "report": null, "error": "runtime unavailable"});
        assert!(describe_last_tick(&failed).ends_with("failed: runtime unavailable"));
        let ok = json!({
            "finished_at": "2024-05-01T10:00:00Z",
            "report": {"running": 3, "paused": 1, "stopped": 0, "skipped": 2, "errors": 0},
            "error": null
        });
        assert!(describe_last_tick(&ok).contains("running=3 paused=1"));
    }
}
