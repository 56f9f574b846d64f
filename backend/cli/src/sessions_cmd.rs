//! CLI Sessions Command
//!
//! Lists registered sessions across all users.

use anyhow::Result;
use serde_json::Value;

use crate::client::ApiClient;
use crate::terminal_output::{render_table, state_label, Column};

pub async fn run(client: &ApiClient, user: Option<&str>) -> Result<()> {
    let body = client.get("/api/vm/admin/all-sessions").await?;
    let sessions = body["sessions"].as_array().cloned().unwrap_or_default();
    let rows = session_rows(&sessions, user);
    if rows.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }
    print!("{}", render_table(&columns(), &rows));
    Ok(())
}

fn columns() -> Vec<Column> {
    vec![
        Column::left("USER"),
        Column::left("LAB"),
        Column::left("SANDBOX"),
        Column::left("STATE"),
        Column::right("DISPLAY"),
        Column::right("PROXY"),
        Column::right("IDLE(m)"),
    ]
}

fn session_rows(sessions: &[Value], user: Option<&str>) -> Vec<Vec<String>> {
    sessions
        .iter()
        .filter(|s| user.is_none_or(|u| s["user_id"].as_str() == Some(u)))
        .map(|s| {
            let text = |field: &str| s[field].as_str().unwrap_or("").to_string();
            let number = |field: &str| s[field].as_i64().map(|n| n.to_string()).unwrap_or_else(|| "-".into());
            vec![
                text("user_id"),
                text("lab_id"),
                text("sandbox_ref"),
                state_label(s["state"].as_str().unwrap_or("")),
                number("display_port"),
                number("proxy_port"),
                number("idle_minutes"),
            ]
        })
        .collect()
}
