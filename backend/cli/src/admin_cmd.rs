//! Admin actions against a running server.

use anyhow::Result;

use crate::client::ApiClient;
use crate::terminal_output::{note_success, note_warn};

/// Run one reclamation tick now.
pub async fn optimize(client: &ApiClient) -> Result<()> {
    let report = client.post("/api/vm/admin/optimize").await?;
    let count = |field: &str| report[field].as_u64().unwrap_or(0);
    note_success(&format!(
        "Tick done: {} running, {} paused, {} stopped, {} skipped",
        count("running"),
        count("paused"),
        count("stopped"),
        count("skipped")
    ));
    if count("errors") > 0 {
        note_warn(&format!("{} sandbox(es) failed; see server log", count("errors")));
    }
    Ok(())
}

/// Drop dead sessions and orphaned sandboxes.
pub async fn cleanup(client: &ApiClient) -> Result<()> {
    let report = client.delete("/api/vm/admin/cleanup").await?;
    let count = |field: &str| report[field].as_u64().unwrap_or(0);
    note_success(&format!(
        "Cleaned {} session(s), removed {} orphan(s)",
        count("cleaned"),
        count("orphans_removed")
    ));
    if count("untracked") > 0 {
        note_warn(&format!(
            "{} running sandbox(es) have no session; left alone",
            count("untracked")
        ));
    }
    Ok(())
}
