//! CLI Doctor Command
//!
//! Checks the config, the sandbox engine and the registry without starting
//! the server.

use std::path::Path;

use anyhow::Result;

use labvm_config::{validate, LabVmConfig, RegistryBackend};
use labvm_core::SandboxFilter;
use labvm_store::SqliteKvStore;

use crate::app::build_runtime;
use crate::terminal_output::{note_error, note_success, note_warn};

pub async fn run(config: &LabVmConfig, config_path: &Path) -> Result<()> {
    println!("\nRunning labvm doctor ({})\n", config_path.display());

    let checks = [
        check_config(config),
        check_runtime(config).await,
        check_registry(config),
    ];

    println!();
    if checks.iter().all(|ok| *ok) {
        note_success("All checks passed.");
    } else {
        note_error("Some checks failed; fix the errors above.");
    }
    Ok(())
}

fn check_config(config: &LabVmConfig) -> bool {
    let report = validate(config);
    for warning in &report.warnings {
        note_warn(&warning.to_string());
    }
    for error in &report.errors {
        note_error(&error.to_string());
    }
    if report.is_valid() {
        note_success("Config is valid");
    }
    report.is_valid()
}

async fn check_runtime(config: &LabVmConfig) -> bool {
    let runtime = build_runtime(&config.runtime);
    match runtime.list(&SandboxFilter::managed(true)).await {
        Ok(rows) => {
            note_success(&format!(
                "{} runtime reachable, {} managed sandbox(es)",
                runtime.name(),
                rows.len()
            ));
            true
        }
        Err(e) => {
            note_error(&format!("{} runtime: {e}", runtime.name()));
            false
        }
    }
}

fn check_registry(config: &LabVmConfig) -> bool {
    match (config.registry.backend, config.registry.path.as_deref()) {
        (RegistryBackend::Memory, _) => {
            note_warn("Memory registry: sessions do not survive a restart");
            true
        }
        (RegistryBackend::Sqlite, Some(path)) => match SqliteKvStore::open(path) {
            Ok(_) => {
                note_success(&format!("Registry opened at {}", path.display()));
                true
            }
            Err(e) => {
                note_error(&format!("Registry at {}: {e:#}", path.display()));
                false
            }
        },
        (RegistryBackend::Sqlite, None) => {
            note_error("SQLite registry has no path");
            false
        }
    }
}
