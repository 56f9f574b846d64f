//! CLI Config Subcommands

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Subcommand;

use labvm_config::{redact, write_config, LabVmConfig};

use crate::terminal_output::note_success;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective config with secrets masked
    Show,
    /// Write a config file with every default spelled out
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(cmd: ConfigCommands, config: &LabVmConfig, path: &Path) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let value = serde_json::to_value(config).context("Failed to serialize config")?;
            println!("# {}", path.display());
            let yaml = serde_yaml::to_string(&redact(&value)).context("Failed to render config")?;
            print!("{yaml}");
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }
            write_config(&LabVmConfig::default(), path).await?;
            note_success(&format!("Wrote {}", path.display()));
        }
    }
    Ok(())
}

