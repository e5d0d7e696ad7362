//! Configuration view and validation commands — `gatehouse config`.

use anyhow::{Context, Result};
use console::style;
use gatehouse::config::DEFAULT_TEMPLATE;
use std::path::Path;

use super::super::{Cli, ConfigCommands};
use super::load_config;

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Gatehouse Configuration").bold().cyan());
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No gatehouse.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let rendered = toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  namespace = \"{}\"", config.namespace);
            println!("  state_dir = \"{}\"", config.state_dir().display());
            println!(
                "  github_token = {}",
                if config.github_token.is_some() { "set" } else { "not set" }
            );
            for stage in &config.toml.stages {
                let settings = config.toml.stage_settings(&stage.id);
                println!(
                    "  stage {}: max_attempts = {}, timeout_secs = {}",
                    stage.id, settings.max_attempts, settings.timeout_secs
                );
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            let errors = warnings.iter().filter(|w| w.starts_with("error:")).count();

            if warnings.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
            if errors > 0 {
                anyhow::bail!("Configuration has {} error(s)", errors);
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("gatehouse.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.config_dir).with_context(|| {
                format!("Failed to create {}", config.config_dir.display())
            })?;
            std::fs::write(&config_path, DEFAULT_TEMPLATE)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created gatehouse.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [[gates]] id, grammar, required");
            println!("  - [[stages]] command, outcomes, routes, escalation");
            println!("  - [overrides.\"pattern-*\"] for stage-specific settings");
            println!();
        }
    }

    Ok(())
}
