//! CLI command implementations.
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `run`     | `Run`                                     |
//! | `inspect` | `Gates`, `Evidence`, `Ledger`, `Receipts` |
//! | `config`  | `Config`                                  |

pub mod config;
pub mod inspect;
pub mod run;

pub use config::cmd_config;
pub use inspect::{cmd_evidence, cmd_gates, cmd_ledger, cmd_receipts};
pub use run::{RunOptions, cmd_run};

use anyhow::{Context, Result};
use gatehouse::config::GatehouseConfig;
use gatehouse::github::GitHubClient;
use std::path::Path;

use super::Cli;

pub(crate) fn load_config(cli: &Cli, project_dir: &Path) -> Result<GatehouseConfig> {
    Ok(GatehouseConfig::new(project_dir.to_path_buf())?.with_namespace(cli.namespace.clone()))
}

pub(crate) fn github_client(config: &GatehouseConfig) -> Result<GitHubClient> {
    let token = config
        .github_token
        .as_deref()
        .context("GITHUB_TOKEN is not set. Export it or add it to .env")?;
    Ok(GitHubClient::new(&config.toml.github.api_url, token))
}
