use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gatehouse::telemetry::{self, LogFormat};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(version, about = "PR review pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output on stderr: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Check-run namespace. Overrides gatehouse.toml and GATEHOUSE_NAMESPACE.
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline for one or more pull requests
    Run {
        /// Repository as owner/repo
        #[arg(long)]
        repo: String,

        /// Pull request number (repeatable)
        #[arg(long = "pr", required = true)]
        prs: Vec<u64>,

        /// Head commit to evaluate; resolved from GitHub when omitted
        #[arg(long)]
        head: Option<String>,

        /// Keep the ledger and check runs in memory and print the ledger
        #[arg(long)]
        dry_run: bool,

        /// Poll for new head commits every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
    /// List the registered gates
    Gates,
    /// Evidence string tools
    Evidence {
        #[command(subcommand)]
        command: EvidenceCommands,
    },
    /// Inspect the ledger comment of a pull request
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// View, validate or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// List gate receipts written for a pull request
    Receipts {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        pr: u64,
        /// Compare the receipt of this head against the latest other receipt
        #[arg(long, value_name = "SHA")]
        diff: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum EvidenceCommands {
    /// Validate an evidence string against a gate's grammar
    Check { gate: String, text: String },
}

#[derive(Subcommand, Clone)]
pub enum LedgerCommands {
    /// Show gates, hops and decision of the ledger comment
    Show {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        pr: u64,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default gatehouse.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // A missing .env is fine.
    let _ = dotenvy::from_path(project_dir.join(".env"));

    let _log_guard = telemetry::init(cli.verbose, cli.log_format, cli.log_file.as_deref())?;

    match &cli.command {
        Commands::Run {
            repo,
            prs,
            head,
            dry_run,
            watch,
        } => {
            let options = cmd::RunOptions {
                repo: repo.clone(),
                prs: prs.clone(),
                head: head.clone(),
                dry_run: *dry_run,
                watch: *watch,
            };
            cmd::cmd_run(&cli, &project_dir, options).await?;
        }
        Commands::Gates => cmd::cmd_gates(&cli, &project_dir)?,
        Commands::Evidence { command } => cmd::cmd_evidence(&cli, &project_dir, command.clone())?,
        Commands::Ledger { command } => cmd::cmd_ledger(&cli, &project_dir, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, &project_dir, command.clone())?,
        Commands::Receipts { repo, pr, diff } => {
            cmd::cmd_receipts(&cli, &project_dir, repo, *pr, diff.as_deref())?
        }
    }

    Ok(())
}
