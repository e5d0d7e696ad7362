//! Read-only views — `gatehouse gates`, `evidence`, `ledger` and `receipts`.

use anyhow::{Context, Result};
use console::style;
use gatehouse::gates::GateStatus;
use gatehouse::ledger::LedgerStore;
use gatehouse::pipeline::HeadResolver;
use gatehouse::pull_request::PullRequestRef;
use gatehouse::receipt::{ReceiptDiff, ReceiptWriter};
use std::path::Path;
use std::sync::Arc;

use super::super::{Cli, EvidenceCommands, LedgerCommands};
use super::{github_client, load_config};

fn styled_status(status: GateStatus) -> console::StyledObject<&'static str> {
    match status {
        GateStatus::Pass => style(status.as_str()).green(),
        GateStatus::Fail => style(status.as_str()).red(),
        GateStatus::Skipped => style(status.as_str()).yellow(),
        GateStatus::Pending => style(status.as_str()).dim(),
    }
}

pub fn cmd_gates(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let registry = config.toml.build_registry()?;

    if registry.is_empty() {
        println!("No gates registered. Run 'gatehouse config init' to create a configuration.");
        return Ok(());
    }

    println!();
    println!("{}", style("Registered Gates").bold().cyan());
    println!();
    for gate in registry.iter() {
        let required = if gate.required {
            style("required").bold()
        } else {
            style("optional").dim()
        };
        println!("  {:<16} {:<9} {:<12} {}", gate.id, required, gate.grammar, gate.description);
    }
    println!();
    Ok(())
}

pub fn cmd_evidence(cli: &Cli, project_dir: &Path, command: EvidenceCommands) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    match command {
        EvidenceCommands::Check { gate, text } => {
            let registry = config.toml.build_registry()?;
            registry.lookup(&gate)?;
            let codec = config.toml.build_codec();
            match codec.decode(&gate, &text) {
                Ok(evidence) => {
                    println!(
                        "{} {} evidence for gate '{}'",
                        style("valid").green().bold(),
                        codec.grammar_for(&gate),
                        gate
                    );
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&evidence).context("Failed to render evidence")?
                    );
                    Ok(())
                }
                Err(e) => {
                    println!("{} {}", style("invalid").red().bold(), e);
                    println!("recorded as: {}", codec.error_line(&e.to_string()));
                    anyhow::bail!("Evidence rejected for gate '{}'", gate)
                }
            }
        }
    }
}

pub async fn cmd_ledger(cli: &Cli, project_dir: &Path, command: LedgerCommands) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    match command {
        LedgerCommands::Show { repo, pr } => {
            let client = Arc::new(github_client(&config)?);
            let pr = PullRequestRef::from_slug(&repo, pr, "")?;
            let head = client.head_sha(&pr).await?;
            let pr = pr.at_head(&head);

            let store = LedgerStore::new(client);
            let doc = store.read(&pr).await?;
            let registry = config.toml.build_registry()?;

            println!();
            println!("{}", style(format!("Ledger for {}", pr)).bold().cyan());
            if doc.gates.is_empty() && doc.hops.is_empty() && doc.decision.is_none() {
                println!("No ledger comment yet.");
                println!();
                return Ok(());
            }
            if doc.head_sha != pr.head_sha {
                println!(
                    "{} ledger records head {}, PR head is {}",
                    style("stale:").yellow().bold(),
                    doc.head_sha,
                    pr.head_sha
                );
            }
            println!();

            println!("{}", style("Gates").bold());
            for outcome in doc.gates.values() {
                println!(
                    "  {:<16} {:<8} {}",
                    outcome.gate_id,
                    styled_status(outcome.status),
                    outcome.evidence
                );
            }
            println!();

            println!("{}", style("Hops").bold());
            if doc.hops_elided > 0 {
                println!("  {}", style(format!("{} earlier hops elided", doc.hops_elided)).dim());
            }
            for hop in &doc.hops {
                println!(
                    "  {} {:<12} {}",
                    hop.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    hop.stage,
                    hop.summary
                );
            }
            println!();

            if let Some(decision) = &doc.decision {
                println!("{}", style("Decision").bold());
                println!("  state: {}", decision.state);
                println!("  next: {}", decision.next_stage.as_deref().unwrap_or("none"));
                println!("  reasoning: {}", decision.reasoning);
                println!();
            }

            let blocking = registry.blocking_gates(&doc, &pr.head_sha);
            if blocking.is_empty() {
                println!("{}", style("Ready for promotion").green().bold());
            } else {
                println!("{}", style("Blocked by:").red().bold());
                for gate in blocking {
                    println!("  - {}: {}", gate.gate_id, gate.reason);
                }
            }
            println!();
            Ok(())
        }
    }
}

pub fn cmd_receipts(
    cli: &Cli,
    project_dir: &Path,
    repo: &str,
    number: u64,
    diff: Option<&str>,
) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let pr = PullRequestRef::from_slug(repo, number, "")?;
    let writer = ReceiptWriter::new(&config.state_dir());
    if let Some(baseline) = diff {
        return print_receipt_diff(&writer.compare(&pr, baseline)?);
    }
    let paths = writer.list(&pr)?;

    if paths.is_empty() {
        println!("No receipts for {}", pr.key());
        return Ok(());
    }

    println!();
    println!("{}", style(format!("Receipts for {}", pr.key())).bold().cyan());
    println!();
    for path in paths {
        let receipt = writer.load(&path)?;
        let overall = if receipt.summary.overall_status == "pass" {
            style(receipt.summary.overall_status.as_str()).green()
        } else {
            style(receipt.summary.overall_status.as_str()).red()
        };
        println!(
            "  {}  {:<8} {:<20} {}/{} passed, {} attempt(s), finished {}",
            &receipt.metadata.head_sha,
            overall,
            receipt.metadata.final_state,
            receipt.summary.passed,
            receipt.summary.total_gates,
            receipt.metadata.total_attempts,
            receipt.metadata.finished_at.format("%Y-%m-%d %H:%M:%S")
        );
        if !receipt.summary.blocking_gates.is_empty() {
            println!("    blocking: {}", receipt.summary.blocking_gates.join(", "));
        }
    }
    println!();
    Ok(())
}

fn print_receipt_diff(diff: &ReceiptDiff) -> Result<()> {
    println!();
    println!("{}", style("Receipt Comparison").bold().cyan());
    println!("Baseline: {}", diff.baseline_head);
    println!("Current:  {}", diff.current_head);
    println!();

    if diff.is_empty() {
        println!("No gate changes.");
        println!();
        return Ok(());
    }
    for gate in &diff.gates_added {
        println!("  {} {}", style("+").green(), gate);
    }
    for gate in &diff.gates_removed {
        println!("  {} {}", style("-").red(), gate);
    }
    for change in &diff.status_changes {
        let label = if change.is_regression {
            style("REGRESSION").red().bold()
        } else if matches!(change.new_status, GateStatus::Pass | GateStatus::Skipped) {
            style("RECOVERED").green()
        } else {
            style("CHANGED").yellow()
        };
        println!(
            "  {} {}: {} -> {}",
            label, change.gate_id, change.old_status, change.new_status
        );
    }
    println!();
    if diff.overall_regression {
        println!("{}", style("Regression detected").red().bold());
        println!();
    }
    Ok(())
}
