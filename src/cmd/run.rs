//! Pipeline runs — `gatehouse run`.

use anyhow::{Context, Result};
use console::style;
use gatehouse::errors::PipelineError;
use gatehouse::memory_host::MemoryHost;
use gatehouse::pipeline::{HeadResolver, PipelineState, RunSummary, Supervisor};
use gatehouse::pull_request::{PullRequestRef, split_slug};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::super::Cli;
use super::{github_client, load_config};

pub struct RunOptions {
    pub repo: String,
    pub prs: Vec<u64>,
    pub head: Option<String>,
    pub dry_run: bool,
    pub watch: Option<u64>,
}

pub async fn cmd_run(cli: &Cli, project_dir: &Path, options: RunOptions) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    if config.toml.stages.is_empty() {
        anyhow::bail!(
            "No stages configured in {}. Run 'gatehouse config init' first.",
            config.config_file().display()
        );
    }
    split_slug(&options.repo)
        .with_context(|| format!("Invalid repository '{}': expected owner/repo", options.repo))?;
    if options.head.is_some() && options.prs.len() > 1 {
        anyhow::bail!("--head can only be used with a single --pr");
    }
    if let Some(head) = &options.head
        && (head.is_empty() || !head.chars().all(|c| c.is_ascii_hexdigit()))
    {
        anyhow::bail!("Invalid head sha '{}'", head);
    }

    println!();
    println!("{}", style("Gatehouse").bold().cyan());
    println!();

    if options.dry_run {
        if options.watch.is_some() {
            anyhow::bail!("--watch cannot be combined with --dry-run");
        }
        let head = options
            .head
            .as_deref()
            .context("--dry-run needs --head: there is no GitHub to resolve it from")?;
        let host = Arc::new(MemoryHost::new());
        let controller = Arc::new(config.build_controller(host.clone(), host.clone())?);
        let supervisor = Supervisor::new(controller);

        let prs = options
            .prs
            .iter()
            .map(|n| PullRequestRef::from_slug(&options.repo, *n, head))
            .collect::<Result<Vec<_>>>()?;
        let results = supervisor.run_all(prs).await;
        let not_ready = report(&results);

        for (pr, _) in &results {
            println!("{}", style(format!("Ledger comment for {}", pr.key())).bold());
            for comment in host.comments(pr) {
                println!("{}", comment.body);
            }
            for run in host.check_runs(pr) {
                println!(
                    "  {} {} {}",
                    style("check").dim(),
                    run.name,
                    run.conclusion.map(|c| c.as_str()).unwrap_or(run.status.as_str())
                );
            }
            println!();
        }
        return finish(not_ready, results.len());
    }

    let client = Arc::new(github_client(&config)?);
    let controller = Arc::new(config.build_controller(client.clone(), client.clone())?);
    let supervisor = Supervisor::new(controller);

    if let Some(secs) = options.watch {
        let prs = options
            .prs
            .iter()
            .map(|n| PullRequestRef::from_slug(&options.repo, *n, ""))
            .collect::<Result<Vec<_>>>()?;
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.cancel();
            }
        });
        println!(
            "Watching {} pull request(s) every {}s. Press Ctrl-C to stop.",
            prs.len(),
            secs.max(1)
        );
        supervisor
            .watch(prs, Duration::from_secs(secs.max(1)), client, shutdown)
            .await;
        return Ok(());
    }

    let mut prs = Vec::new();
    for number in &options.prs {
        let pr = PullRequestRef::from_slug(&options.repo, *number, "")?;
        let head = match &options.head {
            Some(head) => head.clone(),
            None => client.head_sha(&pr).await?,
        };
        prs.push(pr.at_head(&head));
    }
    let results = supervisor.run_all(prs).await;
    let not_ready = report(&results);
    finish(not_ready, results.len())
}

/// Print one line per pull request and return how many are not ready.
fn report(results: &[(PullRequestRef, Result<RunSummary, PipelineError>)]) -> usize {
    let mut not_ready = 0;
    for (pr, result) in results {
        match result {
            Ok(summary) => {
                let state = match &summary.final_state {
                    PipelineState::ReadyForPromotion => style(summary.final_state.label()).green().bold(),
                    _ => {
                        not_ready += 1;
                        style(summary.final_state.label()).red().bold()
                    }
                };
                println!(
                    "  {}  {}  {} hop(s), {} attempt(s), {:.1}s",
                    pr,
                    state,
                    summary.hops.len(),
                    summary.total_attempts(),
                    summary.duration.as_secs_f64()
                );
                if let PipelineState::Blocked { reason } = &summary.final_state {
                    println!("    {}", style(reason).dim());
                }
            }
            Err(e) if e.is_superseded() => {
                not_ready += 1;
                println!("  {}  {}", pr, style("superseded").dim());
            }
            Err(e) => {
                not_ready += 1;
                println!("  {}  {} {}", pr, style("Error:").red().bold(), e);
            }
        }
    }
    println!();
    not_ready
}

fn finish(not_ready: usize, total: usize) -> Result<()> {
    if not_ready > 0 {
        anyhow::bail!("{} of {} pull request(s) not ready for promotion", not_ready, total);
    }
    Ok(())
}
