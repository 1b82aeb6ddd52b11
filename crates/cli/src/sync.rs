//! Sync commands: sync, resume, abort, push, fetch.

use anyhow::{Context, Result};

use patchkeeper_core::models::{BlockedReport, SyncOutcome, SyncReport};
use patchkeeper_core::{GitClient, PatchStore, ResolutionCache, SyncEngine};

use super::style;
use super::Workspace;

fn engine(ctx: Workspace) -> Result<SyncEngine<GitClient>> {
    SyncEngine::new(ctx.client, ctx.config).context("failed to set up the sync engine")
}

pub async fn run_sync(ctx: Workspace) -> Result<()> {
    let engine = engine(ctx)?;
    println!(
        "Syncing {} onto {}...",
        engine.config().build.branch,
        engine.config().upstream.tip_rev()
    );
    let outcome = engine.run().await.context("sync failed")?;
    report_outcome(&engine, outcome)
}

pub async fn run_resume(ctx: Workspace) -> Result<()> {
    let engine = engine(ctx)?;
    let outcome = engine.resume().await.context("resume failed")?;
    report_outcome(&engine, outcome)
}

pub async fn run_abort(ctx: Workspace) -> Result<()> {
    let engine = engine(ctx)?;
    let state = engine.abort().await.context("abort failed")?;
    let branch = state
        .original_branch
        .as_deref()
        .unwrap_or(&engine.config().build.branch)
        .to_string();
    println!(
        "{}",
        style::success(&format!(
            "Aborted the sync blocked on {}; back on {}",
            state.blocked_patch, branch
        ))
    );
    Ok(())
}

fn report_outcome(engine: &SyncEngine<GitClient>, outcome: SyncOutcome) -> Result<()> {
    match outcome {
        SyncOutcome::Completed(report) => {
            print_completed(engine, &report);
            Ok(())
        }
        SyncOutcome::Blocked(report) => {
            print_blocked(&report);
            anyhow::bail!("sync blocked on '{}'", report.patch)
        }
    }
}

fn print_completed(engine: &SyncEngine<GitClient>, report: &SyncReport) {
    let base = report
        .upstream_tip
        .as_deref()
        .map(style::short)
        .unwrap_or("-");
    println!(
        "{}",
        style::success(&format!(
            "{} patch(es) applied onto {} (upstream {})",
            report.applied,
            engine.config().build.branch,
            base
        ))
    );
    for name in &report.auto_resolved {
        println!("  {}", style::dim(&format!("{}: conflicts cleared by shared resolutions", name)));
    }
    for name in &report.skipped {
        println!("  {}", style::dim(&format!("{}: skipped (not active)", name)));
    }
}

fn print_blocked(report: &BlockedReport) {
    println!();
    println!(
        "{}",
        style::warn(&format!(
            "Sync blocked on {} ({} applied, {} remaining)",
            report.patch,
            report.applied,
            report.remaining.len()
        ))
    );
    println!();
    for step in report.next_steps() {
        println!("  {}", step);
    }
    println!();
    println!(
        "  {}",
        style::dim(&format!("state: {}", report.state_path.display()))
    );
    println!();
}

pub async fn run_push(ctx: &Workspace, remote: Option<&str>) -> Result<()> {
    let remote = remote.unwrap_or_else(|| ctx.config.share_remote());
    PatchStore::new(&ctx.client, ctx.config.store.patch_namespace())
        .push(remote)
        .await
        .with_context(|| format!("failed to push patches to '{}'", remote))?;
    ResolutionCache::new(&ctx.client, ctx.config.store.resolution_namespace())
        .push(remote)
        .await
        .with_context(|| format!("failed to push resolutions to '{}'", remote))?;
    println!(
        "{}",
        style::success(&format!("Pushed patches and resolutions to {}", remote))
    );
    Ok(())
}

pub async fn run_fetch(ctx: &Workspace, remote: Option<&str>) -> Result<()> {
    let remote = remote.unwrap_or_else(|| ctx.config.share_remote());
    let store = PatchStore::new(&ctx.client, ctx.config.store.patch_namespace());
    store
        .fetch(remote)
        .await
        .with_context(|| format!("failed to fetch patches from '{}'", remote))?;
    ResolutionCache::new(&ctx.client, ctx.config.store.resolution_namespace())
        .fetch(remote)
        .await
        .with_context(|| format!("failed to fetch resolutions from '{}'", remote))?;
    let count = store.list().context("failed to list patches")?.len();
    println!(
        "{}",
        style::success(&format!("Fetched {} patch(es) from {}", count, remote))
    );
    Ok(())
}
