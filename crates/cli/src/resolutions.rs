//! Shared resolution management: list, forget, clear.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use patchkeeper_core::{GitClient, ResolutionCache};

use super::style;
use super::Workspace;

fn cache(ctx: &Workspace) -> ResolutionCache<'_, GitClient> {
    ResolutionCache::new(&ctx.client, ctx.config.store.resolution_namespace())
}

pub fn run_list(ctx: &Workspace) -> Result<()> {
    let cache = cache(ctx);
    let hashes = cache.list().context("failed to list shared resolutions")?;
    if hashes.is_empty() {
        println!("{}", style::success("No shared resolutions"));
        return Ok(());
    }

    println!();
    println!(
        "{}",
        style::header(&format!("Shared Resolutions ({})", hashes.len()))
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Hash", "Conflict lines", "Resolved lines"]);
    for hash in &hashes {
        let (pre, post) = match cache.entry(hash) {
            Ok(entry) => (
                entry.preimage.lines().count().to_string(),
                entry.postimage.lines().count().to_string(),
            ),
            Err(e) => (style::error(&e.to_string()), String::new()),
        };
        table.add_row(vec![Cell::new(style::short(hash)), Cell::new(pre), Cell::new(post)]);
    }
    println!("{}", table);
    println!();
    Ok(())
}

pub fn run_forget(ctx: &Workspace, prefix: &str) -> Result<()> {
    let hash = cache(ctx)
        .forget(prefix)
        .with_context(|| format!("cannot forget '{}'", prefix))?;
    println!("{}", style::success(&format!("Forgot resolution {}", hash)));
    Ok(())
}

pub fn run_clear(ctx: &Workspace) -> Result<()> {
    let count = cache(ctx)
        .clear_all()
        .context("failed to clear shared resolutions")?;
    println!(
        "{}",
        style::success(&format!("Removed {} shared resolution(s)", count))
    );
    Ok(())
}
