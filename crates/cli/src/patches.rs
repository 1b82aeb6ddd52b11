//! Patch store and manifest commands: export, list, show, drop, order,
//! deps, status, pr.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use patchkeeper_core::patch::{export_commits, ExportOptions};
use patchkeeper_core::{DependencyGraph, GitClient, Manifest, PatchStatus, PatchStore};

use super::style;
use super::Workspace;

fn store(ctx: &Workspace) -> PatchStore<'_, GitClient> {
    PatchStore::new(&ctx.client, ctx.config.store.patch_namespace())
}

/// Every stored patch name, sorted.
fn known_names(ctx: &Workspace) -> Result<Vec<String>> {
    let mut names = store(ctx).list().context("failed to list patches")?;
    names.sort();
    Ok(names)
}

fn load_manifest(ctx: &Workspace) -> Result<Manifest> {
    Manifest::load(ctx.manifest_path()).context("failed to load manifest")
}

pub fn run_export(ctx: &Workspace, upstream: Option<String>, head: &str) -> Result<()> {
    let upstream = upstream.unwrap_or_else(|| ctx.config.upstream.tip_rev());
    let store = store(ctx);
    let mut manifest = load_manifest(ctx)?;
    let options = ExportOptions {
        upstream: &upstream,
        head,
        exclude_paths: &ctx.config.build.exclude_paths,
    };
    let exported = export_commits(&ctx.client, &store, &mut manifest, &options)
        .with_context(|| format!("failed to export {}..{}", upstream, head))?;

    if exported.is_empty() {
        println!("{}", style::success("No new commits to export"));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Patch", "Commit", "Subject"]);
    for patch in &exported {
        table.add_row(vec![
            Cell::new(&patch.name),
            Cell::new(style::short(&patch.commit)),
            Cell::new(&patch.subject),
        ]);
    }
    println!("{}", table);
    println!();
    println!(
        "{}",
        style::success(&format!("Exported {} patch(es)", exported.len()))
    );
    Ok(())
}

pub fn run_list(ctx: &Workspace) -> Result<()> {
    let names = known_names(ctx)?;
    if names.is_empty() {
        println!("No patches stored. Run `patchkeeper export` to create some.");
        return Ok(());
    }
    let manifest = load_manifest(ctx)?;

    println!();
    println!("{}", style::header(&format!("Patches ({})", names.len())));
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Patch", "Status", "Depends on", "Upstream PR", "Description"]);
    for name in &names {
        let meta = manifest.meta(name);
        table.add_row(vec![
            Cell::new(name),
            Cell::new(style::status(manifest.status(name))),
            Cell::new(manifest.dependencies(name).join(", ")),
            Cell::new(meta.and_then(|m| m.upstream_pr.as_deref()).unwrap_or("—")),
            Cell::new(meta.and_then(|m| m.description.as_deref()).unwrap_or("")),
        ]);
    }
    println!("{}", table);
    println!();
    Ok(())
}

pub fn run_show(ctx: &Workspace, name: &str) -> Result<()> {
    let content = store(ctx)
        .read(name)
        .with_context(|| format!("failed to read patch '{}'", name))?;
    let manifest = load_manifest(ctx)?;
    let meta = manifest.meta(name);

    println!("{}", style::header(&format!("Patch: {}", name)));
    println!();
    println!("  Status      : {}", style::status(manifest.status(name)));
    let deps = manifest.dependencies(name);
    println!(
        "  Depends on  : {}",
        if deps.is_empty() { "-".to_string() } else { deps.join(", ") }
    );
    let dependents = manifest.dependents(name);
    println!(
        "  Required by : {}",
        if dependents.is_empty() { "-".to_string() } else { dependents.join(", ") }
    );
    println!(
        "  Upstream PR : {}",
        meta.and_then(|m| m.upstream_pr.as_deref()).unwrap_or("-")
    );
    println!(
        "  Base commit : {}",
        meta.and_then(|m| m.base_commit.as_deref()).unwrap_or("-")
    );
    if let Some(description) = meta.and_then(|m| m.description.as_deref()) {
        println!("  Description : {}", description);
    }
    println!();
    println!("{}", "-".repeat(40));
    print!("{}", content);
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

pub fn run_drop(ctx: &Workspace, name: &str, force: bool) -> Result<()> {
    let store = store(ctx);
    if !store.exists(name).context("failed to look up patch")? {
        anyhow::bail!("patch '{}' not found", name);
    }
    let names = known_names(ctx)?;
    let mut manifest = load_manifest(ctx)?;
    let dependents: Vec<String> = manifest
        .dependents(name)
        .into_iter()
        .filter(|d| names.contains(d))
        .collect();

    if !dependents.is_empty() {
        if !force {
            anyhow::bail!(
                "patch '{}' is required by {}; remove those dependencies first or pass --force",
                name,
                dependents.join(", ")
            );
        }
        for dependent in &dependents {
            manifest
                .remove_dependency(dependent, name, &names)
                .with_context(|| format!("failed to detach '{}'", dependent))?;
            println!(
                "{}",
                style::warn(&format!("'{}' no longer depends on '{}'", dependent, name))
            );
        }
    }

    store
        .delete(name)
        .with_context(|| format!("failed to delete patch '{}'", name))?;
    manifest.remove(name).context("failed to update manifest")?;
    println!("{}", style::success(&format!("Dropped {}", name)));
    Ok(())
}

pub fn run_order(ctx: &Workspace) -> Result<()> {
    let names = known_names(ctx)?;
    let manifest = load_manifest(ctx)?;
    let (active, inactive): (Vec<String>, Vec<String>) = names
        .into_iter()
        .partition(|n| manifest.status(n).is_active());

    let order = DependencyGraph::build(&active, &manifest)
        .topological_sort()
        .context("patches cannot be ordered")?;

    if order.is_empty() {
        println!("No active patches.");
    }
    for (i, name) in order.iter().enumerate() {
        let deps = manifest.dependencies(name);
        if deps.is_empty() {
            println!("{:>4}. {}", i + 1, name);
        } else {
            println!(
                "{:>4}. {} {}",
                i + 1,
                name,
                style::dim(&format!("(after {})", deps.join(", ")))
            );
        }
    }
    for name in &inactive {
        println!(
            "{}",
            style::dim(&format!("   -  {} ({})", name, manifest.status(name)))
        );
    }
    Ok(())
}

pub fn run_deps_add(ctx: &Workspace, patch: &str, dependency: &str) -> Result<()> {
    let names = known_names(ctx)?;
    let mut manifest = load_manifest(ctx)?;
    manifest
        .add_dependency(patch, dependency, &names)
        .with_context(|| format!("cannot make '{}' depend on '{}'", patch, dependency))?;
    println!(
        "{}",
        style::success(&format!("{} now depends on {}", patch, dependency))
    );
    Ok(())
}

pub fn run_deps_remove(ctx: &Workspace, patch: &str, dependency: &str) -> Result<()> {
    let names = known_names(ctx)?;
    let mut manifest = load_manifest(ctx)?;
    if !manifest.dependencies(patch).iter().any(|d| d == dependency) {
        println!(
            "{}",
            style::warn(&format!("{} does not depend on {}", patch, dependency))
        );
        return Ok(());
    }
    manifest
        .remove_dependency(patch, dependency, &names)
        .with_context(|| format!("cannot remove '{}' from '{}'", dependency, patch))?;
    println!(
        "{}",
        style::success(&format!("{} no longer depends on {}", patch, dependency))
    );
    Ok(())
}

pub fn run_set_status(ctx: &Workspace, name: &str, status: &str) -> Result<()> {
    let status = PatchStatus::from_str_val(status).ok_or_else(|| {
        anyhow::anyhow!(
            "invalid status '{}': use active, merged or abandoned",
            status
        )
    })?;
    let names = known_names(ctx)?;
    let mut manifest = load_manifest(ctx)?;
    manifest
        .set_status(name, status, &names)
        .with_context(|| format!("failed to set status of '{}'", name))?;
    println!(
        "{}",
        style::success(&format!("{} is now {}", name, style::status(status)))
    );
    Ok(())
}

pub fn run_pr(ctx: &Workspace, name: &str, link: Option<String>) -> Result<()> {
    let names = known_names(ctx)?;
    let mut manifest = load_manifest(ctx)?;
    let message = match &link {
        Some(link) => format!("{} tracks upstream PR {}", name, link),
        None => format!("Cleared upstream PR of {}", name),
    };
    manifest
        .set_upstream_pr(name, link, &names)
        .with_context(|| format!("failed to update '{}'", name))?;
    println!("{}", style::success(&message));
    Ok(())
}
