//! `init` and `validate`.

use std::path::Path;

use anyhow::{Context, Result};

use patchkeeper_core::fs_util;
use patchkeeper_core::{GitClient, Manifest, PatchStore, PatchkeeperConfig, Vcs};

use super::style;

pub fn run_init(client: &GitClient, config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "file already exists: {}. Use --force to overwrite it.",
            config_path.display()
        );
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    std::fs::write(config_path, PatchkeeperConfig::default_template())
        .context("failed to write config file")?;
    println!(
        "{}",
        style::success(&format!("Configuration written to {}", config_path.display()))
    );

    let config = PatchkeeperConfig::default();
    let manifest_path = client.repo_path().join(&config.store.manifest_path);
    if !manifest_path.exists() {
        Manifest::empty(&manifest_path)
            .save()
            .context("failed to write manifest")?;
        println!(
            "{}",
            style::success(&format!("Empty manifest written to {}", manifest_path.display()))
        );
    }

    fs_util::ensure_git_excluded(client.git_dir(), &config.build.exclude_paths)
        .context("failed to update .git/info/exclude")?;

    println!();
    println!("Next steps:");
    println!("  1. Set upstream.remote and upstream.branch in the config file");
    println!("  2. Export your local commits: patchkeeper export");
    println!("  3. Declare dependencies:      patchkeeper deps add <patch> <dependency>");
    println!("  4. Rebuild the build branch:  patchkeeper sync");
    Ok(())
}

pub fn run_validate(client: &GitClient, config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = if config_path.exists() {
        let config = PatchkeeperConfig::load_from_file(config_path)
            .context("failed to parse configuration")?;
        println!("  [OK] TOML structure is valid");
        config
    } else {
        println!("  [OK] No config file, using defaults");
        PatchkeeperConfig::default()
    };

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  {}", style::error(&format!("[FAIL] {}", e)));
            anyhow::bail!("configuration validation failed");
        }
    }

    let store = PatchStore::new(client, config.store.patch_namespace());
    let mut names = store.list().context("failed to list patches")?;
    names.sort();
    let manifest_path = client.repo_path().join(&config.store.manifest_path);
    let manifest = Manifest::load(&manifest_path).context("failed to load manifest")?;

    let mut failed = false;
    match manifest.validate(&names) {
        Ok(order) => println!(
            "  [OK] Dependency graph of {} patch(es) sorts cleanly",
            order.len()
        ),
        Err(e) => {
            println!("  {}", style::error(&format!("[FAIL] {}", e)));
            failed = true;
        }
    }

    for name in &names {
        if let Err(e) = store.read_body(name) {
            println!("  {}", style::error(&format!("[FAIL] {}", e)));
            failed = true;
        }
    }

    for orphan in manifest.names().iter().filter(|n| !names.contains(*n)) {
        println!(
            "  {}",
            style::warn(&format!("manifest record '{}' has no stored patch", orphan))
        );
    }

    println!();
    println!("Configuration summary:");
    println!("  Upstream tip   : {}", config.upstream.tip_rev());
    println!("  Build branch   : {}", config.build.branch);
    println!("  Excluded paths : {}", config.build.exclude_paths.join(", "));
    println!("  Namespace      : {}", config.store.namespace);
    println!("  Manifest       : {}", manifest_path.display());
    println!("  Share remote   : {}", config.share_remote());
    println!(
        "  Push resolutions: {}",
        if config.share.push_resolutions { "yes" } else { "no" }
    );
    println!(
        "  State directory: {}",
        config
            .state_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "NOT AVAILABLE".to_string())
    );
    println!();

    if failed {
        anyhow::bail!("validation failed");
    }
    println!("{}", style::success("Configuration and manifest are valid."));
    Ok(())
}
