//! patchkeeper command-line tool.
//!
//! Manages the patch store, the dependency manifest and the shared
//! resolution cache of one repository, and drives the sync engine that
//! rebuilds the build branch on top of upstream.

mod patches;
mod resolutions;
mod setup;
mod style;
mod sync;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use patchkeeper_core::config::DEFAULT_CONFIG_PATH;
use patchkeeper_core::{GitClient, PatchkeeperConfig};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Keep a dependency-ordered stack of local patches on top of upstream.
#[derive(Parser, Debug)]
#[command(
    name = "patchkeeper",
    version,
    about = "Keep a dependency-ordered stack of local patches on top of a moving upstream"
)]
struct Cli {
    /// Repository to operate on.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Configuration file (default: .patchkeeper/config.toml in the work tree).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration and an empty manifest.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },

    /// Check the configuration and the dependency manifest.
    Validate,

    /// Store local commits on top of upstream as patches.
    Export {
        /// Upstream revision (default: the configured upstream tip).
        #[arg(long)]
        upstream: Option<String>,

        /// Last commit to export.
        #[arg(long, default_value = "HEAD")]
        head: String,
    },

    /// List stored patches with their metadata.
    List,

    /// Show one patch: metadata and stored body.
    Show {
        /// Patch name.
        name: String,
    },

    /// Delete a patch from the store and the manifest.
    Drop {
        /// Patch name.
        name: String,

        /// Drop even if other patches depend on it.
        #[arg(long)]
        force: bool,
    },

    /// Print the order the next sync will apply patches in.
    Order,

    /// Edit patch dependencies.
    Deps {
        #[command(subcommand)]
        action: DepsAction,
    },

    /// Set a patch's status: active, merged or abandoned.
    Status {
        /// Patch name.
        name: String,

        /// New status.
        status: String,
    },

    /// Record or clear the upstream pull request for a patch.
    Pr {
        /// Patch name.
        name: String,

        /// Pull request URL or number.
        #[arg(required_unless_present = "clear")]
        link: Option<String>,

        /// Remove the recorded link.
        #[arg(long, conflicts_with = "link")]
        clear: bool,
    },

    /// Rebuild the build branch from upstream and every active patch.
    Sync,

    /// Commit the resolved patch and continue a blocked sync.
    Resume,

    /// Abandon a blocked sync and return to the original branch.
    Abort,

    /// Publish patches and shared resolutions.
    Push {
        /// Remote (default: share.remote, else upstream.remote).
        #[arg(long)]
        remote: Option<String>,
    },

    /// Replace local patches and shared resolutions with the remote's.
    Fetch {
        /// Remote (default: share.remote, else upstream.remote).
        #[arg(long)]
        remote: Option<String>,
    },

    /// Manage shared conflict resolutions.
    Resolutions {
        #[command(subcommand)]
        action: ResolutionsAction,
    },
}

#[derive(Subcommand, Debug)]
enum DepsAction {
    /// Make PATCH depend on DEPENDENCY.
    Add { patch: String, dependency: String },
    /// Remove a dependency edge.
    Remove { patch: String, dependency: String },
}

#[derive(Subcommand, Debug)]
enum ResolutionsAction {
    /// List shared resolutions.
    List,
    /// Forget the shared resolution matching a hash prefix.
    Forget { prefix: String },
    /// Forget every shared resolution.
    Clear,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = GitClient::new(&cli.repo).context("failed to open git repository")?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| client.repo_path().join(DEFAULT_CONFIG_PATH));

    // `init` writes the config and `validate` reports on it, so neither can
    // require a valid one up front.
    match cli.command {
        Commands::Init { force } => {
            init_logging(None);
            setup::run_init(&client, &config_path, force)
        }
        Commands::Validate => {
            init_logging(None);
            setup::run_validate(&client, &config_path)
        }
        command => {
            let config = load_config(&config_path)?;
            init_logging(config_path.exists().then_some(config.logging.log_level.as_str()));
            debug!(
                repo = %client.repo_path().display(),
                config = %config_path.display(),
                "configuration loaded"
            );
            run_command(
                command,
                Workspace {
                    client,
                    config,
                    config_path,
                },
            )
            .await
        }
    }
}

async fn run_command(command: Commands, ctx: Workspace) -> Result<()> {
    match command {
        Commands::Export { upstream, head } => patches::run_export(&ctx, upstream, &head),
        Commands::List => patches::run_list(&ctx),
        Commands::Show { name } => patches::run_show(&ctx, &name),
        Commands::Drop { name, force } => patches::run_drop(&ctx, &name, force),
        Commands::Order => patches::run_order(&ctx),
        Commands::Deps { action } => match action {
            DepsAction::Add { patch, dependency } => {
                patches::run_deps_add(&ctx, &patch, &dependency)
            }
            DepsAction::Remove { patch, dependency } => {
                patches::run_deps_remove(&ctx, &patch, &dependency)
            }
        },
        Commands::Status { name, status } => patches::run_set_status(&ctx, &name, &status),
        Commands::Pr { name, link, clear } => {
            patches::run_pr(&ctx, &name, if clear { None } else { link })
        }
        Commands::Sync => sync::run_sync(ctx).await,
        Commands::Resume => sync::run_resume(ctx).await,
        Commands::Abort => sync::run_abort(ctx).await,
        Commands::Push { remote } => sync::run_push(&ctx, remote.as_deref()).await,
        Commands::Fetch { remote } => sync::run_fetch(&ctx, remote.as_deref()).await,
        Commands::Resolutions { action } => match action {
            ResolutionsAction::List => resolutions::run_list(&ctx),
            ResolutionsAction::Forget { prefix } => resolutions::run_forget(&ctx, &prefix),
            ResolutionsAction::Clear => resolutions::run_clear(&ctx),
        },
        Commands::Init { force } => setup::run_init(&ctx.client, &ctx.config_path, force),
        Commands::Validate => setup::run_validate(&ctx.client, &ctx.config_path),
    }
}

/// The opened repository and its configuration, shared by every command.
pub struct Workspace {
    pub client: GitClient,
    pub config: PatchkeeperConfig,
    pub config_path: PathBuf,
}

impl Workspace {
    pub fn manifest_path(&self) -> PathBuf {
        self.client.repo_path().join(&self.config.store.manifest_path)
    }
}

// ---------------------------------------------------------------------------
// Config & logging helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<PatchkeeperConfig> {
    let config = if path.exists() {
        PatchkeeperConfig::load_from_file(path).context("failed to load configuration file")?
    } else {
        PatchkeeperConfig::default()
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// `RUST_LOG` wins; otherwise the configured level, `warn` without a config.
fn init_logging(configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or("warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_deps_add() {
        let cli = Cli::try_parse_from(["patchkeeper", "-C", "/tmp/repo", "deps", "add", "0002-b", "0001-a"])
            .unwrap();
        assert_eq!(cli.repo, PathBuf::from("/tmp/repo"));
        match cli.command {
            Commands::Deps {
                action: DepsAction::Add { patch, dependency },
            } => {
                assert_eq!(patch, "0002-b");
                assert_eq!(dependency, "0001-a");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_pr_requires_link_or_clear() {
        assert!(Cli::try_parse_from(["patchkeeper", "pr", "0001-a"]).is_err());
        assert!(Cli::try_parse_from(["patchkeeper", "pr", "0001-a", "--clear"]).is_ok());
        assert!(Cli::try_parse_from(["patchkeeper", "pr", "0001-a", "42", "--clear"]).is_err());
    }
}
