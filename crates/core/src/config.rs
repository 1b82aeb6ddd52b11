//! Configuration for patchkeeper.
//!
//! Loaded from `.patchkeeper/config.toml` in the repository work tree. Every
//! section is optional; a repository without a config file runs on defaults.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// Config file location relative to the work tree.
pub const DEFAULT_CONFIG_PATH: &str = ".patchkeeper/config.toml";

/// Environment variable overriding the sync state directory.
pub const STATE_DIR_ENV: &str = "PATCHKEEPER_STATE_DIR";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchkeeperConfig {
    /// Where upstream lives.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// The branch patches are replayed onto.
    #[serde(default)]
    pub build: BuildConfig,

    /// Reference namespaces and the manifest file.
    #[serde(default)]
    pub store: StoreConfig,

    /// Sharing patches and resolutions with a team remote.
    #[serde(default)]
    pub share: ShareConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Remote to fetch upstream from (default `origin`).
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Upstream branch on that remote (default `main`).
    #[serde(default = "default_upstream_branch")]
    pub branch: String,
}

impl UpstreamConfig {
    /// Revision of the upstream tip after a fetch, e.g. `origin/main`.
    pub fn tip_rev(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: default_upstream_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Local branch recreated on every sync (default `patchkeeper/build`).
    #[serde(default = "default_build_branch")]
    pub branch: String,

    /// Work-tree paths carried across the branch reset byte-identical.
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            branch: default_build_branch(),
            exclude_paths: default_exclude_paths(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root reference namespace (default `refs/patchkeeper`).
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Manifest location relative to the work tree.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
}

impl StoreConfig {
    /// Namespace holding one reference per patch.
    pub fn patch_namespace(&self) -> String {
        format!("{}/patches", self.namespace)
    }

    /// Namespace holding one reference per shared resolution.
    pub fn resolution_namespace(&self) -> String {
        format!("{}/rerere", self.namespace)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            manifest_path: default_manifest_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Remote holding the team's patches and resolutions. Falls back to the
    /// upstream remote when unset.
    #[serde(default)]
    pub remote: Option<String>,

    /// Push the resolution namespace after every completed sync.
    #[serde(default)]
    pub push_resolutions: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory holding in-progress sync state. Defaults to the platform
    /// state directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_remote() -> String {
    "origin".into()
}

fn default_upstream_branch() -> String {
    "main".into()
}

fn default_build_branch() -> String {
    "patchkeeper/build".into()
}

fn default_exclude_paths() -> Vec<String> {
    vec![".patchkeeper".into()]
}

fn default_namespace() -> String {
    "refs/patchkeeper".into()
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from(".patchkeeper/manifest.json")
}

fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl PatchkeeperConfig {
    /// Load a [`PatchkeeperConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: PatchkeeperConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Load the config of the repository at `workdir`, or defaults when it
    /// has none. The result is validated either way.
    pub fn load_or_default<P: AsRef<Path>>(workdir: P) -> Result<Self, ConfigError> {
        let path = workdir.as_ref().join(DEFAULT_CONFIG_PATH);
        let config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate that all fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("upstream.remote", &self.upstream.remote)?;
        require_non_empty("upstream.branch", &self.upstream.branch)?;
        require_non_empty("build.branch", &self.build.branch)?;
        if let Some(remote) = &self.share.remote {
            require_non_empty("share.remote", remote)?;
        }

        if !self.store.namespace.starts_with("refs/") {
            return Err(ConfigError::InvalidValue {
                field: "store.namespace".into(),
                detail: "namespace must start with 'refs/'".into(),
            });
        }
        if self.store.namespace.ends_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "store.namespace".into(),
                detail: "namespace must not end with '/'".into(),
            });
        }
        if self.build.branch == self.upstream.branch {
            return Err(ConfigError::InvalidValue {
                field: "build.branch".into(),
                detail: "build branch must differ from the upstream branch".into(),
            });
        }

        for excluded in &self.build.exclude_paths {
            if !is_plain_relative(Path::new(excluded)) {
                return Err(ConfigError::InvalidValue {
                    field: "build.exclude_paths".into(),
                    detail: format!("'{}' must be a relative path without '..'", excluded),
                });
            }
        }
        if !is_plain_relative(&self.store.manifest_path) {
            return Err(ConfigError::InvalidValue {
                field: "store.manifest_path".into(),
                detail: "manifest path must be relative to the work tree".into(),
            });
        }

        Ok(())
    }

    /// Remote used for sharing patches and resolutions.
    pub fn share_remote(&self) -> &str {
        self.share
            .remote
            .as_deref()
            .unwrap_or(&self.upstream.remote)
    }

    /// Remote a sync fetches shared resolutions from: the one completed syncs
    /// push them to. `None` when resolutions are neither shared nor pushed,
    /// so local-only entries are not pruned.
    pub fn resolution_fetch_remote(&self) -> Option<&str> {
        if self.share.remote.is_some() || self.share.push_resolutions {
            Some(self.share_remote())
        } else {
            None
        }
    }

    /// Resolve the sync state directory: the environment variable, then the
    /// config, then the platform state directory.
    pub fn state_dir(&self) -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            if !dir.is_empty() {
                return Some(PathBuf::from(dir));
            }
        }
        if let Some(dir) = &self.sync.state_dir {
            return Some(dir.clone());
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map(|d| d.join("patchkeeper"))
            .or_else(|| dirs::home_dir().map(|h| h.join(".patchkeeper").join("state")))
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# patchkeeper configuration

[upstream]
remote = "origin"
branch = "main"

[build]
branch = "patchkeeper/build"
exclude_paths = [".patchkeeper"]

[store]
namespace = "refs/patchkeeper"
manifest_path = ".patchkeeper/manifest.json"

[share]
# remote = "origin"          # defaults to upstream.remote
push_resolutions = false

[sync]
# state_dir = "/custom/state/dir"

[logging]
log_level = "info"
"#
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: field.into(),
            detail: "must not be empty".into(),
        });
    }
    Ok(())
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
[upstream]
remote = "upstream"
branch = "develop"

[build]
branch = "local/build"
exclude_paths = [".patchkeeper", "local-notes"]

[store]
namespace = "refs/team"

[share]
remote = "team"
push_resolutions = true

[sync]
state_dir = "/var/tmp/pk"

[logging]
log_level = "debug"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: PatchkeeperConfig = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.upstream.tip_rev(), "upstream/develop");
        assert_eq!(config.build.exclude_paths.len(), 2);
        assert_eq!(config.store.patch_namespace(), "refs/team/patches");
        assert_eq!(config.store.resolution_namespace(), "refs/team/rerere");
        assert_eq!(config.share_remote(), "team");
        assert!(config.share.push_resolutions);
        assert_eq!(config.sync.state_dir, Some(PathBuf::from("/var/tmp/pk")));
        assert_eq!(config.logging.log_level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: PatchkeeperConfig = toml::from_str("").unwrap();
        assert_eq!(config.upstream.remote, "origin");
        assert_eq!(config.upstream.branch, "main");
        assert_eq!(config.build.branch, "patchkeeper/build");
        assert_eq!(config.build.exclude_paths, vec![".patchkeeper".to_string()]);
        assert_eq!(config.store.patch_namespace(), "refs/patchkeeper/patches");
        assert_eq!(
            config.store.manifest_path,
            PathBuf::from(".patchkeeper/manifest.json")
        );
        assert_eq!(config.share_remote(), "origin");
        assert!(!config.share.push_resolutions);
        assert_eq!(config.resolution_fetch_remote(), None);
        config.validate().unwrap();
    }

    #[test]
    fn test_resolution_fetch_remote_follows_push_remote() {
        let mut config = PatchkeeperConfig::default();
        config.share.push_resolutions = true;
        assert_eq!(config.resolution_fetch_remote(), Some("origin"));

        config.share.remote = Some("team".into());
        config.share.push_resolutions = false;
        assert_eq!(config.resolution_fetch_remote(), Some("team"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, sample_toml()).unwrap();
        let config = PatchkeeperConfig::load_from_file(&path).unwrap();
        assert_eq!(config.upstream.remote, "upstream");
    }

    #[test]
    fn test_file_not_found() {
        let result = PatchkeeperConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = PatchkeeperConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.build.branch, "patchkeeper/build");
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[upstream\nremote = ").unwrap();
        assert!(matches!(
            PatchkeeperConfig::load_from_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_namespace() {
        let mut config = PatchkeeperConfig::default();
        config.store.namespace = "patchkeeper".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "store.namespace"
        ));

        config.store.namespace = "refs/patchkeeper/".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_escaping_exclude_path() {
        let mut config = PatchkeeperConfig::default();
        config.build.exclude_paths = vec!["../outside".into()];
        assert!(config.validate().is_err());

        config.build.exclude_paths = vec!["/etc".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_remote() {
        let mut config = PatchkeeperConfig::default();
        config.upstream.remote = " ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "upstream.remote"
        ));
    }

    #[test]
    fn test_validate_rejects_build_equal_upstream() {
        let mut config = PatchkeeperConfig::default();
        config.build.branch = "main".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_template_is_valid() {
        let config: PatchkeeperConfig =
            toml::from_str(PatchkeeperConfig::default_template()).unwrap();
        config.validate().unwrap();
    }
}
