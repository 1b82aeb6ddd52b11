//! Error types for the patchkeeper core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from the version-control substrate (git2 and the `git` binary).
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// The repository has no work tree (bare repositories are not supported).
    #[error("git repository at '{0}' has no working tree")]
    BareRepository(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The `git` binary was not found on `$PATH`.
    #[error("git binary not found: {0}")]
    BinaryNotFound(String),

    /// A `git` command exited with a non-zero status.
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Fetch or push against a remote failed. The message is the raw
    /// output of the underlying transport.
    #[error("transport error talking to '{remote}': {detail}")]
    Transport { remote: String, detail: String },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

/// Validation failures from building or sorting the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A patch depends on a name that is not part of the graph.
    #[error("patch '{patch}' depends on '{dependency}', which does not exist")]
    MissingDependency { patch: String, dependency: String },

    /// The dependency edges form a cycle.
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A patch was asked to depend on itself.
    #[error("patch '{0}' cannot depend on itself")]
    SelfDependency(String),

    /// The patch being mutated is not known.
    #[error("unknown patch '{0}'")]
    UnknownPatch(String),
}

// ---------------------------------------------------------------------------
// Patch store errors
// ---------------------------------------------------------------------------

/// Errors from the patch store and the patch body format.
#[derive(Debug, Error)]
pub enum PatchError {
    /// No patch is stored under this name.
    #[error("patch not found: {0}")]
    NotFound(String),

    /// The name cannot be used as a patch reference.
    #[error("invalid patch name '{name}': {detail}")]
    InvalidName { name: String, detail: String },

    /// A stored body has no unified diff in it.
    #[error("malformed patch '{name}': {detail}")]
    MalformedPatch { name: String, detail: String },

    /// The stored body is not valid UTF-8.
    #[error("patch '{0}' is not valid UTF-8")]
    InvalidEncoding(String),

    /// A commit's diff cannot be stored as text.
    #[error("commit {0} changes text that is not valid UTF-8")]
    NonUtf8Diff(String),

    /// Every patch number up to `u32::MAX` is taken.
    #[error("no patch number left after {0}")]
    NumberOverflow(u32),

    /// Underlying git error.
    #[error("patch store git error: {0}")]
    GitError(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Manifest errors
// ---------------------------------------------------------------------------

/// Errors from loading, mutating, and persisting the metadata manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be parsed.
    #[error("manifest parse error in '{path}': {detail}")]
    ParseError { path: String, detail: String },

    /// A mutation was rejected by graph validation and reverted.
    #[error(transparent)]
    Validation(#[from] GraphError),

    /// Generic I/O error.
    #[error("manifest I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Resolution cache errors
// ---------------------------------------------------------------------------

/// Errors from the shared conflict-resolution cache.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No shared entry matches the prefix.
    #[error("no resolution entry matches '{0}'")]
    NotFound(String),

    /// More than one shared entry matches the prefix.
    #[error("prefix '{prefix}' is ambiguous; candidates: {}", .candidates.join(", "))]
    AmbiguousPrefix {
        prefix: String,
        candidates: Vec<String>,
    },

    /// A shared entry reference points at something that is not an entry.
    #[error("resolution entry '{hash}' is corrupt: {detail}")]
    CorruptEntry { hash: String, detail: String },

    /// Underlying git error.
    #[error("resolution cache git error: {0}")]
    GitError(#[from] GitError),

    /// Generic I/O error on the local rr-cache.
    #[error("resolution cache I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors from the sync engine. Apply conflicts are not errors; they are
/// reported as [`crate::models::SyncOutcome::Blocked`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// A blocked sync already exists for this repository.
    #[error("a sync is already in progress, blocked on '{patch}'; resolve it and run resume, or abort")]
    AlreadyInProgress { patch: String },

    /// Resume or abort was requested but nothing is blocked.
    #[error("no sync in progress for this repository")]
    NoSyncInProgress,

    /// Resume was requested while conflict markers remain.
    #[error("conflicts are still unresolved in: {}", .files.join(", "))]
    UnresolvedConflicts { files: Vec<String> },

    /// The persisted sync state could not be read or is inconsistent.
    #[error("sync state at '{}' is unusable: {detail}", .path.display())]
    StateCorrupted { path: PathBuf, detail: String },

    /// The state directory could not be determined.
    #[error("could not determine a state directory; set PATCHKEEPER_STATE_DIR")]
    NoStateDir,

    /// Ordering failed; nothing was mutated.
    #[error("sync graph error: {0}")]
    GraphError(#[from] GraphError),

    /// Patch store error during sync.
    #[error("sync patch error: {0}")]
    PatchError(#[from] PatchError),

    /// Manifest error during sync.
    #[error("sync manifest error: {0}")]
    ManifestError(#[from] ManifestError),

    /// Resolution cache error during sync.
    #[error("sync resolution cache error: {0}")]
    ResolutionError(#[from] ResolutionError),

    /// Underlying Git error during sync.
    #[error("sync git error: {0}")]
    GitError(#[from] GitError),

    /// Generic I/O error (excluded paths, state files).
    #[error("sync I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GraphError::CyclicDependency {
            cycle: vec!["P1".into(), "P2".into(), "P1".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: P1 -> P2 -> P1");

        let err = GraphError::MissingDependency {
            patch: "0002-b".into(),
            dependency: "0001-a".into(),
        };
        assert!(err.to_string().contains("0001-a"));

        let err = ResolutionError::AmbiguousPrefix {
            prefix: "ab".into(),
            candidates: vec!["abc1".into(), "abd2".into()],
        };
        assert_eq!(
            err.to_string(),
            "prefix 'ab' is ambiguous; candidates: abc1, abd2"
        );

        let err = GitError::Transport {
            remote: "origin".into(),
            detail: "fatal: could not read from remote repository".into(),
        };
        assert!(err.to_string().contains("fatal: could not read"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = GraphError::SelfDependency("p".into()).into();
        assert!(matches!(err, CoreError::Graph(_)));

        let err: CoreError = PatchError::NotFound("p".into()).into();
        assert!(matches!(err, CoreError::Patch(_)));
    }

    #[test]
    fn test_manifest_error_wraps_validation() {
        let err: ManifestError = GraphError::SelfDependency("p".into()).into();
        assert!(matches!(err, ManifestError::Validation(_)));
        assert_eq!(err.to_string(), "patch 'p' cannot depend on itself");
    }
}
