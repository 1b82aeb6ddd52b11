//! Durable state of a sync blocked on a conflict.
//!
//! One JSON file per repository, named after a hash of the canonical
//! repository path, written atomically. It exists only while a sync is
//! blocked: created at block time, consumed by resume, removed by abort.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::SyncError;

/// Bump when the file layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Work tree this sync runs in.
    pub repo_path: PathBuf,

    /// The patch whose apply conflicted.
    pub blocked_patch: String,
    /// Patches after the blocked one, in order, not yet attempted.
    pub remaining: Vec<String>,
    /// Message to commit the blocked patch with once resolved.
    pub pending_message: String,
    /// Branch checked out before the sync started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_branch: Option<String>,
    /// Patches committed before the block.
    pub applied: usize,
    /// Local resolution ids present before the blocked patch was applied.
    pub resolution_snapshot: Vec<String>,
    /// Where the operator's own rr-cache was saved.
    pub saved_resolution_cache: PathBuf,

    /// Upstream commit the build branch was reset to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_tip: Option<String>,
    #[serde(default)]
    pub conflicted_files: Vec<String>,
    /// Patches skipped because of their status.
    #[serde(default)]
    pub skipped: Vec<String>,
    /// Patches cleared by the resolution cache before the block.
    #[serde(default)]
    pub auto_resolved: Vec<String>,
}

impl SyncState {
    /// Load the state file at `path`.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)?;
        let state: Self =
            serde_json::from_str(&content).map_err(|e| SyncError::StateCorrupted {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        state.validate(path)?;
        Ok(state)
    }

    /// Load the state file at `path` if there is one.
    pub fn load_if_exists(path: &Path) -> Result<Option<Self>, SyncError> {
        if path.exists() {
            Ok(Some(Self::load(path)?))
        } else {
            Ok(None)
        }
    }

    /// Write to `path` atomically, refreshing `updated_at`.
    pub fn save(&mut self, path: &Path) -> Result<(), SyncError> {
        self.updated_at = Utc::now();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("json.tmp");
        let content =
            serde_json::to_string_pretty(self).map_err(|e| SyncError::StateCorrupted {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)?;

        debug!(path = %path.display(), patch = %self.blocked_patch, "saved sync state");
        Ok(())
    }

    /// Remove the state file at `path`; a missing file is fine.
    pub fn delete(path: &Path) -> Result<(), SyncError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "deleted sync state");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self, path: &Path) -> Result<(), SyncError> {
        let corrupted = |detail: String| SyncError::StateCorrupted {
            path: path.to_path_buf(),
            detail,
        };
        if self.schema_version != SCHEMA_VERSION {
            return Err(corrupted(format!(
                "unsupported schema version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        if self.blocked_patch.is_empty() {
            return Err(corrupted("missing blocked patch".into()));
        }
        if self.remaining.contains(&self.blocked_patch) {
            return Err(corrupted(format!(
                "blocked patch '{}' also listed as remaining",
                self.blocked_patch
            )));
        }
        Ok(())
    }
}

/// First 16 hex characters of the SHA-256 of the canonical repository path.
pub fn repo_hash(repo_path: &Path) -> Result<String, SyncError> {
    let canonical = repo_path.canonicalize()?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    Ok(hex::encode(&hasher.finalize()[..8]))
}

/// Locations of everything a sync keeps outside the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    /// The [`SyncState`] file.
    pub state_file: PathBuf,
    /// Where the operator's rr-cache is saved during a sync.
    pub saved_cache: PathBuf,
}

impl StatePaths {
    pub fn for_repo(state_dir: &Path, repo_path: &Path) -> Result<Self, SyncError> {
        let hash = repo_hash(repo_path)?;
        Ok(Self {
            state_file: state_dir.join(format!("sync-{}.json", hash)),
            saved_cache: state_dir.join(format!("{}-rr-cache", hash)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(repo: &Path, cache: &Path) -> SyncState {
        let now = Utc::now();
        SyncState {
            schema_version: SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
            repo_path: repo.to_path_buf(),
            blocked_patch: "0002-b".into(),
            remaining: vec!["0003-c".into(), "0004-d".into()],
            pending_message: "Fix b".into(),
            original_branch: Some("main".into()),
            applied: 1,
            resolution_snapshot: vec!["abc".into()],
            saved_resolution_cache: cache.to_path_buf(),
            upstream_tip: Some("deadbeef".into()),
            conflicted_files: vec!["src/lib.rs".into()],
            skipped: vec!["0005-merged".into()],
            auto_resolved: Vec::new(),
        }
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::for_repo(&dir.path().join("state"), dir.path()).unwrap();
        let mut state = sample(dir.path(), &paths.saved_cache);

        state.save(&paths.state_file).unwrap();
        assert!(!paths.state_file.with_extension("json.tmp").exists());
        let loaded = SyncState::load(&paths.state_file).unwrap();
        assert_eq!(loaded, state);

        SyncState::delete(&paths.state_file).unwrap();
        assert!(SyncState::load_if_exists(&paths.state_file).unwrap().is_none());
        SyncState::delete(&paths.state_file).unwrap();
    }

    #[test]
    fn test_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, "{\"schema_version\": 1").unwrap();
        assert!(matches!(
            SyncState::load(&path),
            Err(SyncError::StateCorrupted { .. })
        ));
    }

    #[test]
    fn test_wrong_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        let mut state = sample(dir.path(), dir.path());
        state.schema_version = 99;
        state.save(&path).unwrap();
        match SyncState::load(&path).unwrap_err() {
            SyncError::StateCorrupted { detail, .. } => assert!(detail.contains("99")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_repo_hash_is_stable_per_path() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let hash = repo_hash(a.path()).unwrap();
        assert_eq!(hash.len(), 16);
        assert_eq!(hash, repo_hash(a.path()).unwrap());
        assert_ne!(hash, repo_hash(b.path()).unwrap());

        let paths = StatePaths::for_repo(Path::new("/state"), a.path()).unwrap();
        assert_eq!(
            paths.state_file,
            PathBuf::from(format!("/state/sync-{}.json", hash))
        );
    }
}
