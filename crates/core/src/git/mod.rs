//! Version-control substrate for patchkeeper.
//!
//! The engine talks to git only through the [`Vcs`] trait so the apply loop
//! can be driven against a real repository ([`GitClient`]) or a test double.

pub mod client;

use std::path::Path;

use async_trait::async_trait;

use crate::errors::GitError;

pub use client::GitClient;

/// Every capability the patch store, the resolution cache and the sync
/// engine need from the underlying repository.
///
/// Object ids are passed around as hex strings.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Root of the working tree.
    fn workdir(&self) -> &Path;

    /// The repository's `.git` directory (home of `rr-cache`).
    fn git_dir(&self) -> &Path;

    // -- transport ----------------------------------------------------------

    /// Fetch the default refspecs of `remote`.
    async fn fetch(&self, remote: &str) -> Result<(), GitError>;

    /// Force-fetch every reference under `namespace` from `remote`, pruning
    /// local references the remote no longer has.
    async fn fetch_namespace(&self, remote: &str, namespace: &str) -> Result<(), GitError>;

    /// Force-push every reference under `namespace` to `remote`, pruning
    /// remote references that no longer exist locally.
    async fn push_namespace(&self, remote: &str, namespace: &str) -> Result<(), GitError>;

    // -- branches -----------------------------------------------------------

    /// Short name of the checked-out branch, `None` when HEAD is detached.
    fn current_branch(&self) -> Result<Option<String>, GitError>;

    /// Resolve any revision expression to a commit id.
    fn resolve_commit(&self, rev: &str) -> Result<String, GitError>;

    /// Delete `name` if it exists, recreate it at `start_point` and check it
    /// out, discarding working tree changes to tracked files.
    fn reset_branch(&self, name: &str, start_point: &str) -> Result<(), GitError>;

    /// Check out an existing local branch, discarding local changes.
    fn checkout_branch(&self, name: &str) -> Result<(), GitError>;

    /// Reset index and working tree to HEAD and drop any in-progress state.
    fn hard_reset(&self) -> Result<(), GitError>;

    // -- working tree -------------------------------------------------------

    /// Three-way apply of a unified diff. `Ok(false)` means the diff did not
    /// apply cleanly; conflicts may have been left in the working tree.
    async fn apply_three_way(&self, diff: &str) -> Result<bool, GitError>;

    /// Stage every change in the working tree, including deletions.
    async fn stage_all(&self) -> Result<(), GitError>;

    /// Whether the index differs from HEAD.
    fn has_staged_changes(&self) -> Result<bool, GitError>;

    /// Commit the index on top of HEAD. Returns the new commit id.
    fn commit(&self, message: &str) -> Result<String, GitError>;

    /// Paths (relative to the work tree) with unmerged index entries.
    async fn conflicted_files(&self) -> Result<Vec<String>, GitError>;

    /// Run the resolution mechanism: record new conflicts, replay known
    /// resolutions, record finished ones.
    async fn replay_resolutions(&self) -> Result<(), GitError>;

    /// Turn the resolution mechanism on for this repository.
    fn enable_resolutions(&self) -> Result<(), GitError>;

    // -- objects and references --------------------------------------------

    fn write_blob(&self, content: &[u8]) -> Result<String, GitError>;

    fn read_blob(&self, id: &str) -> Result<Vec<u8>, GitError>;

    /// Write a flat tree of `(file name, blob id)` entries.
    fn write_tree(&self, entries: &[(String, String)]) -> Result<String, GitError>;

    /// Read a flat tree back as `(file name, object id)` entries.
    fn read_tree(&self, id: &str) -> Result<Vec<(String, String)>, GitError>;

    /// Create or overwrite a direct reference.
    fn set_reference(&self, name: &str, target: &str) -> Result<(), GitError>;

    /// Target of a reference, `None` if it does not exist.
    fn find_reference(&self, name: &str) -> Result<Option<String>, GitError>;

    /// Delete a reference; [`GitError::RefNotFound`] if it does not exist.
    fn delete_reference(&self, name: &str) -> Result<(), GitError>;

    /// Full names of every reference strictly under `prefix/`.
    fn list_references(&self, prefix: &str) -> Result<Vec<String>, GitError>;
}
