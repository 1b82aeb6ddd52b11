//! Turn the commits unique to a local branch into stored patches.

use std::collections::HashSet;
use std::path::Path;

use chrono::{TimeZone, Utc};
use git2::{DiffFormat, DiffOptions, Oid, Sort};
use tracing::{debug, info};

use super::format::{self, PatchBody};
use super::store::PatchStore;
use crate::errors::{CoreError, GitError, PatchError};
use crate::git::GitClient;
use crate::manifest::Manifest;

#[derive(Debug, Clone)]
pub struct ExportOptions<'a> {
    /// Commits reachable from here are not exported (e.g. `origin/main`).
    pub upstream: &'a str,
    /// Tip of the branch holding local work (e.g. `HEAD`).
    pub head: &'a str,
    /// Paths whose changes are left out of exported diffs.
    pub exclude_paths: &'a [String],
}

/// One commit written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedPatch {
    pub name: String,
    pub commit: String,
    pub subject: String,
}

/// Export every non-merge commit in `upstream..head`, oldest first.
///
/// Commits already present in the store (matched by the `From <sha>` line)
/// and commits that only touch excluded paths are skipped. Each new patch
/// gets a manifest record with its subject as description and the upstream
/// tip as base commit.
pub fn export_commits(
    client: &GitClient,
    store: &PatchStore<'_, GitClient>,
    manifest: &mut Manifest,
    options: &ExportOptions<'_>,
) -> Result<Vec<ExportedPatch>, CoreError> {
    let repo = client.open_repo()?;
    let upstream = resolve(&repo, options.upstream)?;
    let head = resolve(&repo, options.head)?;

    let mut already_stored = HashSet::new();
    for name in store.list()? {
        let content = store.read(&name)?;
        if !format::is_generated(&content) {
            continue;
        }
        if let Some(sha) = format::source_commit(&content) {
            already_stored.insert(sha.to_string());
        }
    }

    let mut walk = repo.revwalk().map_err(GitError::from)?;
    walk.push(head).map_err(GitError::from)?;
    walk.hide(upstream).map_err(GitError::from)?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)
        .map_err(GitError::from)?;

    // Looked up when first needed, so a full store only fails an export that
    // has something to write.
    let mut next_number = None;
    let mut exported = Vec::new();

    for oid in walk {
        let oid = oid.map_err(GitError::from)?;
        let commit = repo.find_commit(oid).map_err(GitError::from)?;
        let sha = oid.to_string();

        if commit.parent_count() > 1 {
            debug!(commit = %sha, "skipping merge commit");
            continue;
        }
        if already_stored.contains(&sha) {
            debug!(commit = %sha, "commit already exported");
            continue;
        }

        let diff = render_diff(&repo, &commit, options.exclude_paths)?;
        if diff.is_empty() {
            debug!(commit = %sha, "no exportable changes");
            continue;
        }
        let diff = String::from_utf8(diff).map_err(|_| PatchError::NonUtf8Diff(sha.clone()))?;

        let message = commit.message().unwrap_or("").trim().to_string();
        let subject = message
            .lines()
            .next()
            .unwrap_or(format::FALLBACK_MESSAGE)
            .to_string();
        let date = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);

        let number = match next_number {
            Some(number) => number,
            None => store.next_number()?,
        };
        let name = format::patch_name(number, &subject);
        let body = PatchBody::render(&sha, date, &message, &diff);
        store.store(&name, &body)?;
        next_number = number.checked_add(1);

        let known = store.list()?;
        manifest.set_description(&name, Some(subject.clone()), &known)?;
        manifest.set_base_commit(&name, Some(upstream.to_string()), &known)?;

        info!(patch = %name, commit = %sha, "exported commit");
        exported.push(ExportedPatch {
            name,
            commit: sha,
            subject,
        });
    }

    Ok(exported)
}

fn resolve(repo: &git2::Repository, rev: &str) -> Result<Oid, GitError> {
    let object = repo
        .revparse_single(rev)
        .map_err(|_| GitError::RefNotFound(rev.to_string()))?;
    Ok(object.peel_to_commit()?.id())
}

/// Unified diff of `commit` against its first parent, without excluded paths.
/// Line content is copied verbatim, line endings included.
fn render_diff(
    repo: &git2::Repository,
    commit: &git2::Commit<'_>,
    exclude_paths: &[String],
) -> Result<Vec<u8>, GitError> {
    let tree = commit.tree()?;
    let parent_tree = match commit.parent_count() {
        0 => None,
        _ => Some(commit.parent(0)?.tree()?),
    };
    let mut opts = DiffOptions::new();
    opts.show_binary(true);
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;

    let mut out = Vec::new();
    diff.print(DiffFormat::Patch, |delta, _hunk, line| {
        let path = delta.new_file().path().or_else(|| delta.old_file().path());
        if path.map(|p| is_excluded(p, exclude_paths)).unwrap_or(false) {
            return true;
        }
        if matches!(line.origin(), '+' | '-' | ' ') {
            out.push(line.origin() as u8);
        }
        out.extend_from_slice(line.content());
        true
    })?;
    Ok(out)
}

fn is_excluded(path: &Path, exclude_paths: &[String]) -> bool {
    exclude_paths.iter().any(|excluded| path.starts_with(excluded))
}
