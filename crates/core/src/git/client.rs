//! Local Git repository operations via `git2` and the `git` binary.
//!
//! Object and reference plumbing goes through `git2`. Operations that only
//! the porcelain implements faithfully (three-way apply, `rerere`, network
//! transport with the operator's credential setup) shell out to `git`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{BranchType, ErrorCode, ObjectType, Oid, Repository, ResetType, Signature};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::Vcs;
use crate::errors::GitError;

/// Identity used when the repository has no `user.name` / `user.email`.
const FALLBACK_NAME: &str = "patchkeeper";
const FALLBACK_EMAIL: &str = "patchkeeper@localhost";

/// File mode for regular blobs in trees.
const BLOB_MODE: i32 = 0o100644;

/// High-level Git client for one non-bare repository.
///
/// The client keeps only paths; a fresh `git2::Repository` is opened per
/// operation so state written by the `git` binary (index, config) is always
/// observed.
#[derive(Debug, Clone)]
pub struct GitClient {
    repo_path: PathBuf,
    git_dir: PathBuf,
}

/// Output of a `git` invocation that is allowed to fail.
#[derive(Debug)]
struct GitOutput {
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl GitClient {
    /// Open the repository containing `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::discover(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| GitError::BareRepository(path.display().to_string()))?
            .to_path_buf();
        Ok(Self {
            repo_path: workdir,
            git_dir: repo.path().to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Open a `git2` handle on the repository.
    pub fn open_repo(&self) -> Result<Repository, GitError> {
        Repository::open(&self.repo_path)
            .map_err(|_| GitError::RepositoryNotFound(self.repo_path.display().to_string()))
    }

    /// Check whether the `git` binary can be run.
    pub async fn binary_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn parse_oid(id: &str) -> Result<Oid, GitError> {
        Oid::from_str(id).map_err(|_| GitError::RefNotFound(id.to_string()))
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>, GitError> {
        match repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?),
        }
    }

    async fn run_git_unchecked(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo_path)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(cmd = ?format!("git {}", args.join(" ")), "running git command");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::BinaryNotFound("git".into())
            } else {
                GitError::IoError(e)
            }
        })?;

        Ok(GitOutput {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.run_git_unchecked(args).await?;
        if !output.success {
            warn!(exit_code = output.exit_code, stderr = %output.stderr, "git command failed");
            return Err(GitError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn run_transport(&self, remote: &str, args: &[&str]) -> Result<(), GitError> {
        let output = self.run_git_unchecked(args).await?;
        if !output.success {
            warn!(remote, stderr = %output.stderr, "git transport failed");
            return Err(GitError::Transport {
                remote: remote.to_string(),
                detail: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Vcs for GitClient {
    fn workdir(&self) -> &Path {
        &self.repo_path
    }

    fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    #[instrument(skip(self))]
    async fn fetch(&self, remote: &str) -> Result<(), GitError> {
        info!(remote, "fetching");
        self.run_transport(remote, &["fetch", "--quiet", remote]).await?;
        debug!("fetch completed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_namespace(&self, remote: &str, namespace: &str) -> Result<(), GitError> {
        let refspec = format!("+{ns}/*:{ns}/*", ns = namespace);
        info!(remote, namespace, "fetching namespace");
        self.run_transport(
            remote,
            &["fetch", "--quiet", "--prune", "--no-tags", remote, &refspec],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn push_namespace(&self, remote: &str, namespace: &str) -> Result<(), GitError> {
        let refspec = format!("+{ns}/*:{ns}/*", ns = namespace);
        info!(remote, namespace, "pushing namespace");
        self.run_transport(
            remote,
            &["push", "--quiet", "--force", "--prune", remote, &refspec],
        )
        .await
    }

    fn current_branch(&self) -> Result<Option<String>, GitError> {
        let repo = self.open_repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !head.is_branch() {
            return Ok(None);
        }
        Ok(head.shorthand().map(str::to_string))
    }

    fn resolve_commit(&self, rev: &str) -> Result<String, GitError> {
        let repo = self.open_repo()?;
        let object = repo
            .revparse_single(rev)
            .map_err(|_| GitError::RefNotFound(rev.to_string()))?;
        let commit = object.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    #[instrument(skip(self))]
    fn reset_branch(&self, name: &str, start_point: &str) -> Result<(), GitError> {
        let repo = self.open_repo()?;
        let commit = repo
            .revparse_single(start_point)
            .map_err(|_| GitError::RefNotFound(start_point.to_string()))?
            .peel_to_commit()?;

        // Detach first so the branch can be deleted even when checked out.
        repo.set_head_detached(commit.id())?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(commit.as_object(), ResetType::Hard, Some(&mut checkout))?;
        repo.cleanup_state()?;

        if let Ok(mut existing) = repo.find_branch(name, BranchType::Local) {
            existing.delete()?;
            debug!(name, "deleted existing branch");
        }
        repo.branch(name, &commit, false)?;
        repo.set_head(&format!("refs/heads/{}", name))?;
        info!(name, start_point = %commit.id(), "recreated branch");
        Ok(())
    }

    #[instrument(skip(self))]
    fn checkout_branch(&self, name: &str) -> Result<(), GitError> {
        let repo = self.open_repo()?;
        let refname = format!("refs/heads/{}", name);
        repo.find_reference(&refname)
            .map_err(|_| GitError::RefNotFound(name.to_string()))?;
        repo.set_head(&refname)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))?;
        info!(name, "checked out branch");
        Ok(())
    }

    fn hard_reset(&self) -> Result<(), GitError> {
        let repo = self.open_repo()?;
        let head = repo.head()?.peel_to_commit()?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(head.as_object(), ResetType::Hard, Some(&mut checkout))?;
        repo.cleanup_state()?;
        info!(head = %head.id(), "hard reset to HEAD");
        Ok(())
    }

    #[instrument(skip(self, diff))]
    async fn apply_three_way(&self, diff: &str) -> Result<bool, GitError> {
        // Scratch directory for this attempt only; removed on drop.
        let scratch = tempfile::tempdir()?;
        let diff_path = scratch.path().join("patch.diff");
        std::fs::write(&diff_path, diff)?;
        let diff_arg = diff_path.to_string_lossy().to_string();

        let output = self
            .run_git_unchecked(&["apply", "--3way", "--whitespace=nowarn", &diff_arg])
            .await?;
        if !output.success {
            warn!(stderr = %output.stderr, "three-way apply did not apply cleanly");
            return Ok(false);
        }
        debug!("diff applied cleanly");
        Ok(true)
    }

    async fn stage_all(&self) -> Result<(), GitError> {
        self.run_git(&["add", "-A"]).await?;
        Ok(())
    }

    fn has_staged_changes(&self) -> Result<bool, GitError> {
        let repo = self.open_repo()?;
        let index = repo.index()?;
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(_) => None,
        };
        let diff = repo.diff_tree_to_index(head_tree.as_ref(), Some(&index), None)?;
        Ok(diff.deltas().len() > 0)
    }

    #[instrument(skip(self, message))]
    fn commit(&self, message: &str) -> Result<String, GitError> {
        let repo = self.open_repo()?;
        let mut index = repo.index()?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;
        let signature = Self::signature(&repo)?;
        let parent_commit = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        info!(sha = %oid, "created commit");
        Ok(oid.to_string())
    }

    async fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let stdout = self
            .run_git(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let mut files: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        files.dedup();
        Ok(files)
    }

    async fn replay_resolutions(&self) -> Result<(), GitError> {
        self.run_git(&["rerere"]).await?;
        Ok(())
    }

    fn enable_resolutions(&self) -> Result<(), GitError> {
        let repo = self.open_repo()?;
        let mut config = repo.config()?;
        config.set_bool("rerere.enabled", true)?;
        debug!("enabled rerere");
        Ok(())
    }

    fn write_blob(&self, content: &[u8]) -> Result<String, GitError> {
        let repo = self.open_repo()?;
        Ok(repo.blob(content)?.to_string())
    }

    fn read_blob(&self, id: &str) -> Result<Vec<u8>, GitError> {
        let repo = self.open_repo()?;
        let blob = repo.find_blob(Self::parse_oid(id)?)?;
        Ok(blob.content().to_vec())
    }

    fn write_tree(&self, entries: &[(String, String)]) -> Result<String, GitError> {
        let repo = self.open_repo()?;
        let mut builder = repo.treebuilder(None)?;
        for (name, id) in entries {
            builder.insert(name, Self::parse_oid(id)?, BLOB_MODE)?;
        }
        Ok(builder.write()?.to_string())
    }

    fn read_tree(&self, id: &str) -> Result<Vec<(String, String)>, GitError> {
        let repo = self.open_repo()?;
        let tree = repo.find_tree(Self::parse_oid(id)?)?;
        Ok(tree
            .iter()
            .filter(|entry| entry.kind() == Some(ObjectType::Blob))
            .filter_map(|entry| {
                entry
                    .name()
                    .map(|name| (name.to_string(), entry.id().to_string()))
            })
            .collect())
    }

    fn set_reference(&self, name: &str, target: &str) -> Result<(), GitError> {
        let repo = self.open_repo()?;
        repo.reference(name, Self::parse_oid(target)?, true, "patchkeeper: update")?;
        debug!(name, target, "updated reference");
        Ok(())
    }

    fn find_reference(&self, name: &str) -> Result<Option<String>, GitError> {
        let repo = self.open_repo()?;
        let reference = match repo.find_reference(name) {
            Ok(r) => r,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let resolved = reference.resolve()?;
        Ok(resolved.target().map(|oid| oid.to_string()))
    }

    fn delete_reference(&self, name: &str) -> Result<(), GitError> {
        let repo = self.open_repo()?;
        let mut reference = match repo.find_reference(name) {
            Ok(r) => r,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(GitError::RefNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        reference.delete()?;
        debug!(name, "deleted reference");
        Ok(())
    }

    fn list_references(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        let repo = self.open_repo()?;
        let wanted = format!("{}/", prefix.trim_end_matches('/'));
        let mut names = Vec::new();
        for reference in repo.references()? {
            let reference = reference?;
            if let Some(name) = reference.name() {
                if name.starts_with(&wanted) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo() -> (tempfile::TempDir, GitClient) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        let client = GitClient::new(dir.path()).unwrap();
        (dir, client)
    }

    fn commit_file(client: &GitClient, name: &str, content: &str, message: &str) -> String {
        std::fs::write(client.workdir().join(name), content).unwrap();
        let repo = client.open_repo().unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        client.commit(message).unwrap()
    }

    #[test]
    fn test_init_and_commit() {
        let (_dir, client) = init_repo();
        let sha = commit_file(&client, "hello.txt", "hello world", "initial commit");
        assert_eq!(client.resolve_commit("HEAD").unwrap(), sha);
        assert!(!client.has_staged_changes().unwrap());
    }

    #[test]
    fn test_repo_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            GitClient::new(&missing),
            Err(GitError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_reference_lifecycle() {
        let (_dir, client) = init_repo();
        let blob = client.write_blob(b"payload").unwrap();
        client.set_reference("refs/test/one", &blob).unwrap();
        client.set_reference("refs/test/two", &blob).unwrap();
        client.set_reference("refs/other/three", &blob).unwrap();

        let mut names = client.list_references("refs/test").unwrap();
        names.sort();
        assert_eq!(names, vec!["refs/test/one", "refs/test/two"]);
        assert_eq!(
            client.find_reference("refs/test/one").unwrap(),
            Some(blob.clone())
        );

        client.delete_reference("refs/test/one").unwrap();
        assert_eq!(client.find_reference("refs/test/one").unwrap(), None);
        assert!(matches!(
            client.delete_reference("refs/test/one"),
            Err(GitError::RefNotFound(_))
        ));
    }

    #[test]
    fn test_tree_round_trip() {
        let (_dir, client) = init_repo();
        let pre = client.write_blob(b"before").unwrap();
        let post = client.write_blob(b"after").unwrap();
        let tree = client
            .write_tree(&[
                ("preimage".to_string(), pre.clone()),
                ("postimage".to_string(), post.clone()),
            ])
            .unwrap();
        let mut entries = client.read_tree(&tree).unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![("postimage".to_string(), post), ("preimage".to_string(), pre)]
        );
    }

    #[test]
    fn test_reset_branch_twice_yields_same_tree() {
        let (_dir, client) = init_repo();
        let base = commit_file(&client, "a.txt", "base\n", "base");
        commit_file(&client, "a.txt", "changed\n", "change");

        client.reset_branch("build", &base).unwrap();
        let first = client.open_repo().unwrap().head().unwrap().peel_to_tree().unwrap().id();
        assert_eq!(client.current_branch().unwrap().as_deref(), Some("build"));
        assert_eq!(
            std::fs::read_to_string(client.workdir().join("a.txt")).unwrap(),
            "base\n"
        );

        // Dirty the build branch, then reset again from the same tip.
        commit_file(&client, "b.txt", "extra\n", "extra");
        client.reset_branch("build", &base).unwrap();
        let second = client.open_repo().unwrap().head().unwrap().peel_to_tree().unwrap().id();
        assert_eq!(first, second);
        assert_eq!(client.resolve_commit("build").unwrap(), base);
    }

    #[test]
    fn test_current_branch_detached_is_none() {
        let (_dir, client) = init_repo();
        let sha = commit_file(&client, "a.txt", "x", "one");
        let repo = client.open_repo().unwrap();
        repo.set_head_detached(Oid::from_str(&sha).unwrap()).unwrap();
        assert_eq!(client.current_branch().unwrap(), None);
    }
}
