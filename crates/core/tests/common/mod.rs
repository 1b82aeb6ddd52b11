//! In-memory `Vcs` used to drive the sync engine without git.
//!
//! Objects and references live in maps; the work tree and the `.git/rr-cache`
//! directory are real directories under a temp dir so the engine's file
//! handling runs for real.
//!
//! Fake diffs are ordinary `diff --git` bodies whose lines are directives:
//!
//! - `WRITE <path> <content>` writes a file and applies cleanly.
//! - `CONFLICT <path>` leaves conflict markers in `<path>` and fails.
//! - `BROKEN` fails without leaving any conflict.
//!
//! `replay_resolutions` behaves like `git rerere`: it records a preimage for
//! each new conflict, records a postimage once the file is resolved, and
//! replays a known postimage over a conflicted file.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use patchkeeper_core::errors::GitError;
use patchkeeper_core::fs_util;
use patchkeeper_core::git::Vcs;
use patchkeeper_core::patch::format::PatchBody;
use patchkeeper_core::{Manifest, PatchStore, PatchkeeperConfig, SyncEngine};

pub const UPSTREAM_TIP: &str = "0123456789abcdef0123456789abcdef01234567";
pub const CONFLICT_TEXT: &str = "<<<<<<< ours\nlocal\n=======\nupstream\n>>>>>>> theirs\n";

#[derive(Debug, Clone)]
enum Object {
    Blob(Vec<u8>),
    Tree(Vec<(String, String)>),
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, Object>,
    refs: BTreeMap<String, String>,
    remote_refs: BTreeMap<String, BTreeMap<String, String>>,
    head: Option<String>,
    commits: BTreeMap<String, Vec<String>>,
    conflicted: Vec<String>,
    dirty: bool,
    staged: bool,
    calls: Vec<String>,
    fetch_failure: Option<String>,
    rerere_enabled: bool,
    counter: u64,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}{:039}", prefix, self.counter)
    }
}

pub struct FakeVcs {
    _dir: TempDir,
    workdir: PathBuf,
    git_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl FakeVcs {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work");
        let git_dir = workdir.join(".git");
        std::fs::create_dir_all(&git_dir).unwrap();
        let inner = Inner {
            head: Some("main".into()),
            ..Inner::default()
        };
        Self {
            _dir: dir,
            workdir,
            git_dir,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn fail_fetch(&self, detail: &str) {
        self.lock().fetch_failure = Some(detail.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.lock().calls.iter().any(|c| c.starts_with(prefix))
    }

    /// Commit messages on `branch`, oldest first.
    pub fn commits(&self, branch: &str) -> Vec<String> {
        self.lock().commits.get(branch).cloned().unwrap_or_default()
    }

    pub fn head(&self) -> Option<String> {
        self.lock().head.clone()
    }

    pub fn rerere_enabled(&self) -> bool {
        self.lock().rerere_enabled
    }

    pub fn remote_refs(&self, remote: &str) -> Vec<String> {
        self.lock()
            .remote_refs
            .get(remote)
            .map(|refs| refs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Write a file into the work tree, as an operator would.
    pub fn write_file(&self, rel: &str, content: &str) {
        let path = self.workdir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        self.lock().dirty = true;
    }

    pub fn read_file(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.workdir.join(rel)).ok()
    }

    pub fn rr_cache(&self) -> PathBuf {
        self.git_dir.join("rr-cache")
    }
}

/// Resolution id the fake `rerere` assigns to a conflicted path.
pub fn rr_id(path: &str) -> String {
    format!("rr-{}", path.replace('/', "_"))
}

#[async_trait]
impl Vcs for FakeVcs {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    async fn fetch(&self, remote: &str) -> Result<(), GitError> {
        let mut inner = self.lock();
        inner.calls.push(format!("fetch {}", remote));
        match &inner.fetch_failure {
            Some(detail) => Err(GitError::Transport {
                remote: remote.to_string(),
                detail: detail.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn fetch_namespace(&self, remote: &str, namespace: &str) -> Result<(), GitError> {
        let mut inner = self.lock();
        inner.calls.push(format!("fetch_namespace {} {}", remote, namespace));
        let prefix = format!("{}/", namespace);
        let remote_refs = inner.remote_refs.get(remote).cloned().unwrap_or_default();
        inner.refs.retain(|name, _| !name.starts_with(&prefix));
        for (name, target) in remote_refs {
            if name.starts_with(&prefix) {
                inner.refs.insert(name, target);
            }
        }
        Ok(())
    }

    async fn push_namespace(&self, remote: &str, namespace: &str) -> Result<(), GitError> {
        let mut inner = self.lock();
        inner.calls.push(format!("push_namespace {} {}", remote, namespace));
        let prefix = format!("{}/", namespace);
        let local: Vec<(String, String)> = inner
            .refs
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(n, t)| (n.clone(), t.clone()))
            .collect();
        let remote_refs = inner.remote_refs.entry(remote.to_string()).or_default();
        remote_refs.retain(|name, _| !name.starts_with(&prefix));
        remote_refs.extend(local);
        Ok(())
    }

    fn current_branch(&self) -> Result<Option<String>, GitError> {
        Ok(self.lock().head.clone())
    }

    fn resolve_commit(&self, rev: &str) -> Result<String, GitError> {
        let mut inner = self.lock();
        inner.calls.push(format!("resolve_commit {}", rev));
        Ok(UPSTREAM_TIP.to_string())
    }

    fn reset_branch(&self, name: &str, start_point: &str) -> Result<(), GitError> {
        // The upstream tree has nothing of ours in it.
        for entry in std::fs::read_dir(&self.workdir)? {
            let entry = entry?;
            if entry.file_name() != ".git" {
                fs_util::remove_path(&entry.path())?;
            }
        }
        let mut inner = self.lock();
        inner.calls.push(format!("reset_branch {} {}", name, start_point));
        inner.commits.insert(name.to_string(), Vec::new());
        inner.head = Some(name.to_string());
        inner.conflicted.clear();
        inner.dirty = false;
        inner.staged = false;
        Ok(())
    }

    fn checkout_branch(&self, name: &str) -> Result<(), GitError> {
        let mut inner = self.lock();
        inner.calls.push(format!("checkout_branch {}", name));
        inner.head = Some(name.to_string());
        Ok(())
    }

    fn hard_reset(&self) -> Result<(), GitError> {
        let mut inner = self.lock();
        inner.calls.push("hard_reset".into());
        inner.conflicted.clear();
        inner.dirty = false;
        inner.staged = false;
        Ok(())
    }

    async fn apply_three_way(&self, diff: &str) -> Result<bool, GitError> {
        let mut clean = true;
        let mut conflicted = Vec::new();
        for line in diff.lines() {
            let mut parts = line.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("WRITE"), Some(path), content) => {
                    let full = self.workdir.join(path);
                    std::fs::create_dir_all(full.parent().unwrap())?;
                    std::fs::write(full, format!("{}\n", content.unwrap_or("")))?;
                }
                (Some("CONFLICT"), Some(path), _) => {
                    let full = self.workdir.join(path);
                    std::fs::create_dir_all(full.parent().unwrap())?;
                    std::fs::write(full, CONFLICT_TEXT)?;
                    conflicted.push(path.to_string());
                    clean = false;
                }
                (Some("BROKEN"), _, _) => clean = false,
                _ => {}
            }
        }
        let mut inner = self.lock();
        inner.calls.push(format!("apply_three_way {}", diff.lines().next().unwrap_or("")));
        inner.dirty = true;
        inner.conflicted.extend(conflicted);
        Ok(clean)
    }

    async fn stage_all(&self) -> Result<(), GitError> {
        let mut inner = self.lock();
        inner.calls.push("stage_all".into());
        inner.conflicted.clear();
        if inner.dirty {
            inner.staged = true;
            inner.dirty = false;
        }
        Ok(())
    }

    fn has_staged_changes(&self) -> Result<bool, GitError> {
        Ok(self.lock().staged)
    }

    fn commit(&self, message: &str) -> Result<String, GitError> {
        let mut inner = self.lock();
        let branch = inner.head.clone().unwrap_or_else(|| "HEAD".into());
        inner.calls.push(format!("commit {}", message));
        inner.commits.entry(branch).or_default().push(message.to_string());
        inner.staged = false;
        Ok(inner.next_id("c"))
    }

    async fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        Ok(self.lock().conflicted.clone())
    }

    async fn replay_resolutions(&self) -> Result<(), GitError> {
        let conflicted = {
            let mut inner = self.lock();
            inner.calls.push("replay_resolutions".into());
            inner.conflicted.clone()
        };
        for path in conflicted {
            let file = self.workdir.join(&path);
            let entry = self.rr_cache().join(rr_id(&path));
            let post = entry.join("postimage");
            let pre = entry.join("preimage");
            if post.is_file() {
                std::fs::copy(&post, &file)?;
            } else if !pre.is_file() {
                std::fs::create_dir_all(&entry)?;
                std::fs::copy(&file, &pre)?;
            } else if !fs_util::has_conflict_markers(&file)? {
                std::fs::copy(&file, &post)?;
            }
        }
        Ok(())
    }

    fn enable_resolutions(&self) -> Result<(), GitError> {
        self.lock().rerere_enabled = true;
        Ok(())
    }

    fn write_blob(&self, content: &[u8]) -> Result<String, GitError> {
        let mut inner = self.lock();
        let id = inner.next_id("b");
        inner.objects.insert(id.clone(), Object::Blob(content.to_vec()));
        Ok(id)
    }

    fn read_blob(&self, id: &str) -> Result<Vec<u8>, GitError> {
        match self.lock().objects.get(id) {
            Some(Object::Blob(bytes)) => Ok(bytes.clone()),
            _ => Err(GitError::RefNotFound(id.to_string())),
        }
    }

    fn write_tree(&self, entries: &[(String, String)]) -> Result<String, GitError> {
        let mut inner = self.lock();
        let id = inner.next_id("t");
        inner.objects.insert(id.clone(), Object::Tree(entries.to_vec()));
        Ok(id)
    }

    fn read_tree(&self, id: &str) -> Result<Vec<(String, String)>, GitError> {
        match self.lock().objects.get(id) {
            Some(Object::Tree(entries)) => Ok(entries.clone()),
            _ => Err(GitError::RefNotFound(id.to_string())),
        }
    }

    fn set_reference(&self, name: &str, target: &str) -> Result<(), GitError> {
        self.lock().refs.insert(name.to_string(), target.to_string());
        Ok(())
    }

    fn find_reference(&self, name: &str) -> Result<Option<String>, GitError> {
        Ok(self.lock().refs.get(name).cloned())
    }

    fn delete_reference(&self, name: &str) -> Result<(), GitError> {
        self.lock()
            .refs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| GitError::RefNotFound(name.to_string()))
    }

    fn list_references(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        let wanted = format!("{}/", prefix);
        // Reverse order, so callers cannot rely on enumeration order.
        Ok(self
            .lock()
            .refs
            .keys()
            .rev()
            .filter(|name| name.starts_with(&wanted))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A patch body whose diff is the given fake directives.
pub fn body(subject: &str, directives: &[&str]) -> String {
    let mut diff = format!("diff --git a/{0} b/{0}\n", subject.replace(' ', "-"));
    for line in directives {
        diff.push_str(line);
        diff.push('\n');
    }
    PatchBody::render("feedface", Utc::now(), subject, &diff)
}

pub fn store_patch(vcs: &FakeVcs, name: &str, subject: &str, directives: &[&str]) {
    let store = PatchStore::new(vcs, PatchkeeperConfig::default().store.patch_namespace());
    store.store(name, &body(subject, directives)).unwrap();
}

pub fn manifest(vcs: &FakeVcs) -> Manifest {
    let path = vcs
        .workdir()
        .join(&PatchkeeperConfig::default().store.manifest_path);
    Manifest::load(path).unwrap()
}

pub fn patch_names(vcs: &FakeVcs) -> Vec<String> {
    PatchStore::new(vcs, PatchkeeperConfig::default().store.patch_namespace())
        .list()
        .unwrap()
}

pub fn engine(vcs: FakeVcs, state_dir: &Path) -> SyncEngine<FakeVcs> {
    engine_with(vcs, PatchkeeperConfig::default(), state_dir)
}

pub fn engine_with(
    vcs: FakeVcs,
    config: PatchkeeperConfig,
    state_dir: &Path,
) -> SyncEngine<FakeVcs> {
    SyncEngine::with_state_dir(vcs, config, state_dir).unwrap()
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// Collects formatted tracing output for the current thread.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

pub struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl LogCapture {
    /// Route `INFO` and above into the buffer until the guard drops. Works
    /// with the single-threaded runtime `#[tokio::test]` uses.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}
