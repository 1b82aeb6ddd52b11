//! Sync engine: fetch upstream, pick the active patches, order them, reset the
//! build branch to the upstream tip, and apply each patch in turn.
//!
//! `Idle → Fetching → Filtering → Ordering → Resetting → Applying(i) →
//! {Applying(i+1) | Blocked | Done}`
//!
//! A conflict the resolution cache cannot clear parks a [`SyncState`] on disk
//! and returns [`SyncOutcome::Blocked`]. [`SyncEngine::resume`] picks it up
//! again, [`SyncEngine::abort`] throws it away.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::state::{StatePaths, SyncState, SCHEMA_VERSION};
use crate::config::PatchkeeperConfig;
use crate::errors::SyncError;
use crate::fs_util::{self, HeldPaths};
use crate::git::Vcs;
use crate::graph::DependencyGraph;
use crate::manifest::Manifest;
use crate::models::{BlockedReport, SyncOutcome, SyncPhase, SyncReport};
use crate::patch::{PatchBody, PatchStore};
use crate::resolution::ResolutionCache;

/// Counters carried through the apply loop, and across a block/resume.
#[derive(Debug, Clone, Default)]
struct Progress {
    applied: usize,
    skipped: Vec<String>,
    auto_resolved: Vec<String>,
    upstream_tip: Option<String>,
    original_branch: Option<String>,
}

impl Progress {
    fn into_report(self) -> SyncReport {
        SyncReport {
            applied: self.applied,
            skipped: self.skipped,
            auto_resolved: self.auto_resolved,
            upstream_tip: self.upstream_tip,
        }
    }
}

pub struct SyncEngine<V: Vcs> {
    vcs: V,
    config: PatchkeeperConfig,
    paths: StatePaths,
    phase: std::sync::Mutex<SyncPhase>,
}

impl<V: Vcs> SyncEngine<V> {
    /// Engine keeping its state in the configured state directory.
    pub fn new(vcs: V, config: PatchkeeperConfig) -> Result<Self, SyncError> {
        let state_dir = config.state_dir().ok_or(SyncError::NoStateDir)?;
        Self::with_state_dir(vcs, config, &state_dir)
    }

    /// Engine keeping its state under `state_dir`.
    pub fn with_state_dir(
        vcs: V,
        config: PatchkeeperConfig,
        state_dir: &Path,
    ) -> Result<Self, SyncError> {
        let paths = StatePaths::for_repo(state_dir, vcs.workdir())?;
        debug!(state_file = %paths.state_file.display(), "sync engine ready");
        Ok(Self {
            vcs,
            config,
            paths,
            phase: std::sync::Mutex::new(SyncPhase::Idle),
        })
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    pub fn config(&self) -> &PatchkeeperConfig {
        &self.config
    }

    pub fn state_path(&self) -> &Path {
        &self.paths.state_file
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_phase(&self, new_phase: SyncPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        info!(from = %*phase, to = %new_phase, "sync phase transition");
        *phase = new_phase;
    }

    /// The blocked sync for this repository, if any.
    pub fn pending_state(&self) -> Result<Option<SyncState>, SyncError> {
        SyncState::load_if_exists(&self.paths.state_file)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.vcs.workdir().join(&self.config.store.manifest_path)
    }

    fn store(&self) -> PatchStore<'_, V> {
        PatchStore::new(&self.vcs, self.config.store.patch_namespace())
    }

    fn cache(&self) -> ResolutionCache<'_, V> {
        ResolutionCache::new(&self.vcs, self.config.store.resolution_namespace())
    }

    // -----------------------------------------------------------------------
    // run
    // -----------------------------------------------------------------------

    /// Rebuild the build branch from the upstream tip and every active patch.
    pub async fn run(&self) -> Result<SyncOutcome, SyncError> {
        if let Some(state) = self.pending_state()? {
            return Err(SyncError::AlreadyInProgress {
                patch: state.blocked_patch,
            });
        }

        self.set_phase(SyncPhase::Fetching);
        self.vcs.fetch(&self.config.upstream.remote).await?;

        self.set_phase(SyncPhase::Filtering);
        let store = self.store();
        let mut names = store.list()?;
        names.sort();
        if names.is_empty() {
            info!("no stored patches, nothing to apply");
            self.set_phase(SyncPhase::Done);
            return Ok(SyncOutcome::Completed(SyncReport::default()));
        }

        let manifest = Manifest::load(self.manifest_path())?;
        let mut progress = Progress::default();
        let mut active = Vec::new();
        for name in names {
            let status = manifest.status(&name);
            if status.is_active() {
                active.push(name);
            } else {
                warn!(patch = %name, %status, "skipping inactive patch");
                progress.skipped.push(name);
            }
        }
        if active.is_empty() {
            info!(skipped = progress.skipped.len(), "no active patches, nothing to apply");
            self.set_phase(SyncPhase::Done);
            return Ok(SyncOutcome::Completed(progress.into_report()));
        }

        self.set_phase(SyncPhase::Ordering);
        let graph = DependencyGraph::build(&active, &manifest);
        debug!(patches = graph.len(), "sorting dependency graph");
        let order = graph.topological_sort()?;
        info!(order = ?order, "patch order");
        let queue = self.read_bodies(&order)?;

        progress.original_branch = self.vcs.current_branch()?;
        let upstream_tip = self.vcs.resolve_commit(&self.config.upstream.tip_rev())?;
        progress.upstream_tip = Some(upstream_tip.clone());

        let cache = self.cache();
        cache.snapshot_local(&self.paths.saved_cache)?;
        if let Err(e) = cache
            .prepare_shared(self.config.resolution_fetch_remote())
            .await
        {
            self.restore_cache_after_failure();
            return Err(e.into());
        }

        self.reset_and_apply(&upstream_tip, queue, progress)
            .await
            .map_err(|e| {
                self.restore_cache_after_failure();
                e
            })
    }

    async fn reset_and_apply(
        &self,
        upstream_tip: &str,
        queue: Vec<(String, PatchBody)>,
        progress: Progress,
    ) -> Result<SyncOutcome, SyncError> {
        self.reset_build_branch(upstream_tip)?;
        self.apply_queue(queue, progress).await
    }

    /// Parse every body up front so a malformed patch stops the sync before
    /// anything is reset.
    fn read_bodies(&self, names: &[String]) -> Result<Vec<(String, PatchBody)>, SyncError> {
        let store = self.store();
        let mut queue = Vec::with_capacity(names.len());
        for name in names {
            queue.push((name.clone(), store.read_body(name)?));
        }
        Ok(queue)
    }

    fn reset_build_branch(&self, upstream_tip: &str) -> Result<(), SyncError> {
        self.set_phase(SyncPhase::Resetting);
        let workdir = self.vcs.workdir();
        fs_util::ensure_git_excluded(self.vcs.git_dir(), &self.config.build.exclude_paths)?;
        let held = HeldPaths::hold(workdir, &self.config.build.exclude_paths)?;
        self.vcs.reset_branch(&self.config.build.branch, upstream_tip)?;
        held.restore(workdir)?;
        info!(branch = %self.config.build.branch, upstream = %upstream_tip, "build branch reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // apply loop
    // -----------------------------------------------------------------------

    async fn apply_queue(
        &self,
        queue: Vec<(String, PatchBody)>,
        mut progress: Progress,
    ) -> Result<SyncOutcome, SyncError> {
        let cache = self.cache();
        let names: Vec<String> = queue.iter().map(|(n, _)| n.clone()).collect();

        for (i, (name, body)) in queue.into_iter().enumerate() {
            self.set_phase(SyncPhase::Applying(progress.applied));
            let snapshot = cache.local_ids()?;

            if !self.vcs.apply_three_way(&body.diff).await? {
                self.vcs.replay_resolutions().await?;
                let conflicted = self.vcs.conflicted_files().await?;
                let unresolved = self.files_with_markers(&conflicted)?;

                if conflicted.is_empty() || !unresolved.is_empty() {
                    let remaining = names[i + 1..].to_vec();
                    return self.block(name, body.message, remaining, conflicted, snapshot, progress);
                }
                info!(patch = %name, files = ?conflicted, "conflicts cleared by shared resolutions");
                progress.auto_resolved.push(name.clone());
            }

            self.vcs.stage_all().await?;
            let sha = self.vcs.commit(&body.message)?;
            progress.applied += 1;
            info!(patch = %name, commit = %sha, "applied patch");
            cache.capture_new_entries(&snapshot)?;
        }

        self.finish(progress).await
    }

    fn files_with_markers(&self, files: &[String]) -> Result<Vec<String>, SyncError> {
        let workdir = self.vcs.workdir();
        let mut marked = Vec::new();
        for file in files {
            if fs_util::has_conflict_markers(&workdir.join(file))? {
                marked.push(file.clone());
            }
        }
        Ok(marked)
    }

    fn block(
        &self,
        patch: String,
        message: String,
        remaining: Vec<String>,
        conflicted_files: Vec<String>,
        snapshot: Vec<String>,
        progress: Progress,
    ) -> Result<SyncOutcome, SyncError> {
        let now = Utc::now();
        let mut state = SyncState {
            schema_version: SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
            repo_path: self.vcs.workdir().to_path_buf(),
            blocked_patch: patch.clone(),
            remaining: remaining.clone(),
            pending_message: message,
            original_branch: progress.original_branch,
            applied: progress.applied,
            resolution_snapshot: snapshot,
            saved_resolution_cache: self.paths.saved_cache.clone(),
            upstream_tip: progress.upstream_tip,
            conflicted_files: conflicted_files.clone(),
            skipped: progress.skipped,
            auto_resolved: progress.auto_resolved,
        };
        state.save(&self.paths.state_file)?;
        self.set_phase(SyncPhase::Blocked);
        warn!(patch = %patch, remaining = remaining.len(), files = ?conflicted_files, "sync blocked on conflict");

        Ok(SyncOutcome::Blocked(BlockedReport {
            patch,
            remaining,
            applied: state.applied,
            conflicted_files,
            state_path: self.paths.state_file.clone(),
        }))
    }

    async fn finish(&self, progress: Progress) -> Result<SyncOutcome, SyncError> {
        let cache = self.cache();
        cache.restore_local(&self.paths.saved_cache)?;
        SyncState::delete(&self.paths.state_file)?;

        if self.config.share.push_resolutions {
            let remote = self.config.share_remote();
            cache.push(remote).await?;
            info!(remote, "pushed shared resolutions");
        }

        self.set_phase(SyncPhase::Done);
        info!(
            applied = progress.applied,
            skipped = progress.skipped.len(),
            "sync completed"
        );
        Ok(SyncOutcome::Completed(progress.into_report()))
    }

    fn restore_cache_after_failure(&self) {
        if let Err(e) = self.cache().restore_local(&self.paths.saved_cache) {
            warn!(error = %e, "could not restore local rr-cache");
        }
        self.set_phase(SyncPhase::Idle);
    }

    // -----------------------------------------------------------------------
    // resume / abort
    // -----------------------------------------------------------------------

    /// Commit the manually resolved patch and continue with the rest.
    pub async fn resume(&self) -> Result<SyncOutcome, SyncError> {
        let state = self.pending_state()?.ok_or(SyncError::NoSyncInProgress)?;
        info!(patch = %state.blocked_patch, "resuming sync");
        self.set_phase(SyncPhase::Applying(state.applied));

        self.vcs.replay_resolutions().await?;

        let mut check = state.conflicted_files.clone();
        for file in self.vcs.conflicted_files().await? {
            if !check.contains(&file) {
                check.push(file);
            }
        }
        let unresolved = self.files_with_markers(&check)?;
        if !unresolved.is_empty() {
            self.set_phase(SyncPhase::Blocked);
            return Err(SyncError::UnresolvedConflicts { files: unresolved });
        }

        let queue = self.read_bodies(&state.remaining)?;

        self.vcs.stage_all().await?;
        if self.vcs.has_staged_changes()? {
            let sha = self.vcs.commit(&state.pending_message)?;
            info!(patch = %state.blocked_patch, commit = %sha, "committed resolved patch");
        } else {
            info!(patch = %state.blocked_patch, "nothing staged, treating patch as already committed");
        }

        self.cache().capture_new_entries(&state.resolution_snapshot)?;
        SyncState::delete(&self.paths.state_file)?;

        let progress = Progress {
            applied: state.applied + 1,
            skipped: state.skipped,
            auto_resolved: state.auto_resolved,
            upstream_tip: state.upstream_tip,
            original_branch: state.original_branch,
        };
        self.apply_queue(queue, progress).await.map_err(|e| {
            self.restore_cache_after_failure();
            e
        })
    }

    /// Discard the blocked sync: reset the work tree, return to the original
    /// branch, restore the operator's rr-cache. Returns the discarded state.
    pub async fn abort(&self) -> Result<SyncState, SyncError> {
        let state = self.pending_state()?.ok_or(SyncError::NoSyncInProgress)?;
        warn!(patch = %state.blocked_patch, "aborting sync");

        self.vcs.hard_reset()?;
        if let Some(branch) = &state.original_branch {
            if *branch != self.config.build.branch {
                self.vcs.checkout_branch(branch)?;
            }
        }
        self.cache().restore_local(&state.saved_resolution_cache)?;
        SyncState::delete(&self.paths.state_file)?;

        self.set_phase(SyncPhase::Idle);
        Ok(state)
    }
}
