//! Domain model types used throughout patchkeeper.
//!
//! These types bridge the manifest, the sync engine, and the CLI.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Patch status
// ---------------------------------------------------------------------------

/// Lifecycle status of a stored patch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    /// Applied on every sync.
    #[default]
    Active,
    /// Landed upstream; kept in the store but never applied.
    Merged,
    /// Given up on; kept in the store but never applied.
    Abandoned,
}

impl PatchStatus {
    /// Whether the sync engine should apply a patch in this status.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Parse a status string as written in the manifest.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "merged" => Some(Self::Merged),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

impl std::fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Merged => write!(f, "merged"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync state machine
// ---------------------------------------------------------------------------

/// Phases of a single sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Filtering,
    Ordering,
    Resetting,
    /// Applying the patch at this position of the ordered list.
    Applying(usize),
    Blocked,
    Done,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Filtering => write!(f, "filtering"),
            Self::Ordering => write!(f, "ordering"),
            Self::Resetting => write!(f, "resetting"),
            Self::Applying(i) => write!(f, "applying({})", i),
            Self::Blocked => write!(f, "blocked"),
            Self::Done => write!(f, "done"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync outcomes
// ---------------------------------------------------------------------------

/// Result of a sync or resume call that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every active patch is applied to the build branch.
    Completed(SyncReport),
    /// A patch conflicted and state was parked for manual resolution.
    Blocked(BlockedReport),
}

impl SyncOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// Summary of a finished sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Number of patches committed onto the build branch.
    pub applied: usize,
    /// Patches skipped because their status is not active.
    pub skipped: Vec<String>,
    /// Patches whose conflicts were cleared by the resolution cache.
    pub auto_resolved: Vec<String>,
    /// Upstream commit the build branch is rooted at, if a reset happened.
    pub upstream_tip: Option<String>,
}

/// Summary of a sync that stopped on a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedReport {
    /// The patch whose apply conflicted.
    pub patch: String,
    /// Patches not yet attempted, in order.
    pub remaining: Vec<String>,
    /// Patches committed before the block.
    pub applied: usize,
    /// Files holding conflict markers when the sync stopped.
    pub conflicted_files: Vec<String>,
    /// Where the resumable state was written.
    pub state_path: PathBuf,
}

impl BlockedReport {
    /// Operator instructions for getting the sync moving again.
    pub fn next_steps(&self) -> Vec<String> {
        let mut steps = Vec::new();
        if self.conflicted_files.is_empty() {
            steps.push(format!(
                "Patch '{}' could not be applied; apply its changes by hand.",
                self.patch
            ));
        } else {
            steps.push(format!(
                "Resolve the conflict markers left by '{}' in:",
                self.patch
            ));
            for file in &self.conflicted_files {
                steps.push(format!("    {}", file));
            }
        }
        steps.push("Then run `patchkeeper resume` to commit it and continue.".into());
        steps.push(
            "Or run `patchkeeper abort` to reset the working tree and return to your branch."
                .into(),
        );
        steps
    }
}

// ---------------------------------------------------------------------------
// Resolution cache
// ---------------------------------------------------------------------------

/// A shared conflict resolution: the conflicted text and how it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionEntry {
    /// Content hash of the conflict, as named by the resolution mechanism.
    pub hash: String,
    pub preimage: String,
    pub postimage: String,
}
