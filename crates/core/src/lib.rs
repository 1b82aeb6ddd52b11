//! patchkeeper core library.
//!
//! Keeps a set of local patches on top of an upstream that keeps moving:
//! patches and shared conflict resolutions are stored as git objects under
//! dedicated reference namespaces, ordered by their declared dependencies,
//! and replayed onto a freshly reset build branch by the sync engine.

pub mod config;
pub mod errors;
pub mod fs_util;
pub mod git;
pub mod graph;
pub mod manifest;
pub mod models;
pub mod patch;
pub mod resolution;
pub mod sync;

// Re-exports for convenience.
pub use config::PatchkeeperConfig;
pub use errors::CoreError;
pub use git::{GitClient, Vcs};
pub use graph::DependencyGraph;
pub use manifest::{Manifest, PatchMeta};
pub use models::{PatchStatus, SyncOutcome};
pub use patch::PatchStore;
pub use resolution::ResolutionCache;
pub use sync::SyncEngine;
