//! Rebuilding the build branch: upstream tip plus every active patch.

pub mod engine;
pub mod state;

pub use engine::SyncEngine;
pub use state::{StatePaths, SyncState};
