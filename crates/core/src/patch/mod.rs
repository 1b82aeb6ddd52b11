//! Patches: the serialized body format, the reference-backed store, and
//! export of local commits into the store.

pub mod export;
pub mod format;
pub mod store;

pub use export::{export_commits, ExportOptions, ExportedPatch};
pub use format::PatchBody;
pub use store::PatchStore;
