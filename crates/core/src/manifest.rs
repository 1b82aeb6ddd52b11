//! Per-patch metadata, persisted as a JSON object keyed by patch name.
//!
//! Every mutation is validated by a full topological sort over the names the
//! caller knows about (normally the patch store listing). A rejected mutation
//! is reverted in memory and nothing is written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{GraphError, ManifestError};
use crate::graph::DependencyGraph;
use crate::models::PatchStatus;

/// Metadata record for one patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Link to the upstream pull request this patch was proposed as.
    #[serde(rename = "upstreamPR", default, skip_serializing_if = "Option::is_none")]
    pub upstream_pr: Option<String>,

    #[serde(default)]
    pub status: PatchStatus,

    /// Upstream commit the patch was written against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    path: PathBuf,
    patches: BTreeMap<String, PatchMeta>,
}

impl Manifest {
    /// An empty manifest that will be saved to `path`.
    pub fn empty<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            patches: BTreeMap::new(),
        }
    }

    /// Load the manifest at `path`; a missing file yields an empty manifest.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no manifest yet");
            return Ok(Self::empty(path));
        }

        let contents = std::fs::read_to_string(path)?;
        let patches = if contents.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&contents).map_err(|e| ManifestError::ParseError {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?
        };
        Ok(Self {
            path: path.to_path_buf(),
            patches,
        })
    }

    /// Write the manifest to disk atomically (temp file then rename).
    pub fn save(&self) -> Result<(), ManifestError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = self.to_json()?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "saved manifest");
        Ok(())
    }

    /// Serialized form as written by [`Manifest::save`].
    pub fn to_json(&self) -> Result<String, ManifestError> {
        let mut json =
            serde_json::to_string_pretty(&self.patches).map_err(|e| ManifestError::ParseError {
                path: self.path.display().to_string(),
                detail: e.to_string(),
            })?;
        json.push('\n');
        Ok(json)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -- queries ------------------------------------------------------------

    pub fn meta(&self, name: &str) -> Option<&PatchMeta> {
        self.patches.get(name)
    }

    /// Dependencies of `name`, empty when it has no record.
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.patches
            .get(name)
            .map(|m| m.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Status of `name`, active when it has no record.
    pub fn status(&self, name: &str) -> PatchStatus {
        self.patches.get(name).map(|m| m.status).unwrap_or_default()
    }

    /// Patches that list `name` as a dependency.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.patches
            .iter()
            .filter(|(_, meta)| meta.dependencies.iter().any(|d| d == name))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Names with a record, sorted.
    pub fn names(&self) -> Vec<String> {
        self.patches.keys().cloned().collect()
    }

    /// Sort `names` with their recorded dependencies.
    pub fn validate<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>, GraphError> {
        DependencyGraph::build(names, self).topological_sort()
    }

    // -- mutations ----------------------------------------------------------

    /// Make `name` depend on `dependency`, validate, and persist.
    pub fn add_dependency<S: AsRef<str>>(
        &mut self,
        name: &str,
        dependency: &str,
        known: &[S],
    ) -> Result<(), ManifestError> {
        require_known(name, known)?;
        if name == dependency {
            return Err(GraphError::SelfDependency(name.to_string()).into());
        }
        self.mutate(name, known, |meta| {
            if !meta.dependencies.iter().any(|d| d == dependency) {
                meta.dependencies.push(dependency.to_string());
            }
        })?;
        info!(patch = name, dependency, "added dependency");
        Ok(())
    }

    /// Drop `dependency` from `name`'s list, validate, and persist.
    pub fn remove_dependency<S: AsRef<str>>(
        &mut self,
        name: &str,
        dependency: &str,
        known: &[S],
    ) -> Result<(), ManifestError> {
        require_known(name, known)?;
        self.mutate(name, known, |meta| {
            meta.dependencies.retain(|d| d != dependency);
        })?;
        info!(patch = name, dependency, "removed dependency");
        Ok(())
    }

    pub fn set_status<S: AsRef<str>>(
        &mut self,
        name: &str,
        status: PatchStatus,
        known: &[S],
    ) -> Result<(), ManifestError> {
        require_known(name, known)?;
        self.mutate(name, known, |meta| meta.status = status)?;
        info!(patch = name, %status, "set status");
        Ok(())
    }

    /// Set or clear the upstream pull request link.
    pub fn set_upstream_pr<S: AsRef<str>>(
        &mut self,
        name: &str,
        pr: Option<String>,
        known: &[S],
    ) -> Result<(), ManifestError> {
        require_known(name, known)?;
        self.mutate(name, known, |meta| meta.upstream_pr = pr)?;
        info!(patch = name, "updated upstream PR link");
        Ok(())
    }

    pub fn set_description<S: AsRef<str>>(
        &mut self,
        name: &str,
        description: Option<String>,
        known: &[S],
    ) -> Result<(), ManifestError> {
        require_known(name, known)?;
        self.mutate(name, known, |meta| meta.description = description)
    }

    pub fn set_base_commit<S: AsRef<str>>(
        &mut self,
        name: &str,
        base_commit: Option<String>,
        known: &[S],
    ) -> Result<(), ManifestError> {
        require_known(name, known)?;
        self.mutate(name, known, |meta| meta.base_commit = base_commit)
    }

    /// Remove the record for `name` and persist. Dependents keep their edge
    /// to it; callers check [`Manifest::dependents`] first.
    pub fn remove(&mut self, name: &str) -> Result<Option<PatchMeta>, ManifestError> {
        let removed = self.patches.remove(name);
        if removed.is_some() {
            self.save()?;
            info!(patch = name, "removed manifest record");
        }
        Ok(removed)
    }

    /// Apply `change` to `name`'s record, re-sort `known`, and either persist
    /// or restore the record exactly as it was.
    fn mutate<S, F>(&mut self, name: &str, known: &[S], change: F) -> Result<(), ManifestError>
    where
        S: AsRef<str>,
        F: FnOnce(&mut PatchMeta),
    {
        let previous = self.patches.get(name).cloned();
        change(self.patches.entry(name.to_string()).or_default());

        if let Err(e) = self.validate(known) {
            warn!(patch = name, error = %e, "manifest change rejected, reverting");
            match previous {
                Some(meta) => {
                    self.patches.insert(name.to_string(), meta);
                }
                None => {
                    self.patches.remove(name);
                }
            }
            return Err(e.into());
        }

        self.save()
    }
}

fn require_known<S: AsRef<str>>(name: &str, known: &[S]) -> Result<(), GraphError> {
    if known.iter().any(|k| k.as_ref() == name) {
        Ok(())
    } else {
        Err(GraphError::UnknownPatch(name.to_string()))
    }
}
