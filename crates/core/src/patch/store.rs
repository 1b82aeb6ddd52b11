//! Patch bodies stored as git blobs behind `<namespace>/<name>` references.

use tracing::{debug, info};

use super::format::{self, PatchBody};
use crate::errors::{GitError, PatchError};
use crate::git::Vcs;

/// Named patch storage inside the repository's object database.
pub struct PatchStore<'a, V: Vcs + ?Sized> {
    vcs: &'a V,
    namespace: String,
}

impl<'a, V: Vcs + ?Sized> PatchStore<'a, V> {
    pub fn new(vcs: &'a V, namespace: impl Into<String>) -> Self {
        Self {
            vcs,
            namespace: namespace.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn ref_name(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, name)
    }

    /// Write `content` as a blob and point `name` at it, replacing any
    /// previous body. Returns the blob id.
    pub fn store(&self, name: &str, content: &str) -> Result<String, PatchError> {
        format::validate_name(name)?;
        let blob = self.vcs.write_blob(content.as_bytes())?;
        self.vcs.set_reference(&self.ref_name(name), &blob)?;
        info!(patch = name, blob = %blob, "stored patch");
        Ok(blob)
    }

    /// Raw body of `name`.
    pub fn read(&self, name: &str) -> Result<String, PatchError> {
        let blob = self
            .vcs
            .find_reference(&self.ref_name(name))?
            .ok_or_else(|| PatchError::NotFound(name.to_string()))?;
        let bytes = self.vcs.read_blob(&blob)?;
        String::from_utf8(bytes).map_err(|_| PatchError::InvalidEncoding(name.to_string()))
    }

    /// Parsed body of `name`.
    pub fn read_body(&self, name: &str) -> Result<PatchBody, PatchError> {
        let content = self.read(name)?;
        PatchBody::parse(name, &content)
    }

    pub fn exists(&self, name: &str) -> Result<bool, PatchError> {
        Ok(self.vcs.find_reference(&self.ref_name(name))?.is_some())
    }

    /// Names of every stored patch, in no particular order.
    pub fn list(&self) -> Result<Vec<String>, PatchError> {
        let prefix = format!("{}/", self.namespace);
        let names = self
            .vcs
            .list_references(&self.namespace)?
            .into_iter()
            .filter_map(|full| full.strip_prefix(&prefix).map(str::to_string))
            .collect();
        Ok(names)
    }

    /// Remove the reference for `name`. The blob is left to git's gc.
    pub fn delete(&self, name: &str) -> Result<(), PatchError> {
        match self.vcs.delete_reference(&self.ref_name(name)) {
            Ok(()) => {
                info!(patch = name, "deleted patch");
                Ok(())
            }
            Err(GitError::RefNotFound(_)) => Err(PatchError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// One past the highest numeric prefix in the store, 1 when empty.
    pub fn next_number(&self) -> Result<u32, PatchError> {
        let max = self
            .list()?
            .iter()
            .filter_map(|name| format::number_prefix(name))
            .max()
            .unwrap_or(0);
        max.checked_add(1).ok_or(PatchError::NumberOverflow(max))
    }

    /// Overwrite the remote namespace with the local one.
    pub async fn push(&self, remote: &str) -> Result<(), PatchError> {
        self.vcs.push_namespace(remote, &self.namespace).await?;
        debug!(remote, namespace = %self.namespace, "pushed patches");
        Ok(())
    }

    /// Overwrite the local namespace with the remote one.
    pub async fn fetch(&self, remote: &str) -> Result<(), PatchError> {
        self.vcs.fetch_namespace(remote, &self.namespace).await?;
        debug!(remote, namespace = %self.namespace, "fetched patches");
        Ok(())
    }
}
