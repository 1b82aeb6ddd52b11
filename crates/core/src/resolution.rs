//! Team-shared cache of conflict resolutions.
//!
//! Locally, git's `rerere` keeps `rr-cache/<hash>/{preimage,postimage}` under
//! the git directory. Shared entries live in the object database as trees
//! holding those two blobs, referenced as `<namespace>/<hash>`, so they travel
//! with the same fetch/push as the patches.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{GitError, ResolutionError};
use crate::fs_util;
use crate::git::Vcs;
use crate::models::ResolutionEntry;

const RR_CACHE: &str = "rr-cache";
const PREIMAGE: &str = "preimage";
const POSTIMAGE: &str = "postimage";

pub struct ResolutionCache<'a, V: Vcs + ?Sized> {
    vcs: &'a V,
    namespace: String,
}

impl<'a, V: Vcs + ?Sized> ResolutionCache<'a, V> {
    pub fn new(vcs: &'a V, namespace: impl Into<String>) -> Self {
        Self {
            vcs,
            namespace: namespace.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The local `rr-cache` directory.
    pub fn local_dir(&self) -> PathBuf {
        self.vcs.git_dir().join(RR_CACHE)
    }

    fn ref_name(&self, hash: &str) -> String {
        format!("{}/{}", self.namespace, hash)
    }

    // -- operator's own cache -----------------------------------------------

    /// Copy the local cache to `dest`, replacing anything there. A missing
    /// cache is saved as an empty directory.
    pub fn snapshot_local(&self, dest: &Path) -> Result<(), ResolutionError> {
        fs_util::remove_path(dest)?;
        let local = self.local_dir();
        if local.is_dir() {
            fs_util::copy_recursive(&local, dest)?;
        } else {
            std::fs::create_dir_all(dest)?;
        }
        debug!(dest = %dest.display(), "saved local rr-cache");
        Ok(())
    }

    /// Replace the local cache with the copy at `saved` and remove the copy.
    pub fn restore_local(&self, saved: &Path) -> Result<(), ResolutionError> {
        if !saved.is_dir() {
            warn!(saved = %saved.display(), "no saved rr-cache to restore, leaving current cache");
            return Ok(());
        }
        let local = self.local_dir();
        fs_util::remove_path(&local)?;
        fs_util::copy_recursive(saved, &local)?;
        fs_util::remove_path(saved)?;
        info!("restored local rr-cache");
        Ok(())
    }

    // -- shared cache -------------------------------------------------------

    /// Replace the local cache with the shared entries, optionally fetching
    /// them from `remote` first, and turn `rerere` on. Returns the number of
    /// entries materialized.
    pub async fn prepare_shared(&self, remote: Option<&str>) -> Result<usize, ResolutionError> {
        fs_util::remove_path(&self.local_dir())?;
        if let Some(remote) = remote {
            self.fetch(remote).await?;
        }

        let mut count = 0;
        for hash in self.list()? {
            self.materialize(&hash)?;
            count += 1;
        }
        self.vcs.enable_resolutions()?;
        info!(entries = count, "prepared shared resolutions");
        Ok(count)
    }

    fn materialize(&self, hash: &str) -> Result<(), ResolutionError> {
        let (pre, post) = self.entry_blobs(hash)?;
        let dir = self.local_dir().join(hash);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(PREIMAGE), self.vcs.read_blob(&pre)?)?;
        std::fs::write(dir.join(POSTIMAGE), self.vcs.read_blob(&post)?)?;
        Ok(())
    }

    /// Ids of the entries currently in the local cache, sorted.
    pub fn local_ids(&self) -> Result<Vec<String>, ResolutionError> {
        let local = self.local_dir();
        if !local.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&local)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Share every local entry not in `previous` that has both a preimage
    /// and a postimage. Returns the promoted hashes.
    pub fn capture_new_entries(&self, previous: &[String]) -> Result<Vec<String>, ResolutionError> {
        let previous: HashSet<&str> = previous.iter().map(String::as_str).collect();
        let mut promoted = Vec::new();
        for id in self.local_ids()? {
            if previous.contains(id.as_str()) {
                continue;
            }
            let dir = self.local_dir().join(&id);
            let (pre_path, post_path) = (dir.join(PREIMAGE), dir.join(POSTIMAGE));
            if !pre_path.is_file() || !post_path.is_file() {
                debug!(hash = %id, "resolution not finished, not sharing");
                continue;
            }
            let pre = self.vcs.write_blob(&std::fs::read(&pre_path)?)?;
            let post = self.vcs.write_blob(&std::fs::read(&post_path)?)?;
            let tree = self.vcs.write_tree(&[
                (PREIMAGE.to_string(), pre),
                (POSTIMAGE.to_string(), post),
            ])?;
            self.vcs.set_reference(&self.ref_name(&id), &tree)?;
            info!(hash = %id, "shared new resolution");
            promoted.push(id);
        }
        Ok(promoted)
    }

    /// Hashes of every shared entry, sorted.
    pub fn list(&self) -> Result<Vec<String>, ResolutionError> {
        let prefix = format!("{}/", self.namespace);
        let mut hashes: Vec<String> = self
            .vcs
            .list_references(&self.namespace)?
            .into_iter()
            .filter_map(|full| full.strip_prefix(&prefix).map(str::to_string))
            .collect();
        hashes.sort();
        Ok(hashes)
    }

    /// Full contents of one shared entry.
    pub fn entry(&self, hash: &str) -> Result<ResolutionEntry, ResolutionError> {
        let (pre, post) = self.entry_blobs(hash)?;
        Ok(ResolutionEntry {
            hash: hash.to_string(),
            preimage: String::from_utf8_lossy(&self.vcs.read_blob(&pre)?).into_owned(),
            postimage: String::from_utf8_lossy(&self.vcs.read_blob(&post)?).into_owned(),
        })
    }

    fn entry_blobs(&self, hash: &str) -> Result<(String, String), ResolutionError> {
        let tree = self
            .vcs
            .find_reference(&self.ref_name(hash))?
            .ok_or_else(|| ResolutionError::NotFound(hash.to_string()))?;
        let entries = self
            .vcs
            .read_tree(&tree)
            .map_err(|e| ResolutionError::CorruptEntry {
                hash: hash.to_string(),
                detail: e.to_string(),
            })?;
        let find = |name: &str| {
            entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| id.clone())
                .ok_or_else(|| ResolutionError::CorruptEntry {
                    hash: hash.to_string(),
                    detail: format!("missing {}", name),
                })
        };
        Ok((find(PREIMAGE)?, find(POSTIMAGE)?))
    }

    /// Drop the single shared entry whose hash starts with `prefix`, along
    /// with its local copy. Returns the full hash.
    pub fn forget(&self, prefix: &str) -> Result<String, ResolutionError> {
        let candidates: Vec<String> = self
            .list()?
            .into_iter()
            .filter(|h| h.starts_with(prefix))
            .collect();
        let hash = match candidates.len() {
            0 => return Err(ResolutionError::NotFound(prefix.to_string())),
            1 => candidates[0].clone(),
            _ => {
                return Err(ResolutionError::AmbiguousPrefix {
                    prefix: prefix.to_string(),
                    candidates,
                })
            }
        };

        self.delete_entry(&hash)?;
        fs_util::remove_path(&self.local_dir().join(&hash))?;
        info!(hash = %hash, "forgot resolution");
        Ok(hash)
    }

    /// Drop every shared entry. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, ResolutionError> {
        let hashes = self.list()?;
        for hash in &hashes {
            self.delete_entry(hash)?;
        }
        info!(count = hashes.len(), "cleared shared resolutions");
        Ok(hashes.len())
    }

    fn delete_entry(&self, hash: &str) -> Result<(), ResolutionError> {
        match self.vcs.delete_reference(&self.ref_name(hash)) {
            Ok(()) => Ok(()),
            Err(GitError::RefNotFound(_)) => Err(ResolutionError::NotFound(hash.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn push(&self, remote: &str) -> Result<(), ResolutionError> {
        self.vcs.push_namespace(remote, &self.namespace).await?;
        Ok(())
    }

    pub async fn fetch(&self, remote: &str) -> Result<(), ResolutionError> {
        self.vcs.fetch_namespace(remote, &self.namespace).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitClient;

    const NS: &str = "refs/patchkeeper/rerere";

    fn client() -> (tempfile::TempDir, GitClient) {
        let dir = tempfile::tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let client = GitClient::new(dir.path()).unwrap();
        (dir, client)
    }

    fn write_local(cache: &ResolutionCache<'_, GitClient>, hash: &str, post: bool) {
        let dir = cache.local_dir().join(hash);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(PREIMAGE), format!("<<<<<<<\n{hash}\n>>>>>>>\n")).unwrap();
        if post {
            std::fs::write(dir.join(POSTIMAGE), format!("{hash} resolved\n")).unwrap();
        }
    }

    #[test]
    fn test_capture_only_finished_entries() {
        let (_dir, client) = client();
        let cache = ResolutionCache::new(&client, NS);
        write_local(&cache, "old1", true);
        let before = cache.local_ids().unwrap();

        write_local(&cache, "new1", true);
        write_local(&cache, "half", false);

        let promoted = cache.capture_new_entries(&before).unwrap();
        assert_eq!(promoted, vec!["new1".to_string()]);
        assert_eq!(cache.list().unwrap(), vec!["new1".to_string()]);

        let entry = cache.entry("new1").unwrap();
        assert_eq!(entry.postimage, "new1 resolved\n");
        assert!(entry.preimage.contains("new1"));
    }

    #[tokio::test]
    async fn test_prepare_shared_materializes_entries() {
        let (_dir, client) = client();
        let cache = ResolutionCache::new(&client, NS);
        write_local(&cache, "aaa", true);
        cache.capture_new_entries(&[]).unwrap();
        write_local(&cache, "local-only", true);

        let count = cache.prepare_shared(None).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(cache.local_ids().unwrap(), vec!["aaa".to_string()]);
        assert_eq!(
            std::fs::read_to_string(cache.local_dir().join("aaa").join(POSTIMAGE)).unwrap(),
            "aaa resolved\n"
        );

        let repo = client.open_repo().unwrap();
        assert!(repo.config().unwrap().get_bool("rerere.enabled").unwrap());
    }

    #[test]
    fn test_snapshot_and_restore() {
        let (dir, client) = client();
        let cache = ResolutionCache::new(&client, NS);
        write_local(&cache, "mine", true);

        let saved = dir.path().join("saved-cache");
        cache.snapshot_local(&saved).unwrap();
        fs_util::remove_path(&cache.local_dir()).unwrap();
        write_local(&cache, "shared", true);

        cache.restore_local(&saved).unwrap();
        assert_eq!(cache.local_ids().unwrap(), vec!["mine".to_string()]);
        assert!(!saved.exists());
    }

    #[test]
    fn test_snapshot_of_missing_cache_restores_empty() {
        let (dir, client) = client();
        let cache = ResolutionCache::new(&client, NS);
        let saved = dir.path().join("saved-cache");
        cache.snapshot_local(&saved).unwrap();
        write_local(&cache, "shared", true);

        cache.restore_local(&saved).unwrap();
        assert!(cache.local_ids().unwrap().is_empty());
    }

    #[test]
    fn test_forget_by_prefix() {
        let (_dir, client) = client();
        let cache = ResolutionCache::new(&client, NS);
        for hash in ["abc1", "abd2", "ffe3"] {
            write_local(&cache, hash, true);
        }
        cache.capture_new_entries(&[]).unwrap();

        match cache.forget("ab").unwrap_err() {
            ResolutionError::AmbiguousPrefix { candidates, .. } => {
                assert_eq!(candidates, vec!["abc1".to_string(), "abd2".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            cache.forget("zz"),
            Err(ResolutionError::NotFound(_))
        ));

        assert_eq!(cache.forget("ff").unwrap(), "ffe3");
        assert_eq!(cache.list().unwrap(), vec!["abc1".to_string(), "abd2".to_string()]);
        assert!(!cache.local_dir().join("ffe3").exists());
    }

    #[test]
    fn test_clear_all() {
        let (_dir, client) = client();
        let cache = ResolutionCache::new(&client, NS);
        write_local(&cache, "one", true);
        write_local(&cache, "two", true);
        cache.capture_new_entries(&[]).unwrap();
        assert_eq!(cache.clear_all().unwrap(), 2);
        assert!(cache.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_entry() {
        let (_dir, client) = client();
        let cache = ResolutionCache::new(&client, NS);
        let blob = client.write_blob(b"not a tree").unwrap();
        client.set_reference(&format!("{NS}/bad"), &blob).unwrap();
        assert!(matches!(
            cache.entry("bad"),
            Err(ResolutionError::CorruptEntry { .. })
        ));
    }
}
