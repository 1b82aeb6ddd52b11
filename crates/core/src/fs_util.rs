//! Filesystem helpers shared by the sync engine and the resolution cache.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

/// Copy a file or directory tree from `src` to `dest`, creating parents.
pub fn copy_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if meta.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest)?;
    }
    Ok(())
}

/// Remove a file or directory tree; a missing path is not an error.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether a file still carries a merge conflict block: a `<<<<<<<` opener,
/// then a `=======` separator, then a `>>>>>>>` closer. Stray marker-like
/// lines on their own (a setext heading, say) do not count. Missing files and
/// directories have none.
pub fn has_conflict_markers(path: &Path) -> std::io::Result<bool> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.metadata()?.is_dir() {
        return Ok(false);
    }
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut seen = Marker::None;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(false);
        }
        if is_marker(&line, b'<') {
            seen = Marker::Opener;
        } else if seen == Marker::Opener
            && is_marker(&line, b'=')
            && line[7..].iter().all(|b| b.is_ascii_whitespace())
        {
            seen = Marker::Separator;
        } else if seen == Marker::Separator && is_marker(&line, b'>') {
            return Ok(true);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    None,
    Opener,
    Separator,
}

/// Seven `ch` bytes, then end of line or whitespace before a label.
fn is_marker(line: &[u8], ch: u8) -> bool {
    line.len() >= 7
        && line[..7].iter().all(|&b| b == ch)
        && line.get(7).map_or(true, |b| b.is_ascii_whitespace())
}

/// Add anchored patterns for `paths` to `<git_dir>/info/exclude` so staging
/// everything never picks them up. Existing lines are kept.
pub fn ensure_git_excluded(git_dir: &Path, paths: &[String]) -> std::io::Result<()> {
    let info = git_dir.join("info");
    let exclude = info.join("exclude");
    let mut content = match std::fs::read_to_string(&exclude) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let missing: Vec<String> = paths
        .iter()
        .map(|p| format!("/{}", p.trim_start_matches("./").trim_end_matches('/')))
        .filter(|pattern| !content.lines().any(|l| l.trim() == pattern))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for pattern in &missing {
        content.push_str(pattern);
        content.push('\n');
    }
    std::fs::create_dir_all(&info)?;
    std::fs::write(&exclude, content)?;
    debug!(patterns = ?missing, "added local excludes");
    Ok(())
}

/// Copies of work-tree paths held outside the repository while the build
/// branch is reset.
pub struct HeldPaths {
    holding: TempDir,
    saved: Vec<PathBuf>,
}

impl HeldPaths {
    /// Copy every existing `paths` entry (relative to `workdir`) aside.
    pub fn hold(workdir: &Path, paths: &[String]) -> std::io::Result<Self> {
        let holding = tempfile::tempdir()?;
        let mut saved = Vec::new();
        for rel in paths {
            let src = workdir.join(rel);
            if std::fs::symlink_metadata(&src).is_err() {
                continue;
            }
            copy_recursive(&src, &holding.path().join(rel))?;
            saved.push(PathBuf::from(rel));
        }
        debug!(count = saved.len(), "held excluded paths");
        Ok(Self { holding, saved })
    }

    /// Put the held copies back, replacing whatever the reset left there.
    /// The holding area is removed when `self` drops.
    pub fn restore(self, workdir: &Path) -> std::io::Result<()> {
        for rel in &self.saved {
            let dest = workdir.join(rel);
            remove_path(&dest)?;
            copy_recursive(&self.holding.path().join(rel), &dest)?;
        }
        debug!(count = self.saved.len(), "restored excluded paths");
        Ok(())
    }

    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}
