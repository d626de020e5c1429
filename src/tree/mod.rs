//! In-memory staging tree.
//!
//! A [`StagingTree`] maps tree-relative paths to file content or to a
//! [`SymlinkRecord`]. File bytes stay on disk (spilled by the extractor or
//! referenced in place for directory sources); the tree only records where
//! they live. Directories are implicit: a path is a directory exactly when
//! some entry lies beneath it.

pub mod materialize;
pub mod path;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, Result};
use crate::fsutil::sha256_file;

pub use materialize::{host_supports_symlinks, read_sidecar, LinkMode, MaterializeReport, SIDECAR};

/// Maximum symlink hops followed while resolving a path.
const MAX_LINK_HOPS: usize = 40;

/// A symbolic link captured as a relative offset.
///
/// `path` is where the link lives in the tree; `target` is the link text,
/// interpreted relative to the link's own directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymlinkRecord {
    pub path: String,
    pub target: String,
}

impl SymlinkRecord {
    pub fn new(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: target.into(),
        }
    }

    /// The tree path the link text names, without following further links.
    /// `None` when the text climbs above the tree root.
    pub fn lexical_target(&self) -> Option<String> {
        path::resolve_from(path::parent(&self.path), &self.target)
    }
}

/// Where a regular file's bytes live and how it should be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub source: PathBuf,
    pub size: u64,
    pub executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File(FileContent),
    /// Link text, relative to the link's directory.
    Symlink(String),
}

impl Entry {
    fn describe(&self) -> String {
        match self {
            Entry::File(f) => format!(
                "file {} ({} bytes{})",
                f.source.display(),
                f.size,
                if f.executable { ", executable" } else { "" }
            ),
            Entry::Symlink(target) => format!("symlink -> {target}"),
        }
    }
}

/// A path after following every symlink along the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingTree {
    entries: BTreeMap<String, Entry>,
}

impl StagingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in sorted path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn links(&self) -> Vec<SymlinkRecord> {
        self.entries
            .iter()
            .filter_map(|(p, e)| match e {
                Entry::Symlink(target) => Some(SymlinkRecord::new(p.clone(), target.clone())),
                Entry::File(_) => None,
            })
            .collect()
    }

    /// Total bytes of regular file content.
    pub fn file_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|e| match e {
                Entry::File(f) => f.size,
                Entry::Symlink(_) => 0,
            })
            .sum()
    }

    /// Every implicit directory, sorted.
    pub fn directories(&self) -> Vec<String> {
        let mut dirs = std::collections::BTreeSet::new();
        for p in self.entries.keys() {
            let mut cur = path::parent(p);
            while !cur.is_empty() && dirs.insert(cur.to_string()) {
                cur = path::parent(cur);
            }
        }
        dirs.into_iter().collect()
    }

    pub fn is_dir(&self, dir: &str) -> bool {
        if dir.is_empty() {
            return true;
        }
        let prefix = format!("{dir}/");
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    pub fn insert_file(&mut self, raw_path: &str, content: FileContent) -> Result<()> {
        self.insert(raw_path, Entry::File(content))
    }

    pub fn insert_link(&mut self, raw_path: &str, target: &str) -> Result<()> {
        self.insert(raw_path, Entry::Symlink(target.to_string()))
    }

    /// Insert an entry, refusing to shadow anything.
    ///
    /// Re-inserting identical content is a no-op. Different content at the
    /// same path, a file where a directory is implied (or the reverse), and
    /// an entry beneath a file or symlink are all [`BundleError::Conflict`].
    pub fn insert(&mut self, raw_path: &str, entry: Entry) -> Result<()> {
        let p = path::normalize(raw_path).map_err(BundleError::Config)?;
        if p.is_empty() {
            return Err(BundleError::Config(format!(
                "entry '{raw_path}' names the tree root"
            )));
        }

        let mut ancestor = path::parent(&p);
        while !ancestor.is_empty() {
            if let Some(existing) = self.entries.get(ancestor) {
                return Err(BundleError::Conflict {
                    path: p.clone(),
                    first: format!("'{ancestor}' is a {}", existing.describe()),
                    second: "an entry beneath it".to_string(),
                });
            }
            ancestor = path::parent(ancestor);
        }

        if self.is_dir(&p) {
            return Err(BundleError::Conflict {
                path: p,
                first: "a directory".to_string(),
                second: entry.describe(),
            });
        }

        match self.entries.get(&p) {
            None => {
                self.entries.insert(p, entry);
                Ok(())
            }
            Some(existing) if same_content(existing, &entry)? => Ok(()),
            Some(existing) => Err(BundleError::Conflict {
                path: p,
                first: existing.describe(),
                second: entry.describe(),
            }),
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Entry) -> bool) {
        self.entries.retain(|k, v| keep(k, v));
    }

    /// Follow `raw_path` through every symlink component, including the last.
    ///
    /// Returns `None` when the path (or a link along it) leads nowhere
    /// inside this tree, climbs above the root, or loops.
    pub fn resolve(&self, raw_path: &str) -> Option<Resolved> {
        let mut pending: Vec<String> = raw_path
            .split('/')
            .rev()
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let mut current: Vec<String> = Vec::new();
        let mut hops = 0usize;

        while let Some(comp) = pending.pop() {
            match comp.as_str() {
                "." => continue,
                ".." => {
                    current.pop()?;
                    continue;
                }
                _ => {}
            }
            current.push(comp);
            let joined = current.join("/");
            match self.entries.get(&joined) {
                Some(Entry::Symlink(target)) => {
                    hops += 1;
                    if hops > MAX_LINK_HOPS {
                        return None;
                    }
                    current.pop();
                    if target.starts_with('/') {
                        current.clear();
                    }
                    pending.extend(
                        target
                            .split('/')
                            .rev()
                            .filter(|c| !c.is_empty())
                            .map(str::to_string),
                    );
                }
                Some(Entry::File(_)) => {
                    if !pending.is_empty() {
                        return None;
                    }
                }
                None => {
                    if !self.is_dir(&joined) {
                        return None;
                    }
                }
            }
        }

        let path = current.join("/");
        let is_dir = !matches!(self.entries.get(&path), Some(Entry::File(_)));
        Some(Resolved { path, is_dir })
    }

    /// Check that every symlink resolves to something in this tree.
    pub fn validate_links(&self) -> Result<()> {
        for link in self.links() {
            if self.resolve(&link.path).is_none() {
                return Err(BundleError::DanglingLink {
                    reason: "target not found in tree".to_string(),
                    link: link.path,
                    target: link.target,
                });
            }
        }
        Ok(())
    }

    /// Take the directory at `dir`, re-rooted at its own top.
    ///
    /// `dir` is resolved through symlinks first, so an indirection link
    /// such as `lib/python3 -> python3.10` selects the real versioned
    /// directory's contents. Returns `None` if `dir` is not a directory.
    pub fn subtree(&self, dir: &str) -> Option<StagingTree> {
        let resolved = self.resolve(dir)?;
        if !resolved.is_dir {
            return None;
        }
        let mut out = StagingTree::new();
        for (p, e) in &self.entries {
            if let Some(rel) = path::strip_dir(p, &resolved.path) {
                if !rel.is_empty() {
                    out.entries.insert(rel.to_string(), e.clone());
                }
            }
        }
        Some(out)
    }

    /// Consume the tree, yielding its entries in sorted order.
    pub fn into_entries(self) -> impl Iterator<Item = (String, Entry)> {
        self.entries.into_iter()
    }
}

fn same_content(a: &Entry, b: &Entry) -> Result<bool> {
    match (a, b) {
        (Entry::Symlink(x), Entry::Symlink(y)) => Ok(x == y),
        (Entry::File(x), Entry::File(y)) => {
            if x.size != y.size || x.executable != y.executable {
                return Ok(false);
            }
            if x.source == y.source {
                return Ok(true);
            }
            Ok(sha256_file(&x.source)?.0 == sha256_file(&y.source)?.0)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Write `bytes` under `dir` and return a content record for it.
    pub(crate) fn blob(dir: &Path, name: &str, bytes: &[u8], executable: bool) -> FileContent {
        let source = dir.join(name);
        if let Some(parent) = source.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&source, bytes).unwrap();
        FileContent {
            source,
            size: bytes.len() as u64,
            executable,
        }
    }

    #[test]
    fn directories_are_implicit() {
        let temp = TempDir::new().unwrap();
        let mut tree = StagingTree::new();
        tree.insert_file("bin/lldb", blob(temp.path(), "a", b"x", true))
            .unwrap();
        assert!(tree.is_dir("bin"));
        assert!(tree.is_dir(""));
        assert!(!tree.is_dir("bin/lldb"));
        assert_eq!(tree.directories(), vec!["bin".to_string()]);
    }

    #[test]
    fn insert_rejects_different_content_at_same_path() {
        let temp = TempDir::new().unwrap();
        let mut tree = StagingTree::new();
        tree.insert_file("bin/tool", blob(temp.path(), "a", b"one", true))
            .unwrap();
        let err = tree
            .insert_file("bin/tool", blob(temp.path(), "b", b"two", true))
            .unwrap_err();
        assert!(matches!(err, BundleError::Conflict { ref path, .. } if path == "bin/tool"));
    }

    #[test]
    fn insert_accepts_identical_content_twice() {
        let temp = TempDir::new().unwrap();
        let mut tree = StagingTree::new();
        tree.insert_file("a", blob(temp.path(), "a", b"same", false))
            .unwrap();
        tree.insert_file("a", blob(temp.path(), "b", b"same", false))
            .unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn insert_rejects_entry_beneath_symlink() {
        let mut tree = StagingTree::new();
        tree.insert_link("lib/python3", "python3.10").unwrap();
        let err = tree.insert_link("lib/python3/x", "y").unwrap_err();
        assert!(matches!(err, BundleError::Conflict { .. }));
    }

    #[test]
    fn resolve_follows_directory_links_and_chains() {
        let temp = TempDir::new().unwrap();
        let mut tree = StagingTree::new();
        tree.insert_file("lib/python3.10/os.py", blob(temp.path(), "os", b"os", false))
            .unwrap();
        tree.insert_link("lib/python3", "python3.10").unwrap();
        tree.insert_link("bin/os", "../lib/python3/os.py").unwrap();
        tree.insert_link("abs", "/lib/python3").unwrap();

        let r = tree.resolve("bin/os").unwrap();
        assert_eq!(r.path, "lib/python3.10/os.py");
        assert!(!r.is_dir);
        let r = tree.resolve("abs").unwrap();
        assert_eq!(r.path, "lib/python3.10");
        assert!(r.is_dir);
        assert!(tree.validate_links().is_ok());
    }

    #[test]
    fn resolve_detects_loops_and_escapes() {
        let mut tree = StagingTree::new();
        tree.insert_link("a", "b").unwrap();
        tree.insert_link("b", "a").unwrap();
        tree.insert_link("up", "../outside").unwrap();
        assert!(tree.resolve("a").is_none());
        assert!(tree.resolve("up").is_none());
        assert!(matches!(
            tree.validate_links(),
            Err(BundleError::DanglingLink { .. })
        ));
    }

    #[test]
    fn subtree_prefers_real_directory_behind_indirection_link() {
        let temp = TempDir::new().unwrap();
        let mut tree = StagingTree::new();
        tree.insert_file(
            "usr/lib/llvm-15/lib/python3.10/site-packages/lldb/__init__.py",
            blob(temp.path(), "init", b"import x", false),
        )
        .unwrap();
        tree.insert_link(
            "usr/lib/python3/dist-packages/lldb",
            "../../llvm-15/lib/python3.10/site-packages/lldb",
        )
        .unwrap();

        let sub = tree.subtree("usr/lib/python3/dist-packages/lldb").unwrap();
        assert_eq!(sub.len(), 1);
        assert!(sub.get("__init__.py").is_some());
        assert!(tree.subtree("usr/lib/missing").is_none());
    }
}
