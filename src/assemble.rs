//! Assembly of per-source subtrees into one bundle layout.
//!
//! Each subtree is mounted under a root inside the bundle (`bin`,
//! `python`, ...). Link text is re-expressed from the link's final
//! location: relative text is normalized, and text that is absolute
//! within its subtree is rebased onto the mount root. Upstream links
//! whose offset does not match the published layout are corrected by
//! explicit [`LinkRewrite`]s; nothing is guessed. The result must have
//! every link resolving inside it.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::error::{BundleError, Result};
use crate::target::Target;
use crate::tree::{path, Entry, StagingTree};

/// A subtree and where it goes in the bundle.
#[derive(Debug, Clone)]
pub struct Mount {
    /// Source name, used in conflict reports.
    pub name: String,
    /// Root inside the bundle; empty for the bundle root.
    pub root: String,
    pub tree: StagingTree,
}

/// Point the link at `link` to `target`, both bundle-relative paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRewrite {
    pub link: String,
    pub target: String,
}

/// Link text for a link moved to `final_link`, or `None` when the text
/// climbs above the bundle root from there.
fn rehome(mount_root: &str, final_link: &str, text: &str) -> Option<String> {
    let dir = path::parent(final_link);
    let target = if text.starts_with('/') {
        path::join(mount_root, &path::normalize(text).ok()?)
    } else {
        path::resolve_from(dir, text)?
    };
    Some(path::relative_to(dir, &target))
}

pub fn assemble(target: &Target, mounts: Vec<Mount>, rewrites: &[LinkRewrite]) -> Result<StagingTree> {
    if mounts.is_empty() {
        return Err(BundleError::Config(format!("target {target} has no sources")));
    }

    let mut out = StagingTree::new();
    let mut origin: BTreeMap<String, String> = BTreeMap::new();

    for mount in mounts {
        let root = path::normalize(&mount.root).map_err(|e| {
            BundleError::Config(format!("mount root for source '{}': {e}", mount.name))
        })?;
        debug!(
            "{target}: mounting '{}' at '{}' ({} entries)",
            mount.name,
            if root.is_empty() { "." } else { &root },
            mount.tree.len()
        );
        for (rel, entry) in mount.tree.into_entries() {
            let final_path = path::join(&root, &rel);
            let entry = match entry {
                Entry::Symlink(text) => match rehome(&root, &final_path, &text) {
                    Some(rehomed) => Entry::Symlink(rehomed),
                    // left for rewrites; validation reports it otherwise
                    None => Entry::Symlink(text),
                },
                file => file,
            };
            out.insert(&final_path, entry).map_err(|e| match e {
                BundleError::Conflict {
                    path,
                    first,
                    second,
                } => {
                    let before = origin
                        .iter()
                        .find(|(p, _)| path::is_within(&path, p) || path::is_within(p, &path))
                        .map(|(_, src)| src.as_str())
                        .unwrap_or("an earlier source");
                    BundleError::Conflict {
                        first: format!("{first} (from '{before}')"),
                        second: format!("{second} (from '{}')", mount.name),
                        path,
                    }
                }
                other => other,
            })?;
            origin.entry(final_path).or_insert_with(|| mount.name.clone());
        }
    }

    for rw in rewrites {
        apply_rewrite(&mut out, rw)?;
    }

    out.validate_links()?;
    info!(
        "{target}: assembled {} entries ({} links, {} bytes)",
        out.len(),
        out.links().len(),
        out.file_bytes()
    );
    Ok(out)
}

fn apply_rewrite(tree: &mut StagingTree, rw: &LinkRewrite) -> Result<()> {
    let bad = |why: &str| {
        BundleError::Config(format!(
            "link rewrite '{}' -> '{}': {why}",
            rw.link, rw.target
        ))
    };
    let link = path::normalize(&rw.link).map_err(|e| bad(&e))?;
    let target = path::normalize(&rw.target).map_err(|e| bad(&e))?;
    match tree.get(&link) {
        Some(Entry::Symlink(old)) => {
            let text = path::relative_to(path::parent(&link), &target);
            debug!("rewrite {link}: '{old}' -> '{text}'");
            tree.remove(&link);
            tree.insert_link(&link, &text)
        }
        Some(Entry::File(_)) => Err(bad("path is a regular file, not a symlink")),
        None => Err(bad("no symlink at that path")),
    }
}
