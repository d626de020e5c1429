//! Plain directory sources, taken as they are.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use super::{file_entry, insert_entry};
use crate::error::{BundleError, IoResultExt, Result};
use crate::tree::{path, read_sidecar, Entry, StagingTree, SIDECAR};

/// Walk `root` without following links. Links recorded in a sidecar (by a
/// host that could not create them) come back as link entries.
pub(super) fn read_dir(root: &Path) -> Result<StagingTree> {
    if !root.is_dir() {
        return Err(BundleError::extract(root, "", "directory source does not exist"));
    }
    let mut tree = StagingTree::new();

    for e in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let e = e.map_err(|e| BundleError::extract(root, "", e))?;
        let Ok(rel) = e.path().strip_prefix(root) else {
            continue;
        };
        let Some(rel) = rel.to_str() else {
            return Err(BundleError::extract(
                root,
                rel.display().to_string(),
                "path is not valid UTF-8",
            ));
        };
        let rel = rel.replace('\\', "/");
        if rel.is_empty() || rel == SIDECAR {
            continue;
        }

        let ft = e.file_type();
        if ft.is_symlink() {
            let raw = fs::read_link(e.path()).at(e.path())?;
            let target = if raw.is_absolute() {
                let inside = raw.strip_prefix(root).map_err(|_| {
                    BundleError::extract(
                        root,
                        &rel,
                        format!("link points outside the source directory: {}", raw.display()),
                    )
                })?;
                path::relative_to(path::parent(&rel), &inside.to_string_lossy().replace('\\', "/"))
            } else {
                raw.to_string_lossy().replace('\\', "/")
            };
            insert_entry(&mut tree, root, &rel, &rel, Entry::Symlink(target))?;
        } else if ft.is_file() {
            let meta = e.metadata().map_err(|err| BundleError::extract(root, &rel, err))?;
            insert_entry(
                &mut tree,
                root,
                &rel,
                &rel,
                file_entry(e.path().to_path_buf(), meta.len(), is_executable(&meta)),
            )?;
        }
    }

    for record in read_sidecar(root)? {
        insert_entry(
            &mut tree,
            root,
            &record.path,
            &record.path,
            Entry::Symlink(record.target),
        )?;
    }
    Ok(tree)
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}
