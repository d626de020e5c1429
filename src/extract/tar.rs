//! Tar stream reader.

use std::io::Read;
use std::path::Path;

use log::{debug, warn};

use super::{file_entry, insert_entry, ContainerExtractor};
use crate::error::{BundleError, Result};
use crate::tree::{path, Entry, StagingTree};

/// Read a (decompressed) tar stream into a tree.
///
/// `member` names the enclosing container member when the stream is
/// nested (`data.tar.xz` inside a `.deb`) and prefixes entry names in
/// errors.
pub(super) fn read_tar<R: Read>(
    reader: R,
    archive: &Path,
    member: &str,
    ex: &mut ContainerExtractor,
) -> Result<StagingTree> {
    let label = |entry: &str| {
        if member.is_empty() {
            entry.to_string()
        } else {
            format!("{member}/{entry}")
        }
    };

    let mut ar = ::tar::Archive::new(reader);
    let entries = ar
        .entries()
        .map_err(|e| BundleError::extract(archive, member, e))?;

    let mut tree = StagingTree::new();
    let mut hard_links: Vec<(String, String)> = Vec::new();
    let mut last = String::new();

    for entry in entries {
        ex.checkpoint()?;
        let mut entry = entry.map_err(|e| {
            BundleError::extract(
                archive,
                label(&last),
                format!("corrupt or truncated archive after this entry: {e}"),
            )
        })?;

        let raw = String::from_utf8(entry.path_bytes().into_owned()).map_err(|_| {
            BundleError::extract(archive, label(&last), "entry name is not valid UTF-8")
        })?;
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            last = raw;
            continue;
        }
        let rel = path::normalize(&raw).map_err(|e| BundleError::extract(archive, label(&raw), e))?;
        if rel.is_empty() {
            return Err(BundleError::extract(
                archive,
                label(&raw),
                "non-directory entry names the archive root",
            ));
        }

        if kind.is_file() {
            let mode = entry
                .header()
                .mode()
                .map_err(|e| BundleError::extract(archive, label(&rel), e))?;
            let declared = entry.size();
            let (source, size) = ex
                .spill(&mut entry)
                .map_err(|e| BundleError::extract(archive, label(&rel), e))?;
            if size != declared {
                return Err(BundleError::extract(
                    archive,
                    label(&rel),
                    format!("truncated: header declares {declared} bytes, read {size}"),
                ));
            }
            insert_entry(
                &mut tree,
                archive,
                &label(&rel),
                &rel,
                file_entry(source, size, mode & 0o111 != 0),
            )?;
        } else if kind.is_symlink() {
            let target = link_name(&entry, archive, &label(&rel))?;
            let target = if target.starts_with('/') {
                let inside = path::normalize(&target)
                    .map_err(|e| BundleError::extract(archive, label(&rel), e))?;
                path::relative_to(path::parent(&rel), &inside)
            } else {
                target
            };
            insert_entry(&mut tree, archive, &label(&rel), &rel, Entry::Symlink(target))?;
        } else if kind.is_hard_link() {
            let target = link_name(&entry, archive, &label(&rel))?;
            let target = path::normalize(&target)
                .map_err(|e| BundleError::extract(archive, label(&rel), e))?;
            hard_links.push((rel.clone(), target));
        } else if kind.is_character_special() || kind.is_block_special() || kind.is_fifo() {
            warn!("{}: skipping device or fifo entry {rel}", archive.display());
        } else {
            debug!("{}: skipping {:?} entry {rel}", archive.display(), kind);
        }
        last = rel;
    }

    for (link, target) in hard_links {
        match tree.get(&target) {
            Some(Entry::File(content)) => {
                let content = content.clone();
                insert_entry(&mut tree, archive, &label(&link), &link, Entry::File(content))?;
            }
            _ => {
                return Err(BundleError::extract(
                    archive,
                    label(&link),
                    format!("hard link to '{target}', which is not a regular file in the archive"),
                ));
            }
        }
    }

    Ok(tree)
}

fn link_name<R: Read>(entry: &::tar::Entry<'_, R>, archive: &Path, label: &str) -> Result<String> {
    let bytes = entry
        .link_name_bytes()
        .ok_or_else(|| BundleError::extract(archive, label, "link entry without a target"))?;
    let target = String::from_utf8(bytes.into_owned())
        .map_err(|_| BundleError::extract(archive, label, "link target is not valid UTF-8"))?;
    if target.is_empty() {
        return Err(BundleError::extract(archive, label, "link entry with empty target"));
    }
    Ok(target)
}
