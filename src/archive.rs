//! Deterministic `tar.zst` bundles.
//!
//! Entries are written in sorted path order with directories made
//! explicit. Header metadata is normalized: mtime 0, uid/gid 0, no owner
//! names, mode 0755 for directories and executables, 0644 for other
//! files, 0777 for links. Links are written as link entries. The same
//! tree and level therefore always produce the same bytes.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::TargetContext;
use crate::error::{BundleError, IoResultExt, Result};
use crate::fsutil::{atomic_rename, sha256_file, tmp_name, HashingWriter};
use crate::target::Target;
use crate::tree::{Entry, FileContent, StagingTree};

/// zstd effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    /// For local iteration and tests.
    Fast,
    /// For publication.
    Max,
    Level(i32),
}

impl CompressionLevel {
    pub fn zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fast => 3,
            CompressionLevel::Max => 19,
            CompressionLevel::Level(n) => n,
        }
    }

    pub fn new(level: i32) -> Result<Self> {
        if (1..=22).contains(&level) {
            Ok(CompressionLevel::Level(level))
        } else {
            Err(BundleError::Config(format!(
                "compression level {level} is outside 1..=22"
            )))
        }
    }
}

/// A built bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Path of the archive relative to the manifest's directory.
    pub relative_path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub compression_level: i32,
    pub target: Target,
}

/// Write `tree` as `<out_dir>/<file_name>`.
///
/// The archive is written under a temporary name in `out_dir` and renamed
/// into place once complete. The returned asset's `relative_path` is the
/// bare file name.
pub fn build(
    tree: &StagingTree,
    level: CompressionLevel,
    target: &Target,
    out_dir: &Path,
    file_name: &str,
) -> Result<Asset> {
    build_checked(tree, level, target, out_dir, file_name, &|| Ok(()))
}

/// Like [`build`], checking `ctx` before every entry so a cancelled or
/// expired target stops mid-archive instead of after it.
pub fn build_within(
    tree: &StagingTree,
    level: CompressionLevel,
    ctx: &TargetContext,
    out_dir: &Path,
    file_name: &str,
) -> Result<Asset> {
    build_checked(tree, level, &ctx.target, out_dir, file_name, &|| {
        ctx.checkpoint("building")
    })
}

fn build_checked(
    tree: &StagingTree,
    level: CompressionLevel,
    target: &Target,
    out_dir: &Path,
    file_name: &str,
    checkpoint: &dyn Fn() -> Result<()>,
) -> Result<Asset> {
    fs::create_dir_all(out_dir).at(out_dir)?;
    let out_path = out_dir.join(file_name);
    let tmp = out_dir.join(tmp_name(file_name));

    let written = write_tar_zst(tree, level, &tmp, checkpoint);
    let (sha256, size_bytes) = match written {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };
    atomic_rename(&tmp, &out_path)?;

    info!(
        "[bundle:{target}] wrote {} ({size_bytes} bytes, zstd -{}, sha256 {sha256})",
        out_path.display(),
        level.zstd_level()
    );
    Ok(Asset {
        relative_path: file_name.to_string(),
        size_bytes,
        sha256,
        compression_level: level.zstd_level(),
        target: target.clone(),
    })
}

fn write_tar_zst(
    tree: &StagingTree,
    level: CompressionLevel,
    out: &Path,
    checkpoint: &dyn Fn() -> Result<()>,
) -> Result<(String, u64)> {
    let file = File::create(out).at(out)?;
    let hashing = HashingWriter::new(BufWriter::new(file));
    let mut encoder = zstd::stream::Encoder::new(hashing, level.zstd_level()).at(out)?;
    encoder.include_checksum(true).at(out)?;
    let mut builder = ::tar::Builder::new(encoder);

    // Directories sort before their contents since a path sorts before any
    // of its extensions.
    let mut paths: Vec<(String, Option<&Entry>)> = tree
        .directories()
        .into_iter()
        .map(|d| (d, None))
        .chain(tree.iter().map(|(p, e)| (p.to_string(), Some(e))))
        .collect();
    paths.sort_by(|a, b| a.0.cmp(&b.0));

    for (rel, entry) in paths {
        checkpoint()?;
        let mut header = ::tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        match entry {
            None => {
                header.set_entry_type(::tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, &rel, io::empty()).at(out)?;
            }
            Some(Entry::File(content)) => {
                let f = open_checked(content)?;
                header.set_entry_type(::tar::EntryType::Regular);
                header.set_mode(if content.executable { 0o755 } else { 0o644 });
                header.set_size(content.size);
                builder.append_data(&mut header, &rel, f).at(out)?;
            }
            Some(Entry::Symlink(target)) => {
                header.set_entry_type(::tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, &rel, target).at(out)?;
            }
        }
    }

    let encoder = builder.into_inner().at(out)?;
    let hashing = encoder.finish().at(out)?;
    let size = hashing.written();
    let (sha, buf) = hashing.finish();
    let file = buf.into_inner().map_err(|e| e.into_error()).at(out)?;
    file.sync_all().at(out)?;
    Ok((sha, size))
}

/// Open a spilled or in-place source file, refusing one whose size
/// changed since it was recorded.
fn open_checked(content: &FileContent) -> Result<File> {
    let f = File::open(&content.source).at(&content.source)?;
    let len = f.metadata().at(&content.source)?.len();
    if len != content.size {
        return Err(BundleError::Io {
            path: content.source.clone(),
            source: io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file changed size: recorded {}, now {len}", content.size),
            ),
        });
    }
    Ok(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

/// One entry of a built archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    /// Content digest, for files.
    pub sha256: Option<String>,
    /// Link text, for symlinks.
    pub link_target: Option<String>,
}

/// List the entries of a `tar.zst` bundle in archive order.
pub fn read_archive(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let file = File::open(path).at(path)?;
    let decoder = zstd::stream::read::Decoder::new(file).at(path)?;
    let mut ar = ::tar::Archive::new(decoder);
    let mut out = Vec::new();
    for entry in ar.entries().map_err(|e| BundleError::extract(path, "", e))? {
        let mut entry = entry.map_err(|e| BundleError::extract(path, "", e))?;
        let name = String::from_utf8_lossy(&entry.path_bytes())
            .trim_end_matches('/')
            .to_string();
        let header = entry.header();
        let mode = header.mode().map_err(|e| BundleError::extract(path, &name, e))?;
        let kind = header.entry_type();
        let (kind, sha256, link_target) = if kind.is_dir() {
            (EntryKind::Dir, None, None)
        } else if kind.is_symlink() {
            let target = entry
                .link_name_bytes()
                .map(|b| String::from_utf8_lossy(&b).into_owned());
            (EntryKind::Symlink, None, target)
        } else {
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = entry
                    .read(&mut buf)
                    .map_err(|e| BundleError::extract(path, &name, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            (EntryKind::File, Some(format!("{:x}", hasher.finalize())), None)
        };
        out.push(ArchiveEntry {
            size: entry.size(),
            path: name,
            kind,
            mode,
            sha256,
            link_target,
        });
    }
    Ok(out)
}

/// Check a built archive against its asset record and check that every
/// link inside it resolves inside it.
pub fn verify_archive(path: &Path, asset: &Asset) -> Result<Vec<ArchiveEntry>> {
    let (actual, size) = sha256_file(path)?;
    if actual != asset.sha256 || size != asset.size_bytes {
        return Err(BundleError::Verify {
            path: path.to_path_buf(),
            expected: format!("{} ({} bytes)", asset.sha256, asset.size_bytes),
            actual: format!("{actual} ({size} bytes)"),
        });
    }

    let entries = read_archive(path)?;
    let mut listed = StagingTree::new();
    for e in &entries {
        match e.kind {
            EntryKind::Dir => {}
            EntryKind::File => listed.insert_file(
                &e.path,
                FileContent {
                    source: path.to_path_buf(),
                    size: e.size,
                    executable: e.mode & 0o111 != 0,
                },
            )?,
            EntryKind::Symlink => {
                listed.insert_link(&e.path, e.link_target.as_deref().unwrap_or(""))?
            }
        }
    }
    listed.validate_links()?;
    Ok(entries)
}
