//! Writing a staging tree to disk, and reading link sidecars back.
//!
//! Real symlinks are created only when the host can make them. When it
//! cannot (unprivileged Windows, some network filesystems), each link is
//! kept as a [`SymlinkRecord`] in a sidecar file at the tree root so the
//! directory source reader can recover it later.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use log::{debug, warn};

use super::{path, Entry, StagingTree, SymlinkRecord};
use crate::error::{BundleError, IoResultExt, Result};
use crate::fsutil::write_atomic;

/// Sidecar file holding links that were not created as real symlinks.
pub const SIDECAR: &str = ".bundle-symlinks.json";

/// How `materialize` treats symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Create real links when the host supports them.
    Auto,
    /// Never create real links; record every link in the sidecar.
    RecordOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub files: usize,
    pub real_links: usize,
    /// Links carried only as records (also written to [`SIDECAR`]).
    pub recorded_links: Vec<SymlinkRecord>,
}

/// Whether this host can create symlinks, probed once per process.
pub fn host_supports_symlinks() -> bool {
    static CAPABLE: OnceLock<bool> = OnceLock::new();
    *CAPABLE.get_or_init(|| {
        let probe_dir = std::env::temp_dir().join(crate::fsutil::tmp_name("symlink-probe"));
        if fs::create_dir_all(&probe_dir).is_err() {
            return false;
        }
        let ok = create_symlink("target", &probe_dir.join("link"), false).is_ok();
        let _ = fs::remove_dir_all(&probe_dir);
        debug!("host symlink capability: {ok}");
        ok
    })
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path, _is_dir: bool) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &str, link: &Path, is_dir: bool) -> std::io::Result<()> {
    let target = target.replace('/', "\\");
    if is_dir {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_target: &str, _link: &Path, _is_dir: bool) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).at(path)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

impl StagingTree {
    /// Write this tree under `dest`, which must not exist yet.
    pub fn materialize(&self, dest: &Path, mode: LinkMode) -> Result<MaterializeReport> {
        if dest.exists() {
            return Err(BundleError::Io {
                path: dest.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "materialize destination already exists",
                ),
            });
        }
        fs::create_dir_all(dest).at(dest)?;
        for dir in self.directories() {
            let p = dest.join(&dir);
            fs::create_dir_all(&p).at(&p)?;
        }

        let capable = mode == LinkMode::Auto && host_supports_symlinks();
        let mut report = MaterializeReport::default();

        for (rel, entry) in self.iter() {
            let out = dest.join(rel);
            match entry {
                Entry::File(content) => {
                    fs::copy(&content.source, &out).at(&out)?;
                    set_executable(&out, content.executable)?;
                    report.files += 1;
                }
                Entry::Symlink(target) => {
                    let record = SymlinkRecord::new(rel, target.clone());
                    let is_dir = self.resolve(rel).is_some_and(|r| r.is_dir);
                    if capable {
                        match create_symlink(target, &out, is_dir) {
                            Ok(()) => {
                                report.real_links += 1;
                                continue;
                            }
                            Err(e) => warn!(
                                "could not create symlink {} -> {target}: {e}; keeping record",
                                out.display()
                            ),
                        }
                    }
                    report.recorded_links.push(record);
                }
            }
        }

        if !report.recorded_links.is_empty() {
            let sidecar = dest.join(SIDECAR);
            let bytes = serde_json::to_vec_pretty(&report.recorded_links).map_err(|e| {
                BundleError::Io {
                    path: sidecar.clone(),
                    source: std::io::Error::other(e),
                }
            })?;
            write_atomic(&sidecar, &bytes)?;
        }
        Ok(report)
    }
}

/// Link records from a sidecar at `root`, or none if there is no sidecar.
pub fn read_sidecar(root: &Path) -> Result<Vec<SymlinkRecord>> {
    let sidecar = root.join(SIDECAR);
    if !sidecar.is_file() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(&sidecar).at(&sidecar)?;
    let records: Vec<SymlinkRecord> =
        serde_json::from_slice(&bytes).map_err(|e| BundleError::Extract {
            archive: sidecar.clone(),
            entry: String::new(),
            reason: format!("malformed symlink sidecar: {e}"),
        })?;
    for r in &records {
        if path::normalize(&r.path).ok().as_deref() != Some(r.path.as_str()) {
            return Err(BundleError::Extract {
                archive: sidecar,
                entry: r.path.clone(),
                reason: "sidecar link path is not a normalized tree path".to_string(),
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::blob;
    use tempfile::TempDir;

    fn sample(temp: &Path) -> StagingTree {
        let mut tree = StagingTree::new();
        tree.insert_file("lib/liblldb.so.21", blob(temp, "so", b"ELF", false))
            .unwrap();
        tree.insert_file("bin/lldb", blob(temp, "lldb", b"ELF-bin", true))
            .unwrap();
        tree.insert_link("lib/liblldb.so", "liblldb.so.21").unwrap();
        tree
    }

    #[test]
    fn record_only_mode_writes_sidecar() {
        let temp = TempDir::new().unwrap();
        let tree = sample(&temp.path().join("blobs"));
        let dest = temp.path().join("out");

        let report = tree.materialize(&dest, LinkMode::RecordOnly).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.real_links, 0);
        assert_eq!(
            report.recorded_links,
            vec![SymlinkRecord::new("lib/liblldb.so", "liblldb.so.21")]
        );
        assert!(!dest.join("lib/liblldb.so").exists());
        assert_eq!(read_sidecar(&dest).unwrap(), report.recorded_links);
    }

    #[cfg(unix)]
    #[test]
    fn auto_mode_creates_real_links_on_unix() {
        let temp = TempDir::new().unwrap();
        let tree = sample(&temp.path().join("blobs"));
        let dest = temp.path().join("out");

        let report = tree.materialize(&dest, LinkMode::Auto).unwrap();
        assert_eq!(report.real_links, 1);
        assert!(report.recorded_links.is_empty());
        assert_eq!(
            fs::read_link(dest.join("lib/liblldb.so")).unwrap(),
            Path::new("liblldb.so.21")
        );
        assert_eq!(fs::read(dest.join("lib/liblldb.so")).unwrap(), b"ELF");
        assert!(!dest.join(SIDECAR).exists());
    }

    #[test]
    fn refuses_existing_destination() {
        let temp = TempDir::new().unwrap();
        let tree = StagingTree::new();
        assert!(tree.materialize(temp.path(), LinkMode::Auto).is_err());
    }
}
