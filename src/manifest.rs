//! Published asset manifest.
//!
//! The manifest is one JSON document:
//!
//! ```json
//! { "format_version": 1, "assets": [ { "target": {...}, "relative_path": ..., ... } ] }
//! ```
//!
//! Assets are kept sorted by target so the serialized form does not depend
//! on the order builds finished in. Updates take an exclusive lock on
//! `<manifest>.lock`, re-read the file, replace one record and write the
//! whole document atomically.
//!
//! [`ManifestStore::publish`] moves an asset to its final path and records
//! it under the same lock. The file it replaces is kept as
//! `.<name>.prev` until the manifest write lands, and is put back if it
//! does not.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::archive::Asset;
use crate::error::{BundleError, IoResultExt, Result};
use crate::fsutil::{atomic_rename, sha256_file, write_atomic, FileLock};
use crate::target::Target;

pub const FORMAT_VERSION: u32 = 1;

/// Where a bundle's content came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Provenance {
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetRecord {
    pub target: Target,
    pub relative_path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub compression_level: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<Provenance>,
}

impl AssetRecord {
    pub fn new(asset: &Asset, provenance: Vec<Provenance>) -> Self {
        Self {
            target: asset.target.clone(),
            relative_path: asset.relative_path.clone(),
            size_bytes: asset.size_bytes,
            sha256: asset.sha256.clone(),
            compression_level: asset.compression_level,
            provenance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub format_version: u32,
    pub assets: Vec<AssetRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            assets: Vec::new(),
        }
    }
}

/// What the installer reads for one platform and architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformView {
    pub latest: Option<String>,
    pub versions: BTreeMap<String, VersionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub href: String,
    pub sha256: String,
}

impl Manifest {
    /// Load `path`; a missing file is an empty manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).at(path),
        };
        let bad = |reason: String| BundleError::Manifest {
            path: path.to_path_buf(),
            reason,
        };
        let mut manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|e| bad(e.to_string()))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(bad(format!(
                "unsupported format_version {} (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }
        // Hand-edited files may list assets in any order; the next write
        // puts them back in canonical order.
        manifest.assets.sort_by(|a, b| a.target.cmp(&b.target));
        for pair in manifest.assets.windows(2) {
            if pair[0].target == pair[1].target {
                return Err(bad(format!("duplicate asset for {}", pair[1].target)));
            }
        }
        Ok(manifest)
    }

    /// Canonical serialization: pretty JSON with a trailing newline.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn get(&self, target: &Target) -> Option<&AssetRecord> {
        self.assets
            .binary_search_by(|r| r.target.cmp(target))
            .ok()
            .map(|i| &self.assets[i])
    }

    /// Insert or replace the record for `record.target`.
    pub fn put(&mut self, record: AssetRecord) {
        match self.assets.binary_search_by(|r| r.target.cmp(&record.target)) {
            Ok(i) => self.assets[i] = record,
            Err(i) => self.assets.insert(i, record),
        }
    }

    /// Highest published version for `platform`/`arch`.
    pub fn latest(&self, platform: &str, arch: &str) -> Option<&AssetRecord> {
        self.assets
            .iter()
            .filter(|r| r.target.platform == platform && r.target.arch == arch)
            .max_by(|a, b| compare_versions(&a.target.version, &b.target.version))
    }

    pub fn platform_view(&self, platform: &str, arch: &str) -> PlatformView {
        let versions = self
            .assets
            .iter()
            .filter(|r| r.target.platform == platform && r.target.arch == arch)
            .map(|r| {
                (
                    r.target.version.clone(),
                    VersionEntry {
                        href: r.relative_path.clone(),
                        sha256: r.sha256.clone(),
                    },
                )
            })
            .collect();
        PlatformView {
            latest: self
                .latest(platform, arch)
                .map(|r| r.target.version.clone()),
            versions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum VersionPart {
    Num(u64),
    Text(String),
}

impl Ord for VersionPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (VersionPart::Num(a), VersionPart::Num(b)) => a.cmp(b),
            (VersionPart::Text(a), VersionPart::Text(b)) => a.cmp(b),
            (VersionPart::Num(_), VersionPart::Text(_)) => Ordering::Greater,
            (VersionPart::Text(_), VersionPart::Num(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for VersionPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dotted versions compare numerically per component: `21.1.10 > 21.1.9`.
///
/// A version that extends another with a text part is a prerelease of it:
/// `21.1.5-rc1 < 21.1.5 < 21.1.5.1`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<VersionPart> {
        v.split(['.', '-', '+'])
            .map(|p| match p.parse::<u64>() {
                Ok(n) => VersionPart::Num(n),
                Err(_) => VersionPart::Text(p.to_string()),
            })
            .collect()
    };
    let (a, b) = (parts(a), parts(b));
    for (x, y) in a.iter().zip(&b) {
        match x.cmp(y) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    let extension = |next: &VersionPart| match next {
        VersionPart::Num(_) => Ordering::Greater,
        VersionPart::Text(_) => Ordering::Less,
    };
    match a.len().cmp(&b.len()) {
        Ordering::Equal => Ordering::Equal,
        Ordering::Greater => extension(&a[b.len()]),
        Ordering::Less => extension(&b[a.len()]).reverse(),
    }
}

/// Single-writer access to a manifest file.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
    require_reproducible: bool,
}

impl ManifestStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            require_reproducible: false,
        }
    }

    /// Refuse to replace a published asset with one of different content.
    pub fn require_reproducible(mut self, yes: bool) -> Self {
        self.require_reproducible = yes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory asset paths are relative to.
    pub fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn lock_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifest".to_string());
        self.path.with_file_name(format!("{name}.lock"))
    }

    pub fn load(&self) -> Result<Manifest> {
        Manifest::load(&self.path)
    }

    /// Insert or replace the entry for `target`, leaving every other entry
    /// as it was.
    pub fn upsert(&self, target: &Target, asset: &Asset, provenance: Vec<Provenance>) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path())?;
        let bytes = self.merged(target, asset, provenance)?;
        write_atomic(&self.path, &bytes)?;
        info!("[bundle:{target}] recorded in {}", self.path.display());
        Ok(())
    }

    /// Move `built` to `final_path` and record `asset` for its target as one
    /// step. On failure the file previously at `final_path` is restored, so
    /// the manifest never points at bytes it does not describe.
    pub fn publish(
        &self,
        asset: &Asset,
        built: &Path,
        final_path: &Path,
        provenance: Vec<Provenance>,
    ) -> Result<()> {
        let target = &asset.target;
        let _lock = FileLock::acquire(&self.lock_path())?;
        let backup = backup_path(final_path);
        self.recover(target, final_path, &backup)?;
        let bytes = self.merged(target, asset, provenance)?;

        let had_previous = fs::symlink_metadata(final_path).is_ok();
        if had_previous {
            atomic_rename(final_path, &backup)?;
        }
        let committed =
            atomic_rename(built, final_path).and_then(|()| write_atomic(&self.path, &bytes));
        match committed {
            Ok(()) => {
                if had_previous {
                    let _ = fs::remove_file(&backup);
                }
                info!("[bundle:{target}] published {}", final_path.display());
                Ok(())
            }
            Err(e) => {
                if had_previous {
                    if let Err(restore) = fs::rename(&backup, final_path) {
                        warn!(
                            "[bundle:{target}] could not restore {}: {restore}",
                            final_path.display()
                        );
                    }
                } else if !built.exists() {
                    // Moved but not recorded.
                    let _ = fs::remove_file(final_path);
                }
                Err(e)
            }
        }
    }

    /// Undo a publish that stopped between moving the asset and writing the
    /// manifest. Caller holds the lock.
    fn recover(&self, target: &Target, final_path: &Path, backup: &Path) -> Result<()> {
        if !backup.is_file() {
            return Ok(());
        }
        let recorded = self.load()?.get(target).map(|r| r.sha256.clone());
        let (backup_sha, _) = sha256_file(backup)?;
        if recorded.as_deref() == Some(backup_sha.as_str()) {
            warn!(
                "[bundle:{target}] restoring {} left by an interrupted publish",
                final_path.display()
            );
            atomic_rename(backup, final_path)
        } else {
            fs::remove_file(backup).at(backup)
        }
    }

    /// The manifest with `asset` merged in, serialized. Caller holds the lock.
    fn merged(&self, target: &Target, asset: &Asset, provenance: Vec<Provenance>) -> Result<Vec<u8>> {
        if &asset.target != target {
            return Err(BundleError::Config(format!(
                "asset for {} cannot be recorded under {target}",
                asset.target
            )));
        }
        let mut manifest = self.load()?;

        if let Some(existing) = manifest.get(target) {
            if existing.sha256 != asset.sha256 && self.require_reproducible {
                return Err(BundleError::Verify {
                    path: self.base_dir().join(&existing.relative_path),
                    expected: existing.sha256.clone(),
                    actual: asset.sha256.clone(),
                });
            }
            if existing.sha256 == asset.sha256 {
                debug!("{target}: manifest already records {}", asset.sha256);
            }
        }

        manifest.put(AssetRecord::new(asset, provenance));
        manifest.to_bytes().map_err(|e| BundleError::Manifest {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Whether the asset recorded for `target` is on disk and hashes to
    /// the recorded digest.
    pub fn verify(&self, target: &Target) -> Result<bool> {
        let manifest = self.load()?;
        let Some(record) = manifest.get(target) else {
            return Ok(false);
        };
        let asset_path = self.base_dir().join(&record.relative_path);
        if !asset_path.is_file() {
            return Ok(false);
        }
        let (sha, size) = sha256_file(&asset_path)?;
        Ok(sha == record.sha256 && size == record.size_bytes)
    }
}

fn backup_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "asset".to_string());
    final_path.with_file_name(format!(".{name}.prev"))
}
