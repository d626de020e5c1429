//! Build unit identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, Result};

/// One (platform, architecture, tool version) build unit.
///
/// Ordering is lexicographic by platform, then arch, then version, which is
/// the order manifest entries are serialized in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub platform: String,
    pub arch: String,
    pub version: String,
}

impl Target {
    pub fn new(platform: &str, arch: &str, version: &str) -> Result<Self> {
        for (field, value) in [("platform", platform), ("arch", arch), ("version", version)] {
            validate_segment(field, value)?;
        }
        Ok(Self {
            platform: platform.to_string(),
            arch: arch.to_string(),
            version: version.to_string(),
        })
    }

    /// `platform-arch-version`, used for work directories and CLI filters.
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.platform, self.arch, self.version)
    }

    /// Published file name for a bundle named `name`.
    pub fn asset_file_name(&self, name: &str) -> String {
        format!(
            "{name}-{}-{}-{}.tar.zst",
            self.version, self.platform, self.arch
        )
    }

    /// Parse `platform-arch-version`. Versions may contain further dashes.
    pub fn parse_key(key: &str) -> Result<Self> {
        let mut parts = key.splitn(3, '-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(platform), Some(arch), Some(version)) => Self::new(platform, arch, version),
            _ => Err(BundleError::Config(format!(
                "target key '{key}' must look like <platform>-<arch>-<version>"
            ))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(BundleError::Config(format!("target {field} must not be empty")));
    }
    if value.contains(['/', '\\']) || value.contains("..") {
        return Err(BundleError::Config(format!(
            "target {field} must be a safe path segment: {value}"
        )));
    }
    if field != "version" && value.contains('-') {
        return Err(BundleError::Config(format!(
            "target {field} must not contain '-': {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrips_with_dashed_version() {
        let t = Target::new("linux", "x86_64", "21.1.5-rc1").unwrap();
        assert_eq!(t.key(), "linux-x86_64-21.1.5-rc1");
        assert_eq!(Target::parse_key(&t.key()).unwrap(), t);
    }

    #[test]
    fn ordering_is_platform_then_arch() {
        let mut v = vec![
            Target::new("win", "x86_64", "1").unwrap(),
            Target::new("darwin", "x86_64", "1").unwrap(),
            Target::new("darwin", "arm64", "1").unwrap(),
        ];
        v.sort();
        let keys: Vec<_> = v.iter().map(Target::key).collect();
        assert_eq!(keys, ["darwin-arm64-1", "darwin-x86_64-1", "win-x86_64-1"]);
    }

    #[test]
    fn rejects_path_like_segments() {
        assert!(Target::new("../etc", "x86_64", "1").is_err());
        assert!(Target::new("linux", "x86-64", "1").is_err());
        assert!(Target::parse_key("linux").is_err());
    }

    #[test]
    fn asset_name_layout() {
        let t = Target::new("linux", "arm64", "21.1.5").unwrap();
        assert_eq!(t.asset_file_name("lldb"), "lldb-21.1.5-linux-arm64.tar.zst");
    }
}
