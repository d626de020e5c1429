//! Debian binary packages.
//!
//! The outer container is an `ar` archive: `debian-binary` (format
//! version), `control.tar.*` (package metadata, not needed here) and
//! `data.tar.*`, the installed filesystem tree.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;

use super::{tar::read_tar, Compression, ContainerExtractor};
use crate::error::{BundleError, IoResultExt, Result};
use crate::tree::StagingTree;

pub(super) fn read_deb(archive: &Path, ex: &mut ContainerExtractor) -> Result<StagingTree> {
    let file = File::open(archive).at(archive)?;
    let mut ar = ar::Archive::new(BufReader::new(file));

    let mut version_ok = false;
    let mut data: Option<StagingTree> = None;

    while let Some(member) = ar.next_entry() {
        let mut member = member
            .map_err(|e| BundleError::extract(archive, "", format!("malformed ar container: {e}")))?;
        let name = String::from_utf8_lossy(member.header().identifier())
            .trim_end_matches('/')
            .to_string();

        if name == "debian-binary" {
            let mut version = String::new();
            member
                .read_to_string(&mut version)
                .map_err(|e| BundleError::extract(archive, &name, e))?;
            if !version.trim().starts_with("2.") {
                return Err(BundleError::extract(
                    archive,
                    &name,
                    format!("unsupported package format version '{}'", version.trim()),
                ));
            }
            version_ok = true;
        } else if name.starts_with("data.tar") {
            if !version_ok {
                return Err(BundleError::extract(
                    archive,
                    &name,
                    "data member precedes debian-binary",
                ));
            }
            if data.is_some() {
                return Err(BundleError::extract(archive, &name, "second data member"));
            }
            let compression = Compression::from_member(&name).ok_or_else(|| {
                BundleError::extract(archive, &name, "unsupported data compression")
            })?;
            let reader = compression
                .decoder(&mut member)
                .map_err(|e| BundleError::extract(archive, &name, e))?;
            data = Some(read_tar(reader, archive, &name, ex)?);
        } else {
            debug!("{}: ignoring member {name}", archive.display());
        }
    }

    if !version_ok {
        return Err(BundleError::extract(
            archive,
            "debian-binary",
            "missing package format member",
        ));
    }
    data.ok_or_else(|| BundleError::extract(archive, "data.tar", "package has no data member"))
}
