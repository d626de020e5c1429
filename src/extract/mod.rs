//! Container extraction into staging trees.
//!
//! Three container families are understood: tar (plain, xz, zstd, gzip),
//! Debian packages (an `ar` wrapper around a compressed `data.tar`), and
//! plain directories. Symlinks are always captured as link records; no
//! extractor follows or materializes them. File bytes are spilled to
//! numbered files under the extractor's spill directory and referenced
//! from the tree, so nothing is ever written at a path taken from an
//! archive.

mod deb;
mod dir;
mod tar;

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::context::TargetContext;
use crate::error::{BundleError, IoResultExt, Result};
use crate::tree::{Entry, FileContent, StagingTree};

/// Container family of a source artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Tar,
    Deb,
    Dir,
}

impl ContainerFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::Tar => "tar",
            ContainerFormat::Deb => "deb",
            ContainerFormat::Dir => "dir",
        }
    }

    /// Guess from a URL or file name. `None` if the name says nothing.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.rsplit('/').next().unwrap_or(name);
        if name.ends_with(".deb") {
            Some(ContainerFormat::Deb)
        } else if [".tar", ".tar.xz", ".txz", ".tar.zst", ".tzst", ".tar.gz", ".tgz"]
            .iter()
            .any(|ext| name.ends_with(ext))
        {
            Some(ContainerFormat::Tar)
        } else {
            None
        }
    }

    /// Detect from the artifact itself. Cache blobs carry no extension, so
    /// this looks at leading magic bytes.
    pub fn detect(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(ContainerFormat::Dir);
        }
        let magic = read_magic(path)?;
        if magic.starts_with(b"!<arch>\n") {
            Ok(ContainerFormat::Deb)
        } else if Compression::sniff(&magic) != Compression::None || is_ustar(path)? {
            Ok(ContainerFormat::Tar)
        } else {
            Err(BundleError::extract(path, "", "unrecognized container format"))
        }
    }
}

/// Stream compression wrapped around a tar payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Zstd,
    Gzip,
}

impl Compression {
    pub fn sniff(magic: &[u8]) -> Self {
        if magic.starts_with(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]) {
            Compression::Xz
        } else if magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            Compression::Zstd
        } else if magic.starts_with(&[0x1F, 0x8B]) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    /// Compression of a Debian member from its name (`data.tar.xz` etc.).
    fn from_member(name: &str) -> Option<Self> {
        match name.rsplit_once(".tar") {
            Some((_, "")) => Some(Compression::None),
            Some((_, ".xz")) => Some(Compression::Xz),
            Some((_, ".zst")) => Some(Compression::Zstd),
            Some((_, ".gz")) => Some(Compression::Gzip),
            _ => None,
        }
    }

    fn decoder<'a, R: Read + 'a>(self, r: R) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(r),
            Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(r)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(r)?),
            Compression::Gzip => Box::new(flate2::read::GzDecoder::new(r)),
        })
    }
}

fn read_magic(path: &Path) -> Result<Vec<u8>> {
    let mut f = File::open(path).at(path)?;
    let mut buf = vec![0u8; 8];
    let mut n = 0;
    while n < buf.len() {
        let got = f.read(&mut buf[n..]).at(path)?;
        if got == 0 {
            break;
        }
        n += got;
    }
    buf.truncate(n);
    Ok(buf)
}

/// POSIX tar carries `ustar` at offset 257 of its first header.
fn is_ustar(path: &Path) -> Result<bool> {
    let mut f = File::open(path).at(path)?;
    let mut header = [0u8; 512];
    match f.read_exact(&mut header) {
        Ok(()) => Ok(&header[257..262] == b"ustar"),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).at(path),
    }
}

/// Extracts containers into [`StagingTree`]s, spilling file content into
/// `spill_dir`.
#[derive(Debug)]
pub struct ContainerExtractor {
    spill_dir: PathBuf,
    next_blob: u64,
    context: Option<TargetContext>,
}

impl ContainerExtractor {
    pub fn new(spill_dir: &Path) -> Result<Self> {
        fs::create_dir_all(spill_dir).at(spill_dir)?;
        Ok(Self {
            spill_dir: spill_dir.to_path_buf(),
            next_blob: 0,
            context: None,
        })
    }

    /// Check `ctx` for cancellation and deadline before every entry read.
    pub fn with_context(mut self, ctx: &TargetContext) -> Self {
        self.context = Some(ctx.clone());
        self
    }

    fn checkpoint(&self) -> Result<()> {
        match &self.context {
            Some(ctx) => ctx.checkpoint("extracting"),
            None => Ok(()),
        }
    }

    /// Extract one container and check that every link in it resolves.
    pub fn extract(&mut self, archive: &Path, format: ContainerFormat) -> Result<StagingTree> {
        let tree = self.read(archive, format)?;
        validate(&tree, archive)?;
        Ok(tree)
    }

    /// Extract several containers into one tree, then validate links.
    ///
    /// Packages split across archives (a binary package and the library
    /// package its links point into) only validate once merged. A path
    /// present in two archives with different content is a conflict.
    pub fn extract_all(&mut self, archives: &[(PathBuf, ContainerFormat)]) -> Result<StagingTree> {
        let mut merged = StagingTree::new();
        for (archive, format) in archives {
            let tree = self.read(archive, *format)?;
            for (p, entry) in tree.into_entries() {
                merged.insert(&p, entry)?;
            }
        }
        if let Some((first, _)) = archives.first() {
            validate(&merged, first)?;
        }
        Ok(merged)
    }

    fn read(&mut self, archive: &Path, format: ContainerFormat) -> Result<StagingTree> {
        info!("extracting {} ({})", archive.display(), format.as_str());
        let tree = match format {
            ContainerFormat::Tar => {
                let compression = Compression::sniff(&read_magic(archive)?);
                let file = File::open(archive).at(archive)?;
                let reader = compression
                    .decoder(io::BufReader::new(file))
                    .map_err(|e| BundleError::extract(archive, "", e))?;
                tar::read_tar(reader, archive, "", self)?
            }
            ContainerFormat::Deb => deb::read_deb(archive, self)?,
            ContainerFormat::Dir => dir::read_dir(archive)?,
        };
        debug!(
            "{}: {} entries, {} links, {} bytes",
            archive.display(),
            tree.len(),
            tree.links().len(),
            tree.file_bytes()
        );
        Ok(tree)
    }

    /// Copy `reader` into a fresh spill file.
    fn spill(&mut self, reader: &mut dyn Read) -> io::Result<(PathBuf, u64)> {
        let path = self.spill_dir.join(format!("{:08}", self.next_blob));
        self.next_blob += 1;
        let mut out = io::BufWriter::new(File::create(&path)?);
        let n = io::copy(reader, &mut out)?;
        out.into_inner().map_err(|e| e.into_error())?;
        Ok((path, n))
    }
}

/// Insert into a tree being extracted, reporting clashes as extraction
/// errors: one archive declaring a path twice is a malformed archive.
fn insert_entry(
    tree: &mut StagingTree,
    archive: &Path,
    label: &str,
    rel: &str,
    entry: Entry,
) -> Result<()> {
    tree.insert(rel, entry).map_err(|e| match e {
        BundleError::Conflict { first, second, .. } => BundleError::extract(
            archive,
            label,
            format!("duplicate entry: {first} vs {second}"),
        ),
        BundleError::Config(reason) => BundleError::extract(archive, label, reason),
        other => other,
    })
}

fn file_entry(source: PathBuf, size: u64, executable: bool) -> Entry {
    Entry::File(FileContent {
        source,
        size,
        executable,
    })
}

/// Every link must land on something extracted alongside it.
fn validate(tree: &StagingTree, archive: &Path) -> Result<()> {
    for link in tree.links() {
        if tree.resolve(&link.path).is_none() {
            return Err(BundleError::extract(
                archive,
                link.path,
                format!(
                    "symlink target '{}' cannot be located in the extracted tree",
                    link.target
                ),
            ));
        }
    }
    Ok(())
}

/// Take `select` out of `tree`, resolving indirection links to the real
/// directory they stand for.
pub fn select(tree: &StagingTree, select: &str, archive: &Path) -> Result<StagingTree> {
    tree.subtree(select).ok_or_else(|| {
        BundleError::extract(archive, select, "selected path is not a directory in the container")
    })
}
