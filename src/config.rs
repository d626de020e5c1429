//! Build matrix configuration.
//!
//! ```toml
//! [bundle]
//! name = "lldb"
//! output_dir = "dist"
//! manifest = "dist/manifest.json"
//! compression = "max"
//!
//! [[target]]
//! platform = "linux"
//! arch = "x86_64"
//! version = "21.1.5"
//!
//! [[target.source]]
//! name = "llvm"
//! url = "https://github.com/llvm/llvm-project/releases/download/.../LLVM-21.1.5-Linux-X64.tar.xz"
//! sha256 = "..."
//! select = "LLVM-21.1.5-Linux-X64"
//!
//! [[target.link]]
//! link = "python/lldb/_lldb.so"
//! target = "lib/liblldb.so.21"
//! ```
//!
//! Relative paths are resolved against the directory holding the config
//! file.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::archive::CompressionLevel;
use crate::assemble::LinkRewrite;
use crate::extract::ContainerFormat;
use crate::fetch::Part;
use crate::target::Target;
use crate::trim::{default_python_exclusions, parse_rules, Rule};

const DEFAULT_FETCH_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub config_path: PathBuf,
    /// Bundle name; the first component of every asset file name.
    pub name: String,
    pub output_dir: PathBuf,
    pub manifest: PathBuf,
    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    /// When set, each assembled tree is also written out here.
    pub stage_dir: Option<PathBuf>,
    pub compression: CompressionLevel,
    pub jobs: usize,
    pub target_timeout: Option<Duration>,
    pub fetch_retries: u32,
    pub require_reproducible: bool,
    pub targets: Vec<TargetSpec>,
}

#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub target: Target,
    /// Exclusions applied to sources marked `trim`.
    pub exclude: Vec<Rule>,
    pub sources: Vec<SourceSpec>,
    pub links: Vec<LinkRewrite>,
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    /// Root inside the bundle.
    pub mount: String,
    pub origin: SourceOrigin,
    pub select: Option<String>,
    pub include: Vec<Rule>,
    pub trim: bool,
}

/// One fetchable container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSpec {
    pub url: String,
    pub sha256: Option<String>,
    /// `None` means detect from the fetched bytes.
    pub format: Option<ContainerFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Several containers merged into one tree; a single URL is a list of one.
    Archives(Vec<ArchiveSpec>),
    Parts {
        parts: Vec<Part>,
        sha256: String,
        format: Option<ContainerFormat>,
    },
    /// A local directory or archive, used in place.
    Local {
        path: PathBuf,
        format: Option<ContainerFormat>,
    },
}

impl SourceOrigin {
    /// URLs this source is fetched from, for provenance.
    pub fn urls(&self) -> Vec<String> {
        match self {
            SourceOrigin::Archives(a) => a.iter().map(|a| a.url.clone()).collect(),
            SourceOrigin::Parts { parts, .. } => parts.iter().map(|p| p.url.clone()).collect(),
            SourceOrigin::Local { path, .. } => vec![path.display().to_string()],
        }
    }

    /// Upstream digest when there is exactly one.
    pub fn upstream_sha256(&self) -> Option<String> {
        match self {
            SourceOrigin::Archives(a) if a.len() == 1 => a[0].sha256.clone(),
            SourceOrigin::Parts { sha256, .. } => Some(sha256.clone()),
            _ => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        match self {
            SourceOrigin::Archives(a) => a.iter().any(|a| crate::fetch::transport::is_remote(&a.url)),
            SourceOrigin::Parts { parts, .. } => {
                parts.iter().any(|p| crate::fetch::transport::is_remote(&p.url))
            }
            SourceOrigin::Local { .. } => false,
        }
    }
}

impl BundleConfig {
    /// Manifest-relative path of `file_name` in the output directory.
    pub fn asset_href(&self, file_name: &str) -> String {
        let base = self.manifest.parent().unwrap_or_else(|| Path::new(""));
        let rel = self.output_dir.strip_prefix(base).unwrap_or(Path::new(""));
        let mut parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        parts.push(file_name.to_string());
        parts.join("/")
    }

    /// Keep only targets whose key is in `keys`. Unknown keys are an error.
    pub fn filter_targets(&mut self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for k in keys {
            if !self.targets.iter().any(|t| &t.target.key() == k) {
                bail!(
                    "target '{k}' is not declared in '{}'",
                    self.config_path.display()
                );
            }
        }
        self.targets.retain(|t| keys.contains(&t.target.key()));
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    bundle: BundleToml,
    #[serde(default, rename = "target")]
    targets: Vec<TargetToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BundleToml {
    name: String,
    output_dir: String,
    manifest: String,
    cache_dir: Option<String>,
    work_dir: Option<String>,
    stage_dir: Option<String>,
    compression: Option<CompressionToml>,
    jobs: Option<usize>,
    target_timeout_secs: Option<u64>,
    fetch_retries: Option<u32>,
    #[serde(default)]
    require_reproducible: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompressionToml {
    Tier(String),
    Level(i64),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetToml {
    platform: String,
    arch: String,
    version: String,
    exclude: Option<Vec<String>>,
    #[serde(default, rename = "source")]
    sources: Vec<SourceToml>,
    #[serde(default, rename = "link")]
    links: Vec<LinkToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceToml {
    name: String,
    #[serde(default)]
    mount: String,
    format: Option<ContainerFormat>,
    url: Option<String>,
    sha256: Option<String>,
    parts: Option<Vec<PartToml>>,
    path: Option<String>,
    archives: Option<Vec<ArchiveToml>>,
    select: Option<String>,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    trim: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartToml {
    url: String,
    sha256: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArchiveToml {
    url: String,
    sha256: Option<String>,
    format: Option<ContainerFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkToml {
    link: String,
    target: String,
}

pub fn load_config(config_path: &Path) -> Result<BundleConfig> {
    let text = fs::read_to_string(config_path)
        .with_context(|| format!("reading bundle config '{}'", config_path.display()))?;
    parse_config(&text, config_path)
}

/// Parse config text as if it were read from `config_path`.
pub fn parse_config(text: &str, config_path: &Path) -> Result<BundleConfig> {
    let parsed: ConfigToml = toml::from_str(text)
        .with_context(|| format!("parsing bundle config '{}'", config_path.display()))?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let here = config_path.display();
    let b = parsed.bundle;

    if b.name.trim().is_empty() || b.name.contains(['/', '\\']) {
        bail!("invalid bundle config '{here}': bundle.name must be a plain non-empty name");
    }

    let output_dir = resolve(base, &b.output_dir);
    let manifest = resolve(base, &b.manifest);
    let manifest_dir = manifest.parent().unwrap_or(base);
    if !output_dir.starts_with(manifest_dir) {
        bail!(
            "invalid bundle config '{here}': output_dir '{}' must be inside the manifest's directory '{}' so assets can be referenced relatively",
            output_dir.display(),
            manifest_dir.display()
        );
    }

    let cache_dir = match &b.cache_dir {
        Some(dir) => resolve(base, dir),
        None => dirs::cache_dir()
            .map(|d| d.join("debugger-bundler").join("sources"))
            .with_context(|| {
                format!("invalid bundle config '{here}': no user cache directory; set bundle.cache_dir")
            })?,
    };
    let work_dir = b
        .work_dir
        .as_deref()
        .map(|d| resolve(base, d))
        .unwrap_or_else(|| base.join(".bundle-work"));
    let stage_dir = b.stage_dir.as_deref().map(|d| resolve(base, d));

    let compression = match b.compression {
        None => CompressionLevel::Max,
        Some(CompressionToml::Tier(t)) => match t.trim().to_ascii_lowercase().as_str() {
            "fast" => CompressionLevel::Fast,
            "max" => CompressionLevel::Max,
            other => bail!(
                "invalid bundle config '{here}': unsupported compression '{other}' (expected 'fast', 'max' or 1..=22)"
            ),
        },
        Some(CompressionToml::Level(n)) => i32::try_from(n)
            .ok()
            .and_then(|n| CompressionLevel::new(n).ok())
            .with_context(|| {
                format!("invalid bundle config '{here}': compression level {n} is outside 1..=22")
            })?,
    };

    let jobs = match b.jobs {
        Some(0) => bail!("invalid bundle config '{here}': jobs must be at least 1"),
        Some(n) => n,
        None => std::thread::available_parallelism().map_or(1, |n| n.get()),
    };

    let mut seen = BTreeSet::new();
    let mut targets = Vec::with_capacity(parsed.targets.len());
    for t in parsed.targets {
        let spec = parse_target(t, base)
            .with_context(|| format!("invalid bundle config '{here}'"))?;
        if !seen.insert(spec.target.clone()) {
            bail!(
                "invalid bundle config '{here}': target {} is declared twice",
                spec.target
            );
        }
        targets.push(spec);
    }
    if targets.is_empty() {
        bail!("invalid bundle config '{here}': no [[target]] declared");
    }

    Ok(BundleConfig {
        config_path: config_path.to_path_buf(),
        name: b.name,
        output_dir,
        manifest,
        cache_dir,
        work_dir,
        stage_dir,
        compression,
        jobs,
        target_timeout: b.target_timeout_secs.map(Duration::from_secs),
        fetch_retries: b.fetch_retries.unwrap_or(DEFAULT_FETCH_RETRIES).max(1),
        require_reproducible: b.require_reproducible,
        targets,
    })
}

fn parse_target(t: TargetToml, base: &Path) -> Result<TargetSpec> {
    let target = Target::new(&t.platform, &t.arch, &t.version)?;
    let exclude = match &t.exclude {
        Some(rules) => parse_rules(rules).with_context(|| format!("target {target}: exclude"))?,
        None => default_python_exclusions(),
    };

    if t.sources.is_empty() {
        bail!("target {target} has no [[target.source]]");
    }
    let mut names = BTreeSet::new();
    let mut sources = Vec::with_capacity(t.sources.len());
    for s in t.sources {
        if !names.insert(s.name.clone()) {
            bail!("target {target}: source '{}' is declared twice", s.name);
        }
        sources.push(
            parse_source(s, base).with_context(|| format!("target {target}"))?,
        );
    }

    let links = t
        .links
        .into_iter()
        .map(|l| LinkRewrite {
            link: l.link,
            target: l.target,
        })
        .collect();

    Ok(TargetSpec {
        target,
        exclude,
        sources,
        links,
    })
}

fn parse_source(s: SourceToml, base: &Path) -> Result<SourceSpec> {
    let name = s.name;
    let given = [
        s.url.is_some(),
        s.parts.is_some(),
        s.path.is_some(),
        s.archives.is_some(),
    ]
    .iter()
    .filter(|x| **x)
    .count();
    if given != 1 {
        bail!("source '{name}' must set exactly one of url, parts, path, archives");
    }

    let origin = if let Some(url) = s.url {
        let format = s.format.or_else(|| ContainerFormat::from_name(&url));
        SourceOrigin::Archives(vec![ArchiveSpec {
            url,
            sha256: s.sha256,
            format,
        }])
    } else if let Some(parts) = s.parts {
        let Some(sha256) = s.sha256 else {
            bail!("source '{name}': parts require the sha256 of the joined archive");
        };
        if parts.is_empty() {
            bail!("source '{name}': parts must not be empty");
        }
        SourceOrigin::Parts {
            format: s.format,
            parts: parts
                .into_iter()
                .map(|p| Part {
                    url: p.url,
                    sha256: p.sha256,
                })
                .collect(),
            sha256,
        }
    } else if let Some(path) = s.path {
        if s.sha256.is_some() {
            bail!("source '{name}': sha256 does not apply to a local path");
        }
        SourceOrigin::Local {
            path: resolve(base, &path),
            format: s.format,
        }
    } else {
        let archives = s.archives.unwrap_or_default();
        if archives.is_empty() {
            bail!("source '{name}': archives must not be empty");
        }
        if s.sha256.is_some() {
            bail!("source '{name}': set sha256 on each archive, not on the source");
        }
        SourceOrigin::Archives(
            archives
                .into_iter()
                .map(|a| ArchiveSpec {
                    format: a.format.or_else(|| ContainerFormat::from_name(&a.url)),
                    url: a.url,
                    sha256: a.sha256,
                })
                .collect(),
        )
    };

    let include = parse_rules(&s.include).with_context(|| format!("source '{name}': include"))?;
    Ok(SourceSpec {
        name,
        mount: s.mount,
        origin,
        select: s.select,
        include,
        trim: s.trim,
    })
}

fn resolve(base: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
