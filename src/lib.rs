//! Builds minimal, reproducible debugger runtime bundles.
//!
//! For each (platform, arch, version) target in a build matrix, upstream
//! release archives are fetched into a content-addressed cache, extracted
//! with their symlinks kept as link records, trimmed, assembled into one
//! canonical layout, written as a deterministic `tar.zst`, verified, and
//! recorded in a JSON manifest that installers read.
//!
//! # Architecture
//!
//! ```text
//! driver (IntegrationDriver, one worker per target)
//!     │
//!     ├── fetch     SourceFetcher: URL -> verified cache blob
//!     ├── extract   ContainerExtractor: tar / deb / dir -> StagingTree
//!     ├── trim      RuntimeTrimmer: exclusion rules, dangling-link check
//!     ├── assemble  TreeAssembler: mounts + link re-homing
//!     ├── archive   ArchiveBuilder: StagingTree -> tar.zst Asset
//!     └── manifest  ManifestStore: Target -> Asset, atomic upsert
//! ```
//!
//! Everything a stage needs arrives through a [`TargetContext`]; no stage
//! reads process-wide state.
//!
//! # Example
//!
//! ```rust,ignore
//! use debugger_bundler::{load_config, IntegrationDriver};
//!
//! let cfg = load_config(Path::new("bundle.toml"))?;
//! let summary = IntegrationDriver::new(cfg).run()?;
//! print!("{}", summary.table());
//! ```

pub mod archive;
pub mod assemble;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod fsutil;
pub mod manifest;
pub mod preflight;
pub mod target;
pub mod tree;
pub mod trim;

pub use archive::{Asset, CompressionLevel};
pub use config::{load_config, BundleConfig};
pub use context::{CancelToken, TargetContext};
pub use driver::{IntegrationDriver, RunSummary, TargetOutcome, TargetState};
pub use error::{BundleError, ErrorKind, Result};
pub use extract::{ContainerExtractor, ContainerFormat};
pub use fetch::{CacheEntry, SourceFetcher};
pub use manifest::{Manifest, ManifestStore};
pub use target::Target;
pub use tree::{StagingTree, SymlinkRecord};
