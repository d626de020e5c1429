//! Preflight checks run before any target starts.
//!
//! A missing host tool or a mistyped local source path would otherwise
//! surface as a failure of every target, one at a time, after downloads
//! have already started.

use std::fs;

use anyhow::{bail, Context, Result};

use crate::config::{BundleConfig, SourceOrigin};

/// Check if a command exists on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package providing it).
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }
    Ok(())
}

/// Check the host against what `cfg` needs.
///
/// - `curl` when any source is fetched over HTTP(S)
/// - every local source path exists
/// - the cache, work and output directories can be created
pub fn check_config(cfg: &BundleConfig) -> Result<()> {
    let remote = cfg
        .targets
        .iter()
        .flat_map(|t| &t.sources)
        .any(|s| s.origin.is_remote());
    if remote {
        check_required_tools(&[("curl", "curl")])?;
    }

    for t in &cfg.targets {
        for s in &t.sources {
            if let SourceOrigin::Local { path, .. } = &s.origin {
                if !path.exists() {
                    bail!(
                        "target {}: source '{}' path does not exist: {}",
                        t.target,
                        s.name,
                        path.display()
                    );
                }
            }
        }
    }

    for dir in [&cfg.cache_dir, &cfg.work_dir, &cfg.output_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating directory '{}'", dir.display()))?;
    }
    Ok(())
}
